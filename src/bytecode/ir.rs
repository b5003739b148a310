use serde::{Deserialize, Serialize};

use crate::bytecode::op::ScriptOp;

/// What a jump marker stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerRole {
    /// The opcode byte of a jump.
    JumpSource,
    /// The offset byte following a jump opcode.
    OffsetPlaceholder,
    /// The position a label refers to.
    LabelTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpMarker {
    pub position: usize,
    pub label: String,
    pub role: MarkerRole,
}

/// Intermediate byte code: the code stream plus symbolic jump markers.
///
/// Offsets stay zero until jump resolution. Every edit that changes the code
/// length shifts the markers that follow it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IMByteCodeList {
    pub code: Vec<u8>,
    pub markers: Vec<JumpMarker>,
}

impl IMByteCodeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn push(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn push_op(&mut self, op: ScriptOp) {
        self.code.push(op.byte());
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Emits `op` with a zero offset byte that jump resolution fills in.
    pub fn emit_jump(&mut self, op: ScriptOp, label: &str) {
        self.mark(MarkerRole::JumpSource, label);
        self.push_op(op);
        self.mark(MarkerRole::OffsetPlaceholder, label);
        self.push(0);
    }

    /// Makes `label` refer to the next emitted byte.
    pub fn place_label(&mut self, label: &str) {
        self.mark(MarkerRole::LabelTarget, label);
    }

    fn mark(&mut self, role: MarkerRole, label: &str) {
        self.markers.push(JumpMarker {
            position: self.code.len(),
            label: label.to_string(),
            role,
        });
    }

    /// Appends another segment, moving its markers behind this code.
    pub fn append(&mut self, other: IMByteCodeList) {
        let base = self.code.len();
        self.code.extend(other.code);
        self.markers
            .extend(other.markers.into_iter().map(|mut marker| {
                marker.position += base;
                marker
            }));
    }

    /// Replaces `len` bytes at `pos` with `replacement`.
    pub fn splice(&mut self, pos: usize, len: usize, replacement: &[u8]) {
        self.code
            .splice(pos..pos + len, replacement.iter().copied());
        let end = pos + len;
        for marker in &mut self.markers {
            if marker.position >= end {
                marker.position = marker.position + replacement.len() - len;
            }
        }
    }

    /// True when a marker sits strictly inside `(start, end)`.
    pub fn has_marker_within(&self, start: usize, end: usize) -> bool {
        self.markers
            .iter()
            .any(|m| m.position > start && m.position < end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_shifts_markers() {
        let mut a = IMByteCodeList::new();
        a.push_op(ScriptOp::Nop);
        let mut b = IMByteCodeList::new();
        b.place_label("l");
        b.emit_jump(ScriptOp::Jump, "l");
        a.append(b);
        let positions: Vec<usize> = a.markers.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![1, 1, 2]);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_splice_moves_following_markers() {
        let mut list = IMByteCodeList::new();
        list.extend(&[1, 2, 3, 4]);
        list.place_label("end");
        list.splice(1, 2, &[9]);
        assert_eq!(list.code, vec![1, 9, 4]);
        assert_eq!(list.markers[0].position, 3);

        list.splice(0, 1, &[7, 7, 7]);
        assert_eq!(list.markers[0].position, 5);
        assert!(list.has_marker_within(0, 6));
        assert!(!list.has_marker_within(5, 6));
    }
}
