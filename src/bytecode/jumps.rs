use std::collections::BTreeMap;

use tracing::debug;

use crate::bytecode::ir::{IMByteCodeList, MarkerRole};
use crate::bytecode::op::{ScriptOp, token_length};
use crate::compiler::{CompilationData, CompileError, CompilerStage};

pub struct ResolveJumps;

impl CompilerStage for ResolveJumps {
    fn name(&self) -> &'static str {
        "resolve-jumps"
    }

    fn execute(&self, data: &mut CompilationData<'_>) -> Result<(), CompileError> {
        data.bytecode = resolve(&data.code)?;
        debug!(
            code = data.bytecode.len(),
            jumps = data
                .code
                .markers
                .iter()
                .filter(|m| m.role == MarkerRole::JumpSource)
                .count(),
            "jumps resolved"
        );
        Ok(())
    }
}

/// Fills in every jump offset and returns the final code.
///
/// The offset byte `o` at position `p` targets `p + o`, or `p - o` for
/// `jump_back`. `jump` is rewritten to `jump_back` when its label lies behind
/// it; conditional jumps only go forward.
pub fn resolve(list: &IMByteCodeList) -> Result<Vec<u8>, CompileError> {
    let mut code = list.code.clone();
    let boundaries = token_boundaries(&code);

    let mut targets: BTreeMap<&str, usize> = BTreeMap::new();
    for marker in list.markers.iter().filter(|m| m.role == MarkerRole::LabelTarget) {
        if targets.insert(&marker.label, marker.position).is_some() {
            return Err(CompileError::jump(format!(
                "label '{}' is placed twice",
                marker.label
            )));
        }
        if marker.position != code.len() && !boundaries.contains(&marker.position) {
            return Err(CompileError::jump(format!(
                "label '{}' points inside an instruction",
                marker.label
            )));
        }
    }

    for source in list.markers.iter().filter(|m| m.role == MarkerRole::JumpSource) {
        let p = source.position + 1;
        let paired = list.markers.iter().any(|m| {
            m.role == MarkerRole::OffsetPlaceholder && m.position == p && m.label == source.label
        });
        if !paired {
            return Err(CompileError::jump(format!(
                "jump to '{}' has no offset byte",
                source.label
            )));
        }
        let Some(&target) = targets.get(source.label.as_str()) else {
            return Err(CompileError::jump(format!(
                "label '{}' is never placed",
                source.label
            )));
        };

        let op = code
            .get(source.position)
            .and_then(|b| ScriptOp::from_byte(*b))
            .filter(|op| op.is_jump())
            .ok_or_else(|| {
                CompileError::jump(format!("no jump opcode at {}", source.position))
            })?;

        let (offset, op) = if target > p {
            let op = if op == ScriptOp::JumpBack { ScriptOp::Jump } else { op };
            (target - p, op)
        } else {
            if matches!(op, ScriptOp::Jz | ScriptOp::Jnz) {
                return Err(CompileError::jump(format!(
                    "conditional jump to '{}' goes backward",
                    source.label
                )));
            }
            (p - target, ScriptOp::JumpBack)
        };

        if offset == 0 || offset > u8::MAX as usize {
            return Err(CompileError::jump(format!(
                "jump to '{}' spans {} bytes",
                source.label, offset
            )));
        }
        code[source.position] = op.byte();
        code[p] = offset as u8;
    }

    Ok(code)
}

/// Start positions of every instruction token.
pub fn token_boundaries(code: &[u8]) -> Vec<usize> {
    let mut boundaries = Vec::new();
    let mut pos = 0;
    while pos < code.len() {
        boundaries.push(pos);
        pos += token_length(code, pos);
    }
    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::{constant_byte, identifier};

    #[test]
    fn test_forward_and_backward_jumps() {
        let mut list = IMByteCodeList::new();
        list.place_label("top");
        list.emit_jump(ScriptOp::Jz, "out");
        list.push(constant_byte(1));
        list.push_op(ScriptOp::Nop);
        list.emit_jump(ScriptOp::Jump, "top");
        list.place_label("out");

        let code = resolve(&list).unwrap();
        // jz at 0, offset at 1 -> target 6
        assert_eq!(code[1], 5);
        assert_eq!(code[4], ScriptOp::JumpBack.byte());
        assert_eq!(code[5], 5);
    }

    #[test]
    fn test_unplaced_label() {
        let mut list = IMByteCodeList::new();
        list.emit_jump(ScriptOp::Jump, "nowhere");
        assert!(matches!(
            resolve(&list),
            Err(CompileError::JumpResolutionFailure { .. })
        ));
    }

    #[test]
    fn test_offset_range() {
        let mut list = IMByteCodeList::new();
        list.emit_jump(ScriptOp::Jump, "far");
        for _ in 0..150 {
            list.extend(&[ScriptOp::Assign.byte(), identifier(0)]);
        }
        list.place_label("far");
        assert!(resolve(&list).is_err());
    }

    #[test]
    fn test_backward_conditional_is_rejected() {
        let mut list = IMByteCodeList::new();
        list.place_label("back");
        list.push_op(ScriptOp::Nop);
        list.emit_jump(ScriptOp::Jz, "back");
        assert!(resolve(&list).is_err());
    }
}
