use tracing::{debug, trace};

use crate::bytecode::ir::IMByteCodeList;
use crate::bytecode::op::{self, ScriptOp, pack_count_size, token_length};
use crate::bytecode::patterns::{Pattern, Replace, Template, patterns};
use crate::compiler::{CompilationData, CompileError, CompilerStage};

/// Peephole optimizer over the intermediate code. Skipped when optimization
/// is off.
pub struct Optimize;

impl CompilerStage for Optimize {
    fn name(&self) -> &'static str {
        "optimize"
    }

    fn execute(&self, data: &mut CompilationData<'_>) -> Result<(), CompileError> {
        if !data.options.optimize {
            return Ok(());
        }
        let before = data.code.len();
        let sizes = data.slot_sizes();
        let rewrites = optimize(&mut data.code, &sizes);
        debug!(rewrites, before, after = data.code.len(), "optimized");
        Ok(())
    }
}

/// Rewrites `list` until no pattern applies and returns the number of rewrites.
///
/// `slot_sizes` gives the vector size of every data slot; constants are scalars.
pub fn optimize(list: &mut IMByteCodeList, slot_sizes: &[u8]) -> usize {
    let mut rewrites = 0;
    loop {
        let pass = optimize_pass(list, slot_sizes);
        if pass == 0 {
            return rewrites;
        }
        rewrites += pass;
    }
}

fn optimize_pass(list: &mut IMByteCodeList, slot_sizes: &[u8]) -> usize {
    let mut rewrites = 0;
    let mut pos = 0;
    let mut previous: Option<usize> = None;

    while pos < list.len() {
        let at_start = previous.is_some_and(|p| starts_expression(&list.code, p));
        if let Some((pattern, replacement)) = find_match(list, pos, at_start, slot_sizes) {
            trace!(pattern = %pattern.name, pos, "rewrite");
            list.splice(pos, pattern.template.len(), &replacement);
            rewrites += 1;
            continue;
        }
        previous = Some(pos);
        pos += token_length(&list.code, pos);
    }
    rewrites
}

/// Tokens after which an expression begins.
fn starts_expression(code: &[u8], token: usize) -> bool {
    matches!(
        code.get(token).and_then(|b| ScriptOp::from_byte(*b)),
        Some(
            ScriptOp::Assign
                | ScriptOp::Jz
                | ScriptOp::Jnz
                | ScriptOp::Push
                | ScriptOp::Yield
                | ScriptOp::Begin
        )
    )
}

fn value_size(byte: u8, slot_sizes: &[u8]) -> Option<u8> {
    if op::is_constant(byte) {
        Some(1)
    } else if op::is_identifier(byte) {
        slot_sizes.get(op::slot_of(byte)).copied()
    } else {
        None
    }
}

fn find_match(
    list: &IMByteCodeList,
    pos: usize,
    at_start: bool,
    slot_sizes: &[u8],
) -> Option<(&'static Pattern, Vec<u8>)> {
    let code = &list.code;
    'patterns: for pattern in patterns() {
        if pattern.fused && !at_start {
            continue;
        }
        let len = pattern.template.len();
        if pos + len > code.len() {
            continue;
        }

        let mut values = [0u8; 16];
        let mut size = None;
        for (i, element) in pattern.template.iter().enumerate() {
            let byte = code[pos + i];
            match element {
                Template::Value(index) => {
                    if !op::is_value(byte) {
                        continue 'patterns;
                    }
                    let Some(value_size) = value_size(byte, slot_sizes) else {
                        continue 'patterns;
                    };
                    match size {
                        None => size = Some(value_size),
                        Some(s) if s != value_size => continue 'patterns,
                        Some(_) => {}
                    }
                    values[*index] = byte;
                }
                other => {
                    if !other.matches_op(byte) {
                        continue 'patterns;
                    }
                }
            }
        }

        let size = size.unwrap_or(1);
        if pattern.scalar_only && size != 1 {
            continue;
        }
        if list.has_marker_within(pos, pos + len) {
            continue;
        }

        let replacement = pattern
            .replacement
            .iter()
            .map(|r| match r {
                Replace::Op(op) => op.byte(),
                Replace::Packed => pack_count_size(pattern.value_count(), size),
                Replace::Value(i) => values[*i],
            })
            .collect();
        return Some((pattern, replacement));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::{constant_byte, identifier, unpack_count_size};

    fn assign(expression: &[u8]) -> IMByteCodeList {
        let mut list = IMByteCodeList::new();
        list.extend(&[ScriptOp::Assign.byte(), identifier(0)]);
        list.extend(expression);
        list.push_op(ScriptOp::Nop);
        list
    }

    const MUL: u8 = ScriptOp::Multiply as u8;
    const ADD: u8 = ScriptOp::Add as u8;
    const SUB: u8 = ScriptOp::Substract as u8;

    #[test]
    fn test_fma_at_expression_start() {
        let (x, y, z) = (identifier(1), identifier(2), identifier(3));
        let begin = ScriptOp::Begin.byte();
        let end = ScriptOp::End.byte();
        let mut list = assign(&[x, ADD, begin, y, MUL, z, end]);
        assert_eq!(optimize(&mut list, &[1; 4]), 1);
        assert_eq!(
            list.code,
            vec![ScriptOp::Assign.byte(), identifier(0), ScriptOp::Fma.byte(), y, z, x, 0]
        );
    }

    #[test]
    fn test_chain_prefers_longest() {
        let v: Vec<u8> = (1..=5).map(identifier).collect();
        let mut list = assign(&[v[0], MUL, v[1], MUL, v[2], MUL, v[3], MUL, v[4]]);
        optimize(&mut list, &[1; 6]);
        assert_eq!(list.code[2], ScriptOp::MulA.byte());
        assert_eq!(unpack_count_size(list.code[3]), (5, 1));
        assert_eq!(&list.code[4..9], &v[..]);
    }

    #[test]
    fn test_mixed_sizes_do_not_fuse() {
        let mut list = assign(&[identifier(1), MUL, identifier(2), ADD, constant_byte(1)]);
        let before = list.code.clone();
        // slot 1 is a 3-vector, slot 2 a scalar
        optimize(&mut list, &[1, 3, 1]);
        assert_eq!(list.code, before);
    }

    #[test]
    fn test_no_fusion_mid_expression() {
        let (a, b, c, d) = (identifier(1), identifier(2), identifier(3), identifier(4));
        let mut list = assign(&[a, SUB, b, MUL, c, ADD, d]);
        let before = list.code.clone();
        optimize(&mut list, &[1; 5]);
        assert_eq!(list.code, before);
    }

    #[test]
    fn test_sign_cleanup_and_idempotence() {
        let a = identifier(1);
        let mut list = assign(&[a, ADD, SUB, a, SUB, SUB, a]);
        optimize(&mut list, &[1; 2]);
        assert_eq!(&list.code[2..7], &[a, SUB, a, ADD, a]);

        let once = list.clone();
        assert_eq!(optimize(&mut list, &[1; 2]), 0);
        assert_eq!(list, once);
    }

    #[test]
    fn test_any_fuses_scalars_only() {
        let or = ScriptOp::Or.byte();
        let mut list = assign(&[identifier(1), or, identifier(1), or, identifier(1)]);
        optimize(&mut list, &[1, 2, 2]);
        assert_eq!(list.code[2], identifier(1));

        let mut list = assign(&[identifier(1), or, identifier(1), or, identifier(1)]);
        optimize(&mut list, &[1, 1]);
        assert_eq!(list.code[2], ScriptOp::Any.byte());
    }

    #[test]
    fn test_marker_blocks_rewrite() {
        let mut list = IMByteCodeList::new();
        list.push_op(ScriptOp::Nop);
        list.place_label("l");
        list.push_op(ScriptOp::Nop);
        let before = list.clone();
        optimize(&mut list, &[]);
        assert_eq!(list, before);
    }
}
