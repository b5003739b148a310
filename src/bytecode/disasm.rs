use std::fmt::Write;

use crate::bytecode::jumps::token_boundaries;
use crate::bytecode::op::{ExtendedOp, ScriptOp, byte_name, token_length, unpack_count_size};

/// Disassembly of final code: one instruction token per line, prefixed by
/// its position. Jump targets are marked with `►`.
pub fn disassemble(code: &[u8]) -> String {
    let targets = collect_jump_targets(code);
    let mut out = String::new();

    for pos in token_boundaries(code) {
        if targets.contains(&pos) {
            out.push_str("      ┌──────────────────────────────────\n");
        }
        let marker = if targets.contains(&pos) { "► " } else { "  " };
        let _ = writeln!(out, "{:04} {}{}", pos, marker, describe(code, pos));
    }
    out
}

fn collect_jump_targets(code: &[u8]) -> Vec<usize> {
    let mut targets = Vec::new();
    for pos in token_boundaries(code) {
        if let Some(target) = jump_target(code, pos)
            && !targets.contains(&target)
        {
            targets.push(target);
        }
    }
    targets
}

fn jump_target(code: &[u8], pos: usize) -> Option<usize> {
    let op = ScriptOp::from_byte(*code.get(pos)?)?;
    let offset = *code.get(pos + 1)? as usize;
    let p = pos + 1;
    match op {
        ScriptOp::Jz | ScriptOp::Jnz | ScriptOp::Jump => Some(p + offset),
        ScriptOp::JumpBack => p.checked_sub(offset),
        _ => None,
    }
}

fn describe(code: &[u8], pos: usize) -> String {
    let byte = code[pos];
    let name = byte_name(byte);
    let Some(op) = ScriptOp::from_byte(byte) else {
        return name;
    };
    let len = token_length(code, pos);
    let immediate = code.get(pos + 1).copied();

    match op {
        ScriptOp::Jz | ScriptOp::Jnz | ScriptOp::Jump => {
            format!("{} +{}", name, immediate.unwrap_or(0))
        }
        ScriptOp::JumpBack => format!("{} -{}", name, immediate.unwrap_or(0)),
        ScriptOp::Assign => match immediate {
            Some(target) => format!("{} {}", name, byte_name(target)),
            None => name,
        },
        ScriptOp::ExOp => {
            let Some(ex) = immediate.and_then(ExtendedOp::from_byte) else {
                return format!("{} ?", name);
            };
            if ex == ExtendedOp::Call {
                let id = code
                    .get(pos + 2..pos + len)
                    .filter(|b| b.len() == 4)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));
                match id {
                    Some(id) => format!("{} call #{}", name, id),
                    None => format!("{} call ?", name),
                }
            } else {
                format!("{} {}", name, ex.name())
            }
        }
        _ if op.has_packed_count() => match immediate {
            Some(packed) => {
                let (count, size) = unpack_count_size(packed);
                format!("{} [{} x {}]", name, count, size)
            }
            None => name,
        },
        _ => name,
    }
}
