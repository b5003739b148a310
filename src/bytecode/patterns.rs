//! Peephole patterns of the byte code optimizer.
//!
//! Patterns are plain data. Fused patterns turn an operator run at the start
//! of an expression into one function call; cleanup patterns drop redundant
//! operator and terminator pairs anywhere.

use std::sync::OnceLock;

use crate::bytecode::op::ScriptOp;

/// Longest operand chain folded into one accumulate call.
pub const MAX_CHAIN: usize = 16;
/// Shortest chain worth fusing.
pub const MIN_CHAIN: usize = 3;

/// One element of a pattern template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    Op(ScriptOp),
    /// A constant or data slot byte, captured as value `i`.
    Value(usize),
    Begin,
    End,
}

impl Template {
    pub fn matches_op(self, byte: u8) -> bool {
        let op = match self {
            Template::Op(op) => op,
            Template::Begin => ScriptOp::Begin,
            Template::End => ScriptOp::End,
            Template::Value(_) => return false,
        };
        op.byte() == byte
    }
}

/// One element of a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replace {
    Op(ScriptOp),
    /// Packed `(count << 2) | size` for the captured values.
    Packed,
    Value(usize),
}

#[derive(Debug, Clone)]
pub struct Pattern {
    pub name: String,
    pub template: Vec<Template>,
    pub replacement: Vec<Replace>,
    /// Only valid where an expression starts; every value must share one size.
    pub fused: bool,
    /// Only fuses scalar values.
    pub scalar_only: bool,
}

impl Pattern {
    fn cleanup(name: &str, template: &[ScriptOp], replacement: &[ScriptOp]) -> Self {
        Pattern {
            name: name.to_string(),
            template: template.iter().map(|op| Template::Op(*op)).collect(),
            replacement: replacement.iter().map(|op| Replace::Op(*op)).collect(),
            fused: false,
            scalar_only: false,
        }
    }

    fn fused(name: &str, template: Vec<Template>, replacement: Vec<Replace>) -> Self {
        Pattern {
            name: name.to_string(),
            template,
            replacement,
            fused: true,
            scalar_only: false,
        }
    }

    /// `v0 op v1 op ... v(n-1)` into `target packed v0 .. v(n-1)`.
    fn chain(op: ScriptOp, target: ScriptOp, n: usize) -> Self {
        let mut template = Vec::with_capacity(2 * n - 1);
        for i in 0..n {
            if i > 0 {
                template.push(Template::Op(op));
            }
            template.push(Template::Value(i));
        }
        let mut replacement = vec![Replace::Op(target), Replace::Packed];
        replacement.extend((0..n).map(Replace::Value));

        Pattern {
            name: format!("{}{}", target.name(), n),
            template,
            replacement,
            fused: true,
            scalar_only: matches!(target, ScriptOp::Any | ScriptOp::All),
        }
    }

    /// Number of captured values.
    pub fn value_count(&self) -> usize {
        self.template
            .iter()
            .filter(|t| matches!(t, Template::Value(_)))
            .count()
    }
}

/// All patterns, longest template first.
pub fn patterns() -> &'static [Pattern] {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(build)
}

fn build() -> Vec<Pattern> {
    use ScriptOp::*;
    use Template::{Begin as B, End as E, Op as O, Value as V};

    let mut patterns = Vec::new();

    let chains = [
        (Multiply, MulA),
        (Add, AddA),
        (Substract, SubA),
        (Divide, DivA),
        (And, All),
        (Or, ScriptOp::Any),
    ];
    for (op, target) in chains {
        for n in (MIN_CHAIN..=MAX_CHAIN).rev() {
            patterns.push(Pattern::chain(op, target, n));
        }
    }

    let r = Replace::Value;
    patterns.push(Pattern::fused(
        "fma",
        vec![V(0), O(Multiply), V(1), O(Add), V(2)],
        vec![Replace::Op(Fma), r(0), r(1), r(2)],
    ));
    patterns.push(Pattern::fused(
        "fms",
        vec![V(0), O(Multiply), V(1), O(Substract), V(2)],
        vec![Replace::Op(Fms), r(0), r(1), r(2)],
    ));
    patterns.push(Pattern::fused(
        "fma_add_compound",
        vec![V(0), O(Add), B, V(1), O(Multiply), V(2), E],
        vec![Replace::Op(Fma), r(1), r(2), r(0)],
    ));
    patterns.push(Pattern::fused(
        "fsm_sub_compound",
        vec![V(0), O(Substract), B, V(1), O(Multiply), V(2), E],
        vec![Replace::Op(Fsm), r(0), r(1), r(2)],
    ));
    patterns.push(Pattern::fused(
        "fma_compound_add",
        vec![B, V(0), O(Multiply), V(1), E, O(Add), V(2)],
        vec![Replace::Op(Fma), r(0), r(1), r(2)],
    ));
    patterns.push(Pattern::fused(
        "fms_compound_sub",
        vec![B, V(0), O(Multiply), V(1), E, O(Substract), V(2)],
        vec![Replace::Op(Fms), r(0), r(1), r(2)],
    ));

    patterns.push(Pattern::cleanup("add_sub", &[Add, Substract], &[Substract]));
    patterns.push(Pattern::cleanup("sub_sub", &[Substract, Substract], &[Add]));
    patterns.push(Pattern::cleanup("add_add", &[Add, Add], &[Add]));
    patterns.push(Pattern::cleanup("nop_nop", &[Nop, Nop], &[Nop]));
    patterns.push(Pattern::cleanup("nop_end", &[Nop, End], &[End]));

    // stable: equal lengths keep the order above
    patterns.sort_by(|a, b| b.template.len().cmp(&a.template.len()));
    patterns
}
