//! Built-in function and procedure table.
//!
//! One row per callable name: the byte it compiles to, the accepted parameter
//! counts, how the result size follows from the parameter sizes and which
//! vector sizes the interpreter implements. Compiler and interpreter read the
//! same rows.

use crate::bytecode::op::{ExtendedOp, MAX_PACKED_COUNT, ScriptOp};
use crate::lang::value::broadcast_size;

/// Statements that look like calls: `push(a); x = pop; yield 2;`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Procedure {
    Push,
    Pop,
    Yield,
    Seed,
    Debug,
    DebugStack,
    Return,
}

impl Procedure {
    pub const fn name(self) -> &'static str {
        match self {
            Procedure::Push => "push",
            Procedure::Pop => "pop",
            Procedure::Yield => "yield",
            Procedure::Seed => "seed",
            Procedure::Debug => "debug",
            Procedure::DebugStack => "debugstack",
            Procedure::Return => "return",
        }
    }

    pub fn from_name(name: &str) -> Option<Procedure> {
        let procedure = match name.to_ascii_lowercase().as_str() {
            "push" => Procedure::Push,
            "pop" => Procedure::Pop,
            "yield" => Procedure::Yield,
            "seed" => Procedure::Seed,
            "debug" => Procedure::Debug,
            "debugstack" => Procedure::DebugStack,
            "return" => Procedure::Return,
            _ => return None,
        };
        Some(procedure)
    }

    /// Inclusive bounds on the argument count.
    pub const fn params(self) -> (usize, usize) {
        match self {
            Procedure::Push => (1, 1),
            Procedure::Pop => (0, 1),
            Procedure::Yield => (0, 1),
            Procedure::Seed => (1, 1),
            Procedure::Debug => (1, 1),
            Procedure::DebugStack => (0, 0),
            Procedure::Return => (0, 0),
        }
    }
}

/// What a call resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionRef {
    /// Row index into [`FUNCTIONS`].
    Builtin(usize),
    /// Engine registered native function.
    External { id: u32, arity: u8 },
    Procedure(Procedure),
}

/// Byte emitted for a built-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Emit {
    Op(ScriptOp),
    Ex(ExtendedOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnSize {
    /// Broadcast of all parameter sizes (1 without parameters).
    Broadcast,
    /// Always a scalar.
    Scalar,
}

/// Vector sizes a built-in is implemented for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSupport {
    Any,
    ScalarOrVec4,
    Vec4,
}

impl SizeSupport {
    pub const fn supports(self, size: u8) -> bool {
        match self {
            SizeSupport::Any => size >= 1 && size <= 4,
            SizeSupport::ScalarOrVec4 => size == 1 || size == 4,
            SizeSupport::Vec4 => size == 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FunctionInfo {
    pub name: &'static str,
    pub emit: Emit,
    pub min_params: usize,
    pub max_params: usize,
    pub returns: ReturnSize,
    pub support: SizeSupport,
}

impl FunctionInfo {
    /// True when the call carries a packed count/size byte.
    pub const fn packed(&self) -> bool {
        match self.emit {
            Emit::Op(op) => op.has_packed_count(),
            Emit::Ex(_) => false,
        }
    }

    /// Vector size the call works on: the broadcast of its parameter sizes.
    /// Reductions over every component take any mix and use the widest.
    pub fn operand_width(&self, param_sizes: &[u8]) -> Option<u8> {
        if self.packed() && self.returns == ReturnSize::Scalar {
            return Some(param_sizes.iter().copied().max().unwrap_or(1));
        }
        param_sizes
            .iter()
            .try_fold(1u8, |acc, size| broadcast_size(acc, *size))
    }

    /// Result size for the given parameter sizes, `None` when they do not broadcast.
    pub fn return_size(&self, param_sizes: &[u8]) -> Option<u8> {
        match self.returns {
            ReturnSize::Scalar => Some(1),
            ReturnSize::Broadcast => self.operand_width(param_sizes),
        }
    }
}

const fn op(
    name: &'static str,
    op: ScriptOp,
    params: (usize, usize),
    returns: ReturnSize,
    support: SizeSupport,
) -> FunctionInfo {
    FunctionInfo {
        name,
        emit: Emit::Op(op),
        min_params: params.0,
        max_params: params.1,
        returns,
        support,
    }
}

const fn ex(
    name: &'static str,
    op: ExtendedOp,
    params: (usize, usize),
    returns: ReturnSize,
    support: SizeSupport,
) -> FunctionInfo {
    FunctionInfo {
        name,
        emit: Emit::Ex(op),
        min_params: params.0,
        max_params: params.1,
        returns,
        support,
    }
}

use ReturnSize::{Broadcast, Scalar};
use SizeSupport::{Any, ScalarOrVec4, Vec4};

const N: usize = MAX_PACKED_COUNT;

pub static FUNCTIONS: &[FunctionInfo] = &[
    op("abs", ScriptOp::Abs, (1, 1), Broadcast, Any),
    op("min", ScriptOp::Min, (2, N), Broadcast, Any),
    op("max", ScriptOp::Max, (2, N), Broadcast, Any),
    op("mina", ScriptOp::MinA, (1, N), Scalar, Any),
    op("maxa", ScriptOp::MaxA, (1, N), Scalar, Any),
    op("sqrt", ScriptOp::Sqrt, (1, 1), Broadcast, ScalarOrVec4),
    op("rsqrt", ScriptOp::RSqrt, (1, 1), Broadcast, ScalarOrVec4),
    op("sin", ScriptOp::Sin, (1, 1), Broadcast, ScalarOrVec4),
    op("cos", ScriptOp::Cos, (1, 1), Broadcast, ScalarOrVec4),
    op("tan", ScriptOp::Tan, (1, 1), Broadcast, ScalarOrVec4),
    op("atan", ScriptOp::Atan, (1, 1), Broadcast, ScalarOrVec4),
    op("lerp", ScriptOp::Lerp, (3, 3), Broadcast, Any),
    op("slerp", ScriptOp::Slerp, (3, 3), Broadcast, Vec4),
    op("normalize", ScriptOp::Normalize, (1, 1), Broadcast, Vec4),
    op("clamp", ScriptOp::Clamp, (3, 3), Broadcast, Any),
    op("saturate", ScriptOp::Saturate, (1, 1), Broadcast, Any),
    op("pow", ScriptOp::Pow, (2, 2), Broadcast, ScalarOrVec4),
    op("distance", ScriptOp::Distance, (2, 2), Scalar, Any),
    op("length", ScriptOp::Length, (1, 1), Scalar, Any),
    op("exp", ScriptOp::Exp, (1, 1), Broadcast, ScalarOrVec4),
    op("cross", ScriptOp::Cross, (2, 2), Broadcast, Vec4),
    op("dot", ScriptOp::Dot, (2, 2), Scalar, Any),
    op("select", ScriptOp::Select, (3, 3), Broadcast, Any),
    op("random", ScriptOp::Random, (0, 2), Broadcast, Any),
    op("fma", ScriptOp::Fma, (3, 3), Broadcast, Any),
    op("fms", ScriptOp::Fms, (3, 3), Broadcast, Any),
    op("fsm", ScriptOp::Fsm, (3, 3), Broadcast, Any),
    op("mula", ScriptOp::MulA, (2, N), Broadcast, Any),
    op("adda", ScriptOp::AddA, (2, N), Broadcast, Any),
    op("suba", ScriptOp::SubA, (2, N), Broadcast, Any),
    op("diva", ScriptOp::DivA, (2, N), Broadcast, Any),
    op("any", ScriptOp::Any, (1, N), Scalar, Any),
    op("all", ScriptOp::All, (1, N), Scalar, Any),
    ex("log2", ExtendedOp::Log2, (1, 1), Broadcast, ScalarOrVec4),
    ex("log10", ExtendedOp::Log10, (1, 1), Broadcast, ScalarOrVec4),
    ex("logn", ExtendedOp::Logn, (1, 1), Broadcast, ScalarOrVec4),
    ex("exp10", ExtendedOp::Exp10, (1, 1), Broadcast, ScalarOrVec4),
    ex("sinh", ExtendedOp::Sinh, (1, 1), Broadcast, ScalarOrVec4),
    ex("cosh", ExtendedOp::Cosh, (1, 1), Broadcast, ScalarOrVec4),
    ex("atan2", ExtendedOp::Atan2, (2, 2), Broadcast, ScalarOrVec4),
    ex("ceil", ExtendedOp::Ceil, (1, 1), Broadcast, Any),
    ex("floor", ExtendedOp::Floor, (1, 1), Broadcast, Any),
    ex("frac", ExtendedOp::Frac, (1, 1), Broadcast, Any),
    ex("degrees", ExtendedOp::Degrees, (1, 1), Broadcast, Any),
    ex("radians", ExtendedOp::Radians, (1, 1), Broadcast, Any),
    ex("lengthsq", ExtendedOp::LengthSq, (1, 1), Scalar, Any),
    ex("distancesq", ExtendedOp::DistanceSq, (2, 2), Scalar, Any),
];

pub fn info(index: usize) -> Option<&'static FunctionInfo> {
    FUNCTIONS.get(index)
}

/// Row index of the built-in named `name`, ignoring case.
pub fn lookup(name: &str) -> Option<usize> {
    FUNCTIONS
        .iter()
        .position(|f| f.name.eq_ignore_ascii_case(name))
}

/// Row describing the built-in that compiles to `emit`.
pub fn info_for(emit: Emit) -> Option<&'static FunctionInfo> {
    FUNCTIONS.iter().find(|f| f.emit == emit)
}
