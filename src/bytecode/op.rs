// =============================================================================
// OP - Bytecode encoding
// =============================================================================
//
// One byte per operation. The byte space is partitioned:
//
//   0   ..= 62    script operations (statements, operators, functions)
//   64  ..= 127   engine constants (looked up in the engine constant table)
//   128 ..= 255   data slot references (slot + IDENT_BASE)

use serde::{Deserialize, Serialize};

/// First byte value that refers to an engine constant.
pub const CONSTANT_FIRST: u8 = 64;

/// First byte value that refers to a data slot.
pub const IDENT_BASE: u8 = 128;

/// Number of addressable data slots.
pub const MAX_DATA_SLOTS: usize = 128;

/// Largest parameter count that fits the packed count/size byte.
pub const MAX_PACKED_COUNT: usize = 63;

macro_rules! script_ops {
    ($($variant:ident = $value:literal => $name:literal,)*) => {
        /// Operation byte values that drive both emission and interpretation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum ScriptOp {
            $($variant = $value,)*
        }

        impl ScriptOp {
            /// Lower-case mnemonic used by the disassembler and diagnostics.
            pub const fn name(self) -> &'static str {
                match self {
                    $(ScriptOp::$variant => $name,)*
                }
            }

            /// Decodes an operation byte; constants and data references are not operations.
            pub const fn from_byte(byte: u8) -> Option<ScriptOp> {
                match byte {
                    $($value => Some(ScriptOp::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

script_ops! {
    Nop = 0 => "nop",
    Assign = 1 => "assign",
    Jz = 2 => "jz",
    Jnz = 3 => "jnz",
    Jump = 4 => "jump",
    JumpBack = 5 => "jump_back",
    Push = 6 => "push",
    PushF = 7 => "pushf",
    PushV = 8 => "pushv",
    Pop = 9 => "pop",
    Yield = 10 => "yield",
    Seed = 11 => "seed",
    Ret = 12 => "ret",
    ExOp = 13 => "ex_op",
    Begin = 14 => "begin",
    End = 15 => "end",

    Add = 16 => "add",
    Substract = 17 => "substract",
    Multiply = 18 => "multiply",
    Divide = 19 => "divide",
    And = 20 => "and",
    Or = 21 => "or",
    Xor = 22 => "xor",
    Not = 23 => "not",
    Smaller = 24 => "smaller",
    Greater = 25 => "greater",
    SmallerEquals = 26 => "smaller_equals",
    GreaterEquals = 27 => "greater_equals",
    Equals = 28 => "equals",
    NotEquals = 29 => "not_equals",

    Abs = 30 => "abs",
    Min = 31 => "min",
    Max = 32 => "max",
    MinA = 33 => "mina",
    MaxA = 34 => "maxa",
    Sqrt = 35 => "sqrt",
    RSqrt = 36 => "rsqrt",
    Sin = 37 => "sin",
    Cos = 38 => "cos",
    Tan = 39 => "tan",
    Atan = 40 => "atan",
    Lerp = 41 => "lerp",
    Slerp = 42 => "slerp",
    Normalize = 43 => "normalize",
    Clamp = 44 => "clamp",
    Saturate = 45 => "saturate",
    Pow = 46 => "pow",
    Distance = 47 => "distance",
    Length = 48 => "length",
    Exp = 49 => "exp",
    Cross = 50 => "cross",
    Dot = 51 => "dot",
    Select = 52 => "select",
    Random = 53 => "random",
    Fma = 54 => "fma",
    Fms = 55 => "fms",
    Fsm = 56 => "fsm",
    MulA = 57 => "mula",
    AddA = 58 => "adda",
    SubA = 59 => "suba",
    DivA = 60 => "diva",
    Any = 61 => "any",
    All = 62 => "all",
}

impl ScriptOp {
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Binary and unary operators that may appear between operands.
    pub const fn is_operator(self) -> bool {
        (self as u8) >= ScriptOp::Add as u8 && (self as u8) <= ScriptOp::NotEquals as u8
    }

    /// Operations that produce a value when they appear as an operand.
    pub const fn is_function(self) -> bool {
        (self as u8) >= ScriptOp::Abs as u8 && (self as u8) <= ScriptOp::All as u8
    }

    /// Functions that carry a packed `(count << 2) | size` byte.
    pub const fn has_packed_count(self) -> bool {
        matches!(
            self,
            ScriptOp::Min
                | ScriptOp::Max
                | ScriptOp::MinA
                | ScriptOp::MaxA
                | ScriptOp::MulA
                | ScriptOp::AddA
                | ScriptOp::SubA
                | ScriptOp::DivA
                | ScriptOp::Any
                | ScriptOp::All
                | ScriptOp::Random
                | ScriptOp::PushV
        )
    }

    /// Bytes that follow the opcode and must never be read as operations.
    ///
    /// Extended operations are variable; see [`token_length`].
    pub const fn immediate_bytes(self) -> usize {
        match self {
            ScriptOp::Assign
            | ScriptOp::Jz
            | ScriptOp::Jnz
            | ScriptOp::Jump
            | ScriptOp::JumpBack => 1,
            op if op.has_packed_count() => 1,
            _ => 0,
        }
    }

    /// Opcodes that start a jump and carry a one byte offset.
    pub const fn is_jump(self) -> bool {
        matches!(
            self,
            ScriptOp::Jz | ScriptOp::Jnz | ScriptOp::Jump | ScriptOp::JumpBack
        )
    }
}

macro_rules! extended_ops {
    ($($variant:ident = $value:literal => $name:literal,)*) => {
        /// Sub-operations that follow an `ex_op` byte.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum ExtendedOp {
            $($variant = $value,)*
        }

        impl ExtendedOp {
            pub const fn name(self) -> &'static str {
                match self {
                    $(ExtendedOp::$variant => $name,)*
                }
            }

            pub const fn from_byte(byte: u8) -> Option<ExtendedOp> {
                match byte {
                    $($value => Some(ExtendedOp::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

extended_ops! {
    Call = 0 => "call",
    Debug = 1 => "debug",
    DebugStack = 2 => "debugstack",
    Log2 = 3 => "log2",
    Log10 = 4 => "log10",
    Logn = 5 => "logn",
    Exp10 = 6 => "exp10",
    Sinh = 7 => "sinh",
    Cosh = 8 => "cosh",
    Atan2 = 9 => "atan2",
    Ceil = 10 => "ceil",
    Floor = 11 => "floor",
    Frac = 12 => "frac",
    Degrees = 13 => "degrees",
    Radians = 14 => "radians",
    LengthSq = 15 => "lengthsq",
    DistanceSq = 16 => "distancesq",
    IndexX = 17 => "index_x",
    IndexY = 18 => "index_y",
    IndexZ = 19 => "index_z",
    IndexW = 20 => "index_w",
}

impl ExtendedOp {
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Immediate bytes after the sub-operation byte.
    pub const fn immediate_bytes(self) -> usize {
        match self {
            ExtendedOp::Call => 4,
            _ => 0,
        }
    }

    /// Extended operations that are statements rather than values.
    pub const fn is_procedure(self) -> bool {
        matches!(self, ExtendedOp::Debug | ExtendedOp::DebugStack)
    }

    /// Component index for the `index_*` family.
    pub const fn index_component(self) -> Option<usize> {
        match self {
            ExtendedOp::IndexX => Some(0),
            ExtendedOp::IndexY => Some(1),
            ExtendedOp::IndexZ => Some(2),
            ExtendedOp::IndexW => Some(3),
            _ => None,
        }
    }

    pub const fn index(component: usize) -> Option<ExtendedOp> {
        match component {
            0 => Some(ExtendedOp::IndexX),
            1 => Some(ExtendedOp::IndexY),
            2 => Some(ExtendedOp::IndexZ),
            3 => Some(ExtendedOp::IndexW),
            _ => None,
        }
    }
}

// =============================================================================
// Operand bytes
// =============================================================================

pub const fn is_constant(byte: u8) -> bool {
    byte >= CONSTANT_FIRST && byte < IDENT_BASE
}

pub const fn is_identifier(byte: u8) -> bool {
    byte >= IDENT_BASE
}

/// A single byte that is a value on its own: engine constant or data slot.
pub const fn is_value(byte: u8) -> bool {
    byte >= CONSTANT_FIRST
}

pub const fn slot_of(byte: u8) -> usize {
    (byte - IDENT_BASE) as usize
}

pub const fn identifier(slot: usize) -> u8 {
    IDENT_BASE + slot as u8
}

/// Packs a parameter count and a vector size. A stored size of 0 means 4.
pub const fn pack_count_size(count: usize, vector_size: u8) -> u8 {
    ((count as u8) << 2) | (vector_size & 0b11)
}

/// Inverse of [`pack_count_size`].
pub const fn unpack_count_size(packed: u8) -> (usize, u8) {
    let size = packed & 0b11;
    ((packed >> 2) as usize, if size == 0 { 4 } else { size })
}

/// Length of the instruction token at `pos`: the byte itself plus its immediates.
///
/// Operands, operators and structural bytes are one byte long. Past the end of
/// the code the length is 1 so scanners always make progress.
pub fn token_length(code: &[u8], pos: usize) -> usize {
    let Some(&byte) = code.get(pos) else {
        return 1;
    };

    match ScriptOp::from_byte(byte) {
        Some(ScriptOp::ExOp) => {
            let sub = code
                .get(pos + 1)
                .and_then(|b| ExtendedOp::from_byte(*b))
                .map(|ex| ex.immediate_bytes())
                .unwrap_or(0);
            2 + sub
        }
        Some(op) => 1 + op.immediate_bytes(),
        None => 1,
    }
}

// =============================================================================
// Engine constants
// =============================================================================

/// A named engine constant. `names` are recognized case-insensitively.
#[derive(Debug, Clone, Copy)]
pub struct ConstantDef {
    pub value: f32,
    pub names: &'static [&'static str],
}

const fn c(value: f32) -> ConstantDef {
    ConstantDef { value, names: &[] }
}

const fn named(value: f32, names: &'static [&'static str]) -> ConstantDef {
    ConstantDef { value, names }
}

/// Constants addressed by byte `CONSTANT_FIRST + index`.
pub const CONSTANTS: &[ConstantDef] = &[
    c(0.0),
    c(1.0),
    c(2.0),
    c(3.0),
    c(4.0),
    c(5.0),
    c(6.0),
    c(7.0),
    c(8.0),
    c(9.0),
    c(10.0),
    c(16.0),
    c(24.0),
    c(30.0),
    c(32.0),
    c(45.0),
    c(60.0),
    c(64.0),
    c(90.0),
    c(100.0),
    c(128.0),
    c(180.0),
    c(256.0),
    c(270.0),
    c(360.0),
    c(512.0),
    c(1000.0),
    c(1024.0),
    c(0.5),
    c(0.25),
    c(0.1),
    c(0.2),
    c(0.3),
    c(0.4),
    c(0.6),
    c(0.7),
    c(0.75),
    c(0.8),
    c(0.9),
    c(0.01),
    c(0.001),
    named(std::f32::consts::PI, &["pi"]),
    named(std::f32::consts::TAU, &["tau"]),
    c(std::f32::consts::FRAC_PI_2),
    c(std::f32::consts::FRAC_1_PI),
    c(std::f32::consts::E),
    named(f32::EPSILON, &["epsilon"]),
    named(f32::INFINITY, &["infinity", "inf"]),
    c(f32::NEG_INFINITY),
    named(f32::NAN, &["nan"]),
    named(f32::MIN_POSITIVE, &["flt_min"]),
    named(f32::MAX, &["flt_max"]),
    named(std::f32::consts::PI / 180.0, &["deg2rad"]),
    named(180.0 / std::f32::consts::PI, &["rad2deg"]),
];

/// Byte that addresses the constant at `index` in [`CONSTANTS`].
pub const fn constant_byte(index: usize) -> u8 {
    CONSTANT_FIRST + index as u8
}

/// Finds the constant named `name`, ignoring case.
pub fn constant_by_name(name: &str) -> Option<u8> {
    CONSTANTS
        .iter()
        .position(|def| def.names.iter().any(|n| n.eq_ignore_ascii_case(name)))
        .map(constant_byte)
}

/// Finds a table constant within `epsilon` of `value`. Non-finite values only
/// match by name.
pub fn constant_by_value(value: f32, epsilon: f32) -> Option<u8> {
    if !value.is_finite() {
        return None;
    }
    CONSTANTS
        .iter()
        .position(|def| def.value.is_finite() && (def.value - value).abs() <= epsilon)
        .map(constant_byte)
}

/// Mnemonic for any byte, used by the disassembler.
pub fn byte_name(byte: u8) -> String {
    if is_identifier(byte) {
        format!("id{}", slot_of(byte))
    } else if is_constant(byte) {
        match CONSTANTS.get((byte - CONSTANT_FIRST) as usize) {
            Some(def) => match def.names.first() {
                Some(name) => (*name).to_string(),
                None => format!("{}", def.value),
            },
            None => format!("const{}", byte),
        }
    } else {
        match ScriptOp::from_byte(byte) {
            Some(op) => op.name().to_string(),
            None => format!("0x{:02x}", byte),
        }
    }
}
