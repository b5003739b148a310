//! Byte code: encoding, generation, peephole optimization, jump resolution
//! and packaging.

pub mod compile;
pub mod disasm;
pub mod ir;
pub mod jumps;
pub mod op;
pub mod optimize;
pub mod package;
pub mod patterns;

pub use ir::IMByteCodeList;
pub use op::{ExtendedOp, ScriptOp};
pub use package::{Package, PackageHeader, PackageMode};
