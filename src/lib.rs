//! Vector scripting language: a compiler from script text to a compact byte
//! code package and an interpreter that runs packages against a shared
//! [`Engine`].
//!
//! ```text
//! tokenize → parse → transform → parameters → analysis → flatten →
//! compile → optimize → resolve-jumps → package
//! ```

pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod engine;
pub mod frontend;
pub mod lang;
pub mod runtime;

pub use bytecode::Package;
pub use compiler::{CompileFailure, CompiledScript, Compiler, CompilerOptions};
pub use engine::{Engine, EngineError, NativeFunction};
pub use lang::value::Value;
pub use runtime::{ExitStatus, Interpreter, InterpreterConfig};
