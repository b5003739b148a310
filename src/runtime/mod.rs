//! Package interpreter.

pub mod compound;
pub mod handlers;
pub mod runtime_error;
pub mod stack;
pub mod vm;

pub use runtime_error::ExitStatus;
pub use vm::{Interpreter, InterpreterConfig};
