//! # Script data model
//!
//! Syntax tree nodes, vector values and variable records shared by the
//! compiler stages and the interpreter.
//!
//! ## Conventions
//!
//! - A *sequence* is an ordered list of operand and operator nodes evaluated
//!   strictly left to right.
//! - Juxtaposed operands (`1 2 3`) build a vector of up to four lanes.

pub mod node;
pub mod value;
pub mod variable;
