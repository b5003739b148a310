//! Expression evaluation.
//!
//! An expression is a flat run of operands and operators ending at `nop` or
//! `end`. Operators in operand position are unary; an operator after a value
//! is binary and applies to the next value; two values side by side grow the
//! result vector.

use crate::builtins::{self, Emit};
use crate::bytecode::op::{
    ExtendedOp, ScriptOp, is_constant, is_identifier, slot_of, unpack_count_size,
};
use crate::lang::value::{Value, bool_to_f32};
use crate::lang::variable::DataType;
use crate::runtime::ExitStatus;
use crate::runtime::handlers::handler;
use crate::runtime::vm::Executor;

/// Lane-wise binary operator with scalar broadcasting; `None` for sizes that
/// do not broadcast or for a non-binary operator.
pub fn apply_operator(op: ScriptOp, a: &Value, b: &Value) -> Option<Value> {
    let truth = |x: f32| x != 0.0;
    match op {
        ScriptOp::Add => a.zip(b, |x, y| x + y),
        ScriptOp::Substract => a.zip(b, |x, y| x - y),
        ScriptOp::Multiply => a.zip(b, |x, y| x * y),
        ScriptOp::Divide => a.zip(b, |x, y| x / y),
        ScriptOp::And => a.zip(b, |x, y| bool_to_f32(truth(x) && truth(y))),
        ScriptOp::Or => a.zip(b, |x, y| bool_to_f32(truth(x) || truth(y))),
        ScriptOp::Xor => a.zip(b, |x, y| bool_to_f32(truth(x) != truth(y))),
        ScriptOp::Smaller => a.zip(b, |x, y| bool_to_f32(x < y)),
        ScriptOp::Greater => a.zip(b, |x, y| bool_to_f32(x > y)),
        ScriptOp::SmallerEquals => a.zip(b, |x, y| bool_to_f32(x <= y)),
        ScriptOp::GreaterEquals => a.zip(b, |x, y| bool_to_f32(x >= y)),
        ScriptOp::Equals => a.zip(b, |x, y| bool_to_f32(x == y)),
        ScriptOp::NotEquals => a.zip(b, |x, y| bool_to_f32(x != y)),
        _ => None,
    }
}

/// Applies pending unary operators: `not` first, then negation.
pub fn apply_unary(value: Value, negate: bool, not: bool) -> Value {
    let value = if not { value.not() } else { value };
    if negate { value.negate() } else { value }
}

impl Executor<'_> {
    /// Evaluates up to and including the terminating `nop` or `end`. An empty
    /// expression is scalar 0.
    pub fn expression(&mut self) -> Result<Value, ExitStatus> {
        let mut acc: Option<Value> = None;
        let mut pending: Option<ScriptOp> = None;
        let (mut negate, mut not) = (false, false);

        loop {
            let byte = self.byte(self.cp)?;
            if byte == ScriptOp::Nop.byte() || byte == ScriptOp::End.byte() {
                self.cp += 1;
                break;
            }

            if let Some(op) = ScriptOp::from_byte(byte).filter(|op| op.is_operator()) {
                self.cp += 1;
                if acc.is_some() && pending.is_none() {
                    pending = Some(op);
                    continue;
                }
                match op {
                    ScriptOp::Substract => {
                        if negate {
                            self.diagnose("double negation");
                        }
                        negate = !negate;
                    }
                    ScriptOp::Not => {
                        if not {
                            self.diagnose("double not");
                        }
                        not = !not;
                    }
                    ScriptOp::Add => {}
                    _ => return Err(ExitStatus::ErrorUnknownOperation),
                }
                continue;
            }

            let value = apply_unary(self.operand()?, negate, not);
            negate = false;
            not = false;

            acc = Some(match (acc, pending.take()) {
                (None, _) => value,
                (Some(current), Some(op)) => match apply_operator(op, &current, &value) {
                    Some(result) => result,
                    None => {
                        self.diagnose(format!(
                            "'{}' between sizes {} and {}",
                            op.name(),
                            current.size,
                            value.size
                        ));
                        Value::nan(current.size.max(value.size))
                    }
                },
                (Some(current), None) => current
                    .grow(&value)
                    .ok_or(ExitStatus::ErrorVectorSizeOverflow)?,
            });
        }

        Ok(acc.unwrap_or_default())
    }

    /// Evaluates one operand starting at the code pointer.
    pub fn operand(&mut self) -> Result<Value, ExitStatus> {
        let byte = self.byte(self.cp)?;
        if is_constant(byte) {
            self.cp += 1;
            return Ok(Value::scalar(self.engine.constant(byte)));
        }
        if is_identifier(byte) {
            self.cp += 1;
            return self.read_variable(slot_of(byte));
        }

        match ScriptOp::from_byte(byte) {
            Some(ScriptOp::Pop) => {
                self.cp += 1;
                let (value, _) = self.stack.pop(&self.memory, Some(DataType::Numeric))?;
                Ok(value)
            }
            Some(ScriptOp::Begin) => {
                self.cp += 1;
                self.expression()
            }
            Some(ScriptOp::ExOp) => self.extended(),
            Some(op) if op.is_function() => self.builtin(Emit::Op(op)),
            _ => Err(ExitStatus::ErrorUnknownOperation),
        }
    }

    /// `ex_op <sub> ...` in value position.
    fn extended(&mut self) -> Result<Value, ExitStatus> {
        let sub = self.byte(self.cp + 1)?;
        let Some(ex) = ExtendedOp::from_byte(sub) else {
            return Err(ExitStatus::ErrorUnknownOperation);
        };
        if let Some(component) = ex.index_component() {
            self.cp += 2;
            let value = self.operand()?;
            if component < value.size as usize {
                return Ok(Value::scalar(value.lanes[component]));
            }
            self.diagnose(format!("{} of a size {} value", ex.name(), value.size));
            return Ok(Value::nan(1));
        }
        match ex {
            ExtendedOp::Call => self.call_external(),
            ExtendedOp::Debug | ExtendedOp::DebugStack => Err(ExitStatus::ErrorUnknownOperation),
            _ => {
                self.cp += 1;
                self.builtin(Emit::Ex(ex))
            }
        }
    }

    /// `ex_op call id(4, big endian) args`
    fn call_external(&mut self) -> Result<Value, ExitStatus> {
        let at = self.cp + 2;
        let id = self
            .code
            .get(at..at + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or(ExitStatus::ErrorInvalidPackage)?;
        self.cp = at + 4;

        let function = self
            .engine
            .function_by_id(id)
            .ok_or(ExitStatus::ErrorUnresolvedFunctionId)?;
        let arity = function.function.arity() as usize;
        let mut args = [0.0f32; 4];
        for arg in args.iter_mut().take(arity) {
            *arg = self.operand()?.x();
        }

        if self.validation {
            return Ok(Value::scalar(0.0));
        }
        Ok(Value::scalar(function.function.call(&args[..arity])))
    }

    /// Built-in function whose opcode sits at the code pointer.
    fn builtin(&mut self, emit: Emit) -> Result<Value, ExitStatus> {
        let info = builtins::info_for(emit).ok_or(ExitStatus::ErrorUnknownOperation)?;
        self.cp += 1;

        let (count, packed_width) = if info.packed() {
            let (count, size) = unpack_count_size(self.byte(self.cp)?);
            self.cp += 1;
            (count, Some(size))
        } else {
            (info.min_params, None)
        };

        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            args.push(self.operand()?);
        }
        let sizes: Vec<u8> = args.iter().map(|a| a.size).collect();

        let Some(width) = packed_width.or_else(|| info.operand_width(&sizes)) else {
            self.diagnose(format!("'{}' with parameter sizes {:?}", info.name, sizes));
            let widest = sizes.iter().copied().max().unwrap_or(1);
            return Ok(Value::nan(info.return_size(&[widest]).unwrap_or(widest)));
        };
        if !info.support.supports(width) {
            self.diagnose(format!("'{}' is not implemented for size {}", info.name, width));
            return Ok(Value::nan(info.return_size(&[width]).unwrap_or(width)));
        }

        let handler = handler(emit).ok_or(ExitStatus::ErrorUnknownOperation)?;
        Ok(handler(self, &args, width))
    }
}
