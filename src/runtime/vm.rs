use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::bytecode::op::{ExtendedOp, ScriptOp, is_identifier, slot_of, unpack_count_size};
use crate::bytecode::package::{Memory, Package, decode_metadata};
use crate::engine::Engine;
use crate::lang::value::{MAX_VECTOR_SIZE, Value};
use crate::lang::variable::DataType;
use crate::runtime::ExitStatus;
use crate::runtime::stack::Stack;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Root statements executed per `execute` or `resume` call.
    pub max_iterations: usize,
    /// Check widths and types of every stack pop.
    pub validate_metadata: bool,
    /// Log runtime diagnostics such as size mismatches.
    pub diagnostics: bool,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        InterpreterConfig {
            max_iterations: 10_000,
            validate_metadata: cfg!(debug_assertions),
            diagnostics: true,
        }
    }
}

/// Executes packages against an engine.
///
/// An interpreter keeps no per-package state between calls: the code
/// pointer, stack and suspension flag live in the package header, so one
/// interpreter can run many packages and a package can be resumed by another
/// interpreter.
pub struct Interpreter<'e> {
    engine: &'e Engine,
    config: InterpreterConfig,
    validation: bool,
    rng: StdRng,
    max_stack_values: usize,
}

impl<'e> Interpreter<'e> {
    pub fn new(engine: &'e Engine) -> Self {
        Self::with_config(engine, InterpreterConfig::default())
    }

    pub fn with_config(engine: &'e Engine, config: InterpreterConfig) -> Self {
        Interpreter {
            engine,
            config,
            validation: false,
            rng: StdRng::seed_from_u64(0),
            max_stack_values: 0,
        }
    }

    /// In validation mode external functions are not called and read as 0.
    pub fn validation_mode(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Most values seen on a stack since this interpreter was created.
    pub fn max_stack_values(&self) -> usize {
        self.max_stack_values
    }

    /// Runs `package` from the start with an empty stack.
    #[instrument(name = "execute", skip_all)]
    pub fn execute(&mut self, package: &mut Package) -> ExitStatus {
        let Some(mut header) = package.header() else {
            return ExitStatus::ErrorInvalidPackage;
        };
        header.code_pointer = 0;
        header.stack_offset = 0;
        header.set_suspended(false);
        package.set_header(&header);
        self.run(package, false)
    }

    /// Continues a package suspended by `yield`.
    #[instrument(name = "resume", skip_all)]
    pub fn resume(&mut self, package: &mut Package) -> ExitStatus {
        match package.header() {
            None => ExitStatus::ErrorInvalidPackage,
            Some(header) if !header.is_suspended() => ExitStatus::ErrorNotSuspended,
            Some(_) => self.run(package, true),
        }
    }

    fn run(&mut self, package: &mut Package, resuming: bool) -> ExitStatus {
        let Some(mut header) = package.header() else {
            return ExitStatus::ErrorInvalidPackage;
        };
        let Some((code, memory)) = package.split_mut() else {
            return ExitStatus::ErrorInvalidPackage;
        };
        let stack = match Stack::attach(
            &memory,
            header.stack_offset.max(0) as usize,
            self.config.validate_metadata,
        ) {
            Ok(stack) => stack,
            Err(status) => return status,
        };

        let mut executor = Executor {
            engine: self.engine,
            config: &self.config,
            validation: self.validation,
            rng: &mut self.rng,
            code,
            memory,
            stack,
            cp: header.code_pointer.max(0) as usize,
            acc: Value::default(),
        };

        let result = if resuming {
            executor.wake().and_then(|woke| {
                if woke {
                    executor.run()
                } else {
                    Ok(ExitStatus::Yield)
                }
            })
        } else {
            executor.run()
        };
        let status = result.unwrap_or_else(|status| status);

        let (cp, offset, max_values) = (executor.cp, executor.stack.offset, executor.stack.max_values);
        self.max_stack_values = self.max_stack_values.max(max_values);

        header.code_pointer = cp as i32;
        header.stack_offset = offset as i32;
        header.set_suspended(status == ExitStatus::Yield);
        package.set_header(&header);

        if status.is_error() {
            debug!(%status, cp, "execution stopped");
        } else {
            trace!(%status, cp, "execution finished");
        }
        status
    }
}

/// State of one execution over borrowed package memory.
pub struct Executor<'a> {
    pub engine: &'a Engine,
    pub config: &'a InterpreterConfig,
    pub validation: bool,
    pub rng: &'a mut StdRng,
    pub code: &'a [u8],
    pub memory: Memory<'a>,
    pub stack: Stack,
    /// Index of the next byte to execute.
    pub cp: usize,
    /// Value of the last evaluated expression.
    pub acc: Value,
}

impl Executor<'_> {
    pub fn byte(&self, pos: usize) -> Result<u8, ExitStatus> {
        self.code
            .get(pos)
            .copied()
            .ok_or(ExitStatus::ErrorInvalidPackage)
    }

    pub fn diagnose(&self, message: impl AsRef<str>) {
        if self.config.diagnostics {
            warn!(cp = self.cp, "{}", message.as_ref());
        }
    }

    fn run(&mut self) -> Result<ExitStatus, ExitStatus> {
        let mut iterations = 0;
        while self.cp < self.code.len() {
            iterations += 1;
            if iterations > self.config.max_iterations {
                return Err(ExitStatus::ErrorMaxIterations);
            }

            let byte = self.code[self.cp];
            let Some(op) = ScriptOp::from_byte(byte) else {
                return Err(ExitStatus::ErrorUnsupportedOperationInRoot);
            };
            match op {
                ScriptOp::Nop => self.cp += 1,
                ScriptOp::Assign => self.assign()?,
                ScriptOp::Jz | ScriptOp::Jnz => self.branch(op)?,
                ScriptOp::Jump => {
                    let p = self.cp + 1;
                    self.cp = p + self.byte(p)? as usize;
                }
                ScriptOp::JumpBack => {
                    let p = self.cp + 1;
                    self.cp = p
                        .checked_sub(self.byte(p)? as usize)
                        .ok_or(ExitStatus::ErrorInvalidPackage)?;
                }
                ScriptOp::Push => self.push()?,
                ScriptOp::PushF => {
                    self.cp += 1;
                    self.acc = self.operand()?;
                    self.stack.push(&mut self.memory, &self.acc, DataType::Numeric)?;
                }
                ScriptOp::PushV => {
                    self.acc = self.vector()?;
                    self.stack.push(&mut self.memory, &self.acc, DataType::Numeric)?;
                }
                ScriptOp::Pop => {
                    self.cp += 1;
                    self.stack.pop(&self.memory, None)?;
                }
                ScriptOp::Yield => return self.suspend(),
                ScriptOp::Seed => {
                    self.cp += 1;
                    let seed = self.operand()?.x();
                    trace!(seed, "reseeding");
                    *self.rng = StdRng::seed_from_u64(seed as u64);
                }
                ScriptOp::Ret => return Ok(ExitStatus::Success),
                ScriptOp::ExOp => self.root_extended()?,
                _ => return Err(ExitStatus::ErrorUnsupportedOperationInRoot),
            }
        }
        Ok(ExitStatus::Success)
    }

    /// `assign target <expr> nop`
    fn assign(&mut self) -> Result<(), ExitStatus> {
        let target = self.byte(self.cp + 1)?;
        if !is_identifier(target) {
            return Err(ExitStatus::ErrorInvalidPackage);
        }
        let slot = slot_of(target);
        let (size, _) = self.slot_metadata(slot)?;
        self.cp += 2;

        let value = self.expression()?;
        if value.size != size {
            self.diagnose(format!(
                "assigning a size {} value to a size {} variable",
                value.size, size
            ));
            return Err(ExitStatus::ErrorAssignVectorSizeMismatch);
        }
        for (i, x) in value.components().iter().enumerate() {
            self.memory
                .set_data_value(slot + i, *x)
                .ok_or(ExitStatus::ErrorInvalidPackage)?;
        }
        self.acc = value;
        Ok(())
    }

    /// `jz|jnz offset <expr> nop`
    fn branch(&mut self, op: ScriptOp) -> Result<(), ExitStatus> {
        let p = self.cp + 1;
        let offset = self.byte(p)? as usize;
        self.cp = p + 1;
        let value = self.expression()?;
        let condition = value.any();
        self.acc = value;
        let jump = match op {
            ScriptOp::Jz => !condition,
            _ => condition,
        };
        if jump {
            self.cp = p + offset;
        }
        Ok(())
    }

    /// `push <expr> nop`; a lone id variable keeps its type on the stack.
    fn push(&mut self) -> Result<(), ExitStatus> {
        self.cp += 1;
        let first = self.byte(self.cp)?;
        let lone = is_identifier(first) && self.code.get(self.cp + 1) == Some(&ScriptOp::Nop.byte());
        let data_type = if lone {
            self.slot_metadata(slot_of(first))?.1
        } else {
            DataType::Numeric
        };
        self.acc = self.expression()?;
        self.stack.push(&mut self.memory, &self.acc, data_type)
    }

    /// `pushv packed operand*`: operands side by side build one vector.
    fn vector(&mut self) -> Result<Value, ExitStatus> {
        let (count, _) = unpack_count_size(self.byte(self.cp + 1)?);
        self.cp += 2;
        let mut value: Option<Value> = None;
        for _ in 0..count {
            let next = self.operand()?;
            value = Some(match value {
                None => next,
                Some(v) => v.grow(&next).ok_or(ExitStatus::ErrorVectorSizeOverflow)?,
            });
        }
        Ok(value.unwrap_or_default())
    }

    /// `yield <expr> nop`: saves the accumulator and the frame counter.
    fn suspend(&mut self) -> Result<ExitStatus, ExitStatus> {
        let saved = self.acc;
        self.cp += 1;
        let frames = self.expression()?.x();
        self.stack.push(&mut self.memory, &saved, DataType::Numeric)?;
        self.stack
            .push(&mut self.memory, &Value::scalar(frames), DataType::Numeric)?;
        trace!(frames, "yield");
        Ok(ExitStatus::Yield)
    }

    /// Counts down the frame counter; true once execution continues.
    fn wake(&mut self) -> Result<bool, ExitStatus> {
        let (counter, _) = self.stack.pop(&self.memory, Some(DataType::Numeric))?;
        let frames = counter.x() - 1.0;
        if frames > 0.0 {
            self.stack
                .push(&mut self.memory, &Value::scalar(frames), DataType::Numeric)?;
            return Ok(false);
        }
        let (saved, _) = self.stack.pop(&self.memory, Some(DataType::Numeric))?;
        self.acc = saved;
        Ok(true)
    }

    fn root_extended(&mut self) -> Result<(), ExitStatus> {
        let sub = self.byte(self.cp + 1)?;
        match ExtendedOp::from_byte(sub) {
            Some(ExtendedOp::Call) => {
                self.acc = self.operand()?;
            }
            Some(ExtendedOp::Debug) => {
                self.cp += 2;
                let value = self.operand()?;
                info!(target: "vecscript::script", value = %value, "debug");
            }
            Some(ExtendedOp::DebugStack) => {
                self.cp += 2;
                info!(
                    target: "vecscript::script",
                    slots = self.stack.offset,
                    values = self.stack.values,
                    "debugstack"
                );
            }
            _ => return Err(ExitStatus::ErrorUnsupportedOperationInRoot),
        }
        Ok(())
    }

    /// Size and type of the variable starting at `slot`.
    pub fn slot_metadata(&self, slot: usize) -> Result<(u8, DataType), ExitStatus> {
        if slot >= self.memory.data_slots() {
            return Err(ExitStatus::ErrorInvalidPackage);
        }
        let byte = self
            .memory
            .data_metadata(slot)
            .ok_or(ExitStatus::ErrorInvalidPackage)?;
        match decode_metadata(byte) {
            (size, Some(data_type)) if (1..=MAX_VECTOR_SIZE).contains(&size) => Ok((size, data_type)),
            _ => Err(ExitStatus::ErrorInvalidPackage),
        }
    }

    pub fn read_variable(&self, slot: usize) -> Result<Value, ExitStatus> {
        let (size, _) = self.slot_metadata(slot)?;
        let mut value = Value {
            lanes: [0.0; 4],
            size,
        };
        for (i, lane) in value.lanes.iter_mut().take(size as usize).enumerate() {
            *lane = self
                .memory
                .data_value(slot + i)
                .ok_or(ExitStatus::ErrorInvalidPackage)?;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompiledScript, Compiler, CompilerOptions};

    fn compile(engine: &Engine, source: &str) -> CompiledScript {
        Compiler::new(engine)
            .compile(source, &CompilerOptions::default())
            .unwrap()
    }

    fn run(source: &str) -> (ExitStatus, CompiledScript, Package) {
        let engine = Engine::new();
        let script = compile(&engine, source);
        let mut package = script.new_package();
        let status = Interpreter::new(&engine).execute(&mut package);
        (status, script, package)
    }

    #[test]
    fn test_assign_and_read_back() {
        let (status, script, package) = run("a = 1 + 2 * 3; b = a a;");
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(script.get(&package, "a").unwrap(), Value::scalar(7.0));
        assert_eq!(script.get(&package, "b").unwrap().components(), &[7.0, 7.0]);
    }

    #[test]
    fn test_loop() {
        let (status, script, package) = run("i = 0; s = 0; while (i < 5) { i = i + 1; s = s + i; }");
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(script.get(&package, "s").unwrap(), Value::scalar(15.0));
    }

    #[test]
    fn test_iteration_cap() {
        let (status, _, package) = run("a = 0; while (1) a = a + 1;");
        assert_eq!(status, ExitStatus::ErrorMaxIterations);
        assert!(!package.is_suspended());
    }

    #[test]
    fn test_yield_and_resume() {
        let engine = Engine::new();
        let script = compile(&engine, "a = 3; yield 2; a = a + 1;");
        let mut package = script.new_package();
        let mut interpreter = Interpreter::new(&engine);

        assert_eq!(interpreter.execute(&mut package), ExitStatus::Yield);
        assert!(package.is_suspended());
        assert_eq!(script.get(&package, "a").unwrap(), Value::scalar(3.0));
        assert_eq!(interpreter.resume(&mut package), ExitStatus::Yield);
        assert_eq!(interpreter.resume(&mut package), ExitStatus::Success);
        assert_eq!(script.get(&package, "a").unwrap(), Value::scalar(4.0));
        assert_eq!(package.stack_offset(), 0);
        assert_eq!(interpreter.resume(&mut package), ExitStatus::ErrorNotSuspended);
    }

    #[test]
    fn test_ret_stops_early() {
        let (status, script, package) = run("a = 1; return; a = 2;");
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(script.get(&package, "a").unwrap(), Value::scalar(1.0));
    }

    #[test]
    fn test_invalid_package() {
        let engine = Engine::new();
        let script = compile(&engine, "a = 1;");
        let mut package = script.new_package();
        let mut header = package.header().unwrap();
        header.data_offset = 4096;
        package.set_header(&header);
        assert_eq!(
            Interpreter::new(&engine).execute(&mut package),
            ExitStatus::ErrorInvalidPackage
        );
    }

    #[test]
    fn test_seeded_random_is_repeatable() {
        let engine = Engine::new();
        let script = compile(&engine, "seed(7); a = random(); b = random(10);");
        let mut first = script.new_package();
        let mut second = script.new_package();
        Interpreter::new(&engine).execute(&mut first);
        Interpreter::new(&engine).execute(&mut second);
        let a = script.get(&first, "a").unwrap().x();
        assert!((0.0..1.0).contains(&a));
        assert_eq!(script.get(&first, "b").unwrap(), script.get(&second, "b").unwrap());
    }
}
