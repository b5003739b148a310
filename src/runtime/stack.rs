use crate::bytecode::package::{Memory, decode_metadata, encode_metadata};
use crate::lang::value::{MAX_VECTOR_SIZE, Value};
use crate::lang::variable::DataType;
use crate::runtime::ExitStatus;

/// Value stack inside the package stack region.
///
/// A value of size `n` takes `n` slots and every slot carries the value's
/// metadata byte, so a pop can read the width from the top slot.
#[derive(Debug)]
pub struct Stack {
    /// Slots in use.
    pub offset: usize,
    /// Values in use.
    pub values: usize,
    pub max_values: usize,
    validate: bool,
}

impl Stack {
    /// Attaches to a stack with `offset` slots already in use.
    pub fn attach(memory: &Memory<'_>, offset: usize, validate: bool) -> Result<Stack, ExitStatus> {
        if offset > memory.stack_slots() {
            return Err(ExitStatus::ErrorInvalidPackage);
        }
        let mut values = 0;
        let mut slot = 0;
        while slot < offset {
            let (size, _) = decode_metadata(memory.stack_metadata(slot).unwrap_or(0));
            if size == 0 {
                return Err(ExitStatus::ErrorInvalidPackage);
            }
            slot += size as usize;
            values += 1;
        }
        Ok(Stack {
            offset,
            values,
            max_values: values,
            validate,
        })
    }

    pub fn push(
        &mut self,
        memory: &mut Memory<'_>,
        value: &Value,
        data_type: DataType,
    ) -> Result<(), ExitStatus> {
        let size = value.size as usize;
        if self.offset + size > memory.stack_slots() {
            return Err(ExitStatus::ErrorStackOverflow);
        }
        let meta = encode_metadata(value.size, data_type);
        for (i, x) in value.components().iter().enumerate() {
            memory
                .set_stack_value(self.offset + i, *x)
                .ok_or(ExitStatus::ErrorStackOverflow)?;
            memory
                .set_stack_metadata(self.offset + i, meta)
                .ok_or(ExitStatus::ErrorStackOverflow)?;
        }
        self.offset += size;
        self.values += 1;
        self.max_values = self.max_values.max(self.values);
        Ok(())
    }

    /// Pops the top value. With `expected` set and validation on, a value of
    /// another type is a type mismatch.
    pub fn pop(
        &mut self,
        memory: &Memory<'_>,
        expected: Option<DataType>,
    ) -> Result<(Value, DataType), ExitStatus> {
        if self.offset == 0 || self.values == 0 {
            return Err(ExitStatus::ErrorStackUnderflow);
        }
        let top = memory
            .stack_metadata(self.offset - 1)
            .ok_or(ExitStatus::ErrorInvalidPackage)?;
        let (size, data_type) = decode_metadata(top);
        let data_type = data_type.ok_or(ExitStatus::ErrorStackTypeMismatch)?;
        if size == 0 || size > MAX_VECTOR_SIZE || size as usize > self.offset {
            return Err(ExitStatus::ErrorStackTypeMismatch);
        }

        let start = self.offset - size as usize;
        if self.validate {
            let ragged = (start..self.offset).any(|slot| memory.stack_metadata(slot) != Some(top));
            if ragged {
                return Err(ExitStatus::ErrorStackTypeMismatch);
            }
            if expected.is_some_and(|t| t != data_type) {
                return Err(ExitStatus::ErrorStackTypeMismatch);
            }
        }

        let mut value = Value {
            lanes: [0.0; 4],
            size,
        };
        for (i, lane) in value.lanes.iter_mut().take(size as usize).enumerate() {
            *lane = memory
                .stack_value(start + i)
                .ok_or(ExitStatus::ErrorInvalidPackage)?;
        }
        self.offset = start;
        self.values -= 1;
        Ok((value, data_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::package::{Package, PackageMode};

    fn package(stack: u16) -> Package {
        Package::build(&[0], &[], stack, PackageMode::Normal).unwrap()
    }

    #[test]
    fn test_push_pop_restores_offset() {
        let mut p = package(8);
        let (_, mut memory) = p.split_mut().unwrap();
        let mut stack = Stack::attach(&memory, 0, true).unwrap();
        stack
            .push(&mut memory, &Value::from_slice(&[1.0, 2.0, 3.0]), DataType::Numeric)
            .unwrap();
        stack.push(&mut memory, &Value::scalar(4.0), DataType::Numeric).unwrap();
        assert_eq!(stack.offset, 4);

        let (top, _) = stack.pop(&memory, Some(DataType::Numeric)).unwrap();
        assert_eq!(top, Value::scalar(4.0));
        let (v, _) = stack.pop(&memory, Some(DataType::Numeric)).unwrap();
        assert_eq!(v.components(), &[1.0, 2.0, 3.0]);
        assert_eq!((stack.offset, stack.max_values), (0, 2));
        assert_eq!(
            stack.pop(&memory, None).unwrap_err(),
            ExitStatus::ErrorStackUnderflow
        );
    }

    #[test]
    fn test_overflow() {
        let mut p = package(3);
        let (_, mut memory) = p.split_mut().unwrap();
        let mut stack = Stack::attach(&memory, 0, true).unwrap();
        stack.push(&mut memory, &Value::splat(1.0, 2), DataType::Numeric).unwrap();
        assert_eq!(
            stack.push(&mut memory, &Value::splat(1.0, 2), DataType::Numeric),
            Err(ExitStatus::ErrorStackOverflow)
        );
    }

    #[test]
    fn test_type_checks() {
        let mut p = package(8);
        let (_, mut memory) = p.split_mut().unwrap();
        let mut stack = Stack::attach(&memory, 0, true).unwrap();
        stack.push(&mut memory, &Value::scalar(7.0), DataType::Id).unwrap();
        assert_eq!(
            stack.pop(&memory, Some(DataType::Numeric)).unwrap_err(),
            ExitStatus::ErrorStackTypeMismatch
        );

        // ragged run: a 2-wide value whose lower slot claims size 1
        stack.push(&mut memory, &Value::splat(1.0, 2), DataType::Numeric).unwrap();
        let lower = stack.offset - 2;
        memory.set_stack_metadata(lower, encode_metadata(1, DataType::Numeric)).unwrap();
        assert_eq!(
            stack.pop(&memory, None).unwrap_err(),
            ExitStatus::ErrorStackTypeMismatch
        );
    }

    #[test]
    fn test_attach_counts_values() {
        let mut p = package(8);
        let (_, mut memory) = p.split_mut().unwrap();
        let mut stack = Stack::attach(&memory, 0, false).unwrap();
        stack.push(&mut memory, &Value::splat(1.0, 4), DataType::Numeric).unwrap();
        stack.push(&mut memory, &Value::scalar(2.0), DataType::Numeric).unwrap();
        let again = Stack::attach(&memory, stack.offset, false).unwrap();
        assert_eq!(again.values, 2);
        assert!(Stack::attach(&memory, 9, false).is_err());
    }
}
