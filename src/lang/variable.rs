use serde::{Deserialize, Serialize};

use crate::lang::value::Value;

/// Type half of a metadata byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    #[default]
    Numeric = 0,
    Id = 1,
}

impl DataType {
    pub const fn from_bits(bits: u8) -> Option<DataType> {
        match bits {
            0 => Some(DataType::Numeric),
            1 => Some(DataType::Id),
            _ => None,
        }
    }
}

/// A named data slot of a compile job.
///
/// Created when an identifier or a data constant is first seen. `id` is dense
/// and stable once the analysis stage has pruned unreferenced variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub id: usize,
    pub name: String,
    /// 0 while undetermined.
    pub vector_size: u8,
    pub is_constant: bool,
    pub is_input: bool,
    pub is_output: bool,
    pub reference_count: u32,
    pub data_type: DataType,
    /// Constant value, or the default of an input.
    pub value: Option<Value>,
}

impl Variable {
    pub fn new(id: usize, name: impl Into<String>) -> Self {
        Variable {
            id,
            name: name.into(),
            vector_size: 0,
            is_constant: false,
            is_input: false,
            is_output: false,
            reference_count: 0,
            data_type: DataType::Numeric,
            value: None,
        }
    }

    /// A deduplicated data constant holding `value`.
    pub fn constant(id: usize, value: Value) -> Self {
        let mut variable = Variable::new(id, format!("_const{}", id));
        variable.is_constant = true;
        variable.vector_size = value.size;
        variable.value = Some(value);
        variable
    }
}

/// Slot index of every variable, in id order: each variable takes as many
/// 4-byte slots as its vector size.
pub fn slot_offsets(variables: &[Variable]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(variables.len());
    let mut next = 0;
    for variable in variables {
        offsets.push(next);
        next += variable.vector_size.max(1) as usize;
    }
    offsets
}
