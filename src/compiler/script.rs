use serde::{Deserialize, Serialize};

use crate::bytecode::disasm::disassemble;
use crate::bytecode::package::Package;
use crate::compiler::{CompilationData, CompileError, Diagnostic};
use crate::lang::value::Value;
use crate::lang::variable::{DataType, slot_offsets};

/// Public description of a data slot range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    /// First data slot.
    pub slot: usize,
    pub vector_size: u8,
    pub data_type: DataType,
    pub is_input: bool,
    pub is_output: bool,
    pub is_constant: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("'{name}' has size {expected}, value has size {found}")]
    SizeMismatch { name: String, expected: u8, found: u8 },

    #[error("'{0}' is not an id input")]
    NotAnId(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("invalid package: {0}")]
    Package(String),
}

/// Result of a successful compilation: a pristine package plus the variable
/// table needed to read and write its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledScript {
    pub package: Package,
    pub variables: Vec<VariableInfo>,
    /// Warnings collected during compilation.
    pub diagnostics: Vec<Diagnostic>,
}

impl CompiledScript {
    pub fn from_job(data: CompilationData<'_>) -> Result<Self, CompileError> {
        let package = data
            .package
            .ok_or_else(|| CompileError::Internal("no package was produced".to_string()))?;
        let offsets = slot_offsets(&data.variables);
        let variables = data
            .variables
            .iter()
            .zip(offsets)
            .map(|(v, slot)| VariableInfo {
                name: v.name.clone(),
                slot,
                vector_size: v.vector_size.max(1),
                data_type: v.data_type,
                is_input: v.is_input,
                is_output: v.is_output,
                is_constant: v.is_constant,
            })
            .collect();

        Ok(CompiledScript {
            package,
            variables,
            diagnostics: data.diagnostics,
        })
    }

    /// A fresh copy of the package, ready to execute.
    pub fn new_package(&self) -> Package {
        self.package.clone()
    }

    /// Finds a variable by name, ignoring case.
    pub fn variable(&self, name: &str) -> Option<&VariableInfo> {
        self.variables
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(name))
    }

    fn lookup(&self, name: &str) -> Result<&VariableInfo, ScriptError> {
        self.variable(name)
            .ok_or_else(|| ScriptError::UnknownVariable(name.to_string()))
    }

    /// Reads `name` from the data of `package`.
    pub fn get(&self, package: &Package, name: &str) -> Result<Value, ScriptError> {
        let info = self.lookup(name)?;
        let mut lanes = [0.0f32; 4];
        for (i, lane) in lanes.iter_mut().take(info.vector_size as usize).enumerate() {
            *lane = package
                .read_slot(info.slot + i)
                .ok_or_else(|| ScriptError::Package(format!("slot {} is out of range", info.slot + i)))?;
        }
        Ok(Value {
            lanes,
            size: info.vector_size,
        })
    }

    /// Writes `value` into `name`; the sizes must match.
    pub fn set(&self, package: &mut Package, name: &str, value: Value) -> Result<(), ScriptError> {
        let info = self.lookup(name)?;
        if info.vector_size != value.size {
            return Err(ScriptError::SizeMismatch {
                name: info.name.clone(),
                expected: info.vector_size,
                found: value.size,
            });
        }
        for (i, x) in value.components().iter().enumerate() {
            package
                .write_slot(info.slot + i, *x)
                .ok_or_else(|| ScriptError::Package(format!("slot {} is out of range", info.slot + i)))?;
        }
        Ok(())
    }

    /// Stores an id in an `#input name id` variable.
    pub fn set_id(&self, package: &mut Package, name: &str, id: u32) -> Result<(), ScriptError> {
        let info = self.lookup(name)?;
        if info.data_type != DataType::Id {
            return Err(ScriptError::NotAnId(info.name.clone()));
        }
        package
            .write_slot(info.slot, id as f32)
            .ok_or_else(|| ScriptError::Package(format!("slot {} is out of range", info.slot)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ScriptError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ScriptError> {
        let script: CompiledScript = postcard::from_bytes(bytes)?;
        if script.package.header().is_none() {
            return Err(ScriptError::Package("missing header".to_string()));
        }
        Ok(script)
    }

    pub fn disassemble(&self) -> String {
        disassemble(self.package.code())
    }
}
