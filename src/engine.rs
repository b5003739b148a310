//! Engine context shared by compilers and interpreters.
//!
//! Holds the constant table, the registry of native functions scripts may
//! call and a registry of compiled scripts. An `Engine` is `Send + Sync`;
//! interpreters and compilers borrow it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;

use crate::bytecode::op::{CONSTANT_FIRST, CONSTANTS};
use crate::compiler::CompiledScript;

pub type FunctionId = u32;
pub type ScriptId = u32;

/// Largest argument count of a native function.
pub const MAX_NATIVE_ARITY: u8 = 4;

type Fn0 = Arc<dyn Fn() -> f32 + Send + Sync>;
type Fn1 = Arc<dyn Fn(f32) -> f32 + Send + Sync>;
type Fn2 = Arc<dyn Fn(f32, f32) -> f32 + Send + Sync>;
type Fn3 = Arc<dyn Fn(f32, f32, f32) -> f32 + Send + Sync>;
type Fn4 = Arc<dyn Fn(f32, f32, f32, f32) -> f32 + Send + Sync>;

/// A host function taking 0 to 4 scalar arguments.
#[derive(Clone)]
pub enum NativeFunction {
    Arity0(Fn0),
    Arity1(Fn1),
    Arity2(Fn2),
    Arity3(Fn3),
    Arity4(Fn4),
}

impl NativeFunction {
    pub fn nullary(f: impl Fn() -> f32 + Send + Sync + 'static) -> Self {
        NativeFunction::Arity0(Arc::new(f))
    }

    pub fn unary(f: impl Fn(f32) -> f32 + Send + Sync + 'static) -> Self {
        NativeFunction::Arity1(Arc::new(f))
    }

    pub fn binary(f: impl Fn(f32, f32) -> f32 + Send + Sync + 'static) -> Self {
        NativeFunction::Arity2(Arc::new(f))
    }

    pub fn ternary(f: impl Fn(f32, f32, f32) -> f32 + Send + Sync + 'static) -> Self {
        NativeFunction::Arity3(Arc::new(f))
    }

    pub fn quaternary(f: impl Fn(f32, f32, f32, f32) -> f32 + Send + Sync + 'static) -> Self {
        NativeFunction::Arity4(Arc::new(f))
    }

    pub fn arity(&self) -> u8 {
        match self {
            NativeFunction::Arity0(_) => 0,
            NativeFunction::Arity1(_) => 1,
            NativeFunction::Arity2(_) => 2,
            NativeFunction::Arity3(_) => 3,
            NativeFunction::Arity4(_) => 4,
        }
    }

    /// Calls the function; missing arguments read as 0.
    pub fn call(&self, args: &[f32]) -> f32 {
        let arg = |i: usize| args.get(i).copied().unwrap_or(0.0);
        match self {
            NativeFunction::Arity0(f) => f(),
            NativeFunction::Arity1(f) => f(arg(0)),
            NativeFunction::Arity2(f) => f(arg(0), arg(1)),
            NativeFunction::Arity3(f) => f(arg(0), arg(1), arg(2)),
            NativeFunction::Arity4(f) => f(arg(0), arg(1), arg(2), arg(3)),
        }
    }
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFunction(arity {})", self.arity())
    }
}

/// A registered native function.
#[derive(Debug, Clone)]
pub struct ExternalFunction {
    pub id: FunctionId,
    pub name: String,
    pub function: NativeFunction,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("function '{0}' is already registered")]
    DuplicateFunction(String),

    #[error("'{0}' is not a valid function name")]
    InvalidName(String),

    #[error("no function with id {0}")]
    UnknownFunction(FunctionId),

    #[error("function {id} takes {expected} arguments, replacement takes {found}")]
    ArityMismatch {
        id: FunctionId,
        expected: u8,
        found: u8,
    },
}

pub struct Engine {
    constants: [f32; 256],
    functions: RwLock<Vec<ExternalFunction>>,
    scripts: Mutex<BTreeMap<ScriptId, Arc<CompiledScript>>>,
    next_script: AtomicU32,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("functions", &self.function_names())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new() -> Self {
        let mut constants = [0.0f32; 256];
        for (i, def) in CONSTANTS.iter().enumerate() {
            constants[CONSTANT_FIRST as usize + i] = def.value;
        }
        Engine {
            constants,
            functions: RwLock::new(Vec::new()),
            scripts: Mutex::new(BTreeMap::new()),
            next_script: AtomicU32::new(1),
        }
    }

    /// Value of the constant addressed by `byte`.
    #[inline]
    pub fn constant(&self, byte: u8) -> f32 {
        self.constants[byte as usize]
    }

    // ─────────────────────────────── Functions ─────────────────────────────

    /// Registers `function` under `name` and returns its id. Ids start at 1.
    pub fn register_function(
        &self,
        name: &str,
        function: NativeFunction,
    ) -> Result<FunctionId, EngineError> {
        let valid = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(EngineError::InvalidName(name.to_string()));
        }

        let mut functions = self.functions.write().unwrap_or_else(PoisonError::into_inner);
        if functions.iter().any(|f| f.name.eq_ignore_ascii_case(name)) {
            return Err(EngineError::DuplicateFunction(name.to_string()));
        }
        let id = functions.len() as FunctionId + 1;
        debug!(id, name, arity = function.arity(), "registered function");
        functions.push(ExternalFunction {
            id,
            name: name.to_string(),
            function,
        });
        Ok(id)
    }

    /// Replaces the implementation of function `id`; the arity must not change.
    pub fn update_function_pointer(
        &self,
        id: FunctionId,
        function: NativeFunction,
    ) -> Result<(), EngineError> {
        let mut functions = self.functions.write().unwrap_or_else(PoisonError::into_inner);
        let entry = functions
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or(EngineError::UnknownFunction(id))?;
        if entry.function.arity() != function.arity() {
            return Err(EngineError::ArityMismatch {
                id,
                expected: entry.function.arity(),
                found: function.arity(),
            });
        }
        entry.function = function;
        Ok(())
    }

    pub fn function_by_id(&self, id: FunctionId) -> Option<ExternalFunction> {
        let functions = self.functions.read().unwrap_or_else(PoisonError::into_inner);
        functions.iter().find(|f| f.id == id).cloned()
    }

    pub fn function_by_name(&self, name: &str) -> Option<ExternalFunction> {
        let functions = self.functions.read().unwrap_or_else(PoisonError::into_inner);
        functions
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn function_names(&self) -> Vec<String> {
        let functions = self.functions.read().unwrap_or_else(PoisonError::into_inner);
        functions.iter().map(|f| f.name.clone()).collect()
    }

    // ──────────────────────────────── Scripts ──────────────────────────────

    pub fn add_script(&self, script: CompiledScript) -> ScriptId {
        let id = self.next_script.fetch_add(1, Ordering::Relaxed);
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        scripts.insert(id, Arc::new(script));
        id
    }

    pub fn script(&self, id: ScriptId) -> Option<Arc<CompiledScript>> {
        let scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        scripts.get(&id).cloned()
    }

    pub fn remove_script(&self, id: ScriptId) -> Option<Arc<CompiledScript>> {
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        scripts.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::constant_by_name;

    #[test]
    fn test_constant_table() {
        let engine = Engine::new();
        let pi = constant_by_name("pi").unwrap();
        assert_eq!(engine.constant(pi), std::f32::consts::PI);
        assert_eq!(engine.constant(CONSTANT_FIRST + 1), 1.0);
        assert_eq!(engine.constant(200), 0.0);
    }

    #[test]
    fn test_register_and_lookup() {
        let engine = Engine::new();
        let a = engine
            .register_function("double", NativeFunction::unary(|x| x * 2.0))
            .unwrap();
        let b = engine
            .register_function("hyp", NativeFunction::binary(f32::hypot))
            .unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(engine.function_by_name("DOUBLE").unwrap().id, 1);
        assert_eq!(engine.function_by_id(2).unwrap().function.call(&[3.0, 4.0]), 5.0);
        assert_eq!(
            engine.register_function("Double", NativeFunction::nullary(|| 0.0)),
            Err(EngineError::DuplicateFunction("Double".to_string()))
        );
        assert!(engine.register_function("2x", NativeFunction::nullary(|| 0.0)).is_err());
    }

    #[test]
    fn test_update_keeps_arity() {
        let engine = Engine::new();
        let id = engine
            .register_function("f", NativeFunction::unary(|x| x))
            .unwrap();
        engine
            .update_function_pointer(id, NativeFunction::unary(|x| x + 1.0))
            .unwrap();
        assert_eq!(engine.function_by_id(id).unwrap().function.call(&[1.0]), 2.0);
        assert!(matches!(
            engine.update_function_pointer(id, NativeFunction::nullary(|| 0.0)),
            Err(EngineError::ArityMismatch { expected: 1, found: 0, .. })
        ));
        assert_eq!(
            engine.update_function_pointer(9, NativeFunction::nullary(|| 0.0)),
            Err(EngineError::UnknownFunction(9))
        );
    }

    #[test]
    fn test_engine_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Engine>();
    }
}
