//! Compile pipeline: source text to package.
//!
//! Every stage implements [`CompilerStage`] and mutates one
//! [`CompilationData`]. The pipeline stops at the first failing stage.

pub mod analysis;
pub mod compile_error;
pub mod flatten;
pub mod parameters;
pub mod script;
pub mod transform;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::bytecode::compile::GenerateBytecode;
use crate::bytecode::ir::IMByteCodeList;
use crate::bytecode::jumps::ResolveJumps;
use crate::bytecode::optimize::Optimize;
use crate::bytecode::package::{Package, PackageMode, Packager};
use crate::engine::Engine;
use crate::frontend::lexer::{Lexer, Span, Spanned, identifier_table};
use crate::frontend::parser::{Directive, Parser};
use crate::lang::node::{Node, NodeType};
use crate::lang::variable::{Variable, slot_offsets};

pub use compile_error::CompileError;
pub use script::{CompiledScript, ScriptError, VariableInfo};

// =============================================================================
// Options
// =============================================================================

/// Compiler configuration.
///
/// Derives serde so it can be loaded from configuration files; missing fields
/// take their default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    pub optimize: bool,
    /// Fail compilation when the validation run of the package fails.
    pub auto_validate: bool,
    /// Tolerance when mapping literals onto engine constants.
    pub constant_epsilon: f32,
    /// Stack slots of a package when no estimate is made.
    pub default_stack_size: u16,
    pub estimate_stack_size: bool,
    pub package_mode: PackageMode,
    pub support_yield: bool,
    /// Compile root statements as independent segments in parallel.
    pub parallel: bool,
    /// Defines applied before the script's own `#define` lines.
    pub defines: BTreeMap<String, String>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            optimize: true,
            auto_validate: false,
            constant_epsilon: 0.00001,
            default_stack_size: 16,
            estimate_stack_size: true,
            package_mode: PackageMode::Normal,
            support_yield: true,
            parallel: false,
            defines: BTreeMap::new(),
        }
    }
}

impl CompilerOptions {
    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_auto_validate(mut self, auto_validate: bool) -> Self {
        self.auto_validate = auto_validate;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.insert(name.into(), value.into());
        self
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub stage: String,
    pub message: String,
    pub node: Option<String>,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{} [{}]: {}", level, self.stage, self.message)?;
        if let Some(node) = &self.node {
            write!(f, " ({})", node)?;
        }
        Ok(())
    }
}

/// A failed compilation: the failing stage, its error and every diagnostic
/// collected up to that point.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{stage}: {error}")]
pub struct CompileFailure {
    pub stage: &'static str,
    pub error: CompileError,
    pub diagnostics: Vec<Diagnostic>,
}

// =============================================================================
// Compile job
// =============================================================================

/// State of one compile job, threaded through every stage.
pub struct CompilationData<'e> {
    pub engine: &'e Engine,
    pub options: CompilerOptions,
    pub source: String,
    pub tokens: Vec<Spanned>,
    /// Sorted identifier names found by the lexer.
    pub identifiers: Vec<String>,
    pub root: Node,
    pub directives: Vec<Directive>,
    /// Effective defines after the parse stage.
    pub defines: BTreeMap<String, String>,
    pub variables: Vec<Variable>,
    offsets: Option<Vec<usize>>,
    pub code: IMByteCodeList,
    /// Final code after jump resolution.
    pub bytecode: Vec<u8>,
    pub package: Option<Package>,
    pub diagnostics: Vec<Diagnostic>,
    /// Stage currently executing, used to tag diagnostics.
    pub stage: &'static str,
}

impl std::fmt::Debug for CompilationData<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationData")
            .field("stage", &self.stage)
            .field("tokens", &self.tokens.len())
            .field("variables", &self.variables.len())
            .field("code", &self.code.len())
            .field("bytecode", &self.bytecode.len())
            .field("diagnostics", &self.diagnostics.len())
            .finish_non_exhaustive()
    }
}

impl<'e> CompilationData<'e> {
    pub fn new(engine: &'e Engine, source: &str, options: CompilerOptions) -> Self {
        CompilationData {
            engine,
            options,
            source: source.to_string(),
            tokens: Vec::new(),
            identifiers: Vec::new(),
            root: Node::new(NodeType::Root, Span { line: 1, col: 1 }),
            directives: Vec::new(),
            defines: BTreeMap::new(),
            variables: Vec::new(),
            offsets: None,
            code: IMByteCodeList::new(),
            bytecode: Vec::new(),
            package: None,
            diagnostics: Vec::new(),
            stage: "",
        }
    }

    pub fn warn(&mut self, message: impl Into<String>, node: Option<&Node>) {
        let message = message.into();
        warn!(stage = self.stage, "{}", message);
        self.diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            stage: self.stage.to_string(),
            message,
            node: node.map(Node::describe),
        });
    }

    /// Finds a variable by name, ignoring case.
    pub fn variable_id(&self, name: &str) -> Option<usize> {
        self.variables
            .iter()
            .position(|v| v.name.eq_ignore_ascii_case(name))
    }

    /// Returns the id of `name`, creating the variable on first sight.
    pub fn resolve_variable(&mut self, name: &str) -> usize {
        match self.variable_id(name) {
            Some(id) => id,
            None => {
                let id = self.variables.len();
                self.variables.push(Variable::new(id, name));
                self.invalidate_offsets();
                id
            }
        }
    }

    /// Slot offset of every variable, computed once until variables change.
    pub fn variable_offsets(&mut self) -> &[usize] {
        if self.offsets.is_none() {
            self.offsets = Some(slot_offsets(&self.variables));
        }
        self.offsets.as_deref().unwrap_or_default()
    }

    pub fn invalidate_offsets(&mut self) {
        self.offsets = None;
    }

    /// Number of 4-byte data slots taken by all variables.
    pub fn data_slot_count(&self) -> usize {
        self.variables
            .iter()
            .map(|v| v.vector_size.max(1) as usize)
            .sum()
    }

    /// Vector size of every data slot, used to check optimizer operands.
    pub fn slot_sizes(&self) -> Vec<u8> {
        let mut sizes = Vec::with_capacity(self.data_slot_count());
        for variable in &self.variables {
            let size = variable.vector_size.max(1);
            sizes.extend(std::iter::repeat_n(size, size as usize));
        }
        sizes
    }
}

/// One step of the pipeline.
pub trait CompilerStage: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(&self, data: &mut CompilationData<'_>) -> Result<(), CompileError>;
}

// =============================================================================
// Front stages
// =============================================================================

pub struct Tokenize;

impl CompilerStage for Tokenize {
    fn name(&self) -> &'static str {
        "tokenize"
    }

    fn execute(&self, data: &mut CompilationData<'_>) -> Result<(), CompileError> {
        data.tokens = Lexer::new(&data.source).tokenize()?;
        data.identifiers = identifier_table(&data.tokens);
        debug!(
            tokens = data.tokens.len(),
            identifiers = data.identifiers.len(),
            "tokenized"
        );
        Ok(())
    }
}

pub struct Parse;

impl CompilerStage for Parse {
    fn name(&self) -> &'static str {
        "parse"
    }

    fn execute(&self, data: &mut CompilationData<'_>) -> Result<(), CompileError> {
        let externals = data.engine.function_names();
        let mut parser = Parser::new(data.tokens.clone()).with_externals(externals);
        let parsed = parser.parse(&data.options.defines)?;
        data.root = parsed.root;
        data.directives = parsed.directives;
        data.defines = parsed.defines;
        debug!(statements = data.root.children.len(), "parsed");
        Ok(())
    }
}

// =============================================================================
// Compiler
// =============================================================================

/// Runs the stage pipeline against an engine.
pub struct Compiler<'e> {
    engine: &'e Engine,
    stages: Vec<Box<dyn CompilerStage>>,
}

impl<'e> Compiler<'e> {
    pub fn new(engine: &'e Engine) -> Self {
        let stages: Vec<Box<dyn CompilerStage>> = vec![
            Box::new(Tokenize),
            Box::new(Parse),
            Box::new(transform::Transform),
            Box::new(parameters::ParameterAnalysis),
            Box::new(analysis::Analysis),
            Box::new(flatten::Flatten),
            Box::new(GenerateBytecode),
            Box::new(Optimize),
            Box::new(ResolveJumps),
            Box::new(Packager),
        ];
        Compiler { engine, stages }
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Compiles `source` into a script.
    pub fn compile(
        &self,
        source: &str,
        options: &CompilerOptions,
    ) -> Result<CompiledScript, CompileFailure> {
        let data = self.compile_job(source, options)?;
        CompiledScript::from_job(data).map_err(|error| CompileFailure {
            stage: "package",
            error,
            diagnostics: Vec::new(),
        })
    }

    /// Runs every stage and returns the compile job, keeping the syntax tree
    /// and intermediate code for inspection.
    #[instrument(name = "compile", skip_all, fields(len = source.len()))]
    pub fn compile_job(
        &self,
        source: &str,
        options: &CompilerOptions,
    ) -> Result<CompilationData<'e>, CompileFailure> {
        let mut data = CompilationData::new(self.engine, source, options.clone());

        for stage in &self.stages {
            let name = stage.name();
            data.stage = name;
            let _span = tracing::debug_span!("stage", name).entered();

            if let Err(error) = stage.execute(&mut data) {
                warn!(stage = name, %error, "compilation failed");
                data.diagnostics.push(Diagnostic {
                    severity: Severity::Error,
                    stage: name.to_string(),
                    message: error.to_string(),
                    node: error.node().map(str::to_string),
                });
                return Err(CompileFailure {
                    stage: name,
                    error,
                    diagnostics: data.diagnostics,
                });
            }
        }

        debug!(
            code = data.bytecode.len(),
            variables = data.variables.len(),
            "compiled"
        );
        Ok(data)
    }
}
