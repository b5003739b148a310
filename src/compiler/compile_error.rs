use crate::frontend::lexer::LexerError;
use crate::frontend::parser_error::ParserError;
use crate::lang::node::Node;

/// Errors raised by compiler stages.
///
/// Variants follow the error taxonomy of the pipeline; `node` describes the
/// offending syntax node when one is known.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("lexical error at {line}:{col}: {message}")]
    Lexical {
        message: String,
        line: usize,
        col: usize,
    },

    #[error("syntax error at {line}:{col}: {message}")]
    Syntax {
        message: String,
        line: usize,
        col: usize,
    },

    /// Unknown identifier or function, arity out of bounds.
    #[error("{message}{}", at(.node))]
    SemanticResolution {
        message: String,
        node: Option<String>,
    },

    #[error("vector size mismatch: {message}{}", at(.node))]
    VectorSizeMismatch {
        message: String,
        node: Option<String>,
    },

    #[error("cannot flatten: {message}{}", at(.node))]
    FlattenFailure {
        message: String,
        node: Option<String>,
    },

    #[error("stack underflow: {message}{}", at(.node))]
    StackUnderflow {
        message: String,
        node: Option<String>,
    },

    #[error("jump resolution failed: {message}")]
    JumpResolutionFailure { message: String },

    #[error("package capacity exceeded: {message}")]
    PackagingCapacityFailure { message: String },

    #[error("unsupported operation: {message}{}", at(.node))]
    UnsupportedOperation {
        message: String,
        node: Option<String>,
    },

    /// The validation run of the package did not succeed.
    #[error("validation failed with exit code {code}: {message}")]
    Validation { code: i32, message: String },

    /// Internal compiler error (shouldn't happen in normal use)
    #[error("internal compiler error: {0}")]
    Internal(String),
}

fn at(node: &Option<String>) -> String {
    match node {
        Some(node) => format!(" ({})", node),
        None => String::new(),
    }
}

impl CompileError {
    pub fn semantic(message: impl Into<String>, node: &Node) -> Self {
        CompileError::SemanticResolution {
            message: message.into(),
            node: Some(node.describe()),
        }
    }

    pub fn size_mismatch(message: impl Into<String>, node: &Node) -> Self {
        CompileError::VectorSizeMismatch {
            message: message.into(),
            node: Some(node.describe()),
        }
    }

    pub fn not_flat(message: impl Into<String>, node: &Node) -> Self {
        CompileError::FlattenFailure {
            message: message.into(),
            node: Some(node.describe()),
        }
    }

    pub fn stack_underflow(message: impl Into<String>, node: &Node) -> Self {
        CompileError::StackUnderflow {
            message: message.into(),
            node: Some(node.describe()),
        }
    }

    pub fn unsupported(message: impl Into<String>, node: &Node) -> Self {
        CompileError::UnsupportedOperation {
            message: message.into(),
            node: Some(node.describe()),
        }
    }

    pub fn jump(message: impl Into<String>) -> Self {
        CompileError::JumpResolutionFailure {
            message: message.into(),
        }
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        CompileError::PackagingCapacityFailure {
            message: message.into(),
        }
    }

    /// Short kind name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            CompileError::Lexical { .. } => "lexical",
            CompileError::Syntax { .. } => "syntax",
            CompileError::SemanticResolution { .. } => "semantic",
            CompileError::VectorSizeMismatch { .. } => "vector-size",
            CompileError::FlattenFailure { .. } => "flatten",
            CompileError::StackUnderflow { .. } => "stack",
            CompileError::JumpResolutionFailure { .. } => "jump",
            CompileError::PackagingCapacityFailure { .. } => "capacity",
            CompileError::UnsupportedOperation { .. } => "unsupported",
            CompileError::Validation { .. } => "validation",
            CompileError::Internal(_) => "internal",
        }
    }

    /// Description of the offending node, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            CompileError::SemanticResolution { node, .. }
            | CompileError::VectorSizeMismatch { node, .. }
            | CompileError::FlattenFailure { node, .. }
            | CompileError::StackUnderflow { node, .. }
            | CompileError::UnsupportedOperation { node, .. } => node.as_deref(),
            _ => None,
        }
    }
}

impl From<LexerError> for CompileError {
    fn from(e: LexerError) -> Self {
        CompileError::Lexical {
            message: e.message,
            line: e.line,
            col: e.col,
        }
    }
}

impl From<ParserError> for CompileError {
    fn from(e: ParserError) -> Self {
        CompileError::Syntax {
            message: e.message,
            line: e.line,
            col: e.col,
        }
    }
}
