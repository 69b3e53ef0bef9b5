//! Error types surfaced by the debugger core.
//!
//! Most failures inside the debugger are recovered locally: a function that fails to
//! compile simply cannot receive a breakpoint, and a breakpoint condition that throws is
//! treated as `false`. The types in this module cover what does reach the caller.

use thiserror::Error;

/// Errors reported by [`Debugger`](crate::Debugger) operations.
#[derive(Debug, Error)]
pub enum DebugError {
    /// Side-effect-free evaluation attempted to mutate program state.
    ///
    /// This is the catchable form of the termination raised by the side-effect checker.
    #[error("EvalError: evaluation caused a side effect")]
    SideEffect,

    /// The evaluator reported a failure.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// A function could not be compiled.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// A command received parameters it could not decode.
    #[error("invalid command parameters: {0}")]
    InvalidParams(#[source] serde_json::Error),

    /// A debugger configuration document could not be decoded.
    #[error("invalid debugger configuration: {0}")]
    Config(#[source] serde_json::Error),

    /// The operation needs a paused JavaScript frame.
    #[error("execution is not paused in a JavaScript frame")]
    NotPaused,
}

/// Errors reported by the host's expression evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// The expression threw.
    #[error("Uncaught {0}")]
    Thrown(String),

    /// Execution was terminated while evaluating.
    #[error("execution terminated")]
    Terminated,

    /// The expression could not be parsed.
    #[error("SyntaxError: {0}")]
    Syntax(String),
}

/// A compilation failure reported by the host's compiler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to compile `{function}`: {message}")]
pub struct CompileError {
    /// Name of the function that failed to compile.
    pub function: String,
    /// Compiler diagnostic.
    pub message: String,
}

impl CompileError {
    /// Creates a new compile error.
    pub fn new(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            message: message.into(),
        }
    }
}
