//! Tripwire is the breakpoint and stepping core of a bytecode JavaScript engine.
//!
//! The crate decides *where* execution should stop and *how* it resumes. It maps source
//! positions to breakable bytecode offsets, floods and clears one-shot breaks to implement
//! step-into/over/out, discovers break locations across inlined and generator frames, and
//! coordinates with the engine's tiering pipeline so that instrumented bytecode is what
//! actually runs when a break is expected.
//!
//! Everything the core needs from the surrounding engine (compiler, deoptimizer, stack
//! walker, evaluator, collector hooks) is consumed through the [`Host`] trait. The external
//! controller is notified through a [`DebugDelegate`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tripwire_engine::{Debugger, DebugConfig, StepAction};
//!
//! let mut debugger = Debugger::new(DebugConfig::default());
//! debugger.set_debug_delegate(&mut host, Some(Arc::new(MyController)));
//!
//! let mut position = 42;
//! let id = debugger.set_breakpoint_for_script(&mut host, script, None, &mut position);
//! ```

#![cfg_attr(not(test), forbid(clippy::unwrap_used))]
#![allow(
    clippy::module_name_repetitions,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod debugger;
pub mod error;
pub mod vm;

pub use config::DebugConfig;
pub use debugger::{
    BreakpointId, DebugDelegate, Debugger, ExceptionBreak, FunctionId, Host, ObjectRef,
    PauseContext, ScriptId, StackFrameId, StepAction,
};
pub use error::{CompileError, DebugError, EvalError};

/// Result type for debugger operations.
pub type DebugResult<T> = Result<T, DebugError>;
