//! Tripwire's breakpoint and stepping machinery.
//!
//! # Overview
//!
//! - [`Debugger`]: per-isolate debugger state and every debugger operation.
//! - [`BreakIterator`]: enumerates the break locations of one function.
//! - [`DebugInfo`]: the debugger's side data for one function (breakpoints, instrumented
//!   bytecode, coverage and cached analysis results).
//! - [`Host`]: what the debugger needs from the engine.
//! - [`DebugDelegate`]: how the debugger notifies the external controller.
//!
//! # Architecture
//!
//! Breaks are planted by patching a per-function copy of the bytecode with
//! [`Opcode::DebugBreak`](crate::vm::Opcode::DebugBreak). The interpreter reports a patched
//! instruction through [`DebugBreak`](crate::vm::opcode::DebugBreak), which calls back into
//! [`Debugger::on_break`]. Stepping is implemented by flooding functions with one-shot
//! breaks and deciding, when one of them is hit, whether the step has completed.
//!
//! Functions without bytecode (native and API functions) cannot be patched; they are broken
//! at entry instead, through a host trampoline that checks
//! [`Debugger::needs_break_at_entry`].

mod archive;
mod break_iterator;
mod breakpoints;
mod commands;
mod debug_info;
mod delegate;
mod dispatch;
mod host;
mod scope;
mod side_effects;
mod state;
mod stepping;
mod threads;

pub use archive::{ARCHIVE_SPACE_PER_THREAD, Root, RootVisitor};
pub use break_iterator::{BreakIterator, BreakLocation, BreakLocationType, DebugBreakType};
pub use commands::{CommandCallback, CommandHandler, CommandTable};
pub use debug_info::{
    BreakPoint, BreakPointInfo, CoverageInfo, CoverageSlot, DebugInfo, DebugInfoFlags,
    ExecutionMode, Preparation, SideEffectState,
};
pub use delegate::{DebugDelegate, ExceptionType, PauseContext};
pub use dispatch::IgnoreBreakMode;
pub use host::{
    EvaluationTarget, FrameSummary, FrameTier, FunctionInfo, FunctionKind, Host,
    PromiseState, SourceLocation, StackFrame,
};
pub use side_effects::TemporaryObjectsTracker;
pub use state::{Debugger, ExceptionBreak, Feature, StepAction};
pub use threads::{ThreadId, ThreadManager};

use std::num::NonZeroU64;

/// Source position used when an instruction has no position.
pub const NO_SOURCE_POSITION: i32 = -1;

/// Source position of the break location of functions that break at entry.
pub const BREAK_AT_ENTRY_POSITION: i32 = 0;

/// Identifies a function (the engine's shared function info).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

/// Identifies a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptId(pub u32);

/// Identifies a physical stack frame. Ids stay stable while the frame is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackFrameId(pub NonZeroU64);

impl StackFrameId {
    /// Creates an id from its raw value. Zero is not a valid id.
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// The raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

/// A reference to a heap object. The collector may move objects, see
/// [`Debugger::iterate_roots`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(pub NonZeroU64);

impl ObjectRef {
    /// Creates a reference from an object address. Zero is not a valid address.
    #[must_use]
    pub const fn new(address: u64) -> Option<Self> {
        match NonZeroU64::new(address) {
            Some(address) => Some(Self(address)),
            None => None,
        }
    }

    /// The object address.
    #[must_use]
    pub const fn address(self) -> u64 {
        self.0.get()
    }
}

/// Identifies a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub u32);

impl std::fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
