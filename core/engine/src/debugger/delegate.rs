//! The controller-facing side of the debugger.
//!
//! A [`DebugDelegate`] is installed with [`Debugger::set_debug_delegate`]. The debugger calls
//! it synchronously, on the engine's thread, while execution is paused. The callbacks get a
//! [`PauseContext`] through which they inspect the paused stack, evaluate expressions and
//! decide how execution resumes.

use serde_json::Value;

use super::{
    BreakpointId, Debugger, FrameSummary, NO_SOURCE_POSITION, ObjectRef, ScriptId,
    SourceLocation, StackFrame, StepAction,
    host::{EvaluationTarget, Host, stack_trace_frames},
};
use crate::DebugError;

/// How an exception reached the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    /// A `throw`.
    Exception,
    /// A promise rejection.
    PromiseRejection,
}

/// Receives debugger events.
///
/// Only [`DebugDelegate::break_program_requested`] is required. Breaks are disabled while
/// a callback runs, so evaluating expressions from a callback never re-enters it.
pub trait DebugDelegate: Send + Sync {
    /// Execution paused. `hit_breakpoints` lists the user breakpoints that caused the pause;
    /// it is empty for steps and `debugger` statements.
    ///
    /// Execution resumes when the callback returns. Call [`PauseContext::prepare_step`]
    /// before returning to step.
    fn break_program_requested(&self, pause: &mut PauseContext<'_>, hit_breakpoints: &[BreakpointId]);

    /// An exception is being thrown, or a promise rejected, and exception reporting is on.
    fn exception_thrown(
        &self,
        pause: &mut PauseContext<'_>,
        exception: ObjectRef,
        promise: Option<ObjectRef>,
        is_uncaught: bool,
        exception_type: ExceptionType,
    ) {
        let _ = (pause, exception, promise, is_uncaught, exception_type);
    }

    /// A script finished compiling.
    fn script_compiled(&self, script: ScriptId, has_compile_error: bool) {
        let _ = (script, has_compile_error);
    }

    /// Whether the function spanning `start..end` of `script` is blackboxed. The answer is
    /// cached until [`Debugger::clear_all_debugger_hints`].
    fn is_function_blackboxed(&self, script: ScriptId, start: SourceLocation, end: SourceLocation) -> bool {
        let _ = (script, start, end);
        false
    }

    /// Whether a step landing at `line:column` should silently continue.
    fn should_be_skipped(&self, script: ScriptId, line: u32, column: u32) -> bool {
        let _ = (script, line, column);
        false
    }
}

/// Access to the debugger and the paused engine from a delegate callback.
pub struct PauseContext<'a> {
    debugger: &'a mut Debugger,
    host: &'a mut dyn Host,
}

impl std::fmt::Debug for PauseContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseContext")
            .field("debugger", &self.debugger)
            .finish_non_exhaustive()
    }
}

impl<'a> PauseContext<'a> {
    pub(crate) fn new(debugger: &'a mut Debugger, host: &'a mut dyn Host) -> Self {
        Self { debugger, host }
    }

    /// Steps with `action` once the callback returns.
    pub fn prepare_step(&mut self, action: StepAction) {
        self.debugger.prepare_step(self.host, action);
    }

    /// Drops any pending step.
    pub fn clear_stepping(&mut self) {
        self.debugger.clear_stepping();
    }

    /// Terminates execution instead of resuming it.
    pub fn set_terminate_on_resume(&mut self) {
        self.debugger.set_terminate_on_resume();
    }

    /// Evaluates `source` in the innermost activation of the break frame.
    ///
    /// # Errors
    ///
    /// Fails when the evaluation throws, or with [`DebugError::SideEffect`] when
    /// `throw_on_side_effect` is set and the expression has a side effect.
    pub fn evaluate(&mut self, source: &str, throw_on_side_effect: bool) -> Result<Value, DebugError> {
        let frame = self.debugger.break_frame_id().ok_or(DebugError::NotPaused)?;
        self.evaluate_in(
            EvaluationTarget::Local {
                frame,
                inlined_index: 0,
            },
            source,
            throw_on_side_effect,
        )
    }

    /// Evaluates `source` in `target`.
    ///
    /// # Errors
    ///
    /// See [`PauseContext::evaluate`].
    pub fn evaluate_in(
        &mut self,
        target: EvaluationTarget,
        source: &str,
        throw_on_side_effect: bool,
    ) -> Result<Value, DebugError> {
        self.debugger
            .evaluate(self.host, target, source, throw_on_side_effect)
    }

    /// Runs the command `name` against the paused engine.
    ///
    /// # Errors
    ///
    /// See [`Debugger::dispatch_command`].
    pub fn dispatch_command(&mut self, name: &str, params: Value) -> Result<Value, DebugError> {
        self.debugger.dispatch_command(self.host, name, params)
    }

    /// The paused stack, innermost frame first, without frames hidden from user code.
    #[must_use]
    pub fn frames(&self) -> Vec<StackFrame> {
        stack_trace_frames(&*self.host)
    }

    /// The innermost activation of the break frame.
    #[must_use]
    pub fn top_summary(&self) -> Option<FrameSummary> {
        let id = self.debugger.break_frame_id()?;
        self.frames()
            .into_iter()
            .find(|frame| frame.id == id)
            .map(|frame| *frame.top())
    }

    /// Source position of the paused instruction.
    #[must_use]
    pub fn top_position(&self) -> i32 {
        self.top_summary()
            .map_or(NO_SOURCE_POSITION, |summary| summary.source_position(&*self.host))
    }

    /// The value being returned, when paused at a return.
    #[must_use]
    pub fn return_value(&self) -> Option<ObjectRef> {
        self.debugger.return_value()
    }

    /// The debugger.
    pub fn debugger(&mut self) -> &mut Debugger {
        self.debugger
    }

    /// The engine.
    pub fn host(&mut self) -> &mut dyn Host {
        self.host
    }
}
