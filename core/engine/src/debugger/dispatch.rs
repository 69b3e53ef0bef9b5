//! Break arrival, breakpoint conditions and exception events.

use log::{debug, trace};
use serde_json::Value;

use super::{
    BreakLocation, BreakPoint, BreakpointId, Debugger, FunctionId, ObjectRef, ScriptId,
    StackFrame, StepAction,
    delegate::{DebugDelegate, ExceptionType, PauseContext},
    host::{EvaluationTarget, Host, stack_trace_frames},
};

/// Which blackboxing makes a requested pause be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreBreakMode {
    /// Ignore the pause if the innermost function is blackboxed.
    IgnoreIfTopFrameBlackboxed,
    /// Ignore the pause only if every function on the stack is blackboxed.
    IgnoreIfAllFramesBlackboxed,
}

/// Truthiness of an evaluation result.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl Debugger {
    /// Called by the engine when execution reaches a planted break in `function`, or the
    /// entry of a function that breaks at entry.
    ///
    /// Reports a break to the delegate when a user breakpoint fires or a pending step has
    /// completed; otherwise re-prepares the step.
    pub fn on_break(&mut self, host: &mut dyn Host, function: FunctionId) {
        if self.break_disabled {
            return;
        }
        self.with_debug_scope(host, |debugger, host| {
            debugger.with_break_disabled(|debugger| debugger.break_at(host, function));
        });
    }

    fn break_at(&mut self, host: &mut dyn Host, function: FunctionId) {
        if !self.ensure_break_info(host, function) {
            return;
        }
        self.prepare_function_for_debug_execution(host, function);

        let frames = stack_trace_frames(host);
        let Some(frame) = frames.first() else {
            return;
        };
        let summary = *frame.top();
        let location = BreakLocation::from_frame(&self.expect_debug_info(function), &summary);

        let (hits, _) = self.check_break_points(host, function, &location);
        if !hits.is_empty() || self.thread_local.break_on_next_function_call() {
            let last_action = self.last_step_action();
            self.clear_stepping();
            self.report_break(host, &hits, last_action);
            return;
        }

        if location.is_debug_break_at_entry() {
            return;
        }

        let action = self.last_step_action();
        let current_frame_count = self.current_frame_count(host);
        let target_frame_count = self.thread_local.target_frame_count();

        if self.thread_local.fast_forward_to_return() {
            // Only returns count. Recursive calls reach the same returns deeper down, and
            // user breakpoints whose condition failed land here too.
            if !location.is_return_or_suspend() || current_frame_count > target_frame_count {
                return;
            }
            self.clear_stepping();
            self.report_break(host, &[], StepAction::Out);
            return;
        }

        let step_break = match action {
            StepAction::None => return,
            StepAction::Out => {
                if current_frame_count > target_frame_count {
                    return;
                }
                true
            }
            StepAction::Over | StepAction::Into => {
                if action == StepAction::Over && current_frame_count > target_frame_count {
                    return;
                }
                let is_generator = host.function_info(function).is_generator();
                if location.is_suspend()
                    && (!is_generator || location.suspend_id().is_some_and(|id| id > 0))
                {
                    // Resume stepping once this generator is resumed.
                    let generator = location.generator_object_for_suspended_frame(host, frame.id);
                    self.clear_stepping();
                    self.thread_local.set_suspended_generator(generator);
                    return;
                }
                location.is_return()
                    || current_frame_count != self.thread_local.last_frame_count()
                    || self.thread_local.last_statement_position() != summary.statement_position(host)
            }
        };

        self.clear_stepping();
        if step_break {
            self.report_break(host, &[], action);
        } else {
            self.prepare_step(host, action);
        }
    }

    /// Notifies the delegate of a pause. Must run inside a debug scope.
    pub(crate) fn report_break(
        &mut self,
        host: &mut dyn Host,
        hits: &[BreakpointId],
        last_action: StepAction,
    ) {
        if self.ignore_events() {
            return;
        }
        if self.config.print_break_location {
            self.print_break_location(host);
        }
        let Some(delegate) = self.delegate.clone() else {
            return;
        };
        debug_assert!(self.in_debug_scope());
        self.with_break_disabled(|debugger| {
            if matches!(last_action, StepAction::Over | StepAction::Into)
                && debugger.should_be_skipped(host, &*delegate)
            {
                debugger.prepare_step(host, last_action);
                return;
            }
            let mut pause = PauseContext::new(debugger, host);
            delegate.break_program_requested(&mut pause, hits);
        });
    }

    fn should_be_skipped(&mut self, host: &dyn Host, delegate: &dyn DebugDelegate) -> bool {
        let Some(summary) = stack_trace_frames(host).first().map(|frame| *frame.top()) else {
            return false;
        };
        let Some(script) = host.function_info(summary.function).script else {
            return false;
        };
        let location = host.source_location(script, summary.source_position(host));
        self.with_suppressed(|_| delegate.should_be_skipped(script, location.line, location.column))
    }

    fn print_break_location(&self, host: &dyn Host) {
        let Some(summary) = stack_trace_frames(host).first().map(|frame| *frame.top()) else {
            trace!("break in native code");
            return;
        };
        let info = host.function_info(summary.function);
        let position = summary.source_position(host);
        match info.script {
            Some(script) => {
                let location = host.source_location(script, position);
                trace!(
                    "break at {} ({script:?} {}:{})",
                    info.name, location.line, location.column
                );
            }
            None => trace!("break at {} (position {position})", info.name),
        }
    }

    /// Handles a `debugger` statement or an engine-requested pause.
    pub fn handle_debug_break(&mut self, host: &mut dyn Host, mode: IgnoreBreakMode) {
        if self.break_disabled || !self.is_active || host.is_stack_overflowed() {
            return;
        }
        let Some(function) = stack_trace_frames(host)
            .first()
            .map(|frame| frame.top().function)
        else {
            return;
        };
        let ignore = match mode {
            IgnoreBreakMode::IgnoreIfTopFrameBlackboxed => self.is_blackboxed(host, function),
            IgnoreBreakMode::IgnoreIfAllFramesBlackboxed => {
                self.all_frames_on_stack_are_blackboxed(host)
            }
        };
        if ignore || self.is_muted_at_current_location(host) {
            return;
        }

        let last_action = self.last_step_action();
        self.clear_stepping();
        self.with_debug_scope(host, |debugger, host| {
            debugger.report_break(host, &[], last_action);
        });
    }

    /// The user breakpoints at `location` whose condition holds, and whether any
    /// breakpoint is set there at all.
    pub(crate) fn check_break_points(
        &mut self,
        host: &mut dyn Host,
        function: FunctionId,
        location: &BreakLocation,
    ) -> (Vec<BreakpointId>, bool) {
        let has_break_points = self.break_points_active
            && location.has_break_point(&self.expect_debug_info(function));
        if !has_break_points {
            return (Vec::new(), false);
        }
        (
            self.get_hit_break_points(host, function, location.position()),
            true,
        )
    }

    /// Evaluates the breakpoints at `position` of `function`, returning those that fire.
    pub fn get_hit_break_points(
        &mut self,
        host: &mut dyn Host,
        function: FunctionId,
        position: i32,
    ) -> Vec<BreakpointId> {
        let (break_points, is_break_at_entry) = {
            let info = self.expect_debug_info(function);
            (info.break_points_at(position).to_vec(), info.break_at_entry())
        };
        break_points
            .iter()
            .filter(|break_point| self.check_break_point(host, break_point, is_break_at_entry))
            .map(BreakPoint::id)
            .collect()
    }

    /// Whether `break_point` fires. A condition that fails to evaluate does not.
    pub fn check_break_point(
        &mut self,
        host: &mut dyn Host,
        break_point: &BreakPoint,
        is_break_at_entry: bool,
    ) -> bool {
        let Some(condition) = break_point.condition() else {
            return true;
        };
        let target = if is_break_at_entry {
            EvaluationTarget::TopmostArguments
        } else {
            let Some(frame) = self.break_frame_id() else {
                return false;
            };
            EvaluationTarget::Local {
                frame,
                inlined_index: 0,
            }
        };
        match host.evaluate(self, target, condition) {
            Ok(value) => is_truthy(&value),
            Err(err) => {
                debug!("condition of breakpoint {} failed: {err}", break_point.id());
                false
            }
        }
    }

    /// Whether the current statement has breakpoints and none of them fires.
    ///
    /// A muted location suppresses `debugger` statements and exception events too.
    pub fn is_muted_at_current_location(&mut self, host: &mut dyn Host) -> bool {
        let Some(summary) = stack_trace_frames(host).first().map(|frame| *frame.top()) else {
            return false;
        };
        let locations = {
            let Some(info) = self.debug_info(summary.function) else {
                return false;
            };
            if !info.has_break_info() {
                return false;
            }
            if info.can_break_at_entry() {
                vec![BreakLocation::at_entry()]
            } else {
                BreakLocation::all_at_current_statement(&info, &summary)
            }
        };
        self.with_debug_scope(host, |debugger, host| {
            debugger.with_break_disabled(|debugger| {
                let mut has_break_points_at_all = false;
                for location in &locations {
                    let (hits, has_break_points) =
                        debugger.check_break_points(host, summary.function, location);
                    has_break_points_at_all |= has_break_points;
                    if has_break_points && !hits.is_empty() {
                        return false;
                    }
                }
                has_break_points_at_all
            })
        })
    }

    /// Called by the engine when an exception is thrown.
    pub fn on_throw(&mut self, host: &mut dyn Host, exception: ObjectRef) {
        if self.in_debug_scope() || self.ignore_events() {
            return;
        }
        self.on_exception(host, exception, None, ExceptionType::Exception);
        self.prepare_step_on_throw(host);
    }

    /// Called by the engine when a promise is rejected with `value`.
    pub fn on_promise_reject(
        &mut self,
        host: &mut dyn Host,
        promise: Option<ObjectRef>,
        value: ObjectRef,
    ) {
        if self.in_debug_scope() || self.ignore_events() {
            return;
        }
        if promise
            .and_then(|promise| host.promise_state(promise))
            .is_some_and(|state| state.is_silent)
        {
            return;
        }
        self.on_exception(host, value, promise, ExceptionType::PromiseRejection);
    }

    fn on_exception(
        &mut self,
        host: &mut dyn Host,
        exception: ObjectRef,
        promise: Option<ObjectRef>,
        exception_type: ExceptionType,
    ) {
        if host.is_stack_overflowed() {
            return;
        }
        let Some(delegate) = self.delegate.clone() else {
            return;
        };
        if !self.break_on_exception && !self.break_on_uncaught_exception {
            return;
        }

        let mut uncaught = !host.is_exception_caught();
        if let Some(promise) = promise {
            let state = host.promise_state(promise);
            host.mark_promise(promise);
            uncaught = state.is_none_or(|state| !state.has_user_defined_reject_handler);
        }
        if !uncaught && !self.break_on_exception {
            return;
        }

        if stack_trace_frames(host).is_empty() {
            return;
        }
        if self.is_muted_at_current_location(host) || self.is_exception_blackboxed(host, uncaught) {
            return;
        }

        self.with_debug_scope(host, |debugger, host| {
            debugger.with_break_disabled(|debugger| {
                let mut pause = PauseContext::new(debugger, host);
                delegate.exception_thrown(&mut pause, exception, promise, uncaught, exception_type);
            });
        });
    }

    /// Whether an exception should go unreported because of blackboxing: a caught
    /// exception when the innermost frame is blackboxed, an uncaught one when every frame
    /// is.
    pub fn is_exception_blackboxed(&mut self, host: &dyn Host, uncaught: bool) -> bool {
        let frames = stack_trace_frames(host);
        let is_top_frame_blackboxed = frames
            .first()
            .is_none_or(|frame| self.is_frame_blackboxed(host, frame));
        if !uncaught || !is_top_frame_blackboxed {
            return is_top_frame_blackboxed;
        }
        self.all_frames_on_stack_are_blackboxed(host)
    }

    /// Whether every activation of `frame` is blackboxed.
    pub fn is_frame_blackboxed(&mut self, host: &dyn Host, frame: &StackFrame) -> bool {
        frame
            .summaries
            .iter()
            .all(|summary| self.is_blackboxed(host, summary.function))
    }

    /// Whether every frame on the stack is blackboxed.
    pub fn all_frames_on_stack_are_blackboxed(&mut self, host: &dyn Host) -> bool {
        stack_trace_frames(host)
            .iter()
            .all(|frame| self.is_frame_blackboxed(host, frame))
    }

    /// Whether stepping and pausing skip `function`.
    ///
    /// Without a delegate only functions hidden from user code are blackboxed. Otherwise
    /// the delegate decides, and its answer is cached on the function's debug info.
    pub fn is_blackboxed(&mut self, host: &dyn Host, function: FunctionId) -> bool {
        let info = host.function_info(function);
        let Some(delegate) = self.delegate.clone() else {
            return !info.is_subject_to_debugging;
        };
        self.get_or_create_debug_info(host, function);
        if let Some(cached) = self.expect_debug_info(function).debug_is_blackboxed() {
            return cached;
        }

        let blackboxed = match info.script {
            Some(script) if info.is_subject_to_debugging => {
                let start = host.source_location(script, info.start_position);
                let end = host.source_location(script, info.end_position);
                self.with_suppressed(|debugger| {
                    debugger.with_break_disabled(|_| {
                        delegate.is_function_blackboxed(script, start, end)
                    })
                })
            }
            _ => true,
        };
        self.expect_debug_info_mut(function)
            .set_debug_is_blackboxed(blackboxed);
        blackboxed
    }

    /// Called by the engine after compiling `script`.
    pub fn on_after_compile(&mut self, host: &mut dyn Host, script: ScriptId) {
        self.process_compile_event(host, script, false);
    }

    /// Called by the engine when compiling `script` failed.
    pub fn on_compile_error(&mut self, host: &mut dyn Host, script: ScriptId) {
        self.process_compile_event(host, script, true);
    }

    fn process_compile_event(&mut self, host: &mut dyn Host, script: ScriptId, has_compile_error: bool) {
        if self.ignore_events() {
            return;
        }
        let Some(delegate) = self.delegate.clone() else {
            return;
        };
        self.with_suppressed(|debugger| {
            debugger.with_debug_scope(host, |debugger, _| {
                debugger.with_break_disabled(|_| delegate.script_compiled(script, has_compile_error));
            });
        });
    }
}
