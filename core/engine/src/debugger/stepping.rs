//! Step preparation.
//!
//! A step floods the functions it may stop in with one-shot breaks. Every hit one-shot
//! goes through [`Debugger::on_break`], which decides from the recorded frame count and
//! statement position whether the step has completed or must be prepared again.

use log::trace;

use super::{
    BreakIterator, BreakLocation, Debugger, FunctionId, NO_SOURCE_POSITION, ObjectRef,
    StepAction,
    archive::count_of,
    breakpoints::{apply_break_points, clear_break_points},
    host::{Host, stack_trace_frames},
    state::Feature,
};
use crate::debugger::ExecutionMode;

impl Debugger {
    /// Number of logical activations from the break frame (or the top of the stack when not
    /// in a break) down to the bottom.
    #[must_use]
    pub fn current_frame_count(&self, host: &dyn Host) -> i32 {
        let frames = stack_trace_frames(host);
        let start = self.break_frame_id().map_or(0, |id| {
            frames
                .iter()
                .position(|frame| frame.id == id)
                .unwrap_or(frames.len())
        });
        frames[start..]
            .iter()
            .map(|frame| count_of(frame.function_count()))
            .sum()
    }

    /// Prepares `action` from the current break location.
    ///
    /// Must be called from inside a debug scope, typically from the delegate's break
    /// callback.
    pub fn prepare_step(&mut self, host: &mut dyn Host, action: StepAction) {
        debug_assert!(self.in_debug_scope());
        let Some(frame_id) = self.break_frame_id() else {
            return;
        };
        if action == StepAction::None {
            self.clear_stepping();
            return;
        }
        self.features.track(Feature::STEPPING);
        self.thread_local.set_last_step_action(action);

        let current_frame_count = self.current_frame_count(host);
        let Some(function) = stack_trace_frames(host)
            .iter()
            .find(|frame| frame.id == frame_id)
            .map(|frame| frame.top().function)
        else {
            return;
        };
        if !self.ensure_break_info(host, function) {
            return;
        }
        self.prepare_function_for_debug_execution(host, function);

        // Preparation may have moved baseline frames to the interpreter.
        let frames = stack_trace_frames(host);
        let Some(frame_index) = frames.iter().position(|frame| frame.id == frame_id) else {
            return;
        };
        let summary = *frames[frame_index].top();
        let location = BreakLocation::from_frame(&self.expect_debug_info(function), &summary);

        let mut action = action;
        // A step at a return is a step out, and so is stepping out at a suspend.
        if location.is_return() || (location.is_suspend() && action == StepAction::Out) {
            if self.last_step_action() == StepAction::Out {
                self.thread_local
                    .set_ignore_step_into_function(Some(summary.closure));
            }
            action = StepAction::Out;
            self.thread_local.set_last_step_action(StepAction::Into);
        }

        self.update_hook_on_function_call();

        if action == StepAction::Over && self.is_blackboxed(host, function) {
            action = StepAction::Out;
        }

        self.thread_local
            .set_last_statement_position(summary.statement_position(host));
        self.thread_local.set_last_frame_count(current_frame_count);
        self.thread_local.set_suspended_generator(None);
        trace!(
            "prepared {action:?} in {function:?} at position {}",
            location.position()
        );

        match action {
            StepAction::None => {}
            StepAction::Out => {
                self.thread_local
                    .set_last_statement_position(NO_SOURCE_POSITION);
                self.thread_local.set_last_frame_count(-1);
                if !location.is_return_or_suspend() && !self.is_blackboxed(host, function) {
                    // Not at a return yet: break at the returns of this function first.
                    self.thread_local
                        .set_target_frame_count(current_frame_count);
                    self.thread_local.set_fast_forward_to_return(true);
                    self.flood_with_one_shot(host, function, true);
                    return;
                }
                let mut in_current_frame = true;
                let mut frame_count = current_frame_count;
                for frame in &frames[frame_index..] {
                    if self.last_step_action() == StepAction::Into {
                        host.deoptimize_function(frame.function());
                    }
                    for summary in frame.summaries.iter().rev() {
                        let count = frame_count;
                        frame_count -= 1;
                        if in_current_frame {
                            in_current_frame = false;
                            continue;
                        }
                        if self.is_blackboxed(host, summary.function) {
                            continue;
                        }
                        self.flood_with_one_shot(host, summary.function, false);
                        self.thread_local.set_target_frame_count(count);
                        return;
                    }
                }
            }
            StepAction::Over => {
                self.thread_local
                    .set_target_frame_count(current_frame_count);
                self.flood_with_one_shot(host, function, false);
            }
            StepAction::Into => {
                self.flood_with_one_shot(host, function, false);
            }
        }
    }

    /// Clears every pending step and one-shot break.
    pub fn clear_stepping(&mut self) {
        self.clear_one_shot();
        let tl = &mut self.thread_local;
        tl.set_last_step_action(StepAction::None);
        tl.set_last_statement_position(NO_SOURCE_POSITION);
        tl.set_ignore_step_into_function(None);
        tl.set_fast_forward_to_return(false);
        tl.set_last_frame_count(-1);
        tl.set_target_frame_count(-1);
        tl.set_break_on_next_function_call(false);
        self.update_hook_on_function_call();
    }

    /// Removes every one-shot break, keeping user breakpoints.
    pub(crate) fn clear_one_shot(&mut self) {
        self.debug_infos.for_each_mut(|info| {
            if info.has_break_info() {
                clear_break_points(info);
                apply_break_points(info);
            }
        });
    }

    /// Plants a one-shot break at every break location of `function`, or only at its
    /// returns and suspends.
    pub(crate) fn flood_with_one_shot(
        &mut self,
        host: &mut dyn Host,
        function: FunctionId,
        returns_only: bool,
    ) {
        if self.is_blackboxed(host, function) {
            return;
        }
        if !self.ensure_break_info(host, function) {
            return;
        }
        self.prepare_function_for_debug_execution(host, function);

        let info = self.expect_debug_info(function);
        if info.can_break_at_entry() {
            return;
        }
        let mut it = BreakIterator::new(&info);
        while !it.done() {
            if !returns_only || it.break_location().is_return_or_suspend() {
                it.set_debug_break();
            }
            it.next();
        }
    }

    /// Floods the callee of a call made while stepping into.
    pub(crate) fn prepare_step_in(
        &mut self,
        host: &mut dyn Host,
        closure: ObjectRef,
        function: FunctionId,
    ) {
        debug_assert!(
            self.last_step_action() >= StepAction::Into
                || self.thread_local.break_on_next_function_call()
        );
        if self.ignore_events() || self.in_debug_scope() || self.break_disabled {
            return;
        }
        if self.is_blackboxed(host, function) {
            return;
        }
        if self.thread_local.ignore_step_into_function() == Some(closure) {
            return;
        }
        self.thread_local.set_ignore_step_into_function(None);
        self.flood_with_one_shot(host, function, false);
    }

    /// Continues a step that was waiting on a generator, now that it resumes.
    pub(crate) fn prepare_step_in_suspended_generator(&mut self, host: &mut dyn Host) {
        debug_assert!(self.has_suspended_generator());
        if self.ignore_events() || self.in_debug_scope() || self.break_disabled {
            return;
        }
        self.thread_local.set_last_step_action(StepAction::Into);
        self.update_hook_on_function_call();
        let function = self
            .suspended_generator()
            .and_then(|generator| host.generator_function(generator));
        if let Some(function) = function {
            self.flood_with_one_shot(host, function, false);
        }
        self.thread_local.set_suspended_generator(None);
    }

    /// Re-targets a pending step at the frame that will handle an exception being thrown.
    pub(crate) fn prepare_step_on_throw(&mut self, host: &mut dyn Host) {
        let last_action = self.last_step_action();
        if last_action == StepAction::None
            || self.ignore_events()
            || self.in_debug_scope()
            || self.break_disabled
        {
            return;
        }
        self.clear_one_shot();

        let mut frame_count = self.current_frame_count(host);
        let frames = stack_trace_frames(host);
        let Some(handler_index) = frames.iter().position(|frame| {
            frame
                .summaries
                .iter()
                .any(|summary| summary.has_exception_handler(host))
        }) else {
            return;
        };
        frame_count -= frames[..handler_index]
            .iter()
            .map(|frame| count_of(frame.function_count()))
            .sum::<i32>();

        let target_frame_count = self.thread_local.target_frame_count();
        let mut found_handler = false;
        for frame in &frames[handler_index..] {
            if last_action == StepAction::Into {
                host.deoptimize_function(frame.function());
            }
            for summary in frame.summaries.iter().rev() {
                let count = frame_count;
                frame_count -= 1;
                if !found_handler {
                    found_handler =
                        frame.summaries.len() == 1 || summary.has_exception_handler(host);
                }
                if !found_handler {
                    continue;
                }
                if matches!(last_action, StepAction::Over | StepAction::Out)
                    && count > target_frame_count
                {
                    continue;
                }
                if self.is_blackboxed(host, summary.function) {
                    continue;
                }
                self.flood_with_one_shot(host, summary.function, false);
                return;
            }
        }
    }

    /// Requests a break at the next function call, whatever the pending step.
    pub fn set_break_on_next_function_call(&mut self) {
        self.thread_local.set_break_on_next_function_call(true);
        self.update_hook_on_function_call();
    }

    /// Withdraws [`Debugger::set_break_on_next_function_call`].
    pub fn clear_break_on_next_function_call(&mut self) {
        self.thread_local.set_break_on_next_function_call(false);
        self.update_hook_on_function_call();
    }

    pub(crate) fn update_hook_on_function_call(&mut self) {
        self.hook_on_function_call = self.last_step_action() == StepAction::Into
            || self.execution_mode == ExecutionMode::SideEffects
            || self.thread_local.break_on_next_function_call();
    }

    /// Called by the engine on every function call while
    /// [`Debugger::hook_on_function_call`] is set.
    ///
    /// Returns `false` if a side-effect check failed; termination has then been requested
    /// and the call must not proceed.
    pub fn on_function_call(
        &mut self,
        host: &mut dyn Host,
        closure: ObjectRef,
        function: FunctionId,
        receiver: Option<ObjectRef>,
    ) -> bool {
        if !self.hook_on_function_call {
            return true;
        }
        // The callee must check for breaks too.
        host.deoptimize_function(function);
        if self.last_step_action() >= StepAction::Into
            || self.thread_local.break_on_next_function_call()
        {
            self.prepare_step_in(host, closure, function);
        }
        if self.execution_mode == ExecutionMode::SideEffects
            && !self.perform_side_effect_check(host, function, receiver)
        {
            return false;
        }
        true
    }

    /// Called by the engine when a generator resumes while a step waits on one.
    pub fn on_generator_resume(&mut self, host: &mut dyn Host, generator: ObjectRef) {
        if self.suspended_generator() == Some(generator) {
            self.prepare_step_in_suspended_generator(host);
        }
    }
}
