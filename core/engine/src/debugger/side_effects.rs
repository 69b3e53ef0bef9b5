//! Side-effect-free evaluation.
//!
//! While the debugger is in [`ExecutionMode::SideEffects`], every called function is
//! classified before it runs. Functions that may only mutate objects get their mutating
//! instructions patched with checks, which pass only for objects allocated during the
//! evaluation. Any other side effect terminates execution.

use std::sync::{Mutex, PoisonError};

use log::trace;
use rustc_hash::FxHashSet;
use serde_json::Value;

use super::{
    DebugInfo, Debugger, ExecutionMode, FunctionId, ObjectRef, SideEffectState,
    StackFrame,
    breakpoints::{apply_break_points, clear_break_points},
    host::{EvaluationTarget, Host},
    state::Feature,
};
use crate::{
    DebugError,
    vm::{Opcode, Register, SideEffectClass},
};

/// Objects allocated since side-effect checking started. Mutating them is not an
/// observable side effect.
#[derive(Debug, Default)]
pub struct TemporaryObjectsTracker {
    objects: Mutex<FxHashSet<ObjectRef>>,
}

impl TemporaryObjectsTracker {
    fn objects(&self) -> std::sync::MutexGuard<'_, FxHashSet<ObjectRef>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a new allocation.
    pub fn allocation(&self, object: ObjectRef) {
        self.objects().insert(object);
    }

    /// Follows an object the collector moved from `from` to `to`. Moving an untracked
    /// object over a tracked address untracks it.
    pub fn move_object(&self, from: ObjectRef, to: ObjectRef) {
        let mut objects = self.objects();
        if objects.remove(&from) {
            objects.insert(to);
        } else {
            objects.remove(&to);
        }
    }

    /// Whether `object` was allocated during the evaluation.
    #[must_use]
    pub fn has(&self, object: ObjectRef) -> bool {
        self.objects().contains(&object)
    }

    /// Number of tracked objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects().len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Patches a break over every instruction of `info` that mutates an object.
fn apply_side_effect_checks(info: &mut DebugInfo) {
    debug_assert!(info.has_instrumented_bytecode());
    {
        let original = info.original_bytecode();
        let debug = info.debug_bytecode();
        let mut it = original.iter();
        while !it.done() {
            if it.current_opcode().side_effect_class() == SideEffectClass::RuntimeCheck {
                debug.patch(it.current_offset(), Opcode::DebugBreak.into());
            }
            it.advance();
        }
    }
    info.set_execution_mode(ExecutionMode::SideEffects);
}

/// Restores every instruction of `info` from the original bytecode.
fn clear_side_effect_checks(info: &DebugInfo) {
    let original = info.original_bytecode();
    let debug = info.debug_bytecode();
    let mut it = original.iter();
    while !it.done() {
        let offset = it.current_offset();
        debug.patch(offset, original.bytes()[offset as usize]);
        it.advance();
    }
}

impl Debugger {
    /// Enters side-effect checking. Calls and mutations are checked until
    /// [`Debugger::stop_side_effect_check_mode`].
    pub fn start_side_effect_check_mode(&mut self) {
        debug_assert_ne!(self.execution_mode, ExecutionMode::SideEffects);
        self.execution_mode = ExecutionMode::SideEffects;
        self.update_hook_on_function_call();
        self.side_effect_check_failed = false;
        self.temporary_objects = Some(TemporaryObjectsTracker::default());
        self.features.track(Feature::SIDE_EFFECT_CHECK);
        self.update_debug_infos_for_execution_mode();
    }

    /// Leaves side-effect checking.
    ///
    /// # Errors
    ///
    /// Returns [`DebugError::SideEffect`] if a check failed. The termination the failure
    /// requested is withdrawn so the caller can report the error instead.
    pub fn stop_side_effect_check_mode(&mut self, host: &mut dyn Host) -> Result<(), DebugError> {
        debug_assert_eq!(self.execution_mode, ExecutionMode::SideEffects);
        let failed = self.side_effect_check_failed;
        if failed {
            host.cancel_terminate_execution();
        }
        self.execution_mode = ExecutionMode::Breakpoints;
        self.update_hook_on_function_call();
        self.side_effect_check_failed = false;
        self.temporary_objects = None;
        self.update_debug_infos_for_execution_mode();
        if failed {
            Err(DebugError::SideEffect)
        } else {
            Ok(())
        }
    }

    fn update_debug_infos_for_execution_mode(&mut self) {
        let mode = self.execution_mode;
        self.debug_infos.for_each_mut(|info| {
            if !info.has_instrumented_bytecode() || info.execution_mode() == mode {
                return;
            }
            if mode == ExecutionMode::Breakpoints {
                clear_side_effect_checks(info);
                apply_break_points(info);
            } else {
                clear_break_points(info);
                apply_side_effect_checks(info);
            }
        });
    }

    /// Checks a call of `function` with `receiver` made during side-effect checking.
    ///
    /// Returns `false`, after requesting termination, if the call may have a side effect.
    pub fn perform_side_effect_check(
        &mut self,
        host: &mut dyn Host,
        function: FunctionId,
        receiver: Option<ObjectRef>,
    ) -> bool {
        debug_assert_eq!(self.execution_mode, ExecutionMode::SideEffects);
        if !host.is_compiled(function) && host.compile(function).is_err() {
            return self.fail_side_effect_check(host, function);
        }
        self.get_or_create_debug_info(host, function);

        let state = {
            let info = self.expect_debug_info(function);
            info.side_effect_state()
        };
        let state = if state == SideEffectState::NotComputed {
            let state = host
                .original_bytecode(function)
                .map_or_else(|| host.builtin_side_effect_state(function), |bytecode| {
                    SideEffectState::classify(&bytecode)
                });
            self.expect_debug_info_mut(function)
                .set_side_effect_state(state);
            state
        } else {
            state
        };

        match state {
            SideEffectState::HasSideEffects | SideEffectState::NotComputed => {
                self.fail_side_effect_check(host, function)
            }
            SideEffectState::RequiresRuntimeChecks => {
                if host.original_bytecode(function).is_none() {
                    // Builtins may only mutate their receiver.
                    return self.perform_side_effect_check_for_object(host, receiver);
                }
                self.prepare_function_for_debug_execution(host, function);
                let mut info = self.expect_debug_info_mut(function);
                if info.execution_mode() != ExecutionMode::SideEffects {
                    clear_break_points(&mut info);
                    apply_side_effect_checks(&mut info);
                }
                true
            }
            SideEffectState::HasNoSideEffect => true,
        }
    }

    fn fail_side_effect_check(&mut self, host: &mut dyn Host, function: FunctionId) -> bool {
        if self.config.trace_side_effect_free_debug_evaluate {
            trace!(
                "[debug-evaluate] function {} failed side effect check",
                host.function_info(function).name
            );
        }
        self.side_effect_check_failed = true;
        host.request_terminate_execution();
        false
    }

    /// Checks the patched instruction `frame` is stopped at.
    ///
    /// Returns `false`, after requesting termination, if it mutates an object allocated
    /// before the evaluation started.
    pub fn perform_side_effect_check_at_bytecode(&mut self, host: &mut dyn Host, frame: &StackFrame) -> bool {
        debug_assert_eq!(self.execution_mode, ExecutionMode::SideEffects);
        let summary = *frame.top();
        let Some(bytecode) = host.original_bytecode(summary.function) else {
            return self.fail_side_effect_check(host, summary.function);
        };
        let it = bytecode.iter_at(summary.code_offset);
        let register = match it.current_opcode() {
            Opcode::CallRuntime => {
                return self.fail_side_effect_check(host, summary.function);
            }
            Opcode::StaCurrentContextSlot => Register::CURRENT_CONTEXT,
            _ => it.register_operand(0),
        };
        let object = host.read_register(frame.id, register);
        self.perform_side_effect_check_for_object(host, object)
    }

    /// Checks a mutation of `object`. Mutating a non-object, or an object allocated
    /// during the evaluation, passes.
    pub fn perform_side_effect_check_for_object(
        &mut self,
        host: &mut dyn Host,
        object: Option<ObjectRef>,
    ) -> bool {
        debug_assert!(self.temporary_objects.is_some());
        let Some(object) = object else {
            return true;
        };
        if self
            .temporary_objects
            .as_ref()
            .is_some_and(|tracker| tracker.has(object))
        {
            return true;
        }
        if self.config.trace_side_effect_free_debug_evaluate {
            trace!("[debug-evaluate] failed runtime side effect check on {object:?}");
        }
        self.side_effect_check_failed = true;
        host.request_terminate_execution();
        false
    }

    /// Called by the engine for every object allocated while side effects are checked.
    pub fn on_allocation(&self, object: ObjectRef) {
        if let Some(tracker) = &self.temporary_objects {
            tracker.allocation(object);
        }
    }

    /// Called by the collector when it moves an object.
    pub fn on_object_moved(&self, from: ObjectRef, to: ObjectRef) {
        if let Some(tracker) = &self.temporary_objects {
            tracker.move_object(from, to);
        }
    }

    /// Whether `object` was allocated during the current side-effect-free evaluation.
    #[must_use]
    pub fn is_temporary_object(&self, object: ObjectRef) -> bool {
        self.temporary_objects
            .as_ref()
            .is_some_and(|tracker| tracker.has(object))
    }

    /// Evaluates `source` in `target`. With `throw_on_side_effect`, the evaluation runs in
    /// side-effect checking mode and with breaks disabled.
    ///
    /// # Errors
    ///
    /// Returns [`DebugError::SideEffect`] when a check failed, or the evaluator's error.
    pub fn evaluate(
        &mut self,
        host: &mut dyn Host,
        target: EvaluationTarget,
        source: &str,
        throw_on_side_effect: bool,
    ) -> Result<Value, DebugError> {
        if !throw_on_side_effect {
            return Ok(host.evaluate(self, target, source)?);
        }
        self.with_break_disabled(|debugger| {
            debugger.start_side_effect_check_mode();
            let result = host.evaluate(debugger, target, source);
            debugger.stop_side_effect_check_mode(host)?;
            Ok(result?)
        })
    }
}
