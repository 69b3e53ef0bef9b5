//! The per-isolate debugger state.

use std::{cell::Ref, sync::Arc};

use bitflags::bitflags;
use log::{debug, info};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;

use super::{
    DebugInfo, FunctionId, ObjectRef, StackFrameId,
    archive::ThreadLocal,
    commands::CommandTable,
    debug_info::{DebugInfoList, ExecutionMode},
    delegate::DebugDelegate,
    host::Host,
    scope::ScopeRecord,
    side_effects::TemporaryObjectsTracker,
};
use crate::DebugConfig;

/// A stepping request.
///
/// Actions are ordered so that "at least step over" and "at least step into" are plain
/// comparisons.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    TryFromPrimitive,
    IntoPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(i32)]
#[serde(rename_all = "camelCase")]
pub enum StepAction {
    /// Not stepping.
    None = -1,
    /// Break once the current function returns.
    Out = 0,
    /// Break at the next statement of the current function or a caller.
    Over = 1,
    /// Break at the next statement, entering calls.
    Into = 2,
}

/// Which exceptions the controller wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExceptionBreak {
    /// Every thrown exception.
    All,
    /// Exceptions predicted to be uncaught.
    Uncaught,
}

bitflags! {
    /// Debugger features an isolate has used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Feature: u8 {
        /// A delegate was installed.
        const ACTIVE = 1 << 0;
        /// A breakpoint was set.
        const BREAK_POINT = 1 << 1;
        /// A step was prepared.
        const STEPPING = 1 << 2;
        /// Side-effect-free evaluation was used.
        const SIDE_EFFECT_CHECK = 1 << 3;
    }
}

#[derive(Debug, Default)]
pub(crate) struct FeatureTracker {
    used: Feature,
}

impl FeatureTracker {
    pub(crate) fn track(&mut self, feature: Feature) {
        if !self.used.contains(feature) {
            self.used.insert(feature);
            info!("debugger feature used: {feature:?}");
        }
    }
}

/// Per-isolate debugger state and the entry point of every debugger operation.
///
/// The debugger is driven from the engine's thread. Operations that need engine services
/// take a `&mut dyn Host`; operations that notify the controller call back into the
/// installed [`DebugDelegate`] synchronously, which may in turn call back into the
/// debugger through a [`PauseContext`](super::PauseContext).
pub struct Debugger {
    pub(super) config: DebugConfig,
    pub(super) is_active: bool,
    pub(super) hook_on_function_call: bool,
    pub(super) is_suppressed: bool,
    pub(super) break_disabled: bool,
    pub(super) break_points_active: bool,
    pub(super) break_on_exception: bool,
    pub(super) break_on_uncaught_exception: bool,
    pub(super) side_effect_check_failed: bool,
    pub(super) execution_mode: ExecutionMode,
    pub(super) debug_infos: DebugInfoList,
    pub(super) thread_local: ThreadLocal,
    pub(super) scopes: Vec<ScopeRecord>,
    pub(super) delegate: Option<Arc<dyn DebugDelegate>>,
    pub(super) temporary_objects: Option<TemporaryObjectsTracker>,
    pub(super) features: FeatureTracker,
    pub(super) next_debugging_id: u32,
    pub(super) commands: CommandTable,
}

assert_impl_all!(Debugger: Send);

impl std::fmt::Debug for Debugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debugger")
            .field("is_active", &self.is_active)
            .field("execution_mode", &self.execution_mode)
            .field("debug_infos", &self.debug_infos)
            .field("thread_local", &self.thread_local)
            .field("scope_depth", &self.scopes.len())
            .finish_non_exhaustive()
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new(DebugConfig::default())
    }
}

impl Debugger {
    /// Creates an inactive debugger.
    #[must_use]
    pub fn new(config: DebugConfig) -> Self {
        Self {
            is_active: false,
            hook_on_function_call: false,
            is_suppressed: false,
            break_disabled: false,
            break_points_active: config.break_points_active,
            break_on_exception: config.break_on_exception,
            break_on_uncaught_exception: config.break_on_uncaught_exception,
            side_effect_check_failed: false,
            execution_mode: ExecutionMode::Breakpoints,
            debug_infos: DebugInfoList::default(),
            thread_local: ThreadLocal::init(),
            scopes: Vec::new(),
            delegate: None,
            temporary_objects: None,
            features: FeatureTracker::default(),
            next_debugging_id: 1,
            commands: CommandTable::default(),
            config,
        }
    }

    /// The configuration the debugger was created with.
    #[must_use]
    pub const fn config(&self) -> &DebugConfig {
        &self.config
    }

    /// Whether a delegate is installed.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.is_active
    }

    /// Installs or removes the controller. Removing it unloads every debugger artifact.
    pub fn set_debug_delegate(
        &mut self,
        host: &mut dyn Host,
        delegate: Option<Arc<dyn DebugDelegate>>,
    ) {
        self.delegate = delegate;
        self.update_state(host);
    }

    pub(super) fn update_state(&mut self, host: &mut dyn Host) {
        let is_active = self.delegate.is_some();
        if is_active == self.is_active {
            return;
        }
        if is_active {
            host.set_compilation_cache_enabled(false);
            host.collect_source_positions();
            self.features.track(Feature::ACTIVE);
        } else {
            host.set_compilation_cache_enabled(true);
            self.unload(host);
        }
        self.is_active = is_active;
        debug!("debugger {}", if is_active { "activated" } else { "deactivated" });
    }

    fn unload(&mut self, host: &mut dyn Host) {
        self.clear_all_break_points(host);
        self.clear_stepping();
        self.remove_all_coverage_infos();
        self.clear_all_debugger_hints();
        self.delegate = None;
    }

    /// Whether debugger events are currently ignored.
    #[must_use]
    pub fn ignore_events(&self) -> bool {
        self.is_suppressed || !self.is_active || self.execution_mode == ExecutionMode::SideEffects
    }

    /// Whether a debug scope is open.
    #[must_use]
    pub fn in_debug_scope(&self) -> bool {
        !self.scopes.is_empty()
    }

    /// Whether breaks are currently disabled.
    #[must_use]
    pub const fn break_disabled(&self) -> bool {
        self.break_disabled
    }

    /// Whether user breakpoints are evaluated.
    #[must_use]
    pub const fn break_points_active(&self) -> bool {
        self.break_points_active
    }

    /// Enables or disables user breakpoints without removing them.
    pub fn set_break_points_active(&mut self, active: bool) {
        self.break_points_active = active;
    }

    /// Enables or disables exception reporting.
    pub fn set_break_on_exception(&mut self, kind: ExceptionBreak, enable: bool) {
        match kind {
            ExceptionBreak::All => self.break_on_exception = enable,
            ExceptionBreak::Uncaught => self.break_on_uncaught_exception = enable,
        }
    }

    /// Whether exceptions of `kind` are reported.
    #[must_use]
    pub const fn is_break_on_exception(&self, kind: ExceptionBreak) -> bool {
        match kind {
            ExceptionBreak::All => self.break_on_exception,
            ExceptionBreak::Uncaught => self.break_on_uncaught_exception,
        }
    }

    /// Whether the engine must call [`Debugger::on_function_call`] on every call.
    #[must_use]
    pub const fn hook_on_function_call(&self) -> bool {
        self.hook_on_function_call
    }

    /// The isolate-wide instrumentation mode.
    #[must_use]
    pub const fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    /// Whether a side-effect check failed during the current evaluation.
    #[must_use]
    pub const fn side_effect_check_failed(&self) -> bool {
        self.side_effect_check_failed
    }

    /// The frame the current break happened in.
    #[must_use]
    pub fn break_frame_id(&self) -> Option<StackFrameId> {
        self.thread_local.break_frame_id()
    }

    /// The pending step action.
    #[must_use]
    pub fn last_step_action(&self) -> StepAction {
        self.thread_local.last_step_action()
    }

    /// The value being returned when the break happened at a return.
    #[must_use]
    pub fn return_value(&self) -> Option<ObjectRef> {
        self.thread_local.return_value()
    }

    /// Records the accumulator at a break.
    pub fn set_return_value(&mut self, value: Option<ObjectRef>) {
        self.thread_local.set_return_value(value);
    }

    /// The generator a step is waiting on to resume.
    #[must_use]
    pub fn suspended_generator(&self) -> Option<ObjectRef> {
        self.thread_local.suspended_generator()
    }

    /// Whether a step is waiting on a generator to resume.
    #[must_use]
    pub fn has_suspended_generator(&self) -> bool {
        self.suspended_generator().is_some()
    }

    /// Features used so far.
    #[must_use]
    pub const fn features_used(&self) -> Feature {
        self.features.used
    }

    /// The debugger's side data for `function`, if any.
    ///
    /// # Panics
    ///
    /// Panics if the side data is being mutated, which only happens inside debugger
    /// operations.
    #[must_use]
    pub fn debug_info(&self, function: FunctionId) -> Option<Ref<'_, DebugInfo>> {
        self.debug_infos.get(function)
    }

    /// Whether the debugger holds side data for `function`.
    #[must_use]
    pub fn has_debug_info(&self, function: FunctionId) -> bool {
        self.debug_infos.contains(function)
    }

    /// Number of functions the debugger holds side data for.
    #[must_use]
    pub fn debug_info_count(&self) -> usize {
        self.debug_infos.len()
    }

    /// Whether the entry trampoline must report a break for `function`.
    #[must_use]
    pub fn needs_break_at_entry(&self, function: FunctionId) -> bool {
        self.debug_infos
            .get(function)
            .is_some_and(|info| info.break_at_entry())
    }

    pub(super) fn expect_debug_info(&self, function: FunctionId) -> Ref<'_, DebugInfo> {
        match self.debug_infos.get(function) {
            Some(info) => info,
            None => panic!("no debug info for {function:?}"),
        }
    }

    pub(super) fn expect_debug_info_mut(
        &self,
        function: FunctionId,
    ) -> std::cell::RefMut<'_, DebugInfo> {
        match self.debug_infos.get_mut(function) {
            Some(info) => info,
            None => panic!("no debug info for {function:?}"),
        }
    }
}
