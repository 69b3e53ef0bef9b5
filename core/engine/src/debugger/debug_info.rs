//! Per-function debugger side data.

use std::{
    cell::{Ref, RefCell, RefMut},
    collections::BTreeMap,
    sync::Arc,
};

use bitflags::bitflags;
use intrusive_collections::{SinglyLinkedList, SinglyLinkedListLink, intrusive_adapter};
use rustc_hash::FxHashSet;
use thin_vec::ThinVec;

use super::{BreakpointId, FunctionId};
use crate::vm::{BytecodeArray, DebugBytecodeArray, SideEffectClass};

bitflags! {
    /// Flags recorded on a [`DebugInfo`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DebugInfoFlags: u16 {
        /// Break locations may be computed and breakpoints set.
        const HAS_BREAK_INFO = 1 << 0;
        /// Block coverage is being collected.
        const HAS_COVERAGE_INFO = 1 << 1;
        /// The function has no bytecode and breaks at entry instead.
        const CAN_BREAK_AT_ENTRY = 1 << 2;
        /// The entry trampoline should report a break.
        const BREAK_AT_ENTRY = 1 << 3;
        /// Cached blackbox verdict.
        const DEBUG_IS_BLACKBOXED = 1 << 4;
        /// Whether [`DebugInfoFlags::DEBUG_IS_BLACKBOXED`] is valid.
        const COMPUTED_DEBUG_IS_BLACKBOXED = 1 << 5;
    }
}

/// Whether a function has been readied to run instrumented bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Preparation {
    /// No preparation has happened.
    #[default]
    NotPrepared,
    /// Optimized code was discarded and active frames redirected. Never undone while the
    /// break info lives.
    Prepared,
}

/// Which instrumentation is applied to a function's debug bytecode, and which one the
/// isolate currently wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Nothing applied.
    #[default]
    Normal,
    /// Breakpoints and one-shot breaks are applied.
    Breakpoints,
    /// Side-effect checks are applied.
    SideEffects,
}

/// Cached result of the side-effect analysis of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideEffectState {
    /// Not analysed yet.
    #[default]
    NotComputed,
    /// Calling the function always has a side effect.
    HasSideEffects,
    /// The function mutates objects, which must be checked as it runs.
    RequiresRuntimeChecks,
    /// The function is free of side effects.
    HasNoSideEffect,
}

impl SideEffectState {
    /// Classifies a function by its bytecode.
    #[must_use]
    pub fn classify(bytecode: &BytecodeArray) -> Self {
        let mut requires_runtime_checks = false;
        let mut it = bytecode.iter();
        while !it.done() {
            match it.current_opcode().side_effect_class() {
                SideEffectClass::SideEffect => return Self::HasSideEffects,
                SideEffectClass::RuntimeCheck => requires_runtime_checks = true,
                SideEffectClass::None => {}
            }
            it.advance();
        }
        if requires_runtime_checks {
            Self::RequiresRuntimeChecks
        } else {
            Self::HasNoSideEffect
        }
    }
}

/// A user breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakPoint {
    id: BreakpointId,
    condition: Option<Box<str>>,
}

impl BreakPoint {
    /// Creates a breakpoint. An empty condition means "always".
    #[must_use]
    pub fn new(id: BreakpointId, condition: Option<&str>) -> Self {
        Self {
            id,
            condition: condition.filter(|c| !c.is_empty()).map(Into::into),
        }
    }

    /// The breakpoint id.
    #[must_use]
    pub const fn id(&self) -> BreakpointId {
        self.id
    }

    /// The condition source, if any.
    #[must_use]
    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }
}

/// All breakpoints set at one source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakPointInfo {
    source_position: i32,
    break_points: ThinVec<BreakPoint>,
}

impl BreakPointInfo {
    /// The source position.
    #[must_use]
    pub const fn source_position(&self) -> i32 {
        self.source_position
    }

    /// Breakpoints at this position, in insertion order.
    #[must_use]
    pub fn break_points(&self) -> &[BreakPoint] {
        &self.break_points
    }

    /// Whether a breakpoint with `id` is set here.
    #[must_use]
    pub fn has_break_point(&self, id: BreakpointId) -> bool {
        self.break_points.iter().any(|bp| bp.id == id)
    }
}

/// One counter of block coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageSlot {
    /// Start of the block.
    pub start: i32,
    /// End of the block.
    pub end: i32,
    /// Execution count.
    pub count: u32,
}

/// Block coverage counters of a function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageInfo {
    /// The counters.
    pub slots: Vec<CoverageSlot>,
}

/// The debugger's side data for one function.
///
/// A `DebugInfo` exists while any of break info, coverage info or debugger hints are
/// present. Once all three are gone it is removed from the debugger.
#[derive(Debug)]
pub struct DebugInfo {
    function: FunctionId,
    start_position: i32,
    flags: DebugInfoFlags,
    preparation: Preparation,
    execution_mode: ExecutionMode,
    side_effect_state: SideEffectState,
    debugging_id: Option<u32>,
    original_bytecode: Option<Arc<BytecodeArray>>,
    debug_bytecode: Option<Arc<DebugBytecodeArray>>,
    break_points: BTreeMap<i32, BreakPointInfo>,
    coverage_info: Option<CoverageInfo>,
}

impl DebugInfo {
    /// Creates empty side data for `function`, whose source range starts at
    /// `start_position`.
    #[must_use]
    pub fn new(function: FunctionId, start_position: i32) -> Self {
        Self {
            function,
            start_position,
            flags: DebugInfoFlags::empty(),
            preparation: Preparation::NotPrepared,
            execution_mode: ExecutionMode::Normal,
            side_effect_state: SideEffectState::NotComputed,
            debugging_id: None,
            original_bytecode: None,
            debug_bytecode: None,
            break_points: BTreeMap::new(),
            coverage_info: None,
        }
    }

    /// The function this data belongs to.
    #[must_use]
    pub const fn function(&self) -> FunctionId {
        self.function
    }

    /// Start of the function's source range.
    #[must_use]
    pub const fn start_position(&self) -> i32 {
        self.start_position
    }

    /// The recorded flags.
    #[must_use]
    pub const fn flags(&self) -> DebugInfoFlags {
        self.flags
    }

    /// Whether break info is present.
    #[must_use]
    pub const fn has_break_info(&self) -> bool {
        self.flags.contains(DebugInfoFlags::HAS_BREAK_INFO)
    }

    /// Whether coverage info is present.
    #[must_use]
    pub const fn has_coverage_info(&self) -> bool {
        self.flags.contains(DebugInfoFlags::HAS_COVERAGE_INFO)
    }

    /// Whether the function breaks at entry instead of on bytecode.
    #[must_use]
    pub const fn can_break_at_entry(&self) -> bool {
        self.flags.contains(DebugInfoFlags::CAN_BREAK_AT_ENTRY)
    }

    /// Whether the entry trampoline should report a break.
    #[must_use]
    pub const fn break_at_entry(&self) -> bool {
        self.flags.contains(DebugInfoFlags::BREAK_AT_ENTRY)
    }

    pub(crate) fn set_break_at_entry(&mut self) {
        debug_assert!(self.can_break_at_entry());
        self.flags.insert(DebugInfoFlags::BREAK_AT_ENTRY);
    }

    pub(crate) fn clear_break_at_entry(&mut self) {
        debug_assert!(self.can_break_at_entry());
        self.flags.remove(DebugInfoFlags::BREAK_AT_ENTRY);
    }

    /// Records that break info is present.
    pub(crate) fn install_break_info(
        &mut self,
        can_break_at_entry: bool,
        original_bytecode: Option<Arc<BytecodeArray>>,
    ) {
        self.flags.insert(DebugInfoFlags::HAS_BREAK_INFO);
        if can_break_at_entry {
            self.flags.insert(DebugInfoFlags::CAN_BREAK_AT_ENTRY);
        }
        if self.original_bytecode.is_none() {
            self.original_bytecode = original_bytecode;
        }
    }

    /// Drops the break info. Returns whether instrumented bytecode was uninstalled, in
    /// which case the host must go back to the original bytecode.
    pub(crate) fn clear_break_info(&mut self) -> bool {
        let had_instrumented_bytecode = self.debug_bytecode.take().is_some();
        self.original_bytecode = None;
        self.break_points.clear();
        self.flags.remove(
            DebugInfoFlags::HAS_BREAK_INFO
                | DebugInfoFlags::BREAK_AT_ENTRY
                | DebugInfoFlags::CAN_BREAK_AT_ENTRY,
        );
        self.preparation = Preparation::NotPrepared;
        self.execution_mode = ExecutionMode::Normal;
        had_instrumented_bytecode
    }

    /// How far the function was prepared for debug execution.
    #[must_use]
    pub const fn preparation(&self) -> Preparation {
        self.preparation
    }

    pub(crate) fn set_prepared(&mut self) {
        self.preparation = Preparation::Prepared;
    }

    /// Instrumentation applied to the debug bytecode.
    #[must_use]
    pub const fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    pub(crate) fn set_execution_mode(&mut self, mode: ExecutionMode) {
        self.execution_mode = mode;
    }

    /// Whether the function runs a patchable copy of its bytecode.
    #[must_use]
    pub const fn has_instrumented_bytecode(&self) -> bool {
        self.debug_bytecode.is_some()
    }

    /// Creates the patchable copy of `original`, returning the copy to hand to the host.
    pub(crate) fn install_debug_bytecode(
        &mut self,
        original: Arc<BytecodeArray>,
    ) -> Arc<DebugBytecodeArray> {
        let copy = Arc::new(DebugBytecodeArray::from_original(&original));
        self.original_bytecode = Some(original);
        self.debug_bytecode = Some(Arc::clone(&copy));
        copy
    }

    /// The bytecode the compiler produced.
    ///
    /// # Panics
    ///
    /// Panics if the function has no bytecode; functions that break at entry never reach
    /// bytecode-based code paths.
    #[must_use]
    pub fn original_bytecode(&self) -> &BytecodeArray {
        match &self.original_bytecode {
            Some(bytecode) => bytecode,
            None => panic!("function {:?} has no bytecode", self.function),
        }
    }

    /// Whether the original bytecode is known.
    #[must_use]
    pub const fn has_original_bytecode(&self) -> bool {
        self.original_bytecode.is_some()
    }

    /// The patchable copy.
    ///
    /// # Panics
    ///
    /// Panics if the function is not instrumented.
    #[must_use]
    pub fn debug_bytecode(&self) -> &DebugBytecodeArray {
        match &self.debug_bytecode {
            Some(bytecode) => bytecode,
            None => panic!("function {:?} is not instrumented", self.function),
        }
    }

    /// Adds `break_point` at `source_position`.
    pub(crate) fn set_break_point(&mut self, source_position: i32, break_point: BreakPoint) {
        let info = self
            .break_points
            .entry(source_position)
            .or_insert_with(|| BreakPointInfo {
                source_position,
                break_points: ThinVec::new(),
            });
        if !info.has_break_point(break_point.id) {
            info.break_points.push(break_point);
        }
    }

    /// Removes the breakpoint `id`. Returns whether it was present.
    pub(crate) fn clear_break_point(&mut self, id: BreakpointId) -> bool {
        let Some(position) = self.find_break_point_position(id) else {
            return false;
        };
        if let Some(info) = self.break_points.get_mut(&position) {
            info.break_points.retain(|bp| bp.id != id);
            if info.break_points.is_empty() {
                self.break_points.remove(&position);
            }
        }
        true
    }

    /// Position of the breakpoint `id`, if set on this function.
    #[must_use]
    pub fn find_break_point_position(&self, id: BreakpointId) -> Option<i32> {
        self.break_points
            .values()
            .find(|info| info.has_break_point(id))
            .map(BreakPointInfo::source_position)
    }

    /// Whether any breakpoint is set at `source_position`.
    #[must_use]
    pub fn has_break_point(&self, source_position: i32) -> bool {
        self.break_points
            .get(&source_position)
            .is_some_and(|info| !info.break_points.is_empty())
    }

    /// Breakpoints at `source_position`.
    #[must_use]
    pub fn break_points_at(&self, source_position: i32) -> &[BreakPoint] {
        self.break_points
            .get(&source_position)
            .map_or(&[], BreakPointInfo::break_points)
    }

    /// Positions with at least one breakpoint, ascending.
    pub fn break_point_positions(&self) -> impl Iterator<Item = i32> + '_ {
        self.break_points.keys().copied()
    }

    /// Total number of breakpoints set on the function.
    #[must_use]
    pub fn break_point_count(&self) -> usize {
        self.break_points
            .values()
            .map(|info| info.break_points.len())
            .sum()
    }

    /// Cached side-effect analysis.
    #[must_use]
    pub const fn side_effect_state(&self) -> SideEffectState {
        self.side_effect_state
    }

    pub(crate) fn set_side_effect_state(&mut self, state: SideEffectState) {
        self.side_effect_state = state;
    }

    /// Cached blackbox verdict, if computed.
    #[must_use]
    pub const fn debug_is_blackboxed(&self) -> Option<bool> {
        if self.flags.contains(DebugInfoFlags::COMPUTED_DEBUG_IS_BLACKBOXED) {
            Some(self.flags.contains(DebugInfoFlags::DEBUG_IS_BLACKBOXED))
        } else {
            None
        }
    }

    pub(crate) fn set_debug_is_blackboxed(&mut self, blackboxed: bool) {
        self.flags.insert(DebugInfoFlags::COMPUTED_DEBUG_IS_BLACKBOXED);
        self.flags.set(DebugInfoFlags::DEBUG_IS_BLACKBOXED, blackboxed);
    }

    /// Stable id handed to the controller for this function.
    #[must_use]
    pub const fn debugging_id(&self) -> Option<u32> {
        self.debugging_id
    }

    pub(crate) fn set_debugging_id(&mut self, id: u32) {
        self.debugging_id = Some(id);
    }

    /// Whether any debugger hint is cached.
    #[must_use]
    pub const fn has_debugger_hints(&self) -> bool {
        self.flags.intersects(
            DebugInfoFlags::COMPUTED_DEBUG_IS_BLACKBOXED.union(DebugInfoFlags::DEBUG_IS_BLACKBOXED),
        ) || !matches!(self.side_effect_state, SideEffectState::NotComputed)
            || self.debugging_id.is_some()
    }

    /// Drops every cached hint.
    pub(crate) fn clear_debugger_hints(&mut self) {
        self.flags.remove(
            DebugInfoFlags::COMPUTED_DEBUG_IS_BLACKBOXED | DebugInfoFlags::DEBUG_IS_BLACKBOXED,
        );
        self.side_effect_state = SideEffectState::NotComputed;
        self.debugging_id = None;
    }

    /// Coverage counters, if installed.
    #[must_use]
    pub const fn coverage_info(&self) -> Option<&CoverageInfo> {
        self.coverage_info.as_ref()
    }

    pub(crate) fn set_coverage_info(&mut self, coverage: CoverageInfo) {
        self.flags.insert(DebugInfoFlags::HAS_COVERAGE_INFO);
        self.coverage_info = Some(coverage);
    }

    pub(crate) fn clear_coverage_info(&mut self) {
        self.flags.remove(DebugInfoFlags::HAS_COVERAGE_INFO);
        self.coverage_info = None;
    }

    /// Whether nothing is left worth keeping.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.has_break_info() && !self.has_coverage_info() && !self.has_debugger_hints()
    }
}

struct DebugInfoNode {
    link: SinglyLinkedListLink,
    info: RefCell<DebugInfo>,
}

intrusive_adapter!(DebugInfoAdapter = Box<DebugInfoNode>: DebugInfoNode { link: SinglyLinkedListLink });

/// The debugger's list of live [`DebugInfo`]s, most recently created first.
pub(crate) struct DebugInfoList {
    list: SinglyLinkedList<DebugInfoAdapter>,
    functions: FxHashSet<FunctionId>,
}

impl std::fmt::Debug for DebugInfoList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugInfoList")
            .field("functions", &self.functions)
            .finish_non_exhaustive()
    }
}

impl Default for DebugInfoList {
    fn default() -> Self {
        Self {
            list: SinglyLinkedList::new(DebugInfoAdapter::new()),
            functions: FxHashSet::default(),
        }
    }
}

impl DebugInfoList {
    pub(crate) fn contains(&self, function: FunctionId) -> bool {
        self.functions.contains(&function)
    }

    pub(crate) fn len(&self) -> usize {
        self.functions.len()
    }

    pub(crate) fn push_front(&mut self, info: DebugInfo) {
        let inserted = self.functions.insert(info.function());
        debug_assert!(inserted, "duplicate debug info for {:?}", info.function());
        self.list.push_front(Box::new(DebugInfoNode {
            link: SinglyLinkedListLink::new(),
            info: RefCell::new(info),
        }));
    }

    fn node(&self, function: FunctionId) -> Option<&DebugInfoNode> {
        if !self.contains(function) {
            return None;
        }
        self.list
            .iter()
            .find(|node| node.info.borrow().function() == function)
    }

    pub(crate) fn get(&self, function: FunctionId) -> Option<Ref<'_, DebugInfo>> {
        self.node(function).map(|node| node.info.borrow())
    }

    pub(crate) fn get_mut(&self, function: FunctionId) -> Option<RefMut<'_, DebugInfo>> {
        self.node(function).map(|node| node.info.borrow_mut())
    }

    /// Functions with a live entry, most recent first.
    pub(crate) fn functions(&self) -> Vec<FunctionId> {
        self.list
            .iter()
            .map(|node| node.info.borrow().function())
            .collect()
    }

    pub(crate) fn for_each_mut(&self, mut f: impl FnMut(&mut DebugInfo)) {
        for node in self.list.iter() {
            f(&mut node.info.borrow_mut());
        }
    }

    /// Unlinks and returns the entry for `function`.
    ///
    /// # Panics
    ///
    /// Panics if there is no entry.
    pub(crate) fn remove(&mut self, function: FunctionId) -> DebugInfo {
        assert!(
            self.functions.remove(&function),
            "no debug info for {function:?}"
        );
        let mut cursor = self.list.cursor_mut();
        loop {
            let found = {
                let mut next = cursor.as_cursor();
                next.move_next();
                match next.get() {
                    Some(node) => node.info.borrow().function() == function,
                    None => unreachable!("debug info list out of sync for {function:?}"),
                }
            };
            if found {
                break;
            }
            cursor.move_next();
        }
        match cursor.remove_next() {
            Some(node) => node.info.into_inner(),
            None => unreachable!("debug info list out of sync for {function:?}"),
        }
    }

    /// Applies `clear` to every entry, then frees the entries left empty.
    pub(crate) fn clear_all(&mut self, mut clear: impl FnMut(&mut DebugInfo)) {
        let mut cursor = self.list.cursor_mut();
        loop {
            let next = {
                let mut next = cursor.as_cursor();
                next.move_next();
                next.get().map(|node| {
                    let mut info = node.info.borrow_mut();
                    clear(&mut info);
                    (info.function(), info.is_empty())
                })
            };
            match next {
                None => break,
                Some((function, true)) => {
                    self.functions.remove(&function);
                    cursor.remove_next();
                }
                Some((_, false)) => cursor.move_next(),
            }
        }
    }
}
