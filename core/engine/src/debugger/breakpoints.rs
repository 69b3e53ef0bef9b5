//! Breakpoint management and preparation of functions for debug execution.

use itertools::Itertools;
use log::debug;

use super::{
    BREAK_AT_ENTRY_POSITION, BreakIterator, BreakLocation, BreakPoint, BreakpointId,
    CoverageInfo, DebugInfo, Debugger, ExecutionMode, FunctionId, Preparation, ScriptId,
    StackFrame,
    host::Host,
    state::Feature,
};

/// Removes every planted break of `info`, keeping the breakpoint records.
pub(crate) fn clear_break_points(info: &mut DebugInfo) {
    if !info.has_break_info() {
        return;
    }
    if info.can_break_at_entry() {
        info.clear_break_at_entry();
        return;
    }
    if !info.has_instrumented_bytecode() {
        return;
    }
    let mut it = BreakIterator::new(info);
    while !it.done() {
        it.clear_debug_break();
        it.next();
    }
}

/// Plants a break at the location of every breakpoint of `info`.
pub(crate) fn apply_break_points(info: &mut DebugInfo) {
    if info.can_break_at_entry() {
        if info.break_point_count() > 0 {
            info.set_break_at_entry();
        }
    } else {
        if !info.has_instrumented_bytecode() {
            return;
        }
        for position in info.break_point_positions() {
            let mut it = BreakIterator::new(info);
            if it.done() {
                break;
            }
            it.skip_to_position(position);
            it.set_debug_break();
        }
    }
    info.set_execution_mode(ExecutionMode::Breakpoints);
}

/// The position a breakpoint requested at `source_position` is set at.
fn find_breakable_position(info: &DebugInfo, source_position: i32) -> i32 {
    if info.can_break_at_entry() {
        return BREAK_AT_ENTRY_POSITION;
    }
    let mut it = BreakIterator::new(info);
    it.skip_to_position(source_position);
    it.position()
}

/// Break locations of `info` within `start..end`. Suspends are not offered.
fn find_breakable_positions(info: &DebugInfo, start: i32, end: i32, out: &mut Vec<BreakLocation>) {
    let mut it = BreakIterator::new(info);
    while !it.done() {
        let location = it.break_location();
        if !location.is_suspend() && (start..end).contains(&location.position()) {
            out.push(location);
        }
        it.next();
    }
}

/// The known function of `script` that most tightly contains `position`.
fn find_function_candidate(host: &dyn Host, script: ScriptId, position: i32) -> Option<FunctionId> {
    let mut candidate: Option<(FunctionId, i32, i32, bool)> = None;
    for function in host.script_functions(script) {
        let info = host.function_info(function);
        if !info.is_subject_to_debugging {
            continue;
        }
        let start = info.start_including_token();
        if start > position {
            continue;
        }
        // A top-level function also owns the position just past its end.
        if position >= info.end_position && (!info.is_toplevel || position > info.end_position) {
            continue;
        }
        if let Some((_, current_start, current_end, current_is_toplevel)) = candidate {
            if current_start == start && current_end == info.end_position {
                // Prefer the function over a top-level wrapping only it.
                if !current_is_toplevel && info.is_toplevel {
                    continue;
                }
            } else if start < current_start || current_end < info.end_position {
                continue;
            }
        }
        candidate = Some((function, start, info.end_position, info.is_toplevel));
    }
    candidate.map(|(function, ..)| function)
}

impl Debugger {
    pub(crate) fn get_or_create_debug_info(&mut self, host: &dyn Host, function: FunctionId) {
        if !self.debug_infos.contains(function) {
            let start = host.function_info(function).start_position;
            self.debug_infos.push_front(DebugInfo::new(function, start));
        }
    }

    /// Makes sure `function` has break info, compiling it if needed. Returns `false` if the
    /// function cannot be debugged.
    pub fn ensure_break_info(&mut self, host: &mut dyn Host, function: FunctionId) -> bool {
        if self
            .debug_infos
            .get(function)
            .is_some_and(|info| info.has_break_info())
        {
            return true;
        }
        let info = host.function_info(function);
        let can_break_at_entry = info.can_break_at_entry();
        if !info.is_subject_to_debugging && !can_break_at_entry {
            return false;
        }
        if !host.is_compiled(function)
            && let Err(err) = host.compile(function)
        {
            debug!("cannot debug {}: {err}", info.name);
            return false;
        }
        let original = host.original_bytecode(function);
        if original.is_none() && !can_break_at_entry {
            debug!("cannot debug {}: no bytecode", info.name);
            return false;
        }
        self.get_or_create_debug_info(host, function);
        self.expect_debug_info_mut(function)
            .install_break_info(can_break_at_entry, original);
        true
    }

    /// Makes the engine run instrumentable code for `function`: installs the patchable
    /// bytecode copy, discards optimized code and moves running frames onto the copy.
    /// Functions that break at entry instead route every call through the entry
    /// trampoline. Runs once per function.
    pub fn prepare_function_for_debug_execution(&mut self, host: &mut dyn Host, function: FunctionId) {
        let (preparation, can_break_at_entry, instrumented) = {
            let info = self.expect_debug_info(function);
            (
                info.preparation(),
                info.can_break_at_entry(),
                info.has_instrumented_bytecode(),
            )
        };
        if preparation == Preparation::Prepared {
            return;
        }
        if !can_break_at_entry
            && !instrumented
            && let Some(original) = host.original_bytecode(function)
        {
            let copy = self
                .expect_debug_info_mut(function)
                .install_debug_bytecode(original);
            host.set_debug_bytecode(function, Some(copy));
        }
        if can_break_at_entry {
            // Callers may have inlined the function anywhere.
            host.deoptimize_all();
            host.install_debug_break_trampoline();
        } else {
            host.deoptimize_function(function);
            host.redirect_active_frames(function);
        }
        self.expect_debug_info_mut(function).set_prepared();
    }

    /// Sets a breakpoint in `function` at the first break location at or after `position`,
    /// updating `position` to where it was set.
    pub fn set_breakpoint(
        &mut self,
        host: &mut dyn Host,
        function: FunctionId,
        condition: Option<&str>,
        position: &mut i32,
    ) -> Option<BreakpointId> {
        let id = BreakpointId(self.thread_local.next_breakpoint_id());
        if !self.ensure_break_info(host, function) {
            return None;
        }
        self.prepare_function_for_debug_execution(host, function);
        *position = find_breakable_position(&self.expect_debug_info(function), *position);
        self.add_break_point(function, *position, BreakPoint::new(id, condition));
        Some(id)
    }

    /// Sets a breakpoint at `position` of `script`, in the innermost function containing
    /// it. Functions not compiled yet are compiled to discover nested functions.
    ///
    /// Returns `None`, and sets nothing, when no function contains the position or it has no
    /// break location at or after it.
    pub fn set_breakpoint_for_script(
        &mut self,
        host: &mut dyn Host,
        script: ScriptId,
        condition: Option<&str>,
        position: &mut i32,
    ) -> Option<BreakpointId> {
        let id = BreakpointId(self.thread_local.next_breakpoint_id());
        let outer = self.find_innermost_containing_function(host, script, *position)?;
        if !self.ensure_break_info(host, outer) {
            return None;
        }
        self.prepare_function_for_debug_execution(host, outer);
        let function = self.find_closest_function_from_position(host, script, *position, outer);

        let breakable = find_breakable_position(&self.expect_debug_info(function), *position);
        if breakable < *position {
            return None;
        }
        *position = breakable;
        self.add_break_point(function, breakable, BreakPoint::new(id, condition));
        Some(id)
    }

    /// Sets a breakpoint at the first break location of `function`. Functions without
    /// bytecode break at entry.
    pub fn set_breakpoint_for_function(
        &mut self,
        host: &mut dyn Host,
        function: FunctionId,
        condition: Option<&str>,
    ) -> Option<BreakpointId> {
        let mut position = 0;
        self.set_breakpoint(host, function, condition, &mut position)
    }

    fn add_break_point(&mut self, function: FunctionId, position: i32, break_point: BreakPoint) {
        {
            let mut info = self.expect_debug_info_mut(function);
            info.set_break_point(position, break_point);
            debug_assert!(info.break_point_count() > 0);
            clear_break_points(&mut info);
            apply_break_points(&mut info);
        }
        self.features.track(Feature::BREAK_POINT);
    }

    /// Removes the breakpoint `id`. A function left without breakpoints drops its break
    /// info, and its debug info when nothing else is attached.
    pub fn remove_breakpoint(&mut self, host: &mut dyn Host, id: BreakpointId) {
        for function in self.debug_infos.functions() {
            let remaining = {
                let mut info = self.expect_debug_info_mut(function);
                if !info.has_break_info() || !info.clear_break_point(id) {
                    continue;
                }
                clear_break_points(&mut info);
                let remaining = info.break_point_count();
                if remaining > 0 {
                    apply_break_points(&mut info);
                }
                remaining
            };
            if remaining == 0 {
                self.remove_break_info_and_maybe_free(host, function);
            }
            return;
        }
    }

    fn remove_break_info_and_maybe_free(&mut self, host: &mut dyn Host, function: FunctionId) {
        let uninstalled = self.expect_debug_info_mut(function).clear_break_info();
        if uninstalled {
            host.set_debug_bytecode(function, None);
        }
        if self.expect_debug_info(function).is_empty() {
            self.debug_infos.remove(function);
        }
    }

    /// Removes every breakpoint and one-shot break.
    pub fn clear_all_break_points(&mut self, host: &mut dyn Host) {
        self.debug_infos.clear_all(|info| {
            clear_break_points(info);
            if info.clear_break_info() {
                host.set_debug_bytecode(info.function(), None);
            }
        });
    }

    /// Break locations of `script` within `start..end`, ordered by position. With
    /// `restrict_to_function`, only those of the innermost function containing `start`.
    ///
    /// Returns `None` when the functions involved cannot be compiled.
    pub fn get_possible_breakpoints(
        &mut self,
        host: &mut dyn Host,
        script: ScriptId,
        start: i32,
        end: i32,
        restrict_to_function: bool,
    ) -> Option<Vec<BreakLocation>> {
        let functions = if restrict_to_function {
            let function = self.find_innermost_containing_function(host, script, start)?;
            if !self.ensure_break_info(host, function) {
                return None;
            }
            self.prepare_function_for_debug_execution(host, function);
            vec![function]
        } else {
            self.find_functions_intersecting_range(host, script, start, end)?
        };

        let mut locations = Vec::new();
        for function in functions {
            let info = self.expect_debug_info(function);
            if !info.can_break_at_entry() {
                find_breakable_positions(&info, start, end, &mut locations);
            }
        }
        Some(
            locations
                .into_iter()
                .sorted_by_key(|location| (location.position(), location.code_offset()))
                .collect(),
        )
    }

    /// The innermost function of `script` containing `position`, compiling the top level and
    /// enclosing functions as needed to discover it.
    pub fn find_innermost_containing_function(
        &mut self,
        host: &mut dyn Host,
        script: ScriptId,
        position: i32,
    ) -> Option<FunctionId> {
        let mut iteration = 0;
        loop {
            match find_function_candidate(host, script, position) {
                None if iteration > 0 => return None,
                None => {
                    if let Err(err) = host.compile_toplevel(script) {
                        debug!("cannot compile {script:?}: {err}");
                        return None;
                    }
                }
                Some(function) if host.is_compiled(function) => return Some(function),
                Some(function) => {
                    debug_assert!(host.function_info(function).allows_lazy_compilation);
                    // Compiling reveals the functions nested inside.
                    if let Err(err) = host.compile(function) {
                        debug!("cannot compile {function:?}: {err}");
                        return None;
                    }
                }
            }
            iteration += 1;
        }
    }

    /// Among `outer` and the functions nested in it, the one with the closest break location
    /// at or after `position`.
    pub fn find_closest_function_from_position(
        &mut self,
        host: &mut dyn Host,
        script: ScriptId,
        position: i32,
        outer: FunctionId,
    ) -> FunctionId {
        let mut closest_position =
            find_breakable_position(&self.expect_debug_info(outer), position);
        if closest_position == position {
            return outer;
        }
        let info = host.function_info(outer);
        if info.start_position == info.end_position {
            return outer;
        }
        if closest_position == 0 {
            closest_position = info.end_position;
        }
        let Some(candidates) =
            self.find_functions_intersecting_range(host, script, position, closest_position)
        else {
            return outer;
        };

        let mut closest = outer;
        for candidate in candidates {
            let candidate_position =
                find_breakable_position(&self.expect_debug_info(candidate), position);
            if candidate_position >= position && candidate_position < closest_position {
                closest_position = candidate_position;
                closest = candidate;
            }
            if closest_position == position {
                break;
            }
        }
        closest
    }

    /// Every debuggable function of `script` overlapping `start..end`, compiled and prepared
    /// for debug execution.
    pub fn find_functions_intersecting_range(
        &mut self,
        host: &mut dyn Host,
        script: ScriptId,
        start: i32,
        end: i32,
    ) -> Option<Vec<FunctionId>> {
        let mut tried_toplevel_compile = false;
        loop {
            let mut candidates = Vec::new();
            let mut candidate_subsumes_range = false;
            for function in host.script_functions(script) {
                let info = host.function_info(function);
                if info.end_position < start || info.start_position >= end {
                    continue;
                }
                candidate_subsumes_range |=
                    info.start_position <= start && info.end_position >= end;
                if !info.is_subject_to_debugging {
                    continue;
                }
                if !host.is_compiled(function) && !info.allows_lazy_compilation {
                    continue;
                }
                candidates.push(function);
            }

            if !tried_toplevel_compile
                && !candidate_subsumes_range
                && !host.has_toplevel_function(script)
            {
                tried_toplevel_compile = true;
                if let Err(err) = host.compile_toplevel(script) {
                    debug!("cannot compile {script:?}: {err}");
                    return None;
                }
                continue;
            }

            let mut was_compiled = false;
            for &candidate in &candidates {
                if !host.is_compiled(candidate) {
                    if let Err(err) = host.compile(candidate) {
                        debug!("cannot compile {candidate:?}: {err}");
                        return None;
                    }
                    was_compiled = true;
                }
                if !self.ensure_break_info(host, candidate) {
                    return None;
                }
                self.prepare_function_for_debug_execution(host, candidate);
            }
            // Compiling may have revealed nested functions.
            if !was_compiled {
                return Some(candidates);
            }
        }
    }

    /// Positions of the breakpoints set in `function`, if any.
    #[must_use]
    pub fn get_source_break_locations(&self, function: FunctionId) -> Option<Vec<i32>> {
        let info = self.debug_infos.get(function)?;
        if !info.has_break_info() || info.break_point_count() == 0 {
            return None;
        }
        Some(info.break_point_positions().collect())
    }

    /// Whether the innermost activation of `frame` is stopped at a return.
    #[must_use]
    pub fn is_break_at_return(&self, frame: &StackFrame) -> bool {
        let summary = frame.top();
        let Some(info) = self.debug_infos.get(summary.function) else {
            return false;
        };
        info.has_break_info() && BreakLocation::from_frame(&info, summary).is_return()
    }

    /// Attaches block coverage counters to `function`.
    pub fn install_coverage_info(&mut self, host: &dyn Host, function: FunctionId, coverage: CoverageInfo) {
        self.get_or_create_debug_info(host, function);
        let mut info = self.expect_debug_info_mut(function);
        debug_assert!(!info.has_coverage_info());
        info.set_coverage_info(coverage);
    }

    /// Drops every coverage record.
    pub fn remove_all_coverage_infos(&mut self) {
        self.debug_infos.clear_all(DebugInfo::clear_coverage_info);
    }

    /// Drops every cached blackbox verdict, side-effect analysis and debugging id.
    pub fn clear_all_debugger_hints(&mut self) {
        self.debug_infos.clear_all(DebugInfo::clear_debugger_hints);
    }

    /// A stable id for `function`, assigned on first request.
    pub fn get_function_debugging_id(&mut self, host: &dyn Host, function: FunctionId) -> u32 {
        self.get_or_create_debug_info(host, function);
        if let Some(id) = self.expect_debug_info(function).debugging_id() {
            return id;
        }
        let id = self.next_debugging_id;
        self.next_debugging_id += 1;
        self.expect_debug_info_mut(function).set_debugging_id(id);
        id
    }
}
