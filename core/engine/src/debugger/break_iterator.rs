//! Break locations and the iterator that enumerates them.

use serde::Serialize;

use super::{
    BREAK_AT_ENTRY_POSITION, DebugInfo, ObjectRef, StackFrameId,
    host::{FrameSummary, Host},
};
use crate::vm::{BytecodeArray, Opcode, Register, SourcePositionEntry};

/// Why an instruction is a break location.
///
/// Variants are ordered; every kind from [`DebugBreakType::Slot`] on can be patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugBreakType {
    /// Not a break location.
    NotDebugBreak,
    /// A `debugger` statement, which breaks by itself.
    DebuggerStatement,
    /// The entry of a function without bytecode.
    AtEntry,
    /// A statement.
    Slot,
    /// A call or construct.
    SlotAtCall,
    /// A return.
    SlotAtReturn,
    /// A generator suspend.
    SlotAtSuspend,
}

/// The kind of a break location as reported to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakLocationType {
    /// A call or construct.
    Call,
    /// A return.
    Return,
    /// A `debugger` statement.
    DebuggerStatement,
    /// Any other location.
    Common,
}

/// A place where execution can be paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakLocation {
    code_offset: u32,
    position: i32,
    kind: DebugBreakType,
    generator_register: Option<Register>,
    suspend_id: Option<u32>,
}

impl BreakLocation {
    /// The single break location of a function that breaks at entry.
    #[must_use]
    pub const fn at_entry() -> Self {
        Self {
            code_offset: 0,
            position: BREAK_AT_ENTRY_POSITION,
            kind: DebugBreakType::AtEntry,
            generator_register: None,
            suspend_id: None,
        }
    }

    /// The break location closest at or before the frame's current code offset.
    #[must_use]
    pub fn from_frame(debug_info: &DebugInfo, summary: &FrameSummary) -> Self {
        if debug_info.can_break_at_entry() {
            return Self::at_entry();
        }
        let index = BreakIterator::break_index_from_code_offset(debug_info, summary.code_offset);
        let mut it = BreakIterator::new(debug_info);
        it.skip_to(index);
        it.break_location()
    }

    /// Every break location sharing the statement of the frame's current location.
    #[must_use]
    pub fn all_at_current_statement(debug_info: &DebugInfo, summary: &FrameSummary) -> Vec<Self> {
        debug_assert!(!debug_info.can_break_at_entry());
        let index = BreakIterator::break_index_from_code_offset(debug_info, summary.code_offset);
        let statement_position = {
            let mut it = BreakIterator::new(debug_info);
            it.skip_to(index);
            it.statement_position()
        };
        let mut locations = Vec::new();
        let mut it = BreakIterator::new(debug_info);
        while !it.done() {
            if it.statement_position() == statement_position {
                locations.push(it.break_location());
            }
            it.next();
        }
        locations
    }

    /// The generator object of a frame paused at this suspend location.
    #[must_use]
    pub fn generator_object_for_suspended_frame(
        &self,
        host: &dyn Host,
        frame: StackFrameId,
    ) -> Option<ObjectRef> {
        debug_assert!(self.is_suspend());
        host.read_register(frame, self.generator_register?)
    }

    /// Whether a user breakpoint is set here.
    ///
    /// Several locations may share a source position; only the one a breakpoint at that
    /// position resolves to carries the breakpoint.
    #[must_use]
    pub fn has_break_point(&self, debug_info: &DebugInfo) -> bool {
        if !debug_info.has_break_point(self.position) {
            return false;
        }
        if debug_info.can_break_at_entry() {
            debug_assert_eq!(self.position, BREAK_AT_ENTRY_POSITION);
            return debug_info.break_at_entry();
        }
        let mut it = BreakIterator::new(debug_info);
        it.skip_to_position(self.position);
        it.code_offset() == self.code_offset
    }

    /// Code offset of the location.
    #[must_use]
    pub const fn code_offset(&self) -> u32 {
        self.code_offset
    }

    /// Source position of the location.
    #[must_use]
    pub const fn position(&self) -> i32 {
        self.position
    }

    /// Why this is a break location.
    #[must_use]
    pub const fn break_type(&self) -> DebugBreakType {
        self.kind
    }

    /// Suspend id of a suspend location.
    #[must_use]
    pub const fn suspend_id(&self) -> Option<u32> {
        self.suspend_id
    }

    /// Whether this is a return.
    #[must_use]
    pub fn is_return(&self) -> bool {
        self.kind == DebugBreakType::SlotAtReturn
    }

    /// Whether this is a generator suspend.
    #[must_use]
    pub fn is_suspend(&self) -> bool {
        self.kind == DebugBreakType::SlotAtSuspend
    }

    /// Whether this is a return or a generator suspend.
    #[must_use]
    pub fn is_return_or_suspend(&self) -> bool {
        self.is_return() || self.is_suspend()
    }

    /// Whether this is a call.
    #[must_use]
    pub fn is_call(&self) -> bool {
        self.kind == DebugBreakType::SlotAtCall
    }

    /// Whether this is a `debugger` statement.
    #[must_use]
    pub fn is_debugger_statement(&self) -> bool {
        self.kind == DebugBreakType::DebuggerStatement
    }

    /// Whether this is the entry of a function without bytecode.
    #[must_use]
    pub fn is_debug_break_at_entry(&self) -> bool {
        self.kind == DebugBreakType::AtEntry
    }

    /// The kind reported to the controller.
    #[must_use]
    pub const fn location_type(&self) -> BreakLocationType {
        match self.kind {
            DebugBreakType::SlotAtCall => BreakLocationType::Call,
            DebugBreakType::SlotAtReturn => BreakLocationType::Return,
            DebugBreakType::DebuggerStatement => BreakLocationType::DebuggerStatement,
            _ => BreakLocationType::Common,
        }
    }
}

/// Enumerates the break locations of a function in code offset order.
///
/// The iterator is positioned on the first break location when created. Advancing a
/// finished iterator is a bug.
#[derive(Debug)]
pub struct BreakIterator<'a> {
    debug_info: &'a DebugInfo,
    bytecode: &'a BytecodeArray,
    break_index: Option<usize>,
    entry_index: usize,
    position: i32,
    statement_position: i32,
}

impl<'a> BreakIterator<'a> {
    /// Creates an iterator over the break locations of `debug_info`'s function.
    #[must_use]
    pub fn new(debug_info: &'a DebugInfo) -> Self {
        let start = debug_info.start_position();
        let mut it = Self {
            debug_info,
            bytecode: debug_info.original_bytecode(),
            break_index: None,
            entry_index: 0,
            position: start,
            statement_position: start,
        };
        if !it.done() {
            it.next();
        }
        it
    }

    /// Whether every break location has been visited.
    #[must_use]
    pub fn done(&self) -> bool {
        self.entry_index >= self.bytecode.source_positions().len()
    }

    fn entry(&self) -> SourcePositionEntry {
        self.bytecode.source_positions().entries()[self.entry_index]
    }

    /// Advances to the next break location.
    pub fn next(&mut self) {
        assert!(!self.done(), "advanced a finished break iterator");
        let mut first = self.break_index.is_none();
        while !self.done() {
            if !first {
                self.entry_index += 1;
            }
            first = false;
            if self.done() {
                return;
            }
            let entry = self.entry();
            self.position = entry.source_position;
            if entry.is_statement {
                self.statement_position = self.position;
            }
            if self.debug_break_type() != DebugBreakType::NotDebugBreak {
                break;
            }
        }
        self.break_index = Some(self.break_index.map_or(0, |index| index + 1));
    }

    /// Index of the current break location.
    #[must_use]
    pub fn break_index(&self) -> usize {
        self.break_index.unwrap_or(0)
    }

    /// Source position of the current location.
    #[must_use]
    pub const fn position(&self) -> i32 {
        self.position
    }

    /// Position of the statement containing the current location.
    #[must_use]
    pub const fn statement_position(&self) -> i32 {
        self.statement_position
    }

    /// Code offset of the current location.
    #[must_use]
    pub fn code_offset(&self) -> u32 {
        self.entry().code_offset
    }

    /// Classifies the instruction at the current entry.
    #[must_use]
    pub fn debug_break_type(&self) -> DebugBreakType {
        let entry = self.entry();
        let mut opcode = Opcode::decode(self.bytecode.bytes()[entry.code_offset as usize]);
        if opcode.is_prefix_scaling() {
            opcode = Opcode::decode(self.bytecode.bytes()[entry.code_offset as usize + 1]);
        }
        match opcode {
            Opcode::Debugger => DebugBreakType::DebuggerStatement,
            Opcode::Return => DebugBreakType::SlotAtReturn,
            Opcode::SuspendGenerator => DebugBreakType::SlotAtSuspend,
            opcode if opcode.is_call_or_construct() => DebugBreakType::SlotAtCall,
            _ if entry.is_statement => DebugBreakType::Slot,
            _ => DebugBreakType::NotDebugBreak,
        }
    }

    /// Advances until the current location is the one with `index`.
    pub fn skip_to(&mut self, index: usize) {
        while self.break_index() < index {
            self.next();
        }
    }

    /// Moves to the break location a breakpoint at `source_position` resolves to.
    pub fn skip_to_position(&mut self, source_position: i32) {
        let index = BreakIterator::new(self.debug_info).break_index_from_position(source_position);
        self.skip_to(index);
    }

    /// Index of the location with the smallest position at or after `source_position`,
    /// ties going to the earliest in code order. Without such a location, the index of the
    /// last location.
    fn break_index_from_position(mut self, source_position: i32) -> usize {
        let mut closest: Option<(i32, usize)> = None;
        let mut last = 0;
        while !self.done() {
            let index = self.break_index();
            last = index;
            if self.position >= source_position
                && closest.is_none_or(|(position, _)| self.position < position)
            {
                closest = Some((self.position, index));
                if self.position == source_position {
                    break;
                }
            }
            self.next();
        }
        closest.map_or(last, |(_, index)| index)
    }

    /// Index of the closest location at or before `code_offset`.
    #[must_use]
    pub fn break_index_from_code_offset(debug_info: &DebugInfo, code_offset: u32) -> usize {
        let mut closest = 0;
        let mut distance = u32::MAX;
        let mut it = BreakIterator::new(debug_info);
        while !it.done() {
            let offset = it.code_offset();
            if offset <= code_offset && code_offset - offset < distance {
                closest = it.break_index();
                distance = code_offset - offset;
                if distance == 0 {
                    break;
                }
            }
            it.next();
        }
        closest
    }

    /// Plants a break at the current location. `debugger` statements already break.
    pub fn set_debug_break(&self) {
        let kind = self.debug_break_type();
        if kind == DebugBreakType::DebuggerStatement {
            return;
        }
        debug_assert!(kind >= DebugBreakType::Slot);
        self.debug_info
            .debug_bytecode()
            .patch(self.code_offset(), Opcode::DebugBreak.into());
    }

    /// Restores the original instruction byte at the current location.
    pub fn clear_debug_break(&self) {
        let kind = self.debug_break_type();
        if kind == DebugBreakType::DebuggerStatement {
            return;
        }
        debug_assert!(kind >= DebugBreakType::Slot);
        let offset = self.code_offset();
        self.debug_info
            .debug_bytecode()
            .patch(offset, self.bytecode.bytes()[offset as usize]);
    }

    /// Whether a break is planted at the current location.
    #[must_use]
    pub fn is_debug_break(&self) -> bool {
        self.debug_info.debug_bytecode().is_break_at(self.code_offset())
    }

    /// The current location.
    #[must_use]
    pub fn break_location(&self) -> BreakLocation {
        let kind = self.debug_break_type();
        let code_offset = self.code_offset();
        let (generator_register, suspend_id) = if kind == DebugBreakType::SlotAtSuspend {
            let it = self.bytecode.iter_at(code_offset);
            debug_assert_eq!(it.current_opcode(), Opcode::SuspendGenerator);
            (Some(it.register_operand(0)), Some(it.unsigned_operand(3)))
        } else {
            (None, None)
        };
        BreakLocation {
            code_offset,
            position: self.position,
            kind,
            generator_register,
            suspend_id,
        }
    }
}
