//! Bytecode arrays, their side tables and the instrumented debug copies.

use std::sync::{PoisonError, RwLock};

use super::opcode::{Opcode, OperandScale, OperandType};
use crate::debugger::{FunctionId, NO_SOURCE_POSITION};

/// A register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(pub u32);

impl Register {
    /// Pseudo register naming the current function context.
    pub const CURRENT_CONTEXT: Self = Self(u32::MAX);

    /// The register index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One entry of a [`SourcePositionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePositionEntry {
    /// Offset of the first byte of the instruction.
    pub code_offset: u32,
    /// Source position (character offset into the script).
    pub source_position: i32,
    /// Whether the position starts a statement.
    pub is_statement: bool,
}

/// Maps code offsets to source positions, ordered by code offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePositionTable {
    entries: Vec<SourcePositionEntry>,
}

impl SourcePositionTable {
    /// Creates a table from entries ordered by code offset.
    #[must_use]
    pub fn new(entries: Vec<SourcePositionEntry>) -> Self {
        debug_assert!(
            entries.windows(2).all(|w| w[0].code_offset <= w[1].code_offset),
            "source positions must be ordered by code offset"
        );
        Self { entries }
    }

    /// All entries in code offset order.
    #[must_use]
    pub fn entries(&self) -> &[SourcePositionEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&SourcePositionEntry> {
        self.entries.get(index)
    }

    fn covering(&self, code_offset: u32) -> &[SourcePositionEntry] {
        let end = self.entries.partition_point(|e| e.code_offset <= code_offset);
        &self.entries[..end]
    }

    /// The source position of the instruction at `code_offset`.
    #[must_use]
    pub fn source_position_at(&self, code_offset: u32) -> i32 {
        self.covering(code_offset)
            .last()
            .map_or(NO_SOURCE_POSITION, |e| e.source_position)
    }

    /// The position of the statement containing the instruction at `code_offset`.
    #[must_use]
    pub fn statement_position_at(&self, code_offset: u32) -> i32 {
        self.covering(code_offset)
            .iter()
            .rev()
            .find(|e| e.is_statement)
            .map_or(NO_SOURCE_POSITION, |e| e.source_position)
    }
}

/// How the thrower's frame predicts an exception will be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchPrediction {
    /// A JavaScript `catch` block handles it.
    Caught,
    /// The handler rejects a promise.
    Promise,
}

/// A `try` range of a [`HandlerTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRange {
    /// First covered code offset.
    pub start: u32,
    /// One past the last covered code offset.
    pub end: u32,
    /// Code offset of the handler.
    pub handler: u32,
    /// Prediction for exceptions caught here.
    pub prediction: CatchPrediction,
}

impl HandlerRange {
    /// Whether `code_offset` lies in the range.
    #[must_use]
    pub const fn contains(&self, code_offset: u32) -> bool {
        self.start <= code_offset && code_offset < self.end
    }
}

/// Exception handler ranges of a function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerTable {
    ranges: Vec<HandlerRange>,
}

impl HandlerTable {
    /// Creates a table from its ranges.
    #[must_use]
    pub fn new(ranges: Vec<HandlerRange>) -> Self {
        Self { ranges }
    }

    /// The innermost range covering `code_offset`.
    #[must_use]
    pub fn lookup_range(&self, code_offset: u32) -> Option<&HandlerRange> {
        self.ranges
            .iter()
            .filter(|range| range.contains(code_offset))
            .min_by_key(|range| range.end - range.start)
    }

    /// Whether the table has no ranges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// A constant pool entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    /// A property or global name.
    String(Box<str>),
    /// A function literal.
    Function(FunctionId),
}

/// The compiled bytecode of one function, as produced by the engine's compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytecodeArray {
    bytes: Box<[u8]>,
    constants: Box<[Constant]>,
    parameter_count: u32,
    register_count: u32,
    source_positions: SourcePositionTable,
    handlers: HandlerTable,
}

impl BytecodeArray {
    /// The raw instruction stream.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the instruction stream in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the instruction stream is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of declared parameters.
    #[must_use]
    pub const fn parameter_count(&self) -> u32 {
        self.parameter_count
    }

    /// Size of the register file.
    #[must_use]
    pub const fn register_count(&self) -> u32 {
        self.register_count
    }

    /// The constant at `index`.
    #[must_use]
    pub fn constant(&self, index: u32) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    /// The string constant at `index`.
    #[must_use]
    pub fn name_constant(&self, index: u32) -> Option<&str> {
        match self.constant(index)? {
            Constant::String(name) => Some(name),
            Constant::Function(_) => None,
        }
    }

    /// The source position table.
    #[must_use]
    pub const fn source_positions(&self) -> &SourcePositionTable {
        &self.source_positions
    }

    /// The exception handler table.
    #[must_use]
    pub const fn handler_table(&self) -> &HandlerTable {
        &self.handlers
    }

    /// An iterator positioned on the first instruction.
    #[must_use]
    pub fn iter(&self) -> BytecodeArrayIterator<'_> {
        BytecodeArrayIterator::new(&self.bytes)
    }

    /// An iterator positioned on the instruction at `code_offset`.
    #[must_use]
    pub fn iter_at(&self, code_offset: u32) -> BytecodeArrayIterator<'_> {
        BytecodeArrayIterator::at(&self.bytes, code_offset)
    }
}

/// The patchable copy of a function's bytecode that the interpreter runs while the
/// function is instrumented.
///
/// The copy is shared between the debugger, which plants and removes breaks, and the
/// interpreter, which dispatches on it.
#[derive(Debug)]
pub struct DebugBytecodeArray {
    bytes: RwLock<Box<[u8]>>,
}

impl DebugBytecodeArray {
    /// Copies the instruction stream of `original`.
    #[must_use]
    pub fn from_original(original: &BytecodeArray) -> Self {
        Self {
            bytes: RwLock::new(original.bytes.clone()),
        }
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the copy is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The byte at `code_offset`.
    #[must_use]
    pub fn byte_at(&self, code_offset: u32) -> u8 {
        self.bytes.read().unwrap_or_else(PoisonError::into_inner)[code_offset as usize]
    }

    /// Whether a break is planted at `code_offset`.
    #[must_use]
    pub fn is_break_at(&self, code_offset: u32) -> bool {
        self.byte_at(code_offset) == u8::from(Opcode::DebugBreak)
    }

    /// A copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .to_vec()
    }

    pub(crate) fn patch(&self, code_offset: u32, byte: u8) {
        self.bytes.write().unwrap_or_else(PoisonError::into_inner)[code_offset as usize] = byte;
    }
}

/// Walks the instructions of a bytecode array.
#[derive(Debug, Clone)]
pub struct BytecodeArrayIterator<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> BytecodeArrayIterator<'a> {
    /// Creates an iterator positioned on the first instruction of `bytes`.
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Creates an iterator positioned on the instruction starting at `code_offset`.
    #[must_use]
    pub const fn at(bytes: &'a [u8], code_offset: u32) -> Self {
        Self {
            bytes,
            offset: code_offset as usize,
        }
    }

    /// Whether every instruction has been visited.
    #[must_use]
    pub const fn done(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    /// Offset of the first byte of the current instruction, prefix included.
    #[must_use]
    pub fn current_offset(&self) -> u32 {
        to_offset(self.offset)
    }

    /// Operand scale of the current instruction.
    #[must_use]
    pub fn current_scale(&self) -> OperandScale {
        OperandScale::from_prefix(Opcode::decode(self.bytes[self.offset]))
            .unwrap_or(OperandScale::Single)
    }

    fn prefix_size(&self) -> usize {
        usize::from(self.current_scale() != OperandScale::Single)
    }

    /// Opcode of the current instruction, skipping any scaling prefix.
    #[must_use]
    pub fn current_opcode(&self) -> Opcode {
        Opcode::decode(self.bytes[self.offset + self.prefix_size()])
    }

    /// Total size of the current instruction, prefix included.
    #[must_use]
    pub fn current_size(&self) -> usize {
        self.prefix_size() + 1 + self.current_opcode().operands_size(self.current_scale())
    }

    /// Offset of the instruction following the current one.
    #[must_use]
    pub fn next_offset(&self) -> u32 {
        to_offset(self.offset + self.current_size())
    }

    /// Raw value of operand `index`. Signed operands are sign extended.
    #[must_use]
    pub fn operand(&self, index: usize) -> u32 {
        let opcode = self.current_opcode();
        let scale = self.current_scale();
        let kind = opcode.operand_types()[index];
        let start = self.offset + self.prefix_size() + 1 + index * scale.width();
        let b = &self.bytes[start..start + scale.width()];
        match (scale, kind.is_signed()) {
            (OperandScale::Single, false) => u32::from(b[0]),
            (OperandScale::Single, true) => i32::from(b[0].cast_signed()).cast_unsigned(),
            (OperandScale::Double, false) => u32::from(u16::from_le_bytes([b[0], b[1]])),
            (OperandScale::Double, true) => {
                i32::from(i16::from_le_bytes([b[0], b[1]])).cast_unsigned()
            }
            (OperandScale::Quadruple, _) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        }
    }

    /// Operand `index` read as a register.
    #[must_use]
    pub fn register_operand(&self, index: usize) -> Register {
        debug_assert_eq!(
            self.current_opcode().operand_types()[index],
            OperandType::Reg
        );
        Register(self.operand(index))
    }

    /// Operand `index` read as a signed immediate.
    #[must_use]
    pub fn immediate_operand(&self, index: usize) -> i32 {
        self.operand(index).cast_signed()
    }

    /// Operand `index` read as an unsigned value.
    #[must_use]
    pub fn unsigned_operand(&self, index: usize) -> u32 {
        self.operand(index)
    }

    /// Moves to the next instruction.
    pub fn advance(&mut self) {
        self.offset += self.current_size();
    }
}

fn to_offset(offset: usize) -> u32 {
    u32::try_from(offset).unwrap_or_else(|_| panic!("code offset {offset} out of range"))
}

/// A forward jump waiting for its target.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel {
    operand_offset: usize,
}

/// Assembles a [`BytecodeArray`] together with its side tables.
///
/// Source positions are attached to the next emitted instruction:
///
/// ```
/// use tripwire_engine::vm::{BytecodeBuilder, Register};
///
/// let mut builder = BytecodeBuilder::new(0, 1);
/// builder.statement(10).lda_smi(1).star(Register(0));
/// builder.statement(20).ldar(Register(0)).ret();
/// let bytecode = builder.build();
/// assert_eq!(bytecode.source_positions().len(), 2);
/// ```
#[derive(Debug, Default)]
pub struct BytecodeBuilder {
    bytes: Vec<u8>,
    constants: Vec<Constant>,
    positions: Vec<SourcePositionEntry>,
    handlers: Vec<HandlerRange>,
    pending_position: Option<(i32, bool)>,
    parameter_count: u32,
    register_count: u32,
}

impl BytecodeBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new(parameter_count: u32, register_count: u32) -> Self {
        Self {
            parameter_count,
            register_count,
            ..Self::default()
        }
    }

    /// Offset the next instruction will be emitted at.
    #[must_use]
    pub fn current_offset(&self) -> u32 {
        to_offset(self.bytes.len())
    }

    /// Attaches a statement position to the next instruction.
    pub fn statement(&mut self, position: i32) -> &mut Self {
        self.pending_position = Some((position, true));
        self
    }

    /// Attaches an expression position to the next instruction, unless a statement
    /// position is already pending.
    pub fn expression(&mut self, position: i32) -> &mut Self {
        if !matches!(self.pending_position, Some((_, true))) {
            self.pending_position = Some((position, false));
        }
        self
    }

    /// Interns a name in the constant pool.
    pub fn name(&mut self, name: &str) -> u32 {
        let index = self
            .constants
            .iter()
            .position(|c| matches!(c, Constant::String(s) if &**s == name))
            .unwrap_or_else(|| {
                self.constants.push(Constant::String(name.into()));
                self.constants.len() - 1
            });
        to_offset(index)
    }

    fn function_constant(&mut self, function: FunctionId) -> u32 {
        self.constants.push(Constant::Function(function));
        to_offset(self.constants.len() - 1)
    }

    /// Emits `opcode` with the narrowest operand scale that fits every operand.
    pub fn emit(&mut self, opcode: Opcode, operands: &[u32]) -> &mut Self {
        let types = opcode.operand_types();
        assert_eq!(operands.len(), types.len(), "wrong operand count for {opcode}");
        let scale = types
            .iter()
            .zip(operands)
            .map(|(kind, value)| OperandScale::for_operand(*kind, *value))
            .max()
            .unwrap_or(OperandScale::Single);
        self.emit_scaled(opcode, operands, scale);
        self
    }

    fn emit_scaled(&mut self, opcode: Opcode, operands: &[u32], scale: OperandScale) -> usize {
        if let Some((source_position, is_statement)) = self.pending_position.take() {
            self.positions.push(SourcePositionEntry {
                code_offset: self.current_offset(),
                source_position,
                is_statement,
            });
        }
        if let Some(prefix) = scale.prefix() {
            self.bytes.push(prefix.into());
        }
        self.bytes.push(opcode.into());
        let operands_start = self.bytes.len();
        for value in operands {
            self.bytes
                .extend_from_slice(&value.to_le_bytes()[..scale.width()]);
        }
        operands_start
    }

    /// `acc = 0`
    pub fn lda_zero(&mut self) -> &mut Self {
        self.emit(Opcode::LdaZero, &[])
    }

    /// `acc = value`
    pub fn lda_smi(&mut self, value: i32) -> &mut Self {
        self.emit(Opcode::LdaSmi, &[value.cast_unsigned()])
    }

    /// `acc = undefined`
    pub fn lda_undefined(&mut self) -> &mut Self {
        self.emit(Opcode::LdaUndefined, &[])
    }

    /// `acc = true`
    pub fn lda_true(&mut self) -> &mut Self {
        self.emit(Opcode::LdaTrue, &[])
    }

    /// `acc = false`
    pub fn lda_false(&mut self) -> &mut Self {
        self.emit(Opcode::LdaFalse, &[])
    }

    /// `acc = reg`
    pub fn ldar(&mut self, reg: Register) -> &mut Self {
        self.emit(Opcode::Ldar, &[reg.0])
    }

    /// `reg = acc`
    pub fn star(&mut self, reg: Register) -> &mut Self {
        self.emit(Opcode::Star, &[reg.0])
    }

    /// `dst = src`
    pub fn mov(&mut self, src: Register, dst: Register) -> &mut Self {
        self.emit(Opcode::Mov, &[src.0, dst.0])
    }

    /// `acc = reg + acc`
    pub fn add(&mut self, reg: Register) -> &mut Self {
        self.emit(Opcode::Add, &[reg.0])
    }

    /// `acc = reg - acc`
    pub fn sub(&mut self, reg: Register) -> &mut Self {
        self.emit(Opcode::Sub, &[reg.0])
    }

    /// `acc = reg == acc`
    pub fn test_equal(&mut self, reg: Register) -> &mut Self {
        self.emit(Opcode::TestEqual, &[reg.0])
    }

    /// `acc = reg < acc`
    pub fn test_less_than(&mut self, reg: Register) -> &mut Self {
        self.emit(Opcode::TestLessThan, &[reg.0])
    }

    /// `acc = reg > acc`
    pub fn test_greater_than(&mut self, reg: Register) -> &mut Self {
        self.emit(Opcode::TestGreaterThan, &[reg.0])
    }

    /// `acc = global[name]`
    pub fn lda_global(&mut self, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit(Opcode::LdaGlobal, &[index])
    }

    /// `global[name] = acc`
    pub fn sta_global(&mut self, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit(Opcode::StaGlobal, &[index])
    }

    /// `acc = object[name]`
    pub fn lda_named_property(&mut self, object: Register, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit(Opcode::LdaNamedProperty, &[object.0, index])
    }

    /// `object[name] = acc`
    pub fn sta_named_property(&mut self, object: Register, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit(Opcode::StaNamedProperty, &[object.0, index])
    }

    /// `object[key] = acc`
    pub fn sta_keyed_property(&mut self, object: Register, key: Register) -> &mut Self {
        self.emit(Opcode::StaKeyedProperty, &[object.0, key.0])
    }

    /// `acc = context[slot]`
    pub fn lda_context_slot(&mut self, slot: u32) -> &mut Self {
        self.emit(Opcode::LdaCurrentContextSlot, &[slot])
    }

    /// `context[slot] = acc`
    pub fn sta_context_slot(&mut self, slot: u32) -> &mut Self {
        self.emit(Opcode::StaCurrentContextSlot, &[slot])
    }

    /// `acc = {}`
    pub fn create_object(&mut self) -> &mut Self {
        self.emit(Opcode::CreateObject, &[])
    }

    /// `acc = closure(function)`
    pub fn create_closure(&mut self, function: FunctionId) -> &mut Self {
        let index = self.function_constant(function);
        self.emit(Opcode::CreateClosure, &[index])
    }

    /// `acc = callee(first..first + count)`
    pub fn call(&mut self, callee: Register, first: Register, count: u32) -> &mut Self {
        self.emit(Opcode::CallUndefinedReceiver, &[callee.0, first.0, count])
    }

    /// `acc = first.callee(first + 1..first + count)`
    pub fn call_property(&mut self, callee: Register, first: Register, count: u32) -> &mut Self {
        self.emit(Opcode::CallProperty, &[callee.0, first.0, count])
    }

    /// `acc = new constructor(first..first + count)`
    pub fn construct(&mut self, constructor: Register, first: Register, count: u32) -> &mut Self {
        self.emit(Opcode::Construct, &[constructor.0, first.0, count])
    }

    /// `acc = runtime[id](first..first + count)`
    pub fn call_runtime(&mut self, id: u32, first: Register, count: u32) -> &mut Self {
        self.emit(Opcode::CallRuntime, &[id, first.0, count])
    }

    /// Suspends the generator held in `generator`, yielding the accumulator.
    pub fn suspend_generator(
        &mut self,
        generator: Register,
        first: Register,
        count: u32,
        suspend_id: u32,
    ) -> &mut Self {
        self.emit(
            Opcode::SuspendGenerator,
            &[generator.0, first.0, count, suspend_id],
        )
    }

    /// Marks the resume point of the generator held in `generator`.
    pub fn resume_generator(&mut self, generator: Register, first: Register, count: u32) -> &mut Self {
        self.emit(Opcode::ResumeGenerator, &[generator.0, first.0, count])
    }

    /// `throw acc`
    pub fn throw(&mut self) -> &mut Self {
        self.emit(Opcode::Throw, &[])
    }

    /// `debugger;`
    pub fn debugger(&mut self) -> &mut Self {
        self.emit(Opcode::Debugger, &[])
    }

    /// `return acc`
    pub fn ret(&mut self) -> &mut Self {
        self.emit(Opcode::Return, &[])
    }

    /// Does nothing.
    pub fn nop(&mut self) -> &mut Self {
        self.emit(Opcode::Nop, &[])
    }

    /// Jumps to an already emitted offset.
    pub fn jump_to(&mut self, target: u32) -> &mut Self {
        self.emit_scaled(Opcode::Jump, &[target], OperandScale::Double);
        self
    }

    /// Emits a forward jump, resolved by [`BytecodeBuilder::bind`].
    pub fn jump(&mut self) -> JumpLabel {
        let operand_offset = self.emit_scaled(Opcode::Jump, &[0], OperandScale::Double);
        JumpLabel { operand_offset }
    }

    /// Emits a forward jump taken when the accumulator is falsy.
    pub fn jump_if_false(&mut self) -> JumpLabel {
        let operand_offset = self.emit_scaled(Opcode::JumpIfFalse, &[0], OperandScale::Double);
        JumpLabel { operand_offset }
    }

    /// Resolves `label` to the current offset.
    pub fn bind(&mut self, label: JumpLabel) -> &mut Self {
        let target = u16::try_from(self.bytes.len())
            .unwrap_or_else(|_| panic!("jump target {} out of range", self.bytes.len()));
        self.bytes[label.operand_offset..label.operand_offset + 2]
            .copy_from_slice(&target.to_le_bytes());
        self
    }

    /// Registers a `try` range.
    pub fn add_handler(
        &mut self,
        start: u32,
        end: u32,
        handler: u32,
        prediction: CatchPrediction,
    ) -> &mut Self {
        self.handlers.push(HandlerRange {
            start,
            end,
            handler,
            prediction,
        });
        self
    }

    /// Finishes the array.
    #[must_use]
    pub fn build(self) -> BytecodeArray {
        BytecodeArray {
            bytes: self.bytes.into_boxed_slice(),
            constants: self.constants.into_boxed_slice(),
            parameter_count: self.parameter_count,
            register_count: self.register_count,
            source_positions: SourcePositionTable::new(self.positions),
            handlers: HandlerTable::new(self.handlers),
        }
    }
}
