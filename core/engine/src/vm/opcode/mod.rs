//! Opcodes of the instrumented bytecode format.
//!
//! Every instruction is a one byte opcode followed by its operands. Operands are one byte
//! wide unless the instruction is preceded by a [`Opcode::Wide`] (two bytes) or
//! [`Opcode::ExtraWide`] (four bytes) scaling prefix. A break planted on a prefixed
//! instruction replaces the prefix byte, so the break offset is always the offset of the
//! first byte of the instruction.

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod debugger;

pub use debugger::{DebugBreak, DebuggerStatement};

/// The kind of an operand, which decides how the interpreter reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// A register index.
    Reg,
    /// The number of consecutive registers in a register list.
    RegCount,
    /// A signed immediate.
    Imm,
    /// An unsigned immediate.
    UImm,
    /// An index into the constant pool or a code offset.
    Idx,
}

impl OperandType {
    /// Whether the operand is sign extended when read.
    #[must_use]
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::Imm)
    }
}

/// The width of every operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum OperandScale {
    /// One byte operands, no prefix.
    Single = 1,
    /// Two byte operands, [`Opcode::Wide`] prefix.
    Double = 2,
    /// Four byte operands, [`Opcode::ExtraWide`] prefix.
    Quadruple = 4,
}

impl OperandScale {
    /// Operand width in bytes.
    #[must_use]
    pub const fn width(self) -> usize {
        self as usize
    }

    /// The prefix that selects this scale, if any.
    #[must_use]
    pub const fn prefix(self) -> Option<Opcode> {
        match self {
            Self::Single => None,
            Self::Double => Some(Opcode::Wide),
            Self::Quadruple => Some(Opcode::ExtraWide),
        }
    }

    /// The scale selected by a prefix opcode.
    #[must_use]
    pub const fn from_prefix(opcode: Opcode) -> Option<Self> {
        match opcode {
            Opcode::Wide => Some(Self::Double),
            Opcode::ExtraWide => Some(Self::Quadruple),
            _ => None,
        }
    }

    /// The smallest scale able to hold `value` as an operand of type `kind`.
    #[must_use]
    pub fn for_operand(kind: OperandType, value: u32) -> Self {
        if kind.is_signed() {
            let value = value.cast_signed();
            if i8::try_from(value).is_ok() {
                Self::Single
            } else if i16::try_from(value).is_ok() {
                Self::Double
            } else {
                Self::Quadruple
            }
        } else if value <= u32::from(u8::MAX) {
            Self::Single
        } else if value <= u32::from(u16::MAX) {
            Self::Double
        } else {
            Self::Quadruple
        }
    }
}

/// How an instruction interacts with side-effect-free evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffectClass {
    /// The instruction never mutates state that outlives the evaluation.
    None,
    /// The instruction mutates the object held in its receiver operand, which is
    /// acceptable only if that object was allocated during the evaluation.
    RuntimeCheck,
    /// The instruction always has an observable side effect.
    SideEffect,
}

/// Signals that the interpreter must unwind because a debugger check requested termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination;

/// The common surface of opcode operations implemented by the debugger core.
pub trait Operation {
    /// Display name of the operation.
    const NAME: &'static str;
    /// Name used when dumping instructions.
    const INSTRUCTION: &'static str;
    /// Relative dispatch cost.
    const COST: u8;
}

macro_rules! define_opcodes {
    ($( $(#[$meta:meta])* $name:ident => [$($operand:ident),*] ),* $(,)?) => {
        /// The opcodes of the bytecode format.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
        #[repr(u8)]
        pub enum Opcode {
            $( $(#[$meta])* $name, )*
        }

        impl Opcode {
            /// The operand layout of the instruction, in order.
            #[must_use]
            pub const fn operand_types(self) -> &'static [OperandType] {
                match self {
                    $( Self::$name => &[$(OperandType::$operand),*], )*
                }
            }

            const fn raw_name(self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name), )*
                }
            }
        }
    };
}

define_opcodes! {
    /// Doubles the operand width of the next instruction.
    Wide => [],
    /// Quadruples the operand width of the next instruction.
    ExtraWide => [],
    /// Planted by the debugger over the first byte of an instruction.
    DebugBreak => [],
    /// Does nothing.
    Nop => [],
    /// `acc = 0`
    LdaZero => [],
    /// `acc = imm`
    LdaSmi => [Imm],
    /// `acc = undefined`
    LdaUndefined => [],
    /// `acc = true`
    LdaTrue => [],
    /// `acc = false`
    LdaFalse => [],
    /// `acc = reg`
    Ldar => [Reg],
    /// `reg = acc`
    Star => [Reg],
    /// `dst = src`
    Mov => [Reg, Reg],
    /// `acc = reg + acc`
    Add => [Reg],
    /// `acc = reg - acc`
    Sub => [Reg],
    /// `acc = reg == acc`
    TestEqual => [Reg],
    /// `acc = reg < acc`
    TestLessThan => [Reg],
    /// `acc = reg > acc`
    TestGreaterThan => [Reg],
    /// `acc = global[name]`
    LdaGlobal => [Idx],
    /// `global[name] = acc`
    StaGlobal => [Idx],
    /// `acc = obj[name]`
    LdaNamedProperty => [Reg, Idx],
    /// `obj[name] = acc`
    StaNamedProperty => [Reg, Idx],
    /// `obj[key] = acc`
    StaKeyedProperty => [Reg, Reg],
    /// `acc = context[slot]`
    LdaCurrentContextSlot => [Idx],
    /// `context[slot] = acc`
    StaCurrentContextSlot => [Idx],
    /// `acc = {}`
    CreateObject => [],
    /// `acc = closure(function)`
    CreateClosure => [Idx],
    /// `acc = callee(args...)`
    CallUndefinedReceiver => [Reg, Reg, RegCount],
    /// `acc = receiver.callee(args...)`, the receiver is the first register of the list.
    CallProperty => [Reg, Reg, RegCount],
    /// `acc = new constructor(args...)`
    Construct => [Reg, Reg, RegCount],
    /// `acc = runtime[id](args...)`
    CallRuntime => [Idx, Reg, RegCount],
    /// Jumps to an absolute code offset.
    Jump => [Idx],
    /// Jumps to an absolute code offset if the accumulator is falsy.
    JumpIfFalse => [Idx],
    /// Saves the register file into the generator and yields the accumulator.
    SuspendGenerator => [Reg, Reg, RegCount, UImm],
    /// Marks the point where a resumed generator continues.
    ResumeGenerator => [Reg, Reg, RegCount],
    /// Throws the accumulator.
    Throw => [],
    /// The `debugger` statement.
    Debugger => [],
    /// Returns the accumulator.
    Return => [],
}

impl Opcode {
    /// Decodes an opcode byte.
    ///
    /// # Panics
    ///
    /// Panics if `byte` is not an opcode. Bytecode is produced by the engine's compiler, so
    /// an unknown byte means the array is corrupted.
    #[must_use]
    pub fn decode(byte: u8) -> Self {
        Self::try_from(byte).unwrap_or_else(|err| panic!("corrupted bytecode: {err}"))
    }

    /// Display name of the opcode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debugger => <DebuggerStatement as Operation>::NAME,
            Self::DebugBreak => <DebugBreak as Operation>::NAME,
            _ => self.raw_name(),
        }
    }

    /// Whether this is an operand scaling prefix.
    #[must_use]
    pub const fn is_prefix_scaling(self) -> bool {
        matches!(self, Self::Wide | Self::ExtraWide)
    }

    /// Whether this instruction calls or constructs a function.
    #[must_use]
    pub const fn is_call_or_construct(self) -> bool {
        matches!(
            self,
            Self::CallUndefinedReceiver | Self::CallProperty | Self::Construct | Self::CallRuntime
        )
    }

    /// Whether this instruction leaves the function.
    #[must_use]
    pub const fn is_return(self) -> bool {
        matches!(self, Self::Return)
    }

    /// Whether this instruction may transfer control to another offset.
    #[must_use]
    pub const fn is_jump(self) -> bool {
        matches!(self, Self::Jump | Self::JumpIfFalse)
    }

    /// Side-effect classification used by side-effect-free evaluation.
    #[must_use]
    pub const fn side_effect_class(self) -> SideEffectClass {
        match self {
            Self::StaNamedProperty | Self::StaKeyedProperty | Self::StaCurrentContextSlot => {
                SideEffectClass::RuntimeCheck
            }
            Self::StaGlobal
            | Self::CallRuntime
            | Self::SuspendGenerator
            | Self::ResumeGenerator
            | Self::DebugBreak => SideEffectClass::SideEffect,
            _ => SideEffectClass::None,
        }
    }

    /// Size in bytes of the instruction's operands at `scale`.
    #[must_use]
    pub const fn operands_size(self, scale: OperandScale) -> usize {
        self.operand_types().len() * scale.width()
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
