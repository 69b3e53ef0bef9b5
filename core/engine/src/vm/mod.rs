//! The bytecode model the debugger instruments.
//!
//! The debugger never executes bytecode itself. It reads the engine's original
//! [`BytecodeArray`]s to discover break locations and classify side effects, and it patches
//! per-function [`DebugBytecodeArray`] copies that the engine's interpreter dispatches on.

pub mod bytecode;
pub mod opcode;

pub use bytecode::{
    BytecodeArray, BytecodeArrayIterator, BytecodeBuilder, CatchPrediction, Constant,
    DebugBytecodeArray, HandlerRange, HandlerTable, JumpLabel, Register, SourcePositionEntry,
    SourcePositionTable,
};
pub use opcode::{Opcode, OperandScale, OperandType, SideEffectClass, Termination};
