use std::ops::ControlFlow;

use log::trace;

use crate::{
    debugger::{Debugger, ExecutionMode, FunctionId, Host, IgnoreBreakMode, ObjectRef},
    vm::opcode::{Operation, Termination},
};

/// `DebuggerStatement` implements the Opcode Operation for `Opcode::Debugger`
///
/// Operation:
///  - Pauses in the debugger if breakpoints are active.
#[derive(Debug, Clone, Copy)]
pub struct DebuggerStatement;

impl DebuggerStatement {
    /// Runs a `debugger` statement.
    pub fn operation(debugger: &mut Debugger, host: &mut dyn Host) -> ControlFlow<Termination> {
        if debugger.break_points_active() {
            debugger.handle_debug_break(host, IgnoreBreakMode::IgnoreIfTopFrameBlackboxed);
        }
        ControlFlow::Continue(())
    }
}

impl Operation for DebuggerStatement {
    const NAME: &'static str = "Debugger";
    const INSTRUCTION: &'static str = "INST - Debugger";
    const COST: u8 = 1;
}

/// `DebugBreak` implements the Opcode Operation for `Opcode::DebugBreak`
///
/// Operation:
///  - Reports a planted break, or runs the side-effect check of the patched instruction.
///    The interpreter then dispatches the original instruction at the same offset.
#[derive(Debug, Clone, Copy)]
pub struct DebugBreak;

impl DebugBreak {
    /// Runs a planted break in `function`. `accumulator` is the value a return at this
    /// location would produce.
    pub fn operation(
        debugger: &mut Debugger,
        host: &mut dyn Host,
        function: FunctionId,
        accumulator: Option<ObjectRef>,
    ) -> ControlFlow<Termination> {
        let saved = debugger.return_value();
        debugger.set_return_value(accumulator);

        let flow = match debugger.execution_mode() {
            ExecutionMode::Breakpoints => {
                debugger.on_break(host, function);
                ControlFlow::Continue(())
            }
            ExecutionMode::SideEffects => {
                let passed = host
                    .stack_frames()
                    .first()
                    .is_none_or(|frame| debugger.perform_side_effect_check_at_bytecode(host, frame));
                if passed {
                    ControlFlow::Continue(())
                } else {
                    trace!("side-effect check failed in {function:?}");
                    ControlFlow::Break(Termination)
                }
            }
            ExecutionMode::Normal => ControlFlow::Continue(()),
        };

        debugger.set_return_value(saved);
        flow
    }

    /// Runs the entry trampoline of a function without bytecode.
    pub fn at_entry(
        debugger: &mut Debugger,
        host: &mut dyn Host,
        function: FunctionId,
    ) -> ControlFlow<Termination> {
        if debugger.needs_break_at_entry(function)
            && debugger.execution_mode() == ExecutionMode::Breakpoints
        {
            debugger.on_break(host, function);
        }
        ControlFlow::Continue(())
    }
}

impl Operation for DebugBreak {
    const NAME: &'static str = "DebugBreak";
    const INSTRUCTION: &'static str = "INST - DebugBreak";
    const COST: u8 = 2;
}
