//! The engine services the debugger depends on.
//!
//! The debugger owns no engine state. Compilation, tiering, stack walking, expression
//! evaluation and termination all belong to the engine and are reached through [`Host`].

use std::sync::Arc;

use super::{
    Debugger, FunctionId, NO_SOURCE_POSITION, ObjectRef, ScriptId, StackFrameId,
    debug_info::SideEffectState,
};
use crate::{
    CompileError, EvalError,
    vm::{BytecodeArray, DebugBytecodeArray, Register},
};

/// The kind of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// An ordinary function.
    Normal,
    /// A generator function.
    Generator,
    /// An async function.
    Async,
    /// A builtin implemented by the engine, without bytecode.
    Native,
    /// A function provided through the embedder API, without bytecode.
    Api,
}

/// Static facts about a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Debug name.
    pub name: String,
    /// Script the function belongs to. Natives have none.
    pub script: Option<ScriptId>,
    /// Kind of the function.
    pub kind: FunctionKind,
    /// Start of the function's source range.
    pub start_position: i32,
    /// End of the function's source range.
    pub end_position: i32,
    /// Position of the `function` token, [`NO_SOURCE_POSITION`] if there is none.
    pub function_token_position: i32,
    /// Whether this is a script's top-level function.
    pub is_toplevel: bool,
    /// Whether user code can see and step through the function.
    pub is_subject_to_debugging: bool,
    /// Whether the compiler may compile the function on first call.
    pub allows_lazy_compilation: bool,
}

impl FunctionInfo {
    /// Whether the function is a generator.
    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.kind == FunctionKind::Generator
    }

    /// Whether the function has no bytecode and is broken at entry instead.
    #[must_use]
    pub fn can_break_at_entry(&self) -> bool {
        matches!(self.kind, FunctionKind::Native | FunctionKind::Api)
    }

    /// Start of the source range, counting from the `function` token when there is one.
    #[must_use]
    pub const fn start_including_token(&self) -> i32 {
        if self.function_token_position == NO_SOURCE_POSITION {
            self.start_position
        } else {
            self.function_token_position
        }
    }
}

/// Execution tier of a physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTier {
    /// Interpreted, dispatching on the active bytecode.
    Interpreted,
    /// Baseline machine code. Must be redirected to the interpreter to honor breaks.
    Baseline,
    /// Optimized machine code, possibly with inlined callees.
    Optimized,
}

/// One logical function activation of a physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSummary {
    /// The running function.
    pub function: FunctionId,
    /// The closure object of the activation.
    pub closure: ObjectRef,
    /// The current code offset in the function's bytecode.
    pub code_offset: u32,
}

impl FrameSummary {
    /// Source position of the current instruction.
    #[must_use]
    pub fn source_position(&self, host: &dyn Host) -> i32 {
        host.original_bytecode(self.function)
            .map_or(NO_SOURCE_POSITION, |bytecode| {
                bytecode.source_positions().source_position_at(self.code_offset)
            })
    }

    /// Position of the statement containing the current instruction.
    #[must_use]
    pub fn statement_position(&self, host: &dyn Host) -> i32 {
        host.original_bytecode(self.function)
            .map_or(NO_SOURCE_POSITION, |bytecode| {
                bytecode.source_positions().statement_position_at(self.code_offset)
            })
    }

    /// Whether an exception handler of the function covers the current instruction.
    #[must_use]
    pub fn has_exception_handler(&self, host: &dyn Host) -> bool {
        host.original_bytecode(self.function).is_some_and(|bytecode| {
            bytecode
                .handler_table()
                .lookup_range(self.code_offset)
                .is_some()
        })
    }
}

/// A physical stack frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Stable id of the frame.
    pub id: StackFrameId,
    /// Execution tier.
    pub tier: FrameTier,
    /// Logical activations, outermost first. Optimized frames hold one summary per
    /// inlined function.
    pub summaries: Vec<FrameSummary>,
}

impl StackFrame {
    /// The innermost activation.
    ///
    /// # Panics
    ///
    /// Panics if the frame has no activations.
    #[must_use]
    pub fn top(&self) -> &FrameSummary {
        match self.summaries.last() {
            Some(summary) => summary,
            None => panic!("stack frame {:?} has no activations", self.id),
        }
    }

    /// The function whose code the physical frame runs.
    #[must_use]
    pub fn function(&self) -> FunctionId {
        self.summaries
            .first()
            .map_or_else(|| self.top().function, |summary| summary.function)
    }

    /// Number of logical activations.
    #[must_use]
    pub fn function_count(&self) -> usize {
        self.summaries.len()
    }
}

/// The scope an expression is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationTarget {
    /// The global scope.
    Global,
    /// The scope of a logical activation. `inlined_index` counts from the innermost
    /// activation of the frame.
    Local {
        /// The physical frame.
        frame: StackFrameId,
        /// Index of the activation, innermost first.
        inlined_index: usize,
    },
    /// The arguments of the innermost function, used by break-at-entry conditions.
    TopmostArguments,
}

/// A line/column pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct SourceLocation {
    /// Zero based line.
    pub line: u32,
    /// Zero based column.
    pub column: u32,
}

/// What the engine knows about a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct PromiseState {
    /// The rejection should not be reported.
    pub is_silent: bool,
    /// Some user code handles the rejection.
    pub has_user_defined_reject_handler: bool,
    /// The debugger already reported this promise.
    pub debug_marked: bool,
}

/// What the debugger needs from the engine.
///
/// Methods with a default implementation describe optional services; an engine without
/// baseline code, for instance, has nothing to redirect.
pub trait Host {
    /// Static facts about `function`.
    fn function_info(&self, function: FunctionId) -> FunctionInfo;

    /// Whether `function` has bytecode (or is native).
    fn is_compiled(&self, function: FunctionId) -> bool;

    /// Compiles `function`.
    ///
    /// # Errors
    ///
    /// Returns the compiler's diagnostic when compilation fails.
    fn compile(&mut self, function: FunctionId) -> Result<(), CompileError>;

    /// Compiles the top-level function of `script`.
    ///
    /// # Errors
    ///
    /// Returns the compiler's diagnostic when compilation fails.
    fn compile_toplevel(&mut self, script: ScriptId) -> Result<(), CompileError>;

    /// Whether the top-level function of `script` exists.
    fn has_toplevel_function(&self, script: ScriptId) -> bool;

    /// Every function of `script` the engine currently knows about.
    fn script_functions(&self, script: ScriptId) -> Vec<FunctionId>;

    /// The bytecode the compiler produced for `function`.
    fn original_bytecode(&self, function: FunctionId) -> Option<Arc<BytecodeArray>>;

    /// Installs or removes the instrumented bytecode the interpreter must run.
    fn set_debug_bytecode(&mut self, function: FunctionId, bytecode: Option<Arc<DebugBytecodeArray>>);

    /// Line and column of a source position.
    fn source_location(&self, script: ScriptId, position: i32) -> SourceLocation {
        let _ = script;
        SourceLocation {
            line: 0,
            column: u32::try_from(position).unwrap_or(0),
        }
    }

    /// Discards optimized code of `function` and of everything that inlined it. Frames
    /// already running it deoptimize when control returns to them.
    fn deoptimize_function(&mut self, function: FunctionId);

    /// Discards all optimized code.
    fn deoptimize_all(&mut self);

    /// Moves frames running baseline code of `function` to the interpreter, so they pick
    /// up instrumented bytecode.
    fn redirect_active_frames(&mut self, function: FunctionId) {
        let _ = function;
    }

    /// Routes calls of functions without bytecode through the break-at-entry trampoline.
    fn install_debug_break_trampoline(&mut self) {}

    /// The physical stack, innermost frame first.
    fn stack_frames(&self) -> Vec<StackFrame>;

    /// The object in `register` of `frame`, if it holds one.
    fn read_register(&self, frame: StackFrameId, register: Register) -> Option<ObjectRef>;

    /// The function of a generator object.
    fn generator_function(&self, generator: ObjectRef) -> Option<FunctionId>;

    /// Evaluates `source` in `target`.
    ///
    /// The debugger is passed back in so that the evaluated code can hit breakpoints and
    /// side-effect checks.
    ///
    /// # Errors
    ///
    /// Returns the evaluator's failure.
    fn evaluate(
        &mut self,
        debugger: &mut Debugger,
        target: EvaluationTarget,
        source: &str,
    ) -> Result<serde_json::Value, EvalError>;

    /// Asks the engine to unwind all running JavaScript.
    fn request_terminate_execution(&mut self);

    /// Withdraws a termination request.
    fn cancel_terminate_execution(&mut self);

    /// Enables or disables the compilation cache.
    fn set_compilation_cache_enabled(&mut self, enabled: bool) {
        let _ = enabled;
    }

    /// Ensures every function keeps its source position tables.
    fn collect_source_positions(&mut self) {}

    /// Whether a JavaScript handler on the stack will catch an exception thrown now.
    fn is_exception_caught(&self) -> bool;

    /// Promise bookkeeping for `object`, if it is a promise.
    fn promise_state(&self, object: ObjectRef) -> Option<PromiseState> {
        let _ = object;
        None
    }

    /// Records that `promise`'s rejection was reported.
    fn mark_promise(&mut self, promise: ObjectRef) {
        let _ = promise;
    }

    /// Side-effect classification of a function without bytecode.
    fn builtin_side_effect_state(&self, function: FunctionId) -> SideEffectState {
        let _ = function;
        SideEffectState::HasSideEffects
    }

    /// Whether the stack has overflowed.
    fn is_stack_overflowed(&self) -> bool {
        false
    }
}

/// Frames running functions user code can see, innermost first.
pub(crate) fn stack_trace_frames(host: &dyn Host) -> Vec<StackFrame> {
    host.stack_frames()
        .into_iter()
        .filter(|frame| host.function_info(frame.function()).is_subject_to_debugging)
        .collect()
}
