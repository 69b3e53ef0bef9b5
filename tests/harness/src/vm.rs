//! A small register interpreter that drives the debugger the way a production engine does.
//!
//! The interpreter runs the original bytecode of every function, but an interpreted frame
//! whose function has instrumented bytecode checks that copy first: a planted
//! [`Opcode::DebugBreak`] is reported through [`DebugBreak::operation`] before the original
//! instruction executes. Baseline and optimized frames never look at the copy, so they miss
//! breaks until the debugger redirects or deoptimizes them.

use std::sync::Arc;

use log::{debug, trace};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tripwire_engine::{
    CompileError, Debugger, EvalError, FunctionId, Host, ObjectRef, ScriptId, StackFrameId,
    debugger::{
        EvaluationTarget, FrameSummary, FrameTier, FunctionInfo, PromiseState, Root,
        RootVisitor, SideEffectState, SourceLocation, StackFrame,
    },
    vm::{
        BytecodeArray, CatchPrediction, Constant, DebugBytecodeArray, Opcode, Register,
        opcode::{DebugBreak, DebuggerStatement},
    },
};

use crate::{
    eval,
    program::{Body, Program},
    value::{GeneratorState, Heap, HeapObject, Value},
};

/// A function implemented in Rust. Gets the receiver and the arguments; an `Err` is thrown.
pub type NativeFn = fn(&mut Vm, &mut Debugger, Value, &[Value]) -> Result<Value, Value>;

/// Runtime function appending its arguments to [`Vm::output`].
pub const RUNTIME_LOG: u32 = 0;

/// Runtime function rejecting the promise in its first argument with the second.
pub const RUNTIME_REJECT_PROMISE: u32 = 1;

const DEFAULT_STACK_LIMIT: usize = 256;

/// How a run ended abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Completion {
    /// An exception escaped.
    #[error("uncaught exception {0:?}")]
    Throw(Value),
    /// Execution was terminated.
    #[error("execution terminated")]
    Terminated,
    /// The instruction budget ran out. [`Vm::resume`] continues the run.
    #[error("execution preempted")]
    Preempted,
}

#[derive(Debug, Clone)]
pub(crate) struct Activation {
    pub(crate) function: FunctionId,
    pub(crate) closure: ObjectRef,
    pub(crate) registers: Vec<Value>,
    pub(crate) accumulator: Value,
    pub(crate) pc: u32,
    pub(crate) context: Option<ObjectRef>,
    pub(crate) generator: Option<ObjectRef>,
    pub(crate) constructed: Option<ObjectRef>,
    pub(crate) arguments: Vec<Value>,
    pub(crate) receiver: Value,
}

impl Activation {
    fn relocate(&mut self, moved: &FxHashMap<ObjectRef, ObjectRef>) {
        let relocate_ref = |object: &mut ObjectRef| {
            if let Some(to) = moved.get(&*object) {
                *object = *to;
            }
        };
        relocate_ref(&mut self.closure);
        for slot in [&mut self.context, &mut self.generator, &mut self.constructed] {
            if let Some(object) = slot {
                relocate_ref(object);
            }
        }
        self.accumulator.relocate(moved);
        self.receiver.relocate(moved);
        for value in self.registers.iter_mut().chain(&mut self.arguments) {
            value.relocate(moved);
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub(crate) id: StackFrameId,
    pub(crate) tier: FrameTier,
    pub(crate) native: bool,
    pub(crate) deopt_pending: bool,
    /// Outermost first.
    pub(crate) activations: Vec<Activation>,
}

impl Frame {
    pub(crate) fn top(&self) -> &Activation {
        match self.activations.last() {
            Some(activation) => activation,
            None => unreachable!("frame {:?} without activations", self.id),
        }
    }

    fn function(&self) -> FunctionId {
        match self.activations.first() {
            Some(activation) => activation.function,
            None => unreachable!("frame {:?} without activations", self.id),
        }
    }
}

/// The stack of a thread that gave up the isolate.
#[derive(Debug, Default)]
pub struct SavedStack {
    frames: Vec<Frame>,
    budget: Option<usize>,
}

impl SavedStack {
    /// Number of saved frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frame was saved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// The object moves of one collection. Also rewrites the slots it visits.
#[derive(Debug, Default)]
pub struct Relocation {
    moved: FxHashMap<ObjectRef, ObjectRef>,
}

impl Relocation {
    /// Where `object` moved to.
    #[must_use]
    pub fn get(&self, object: ObjectRef) -> Option<ObjectRef> {
        self.moved.get(&object).copied()
    }
}

impl RootVisitor for Relocation {
    fn visit_root(&mut self, root: Root, slot: &mut Option<ObjectRef>) {
        if let Some(object) = slot
            && let Some(to) = self.moved.get(&*object)
        {
            trace!("relocating debugger root {root:?}");
            *object = *to;
        }
    }
}

enum Step {
    Next,
    Returned(Value),
}

enum Invoked {
    Pushed,
    Done(Value),
    Terminated,
}

/// The interpreter.
#[derive(Debug)]
pub struct Vm {
    pub(crate) program: Program,
    pub(crate) heap: Heap,
    pub(crate) globals: FxHashMap<String, Value>,
    pub(crate) frames: Vec<Frame>,
    next_frame_id: u64,
    debug_bytecode: FxHashMap<FunctionId, Arc<DebugBytecodeArray>>,
    tiers: FxHashMap<FunctionId, FrameTier>,
    inlined: FxHashSet<(FunctionId, FunctionId)>,
    trampoline_installed: bool,
    terminate_requested: bool,
    compilation_cache_enabled: bool,
    collects_source_positions: bool,
    stack_overflowed: bool,
    stack_limit: usize,
    budget: Option<usize>,
    output: Vec<Value>,
    deoptimized: Vec<FunctionId>,
}

impl Vm {
    /// Creates an interpreter for `program`.
    #[must_use]
    pub fn new(program: Program) -> Self {
        Self {
            program,
            heap: Heap::default(),
            globals: FxHashMap::default(),
            frames: Vec::new(),
            next_frame_id: 1,
            debug_bytecode: FxHashMap::default(),
            tiers: FxHashMap::default(),
            inlined: FxHashSet::default(),
            trampoline_installed: false,
            terminate_requested: false,
            compilation_cache_enabled: true,
            collects_source_positions: false,
            stack_overflowed: false,
            stack_limit: DEFAULT_STACK_LIMIT,
            budget: None,
            output: Vec::new(),
            deoptimized: Vec::new(),
        }
    }

    /// The program being run.
    #[must_use]
    pub const fn program(&self) -> &Program {
        &self.program
    }

    /// Compiles and runs the top-level code of `script` with a fresh context.
    ///
    /// # Errors
    ///
    /// Returns how the run ended if it did not complete. A script that fails to compile
    /// throws.
    pub fn run_script(&mut self, debugger: &mut Debugger, script: ScriptId) -> Result<Value, Completion> {
        let Some(toplevel) = self.program.toplevel(script) else {
            return Err(Completion::Throw(self.error_object(debugger, "no top-level function")));
        };
        if let Err(err) = self.program.compile(toplevel) {
            debug!("{err}");
            debugger.on_compile_error(self, script);
            return Err(Completion::Throw(self.error_object(debugger, "SyntaxError")));
        }
        debugger.on_after_compile(self, script);

        let context = self.allocate(debugger, HeapObject::Context(Vec::new()));
        let closure = self.allocate(
            debugger,
            HeapObject::Closure {
                function: toplevel,
                context: Some(context),
            },
        );
        self.call(debugger, Value::Object(closure), Value::Undefined, &[])
    }

    /// Calls `callee` from Rust.
    ///
    /// # Errors
    ///
    /// Returns how the call ended if it did not complete.
    pub fn call(
        &mut self,
        debugger: &mut Debugger,
        callee: Value,
        receiver: Value,
        arguments: &[Value],
    ) -> Result<Value, Completion> {
        let base = self.frames.len();
        match self.invoke(debugger, callee, receiver, arguments.to_vec(), false, false) {
            Ok(Invoked::Pushed) => self.execute(debugger, base),
            Ok(Invoked::Done(value)) => Ok(value),
            Ok(Invoked::Terminated) => self.finish_termination(base),
            Err(exception) => {
                self.throw(debugger, exception, base)?;
                self.execute(debugger, base)
            }
        }
    }

    /// Calls the global function `name`.
    ///
    /// # Errors
    ///
    /// See [`Vm::call`].
    pub fn call_global(
        &mut self,
        debugger: &mut Debugger,
        name: &str,
        arguments: &[Value],
    ) -> Result<Value, Completion> {
        let callee = self.global(name);
        self.call(debugger, callee, Value::Undefined, arguments)
    }

    /// Continues a preempted run.
    ///
    /// # Errors
    ///
    /// See [`Vm::call`].
    pub fn resume(&mut self, debugger: &mut Debugger) -> Result<Value, Completion> {
        self.execute(debugger, 0)
    }

    fn execute(&mut self, debugger: &mut Debugger, base: usize) -> Result<Value, Completion> {
        loop {
            if self.terminate_requested {
                return self.finish_termination(base);
            }
            if base == 0
                && let Some(budget) = &mut self.budget
            {
                if *budget == 0 {
                    return Err(Completion::Preempted);
                }
                *budget -= 1;
            }
            match self.step(debugger, base) {
                Ok(Step::Next) => {}
                Ok(Step::Returned(value)) => return Ok(value),
                Err(exception) => self.throw(debugger, exception, base)?,
            }
        }
    }

    fn finish_termination(&mut self, base: usize) -> Result<Value, Completion> {
        self.frames.truncate(base);
        // The flag stays up until the outermost run has unwound.
        if base == 0 {
            self.terminate_requested = false;
        }
        Err(Completion::Terminated)
    }

    fn throw(&mut self, debugger: &mut Debugger, exception: Value, base: usize) -> Result<(), Completion> {
        let exception = match exception {
            Value::Object(_) => exception,
            primitive => {
                let mut properties = FxHashMap::default();
                properties.insert("value".to_owned(), primitive);
                Value::Object(self.allocate(debugger, HeapObject::Plain(properties)))
            }
        };
        if let Value::Object(object) = exception {
            debugger.on_throw(self, object);
        }
        self.stack_overflowed = false;

        while self.frames.len() > base {
            let Some(frame) = self.frames.last_mut() else {
                break;
            };
            if !frame.native {
                let activation = frame.top();
                let handler = self
                    .program
                    .bytecode(activation.function)
                    .and_then(|bytecode| bytecode.handler_table().lookup_range(activation.pc).copied());
                if let Some(range) = handler {
                    let Some(activation) = frame.activations.last_mut() else {
                        unreachable!("frame without activations");
                    };
                    activation.pc = range.handler;
                    activation.accumulator = exception;
                    return Ok(());
                }
            }
            let Some(activation) = frame.activations.pop() else {
                unreachable!("frame without activations");
            };
            if frame.activations.is_empty() {
                self.frames.pop();
            }
            if let Some(generator) = activation.generator
                && let Some(HeapObject::Generator(state)) = self.heap.get_mut(generator)
            {
                state.done = true;
            }
        }
        Err(Completion::Throw(exception))
    }

    fn step(&mut self, debugger: &mut Debugger, base: usize) -> Result<Step, Value> {
        self.materialize_deoptimized_frame();
        let (function, pc, tier) = {
            let frame = self.top_frame();
            (frame.top().function, frame.top().pc, frame.tier)
        };
        let Some(bytecode) = self.program.bytecode(function) else {
            unreachable!("running {function:?} without bytecode");
        };

        if tier == FrameTier::Interpreted
            && self
                .debug_bytecode
                .get(&function)
                .is_some_and(|debug| debug.is_break_at(pc))
        {
            let accumulator = self.top().accumulator.as_object();
            if DebugBreak::operation(debugger, self, function, accumulator).is_break()
                || self.terminate_requested
            {
                return Ok(Step::Next);
            }
        }

        let it = bytecode.iter_at(pc);
        let next = it.next_offset();
        let opcode = it.current_opcode();
        trace!("{function:?}@{pc}: {opcode}");
        match opcode {
            Opcode::Wide | Opcode::ExtraWide | Opcode::DebugBreak => {
                unreachable!("{opcode} in original bytecode")
            }
            Opcode::Nop | Opcode::ResumeGenerator => {}
            Opcode::LdaZero => self.set_acc(Value::Smi(0)),
            Opcode::LdaSmi => self.set_acc(Value::Smi(it.immediate_operand(0))),
            Opcode::LdaUndefined => self.set_acc(Value::Undefined),
            Opcode::LdaTrue => self.set_acc(Value::Bool(true)),
            Opcode::LdaFalse => self.set_acc(Value::Bool(false)),
            Opcode::Ldar => self.set_acc(self.reg(it.register_operand(0))),
            Opcode::Star => self.set_reg(it.register_operand(0), self.acc()),
            Opcode::Mov => self.set_reg(it.register_operand(1), self.reg(it.register_operand(0))),
            Opcode::Add | Opcode::Sub | Opcode::TestEqual | Opcode::TestLessThan | Opcode::TestGreaterThan => {
                let lhs = self.reg(it.register_operand(0));
                let rhs = self.acc();
                let result = binary(opcode, lhs, rhs)
                    .ok_or_else(|| self.error_object(debugger, "TypeError"))?;
                self.set_acc(result);
            }
            Opcode::LdaGlobal => {
                let name = name_operand(&bytecode, it.unsigned_operand(0));
                self.set_acc(self.global(name));
            }
            Opcode::StaGlobal => {
                let name = name_operand(&bytecode, it.unsigned_operand(0));
                self.globals.insert(name.to_owned(), self.acc());
            }
            Opcode::LdaNamedProperty => {
                let object = self.reg(it.register_operand(0));
                let name = name_operand(&bytecode, it.unsigned_operand(1));
                let value = self.property(object, name);
                self.set_acc(value);
            }
            Opcode::StaNamedProperty => {
                let object = self.reg(it.register_operand(0));
                let name = name_operand(&bytecode, it.unsigned_operand(1));
                self.set_property(debugger, object, name, self.acc())?;
            }
            Opcode::StaKeyedProperty => {
                let object = self.reg(it.register_operand(0));
                let key = match self.reg(it.register_operand(1)) {
                    Value::Smi(index) => index.to_string(),
                    Value::Bool(b) => b.to_string(),
                    Value::Undefined => "undefined".to_owned(),
                    Value::Object(_) => "[object Object]".to_owned(),
                };
                self.set_property(debugger, object, &key, self.acc())?;
            }
            Opcode::LdaCurrentContextSlot => {
                let slot = it.unsigned_operand(0) as usize;
                let value = match self.top().context.and_then(|context| self.heap.get(context)) {
                    Some(HeapObject::Context(slots)) => slots.get(slot).copied().unwrap_or_default(),
                    _ => Value::Undefined,
                };
                self.set_acc(value);
            }
            Opcode::StaCurrentContextSlot => {
                let slot = it.unsigned_operand(0) as usize;
                let value = self.acc();
                let context = self.top().context;
                match context.and_then(|context| self.heap.get_mut(context)) {
                    Some(HeapObject::Context(slots)) => {
                        if slots.len() <= slot {
                            slots.resize(slot + 1, Value::Undefined);
                        }
                        slots[slot] = value;
                    }
                    _ => return Err(self.error_object(debugger, "ReferenceError")),
                }
            }
            Opcode::CreateObject => {
                let object = self.allocate(debugger, HeapObject::Plain(FxHashMap::default()));
                self.set_acc(Value::Object(object));
            }
            Opcode::CreateClosure => {
                let Some(Constant::Function(target)) = bytecode.constant(it.unsigned_operand(0)) else {
                    unreachable!("closure operand is not a function constant");
                };
                let closure = HeapObject::Closure {
                    function: *target,
                    context: self.top().context,
                };
                let closure = self.allocate(debugger, closure);
                self.set_acc(Value::Object(closure));
            }
            Opcode::CallUndefinedReceiver | Opcode::CallProperty | Opcode::Construct => {
                let callee = self.reg(it.register_operand(0));
                let mut arguments = self.register_list(it.register_operand(1), it.unsigned_operand(2));
                let receiver = if opcode == Opcode::CallProperty && !arguments.is_empty() {
                    arguments.remove(0)
                } else {
                    Value::Undefined
                };
                let construct = opcode == Opcode::Construct;
                match self.invoke(debugger, callee, receiver, arguments, construct, true)? {
                    // The caller advances when the callee returns.
                    Invoked::Pushed | Invoked::Terminated => return Ok(Step::Next),
                    Invoked::Done(value) => self.set_acc(value),
                }
            }
            Opcode::CallRuntime => {
                let arguments = self.register_list(it.register_operand(1), it.unsigned_operand(2));
                let result = self.call_runtime(debugger, it.unsigned_operand(0), &arguments)?;
                self.set_acc(result);
            }
            Opcode::Jump => {
                self.top_mut().pc = it.unsigned_operand(0);
                return Ok(Step::Next);
            }
            Opcode::JumpIfFalse => {
                if !self.acc().is_truthy() {
                    self.top_mut().pc = it.unsigned_operand(0);
                    return Ok(Step::Next);
                }
            }
            Opcode::SuspendGenerator => {
                let Some(generator) = self.reg(it.register_operand(0)).as_object() else {
                    return Err(self.error_object(debugger, "TypeError"));
                };
                let suspend_id = it.unsigned_operand(3);
                let registers = self.top().registers.clone();
                if let Some(HeapObject::Generator(state)) = self.heap.get_mut(generator) {
                    state.registers = registers;
                    state.resume_offset = next;
                }
                // The initial suspend hands the generator object to the caller.
                let value = if suspend_id == 0 {
                    Value::Object(generator)
                } else {
                    self.acc()
                };
                return Ok(self.return_from_activation(value, base));
            }
            Opcode::Throw => return Err(self.acc()),
            Opcode::Debugger => {
                let _ = DebuggerStatement::operation(debugger, self);
            }
            Opcode::Return => {
                if let Some(generator) = self.top().generator
                    && let Some(HeapObject::Generator(state)) = self.heap.get_mut(generator)
                {
                    state.done = true;
                }
                return Ok(self.return_from_activation(self.acc(), base));
            }
        }
        self.top_mut().pc = next;
        Ok(Step::Next)
    }

    fn return_from_activation(&mut self, value: Value, base: usize) -> Step {
        let frame = self.top_frame_mut();
        let Some(activation) = frame.activations.pop() else {
            unreachable!("frame without activations");
        };
        if frame.activations.is_empty() {
            self.frames.pop();
        }
        let value = match (activation.constructed, value) {
            (Some(object), value) if value.as_object().is_none() => Value::Object(object),
            (_, value) => value,
        };
        if self.frames.len() == base {
            return Step::Returned(value);
        }
        let (function, pc) = (self.top().function, self.top().pc);
        let Some(bytecode) = self.program.bytecode(function) else {
            unreachable!("caller without bytecode");
        };
        let caller = self.top_mut();
        caller.accumulator = value;
        caller.pc = bytecode.iter_at(pc).next_offset();
        Step::Next
    }

    fn invoke(
        &mut self,
        debugger: &mut Debugger,
        callee: Value,
        receiver: Value,
        arguments: Vec<Value>,
        construct: bool,
        allow_inlining: bool,
    ) -> Result<Invoked, Value> {
        let Some(target) = callee.as_object() else {
            return Err(self.error_object(debugger, "TypeError: not a function"));
        };
        match self.heap.get(target).cloned() {
            Some(HeapObject::Closure { function, context }) => self.invoke_closure(
                debugger,
                target,
                function,
                context,
                receiver,
                arguments,
                construct,
                allow_inlining,
            ),
            Some(HeapObject::Generator(state)) => {
                self.resume_generator(debugger, target, state, arguments.first().copied())
            }
            _ => Err(self.error_object(debugger, "TypeError: not a function")),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke_closure(
        &mut self,
        debugger: &mut Debugger,
        closure: ObjectRef,
        function: FunctionId,
        context: Option<ObjectRef>,
        receiver: Value,
        arguments: Vec<Value>,
        construct: bool,
        allow_inlining: bool,
    ) -> Result<Invoked, Value> {
        if self.frames.len() >= self.stack_limit {
            self.stack_overflowed = true;
            return Err(self.error_object(debugger, "RangeError: Maximum call stack size exceeded"));
        }
        if debugger.hook_on_function_call()
            && !debugger.on_function_call(self, closure, function, receiver.as_object())
        {
            return Ok(Invoked::Terminated);
        }

        if let Body::Native(native, _) = self.program.entry(function).body {
            let activation = self.activation(function, closure, context, Vec::new(), arguments.clone(), receiver);
            self.push_frame(FrameTier::Interpreted, true, activation);
            if self.trampoline_installed && debugger.needs_break_at_entry(function) {
                let _ = DebugBreak::at_entry(debugger, self, function);
            }
            if self.terminate_requested {
                self.frames.pop();
                return Ok(Invoked::Terminated);
            }
            let result = native(self, debugger, receiver, &arguments);
            self.frames.pop();
            return result.map(Invoked::Done);
        }

        if let Err(err) = self.program.compile(function) {
            debug!("{err}");
            return Err(self.error_object(debugger, "SyntaxError"));
        }
        let Some(bytecode) = self.program.bytecode(function) else {
            unreachable!("compiled function without bytecode");
        };
        let is_generator = self.program.entry(function).info.is_generator();
        let mut registers = vec![Value::Undefined; bytecode.register_count() as usize];
        let first_parameter = usize::from(is_generator);
        for (slot, argument) in registers
            .iter_mut()
            .skip(first_parameter)
            .zip(arguments.iter().take(bytecode.parameter_count() as usize))
        {
            *slot = *argument;
        }

        let mut receiver = receiver;
        let mut activation;
        if construct {
            let object = self.allocate(debugger, HeapObject::Plain(FxHashMap::default()));
            receiver = Value::Object(object);
            activation = self.activation(function, closure, context, registers, arguments, receiver);
            activation.constructed = Some(object);
        } else {
            activation = self.activation(function, closure, context, registers, arguments, receiver);
        }
        if is_generator {
            let generator = self.allocate(
                debugger,
                HeapObject::Generator(GeneratorState {
                    function,
                    closure,
                    registers: Vec::new(),
                    resume_offset: 0,
                    done: false,
                }),
            );
            activation.generator = Some(generator);
            if let Some(slot) = activation.registers.first_mut() {
                *slot = Value::Object(generator);
            }
        }

        if allow_inlining
            && let Some(frame) = self.frames.last_mut()
            && frame.tier == FrameTier::Optimized
            && !frame.deopt_pending
            && self.inlined.contains(&(frame.function(), function))
        {
            frame.activations.push(activation);
            return Ok(Invoked::Pushed);
        }
        let tier = self.tiers.get(&function).copied().unwrap_or(FrameTier::Interpreted);
        self.push_frame(tier, false, activation);
        Ok(Invoked::Pushed)
    }

    fn resume_generator(
        &mut self,
        debugger: &mut Debugger,
        generator: ObjectRef,
        state: GeneratorState,
        sent: Option<Value>,
    ) -> Result<Invoked, Value> {
        if state.done {
            return Ok(Invoked::Done(Value::Undefined));
        }
        if debugger.hook_on_function_call()
            && !debugger.on_function_call(self, state.closure, state.function, Some(generator))
        {
            return Ok(Invoked::Terminated);
        }
        debugger.on_generator_resume(self, generator);

        let context = match self.heap.get(state.closure) {
            Some(HeapObject::Closure { context, .. }) => *context,
            _ => None,
        };
        let mut activation = self.activation(
            state.function,
            state.closure,
            context,
            state.registers,
            Vec::new(),
            Value::Undefined,
        );
        activation.pc = state.resume_offset;
        activation.generator = Some(generator);
        activation.accumulator = sent.unwrap_or_default();
        let tier = self.tiers.get(&state.function).copied().unwrap_or(FrameTier::Interpreted);
        self.push_frame(tier, false, activation);
        Ok(Invoked::Pushed)
    }

    fn call_runtime(&mut self, debugger: &mut Debugger, id: u32, arguments: &[Value]) -> Result<Value, Value> {
        match id {
            RUNTIME_LOG => {
                self.output.extend_from_slice(arguments);
                Ok(Value::Undefined)
            }
            RUNTIME_REJECT_PROMISE => {
                let promise = arguments.first().and_then(|value| value.as_object());
                let reason = arguments.get(1).copied().unwrap_or_default();
                let reason = match reason {
                    Value::Object(object) => object,
                    primitive => {
                        let mut properties = FxHashMap::default();
                        properties.insert("value".to_owned(), primitive);
                        self.allocate(debugger, HeapObject::Plain(properties))
                    }
                };
                debugger.on_promise_reject(self, promise, reason);
                Ok(Value::Undefined)
            }
            _ => Err(self.error_object(debugger, "unknown runtime function")),
        }
    }

    fn activation(
        &self,
        function: FunctionId,
        closure: ObjectRef,
        context: Option<ObjectRef>,
        registers: Vec<Value>,
        arguments: Vec<Value>,
        receiver: Value,
    ) -> Activation {
        Activation {
            function,
            closure,
            registers,
            accumulator: Value::Undefined,
            pc: 0,
            context,
            generator: None,
            constructed: None,
            arguments,
            receiver,
        }
    }

    fn push_frame(&mut self, tier: FrameTier, native: bool, activation: Activation) {
        let id = self.next_frame_id();
        self.frames.push(Frame {
            id,
            tier,
            native,
            deopt_pending: false,
            activations: vec![activation],
        });
    }

    fn next_frame_id(&mut self) -> StackFrameId {
        let Some(id) = StackFrameId::new(self.next_frame_id) else {
            unreachable!("frame ids start above zero");
        };
        self.next_frame_id += 1;
        id
    }

    /// Splits a deoptimized frame into one interpreted frame per activation.
    fn materialize_deoptimized_frame(&mut self) {
        if !self.frames.last().is_some_and(|frame| frame.deopt_pending) {
            return;
        }
        let Some(frame) = self.frames.pop() else {
            return;
        };
        debug!(
            "materializing {} activations of frame {:?}",
            frame.activations.len(),
            frame.id
        );
        for (index, activation) in frame.activations.into_iter().enumerate() {
            let id = if index == 0 { frame.id } else { self.next_frame_id() };
            self.frames.push(Frame {
                id,
                tier: FrameTier::Interpreted,
                native: false,
                deopt_pending: false,
                activations: vec![activation],
            });
        }
    }

    fn top_frame(&self) -> &Frame {
        match self.frames.last() {
            Some(frame) => frame,
            None => unreachable!("no frame is running"),
        }
    }

    fn top_frame_mut(&mut self) -> &mut Frame {
        match self.frames.last_mut() {
            Some(frame) => frame,
            None => unreachable!("no frame is running"),
        }
    }

    fn top(&self) -> &Activation {
        self.top_frame().top()
    }

    fn top_mut(&mut self) -> &mut Activation {
        match self.top_frame_mut().activations.last_mut() {
            Some(activation) => activation,
            None => unreachable!("frame without activations"),
        }
    }

    fn acc(&self) -> Value {
        self.top().accumulator
    }

    fn set_acc(&mut self, value: Value) {
        self.top_mut().accumulator = value;
    }

    fn reg(&self, register: Register) -> Value {
        self.top().registers.get(register.index()).copied().unwrap_or_default()
    }

    fn set_reg(&mut self, register: Register, value: Value) {
        let registers = &mut self.top_mut().registers;
        if registers.len() <= register.index() {
            registers.resize(register.index() + 1, Value::Undefined);
        }
        registers[register.index()] = value;
    }

    fn register_list(&self, first: Register, count: u32) -> Vec<Value> {
        (first.0..first.0 + count).map(|index| self.reg(Register(index))).collect()
    }

    pub(crate) fn allocate(&mut self, debugger: &Debugger, object: HeapObject) -> ObjectRef {
        let object = self.heap.allocate(object);
        debugger.on_allocation(object);
        object
    }

    fn error_object(&mut self, debugger: &Debugger, message: &str) -> Value {
        debug!("throwing {message}");
        let mut properties = FxHashMap::default();
        properties.insert("error".to_owned(), Value::Bool(true));
        Value::Object(self.allocate(debugger, HeapObject::Plain(properties)))
    }

    /// Reads `name` of `object`. Missing properties and primitives read as undefined.
    #[must_use]
    pub fn property(&self, object: Value, name: &str) -> Value {
        match object.as_object().and_then(|object| self.heap.get(object)) {
            Some(HeapObject::Plain(properties)) => properties.get(name).copied().unwrap_or_default(),
            _ => Value::Undefined,
        }
    }

    pub(crate) fn set_property(
        &mut self,
        debugger: &Debugger,
        object: Value,
        name: &str,
        value: Value,
    ) -> Result<(), Value> {
        match object.as_object().and_then(|object| self.heap.get_mut(object)) {
            Some(HeapObject::Plain(properties)) => {
                properties.insert(name.to_owned(), value);
                Ok(())
            }
            _ => Err(self.error_object(debugger, "TypeError: cannot set property")),
        }
    }

    /// The global `name`, undefined if unset.
    #[must_use]
    pub fn global(&self, name: &str) -> Value {
        self.globals.get(name).copied().unwrap_or_default()
    }

    /// Sets the global `name`.
    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_owned(), value);
    }

    /// Allocates an empty object.
    pub fn new_object(&mut self, debugger: &Debugger) -> Value {
        Value::Object(self.allocate(debugger, HeapObject::Plain(FxHashMap::default())))
    }

    /// Allocates a closure of `function` without a context.
    pub fn new_closure(&mut self, debugger: &Debugger, function: FunctionId) -> Value {
        Value::Object(self.allocate(
            debugger,
            HeapObject::Closure {
                function,
                context: None,
            },
        ))
    }

    /// Allocates a pending promise.
    pub fn new_promise(&mut self, debugger: &Debugger, silent: bool, has_reject_handler: bool) -> Value {
        Value::Object(self.allocate(
            debugger,
            HeapObject::Promise {
                silent,
                has_reject_handler,
                marked: false,
            },
        ))
    }

    /// Values logged through [`RUNTIME_LOG`].
    #[must_use]
    pub fn output(&self) -> &[Value] {
        &self.output
    }

    /// Makes new frames of `function` run at `tier`.
    pub fn set_tier(&mut self, function: FunctionId, tier: FrameTier) {
        self.tiers.insert(function, tier);
    }

    /// Optimizes `caller` with `callee` inlined into it.
    pub fn inline(&mut self, caller: FunctionId, callee: FunctionId) {
        self.tiers.insert(caller, FrameTier::Optimized);
        self.inlined.insert((caller, callee));
    }

    /// Functions deoptimized so far, in order.
    #[must_use]
    pub fn deoptimized(&self) -> &[FunctionId] {
        &self.deoptimized
    }

    /// Tier and functions of every frame, innermost first.
    #[must_use]
    pub fn frame_layout(&self) -> Vec<(FrameTier, Vec<FunctionId>)> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let functions = frame.activations.iter().map(|activation| activation.function).collect();
                (frame.tier, functions)
            })
            .collect()
    }

    /// Whether the compilation cache is on.
    #[must_use]
    pub const fn compilation_cache_enabled(&self) -> bool {
        self.compilation_cache_enabled
    }

    /// Whether source positions are kept for every function.
    #[must_use]
    pub const fn collects_source_positions(&self) -> bool {
        self.collects_source_positions
    }

    /// Preempts the outermost run after `budget` more instructions. `None` removes the
    /// limit.
    pub fn set_budget(&mut self, budget: Option<usize>) {
        self.budget = budget;
    }

    /// Lowers the maximum stack depth.
    pub fn set_stack_limit(&mut self, limit: usize) {
        self.stack_limit = limit;
    }

    /// Saves and clears the stack, for another thread to enter.
    pub fn take_stack(&mut self) -> SavedStack {
        SavedStack {
            frames: std::mem::take(&mut self.frames),
            budget: self.budget.take(),
        }
    }

    /// Reinstates a stack saved by [`Vm::take_stack`].
    ///
    /// # Panics
    ///
    /// Panics if the current stack is not empty.
    pub fn restore_stack(&mut self, saved: SavedStack) {
        assert!(self.frames.is_empty(), "restoring over a running stack");
        self.frames = saved.frames;
        self.budget = saved.budget;
    }

    /// Moves every object, telling the debugger about each move and rewriting its roots.
    pub fn collect_garbage(&mut self, debugger: &mut Debugger) -> Relocation {
        let moved = self.heap.compact();
        for activation in self.frames.iter_mut().flat_map(|frame| &mut frame.activations) {
            activation.relocate(&moved);
        }
        for value in self.globals.values_mut().chain(&mut self.output) {
            value.relocate(&moved);
        }
        for (&from, &to) in &moved {
            debugger.on_object_moved(from, to);
        }
        debug!("moved {} objects", moved.len());
        let mut relocation = Relocation { moved };
        debugger.iterate_roots(&mut relocation);
        relocation
    }

    pub(crate) fn frame(&self, id: StackFrameId) -> Option<&Frame> {
        self.frames.iter().find(|frame| frame.id == id)
    }
}

fn name_operand(bytecode: &BytecodeArray, index: u32) -> &str {
    match bytecode.name_constant(index) {
        Some(name) => name,
        None => unreachable!("constant {index} is not a name"),
    }
}

fn binary(opcode: Opcode, lhs: Value, rhs: Value) -> Option<Value> {
    if opcode == Opcode::TestEqual {
        return Some(Value::Bool(lhs == rhs));
    }
    let (Value::Smi(lhs), Value::Smi(rhs)) = (lhs, rhs) else {
        return None;
    };
    Some(match opcode {
        Opcode::Add => Value::Smi(lhs.wrapping_add(rhs)),
        Opcode::Sub => Value::Smi(lhs.wrapping_sub(rhs)),
        Opcode::TestLessThan => Value::Bool(lhs < rhs),
        Opcode::TestGreaterThan => Value::Bool(lhs > rhs),
        _ => unreachable!("{opcode} is not a binary operation"),
    })
}

impl Host for Vm {
    fn function_info(&self, function: FunctionId) -> FunctionInfo {
        self.program.entry(function).info.clone()
    }

    fn is_compiled(&self, function: FunctionId) -> bool {
        self.program.entry(function).compiled
    }

    fn compile(&mut self, function: FunctionId) -> Result<(), CompileError> {
        self.program.compile(function)
    }

    fn compile_toplevel(&mut self, script: ScriptId) -> Result<(), CompileError> {
        match self.program.toplevel(script) {
            Some(toplevel) => self.program.compile(toplevel),
            None => Err(CompileError::new("<toplevel>", "script has no top-level function")),
        }
    }

    fn has_toplevel_function(&self, script: ScriptId) -> bool {
        self.program.toplevel(script).is_some()
    }

    fn script_functions(&self, script: ScriptId) -> Vec<FunctionId> {
        self.program.script_functions(script)
    }

    fn original_bytecode(&self, function: FunctionId) -> Option<Arc<BytecodeArray>> {
        self.program.bytecode(function)
    }

    fn set_debug_bytecode(&mut self, function: FunctionId, bytecode: Option<Arc<DebugBytecodeArray>>) {
        match bytecode {
            Some(bytecode) => {
                // Baseline code is compiled from the original bytecode.
                if self.tiers.get(&function) == Some(&FrameTier::Baseline) {
                    self.tiers.remove(&function);
                }
                self.debug_bytecode.insert(function, bytecode);
            }
            None => {
                self.debug_bytecode.remove(&function);
            }
        }
    }

    fn source_location(&self, script: ScriptId, position: i32) -> SourceLocation {
        self.program.source_location(script, position)
    }

    fn deoptimize_function(&mut self, function: FunctionId) {
        let inliners: Vec<FunctionId> = self
            .inlined
            .iter()
            .filter(|(_, callee)| *callee == function)
            .map(|(caller, _)| *caller)
            .collect();
        let mut discarded = Vec::new();
        for target in inliners.into_iter().chain([function]) {
            if self.tiers.get(&target) == Some(&FrameTier::Optimized) {
                self.tiers.remove(&target);
                discarded.push(target);
            }
        }
        if discarded.is_empty() {
            return;
        }
        self.inlined
            .retain(|(caller, callee)| !discarded.contains(caller) && !discarded.contains(callee));
        for frame in &mut self.frames {
            if frame.tier == FrameTier::Optimized && discarded.contains(&frame.function()) {
                frame.deopt_pending = true;
            }
        }
        for target in discarded {
            debug!("deoptimized {}", self.program.entry(target).info.name);
            self.deoptimized.push(target);
        }
    }

    fn deoptimize_all(&mut self) {
        let optimized: Vec<FunctionId> = self
            .tiers
            .iter()
            .filter(|(_, tier)| **tier == FrameTier::Optimized)
            .map(|(function, _)| *function)
            .collect();
        for function in optimized {
            self.tiers.remove(&function);
            self.deoptimized.push(function);
        }
        self.inlined.clear();
        for frame in &mut self.frames {
            if frame.tier == FrameTier::Optimized {
                frame.deopt_pending = true;
            }
        }
        debug!("deoptimized all functions");
    }

    fn redirect_active_frames(&mut self, function: FunctionId) {
        for frame in &mut self.frames {
            if frame.tier == FrameTier::Baseline && frame.function() == function {
                frame.tier = FrameTier::Interpreted;
            }
        }
    }

    fn install_debug_break_trampoline(&mut self) {
        self.trampoline_installed = true;
    }

    fn stack_frames(&self) -> Vec<StackFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| StackFrame {
                id: frame.id,
                tier: frame.tier,
                summaries: frame
                    .activations
                    .iter()
                    .map(|activation| FrameSummary {
                        function: activation.function,
                        closure: activation.closure,
                        code_offset: activation.pc,
                    })
                    .collect(),
            })
            .collect()
    }

    fn read_register(&self, frame: StackFrameId, register: Register) -> Option<ObjectRef> {
        let activation = self.frame(frame)?.top();
        if register == Register::CURRENT_CONTEXT {
            return activation.context;
        }
        activation.registers.get(register.index())?.as_object()
    }

    fn generator_function(&self, generator: ObjectRef) -> Option<FunctionId> {
        match self.heap.get(generator) {
            Some(HeapObject::Generator(state)) => Some(state.function),
            _ => None,
        }
    }

    fn evaluate(
        &mut self,
        debugger: &mut Debugger,
        target: EvaluationTarget,
        source: &str,
    ) -> Result<serde_json::Value, EvalError> {
        eval::evaluate(self, debugger, target, source)
    }

    fn request_terminate_execution(&mut self) {
        self.terminate_requested = true;
    }

    fn cancel_terminate_execution(&mut self) {
        self.terminate_requested = false;
    }

    fn set_compilation_cache_enabled(&mut self, enabled: bool) {
        self.compilation_cache_enabled = enabled;
    }

    fn collect_source_positions(&mut self) {
        self.collects_source_positions = true;
    }

    fn is_exception_caught(&self) -> bool {
        for frame in self.frames.iter().rev().filter(|frame| !frame.native) {
            for activation in frame.activations.iter().rev() {
                let range = self
                    .program
                    .bytecode(activation.function)
                    .and_then(|bytecode| bytecode.handler_table().lookup_range(activation.pc).copied());
                match range.map(|range| range.prediction) {
                    Some(CatchPrediction::Caught) => return true,
                    Some(CatchPrediction::Promise) => return false,
                    None => {}
                }
            }
        }
        false
    }

    fn promise_state(&self, object: ObjectRef) -> Option<PromiseState> {
        match self.heap.get(object) {
            Some(HeapObject::Promise {
                silent,
                has_reject_handler,
                marked,
            }) => Some(PromiseState {
                is_silent: *silent,
                has_user_defined_reject_handler: *has_reject_handler,
                debug_marked: *marked,
            }),
            _ => None,
        }
    }

    fn mark_promise(&mut self, promise: ObjectRef) {
        if let Some(HeapObject::Promise { marked, .. }) = self.heap.get_mut(promise) {
            *marked = true;
        }
    }

    fn builtin_side_effect_state(&self, function: FunctionId) -> SideEffectState {
        match self.program.entry(function).body {
            Body::Native(_, state) => state,
            _ => SideEffectState::HasSideEffects,
        }
    }

    fn is_stack_overflowed(&self) -> bool {
        self.stack_overflowed
    }
}
