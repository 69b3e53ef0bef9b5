//! Thread-local stepping state and its archive format.
//!
//! When the engine switches the JavaScript thread running in an isolate, it archives the
//! outgoing thread's stepping state into an opaque byte buffer and restores the incoming
//! thread's state from its own buffer. The state also holds object references, which the
//! collector updates through [`RootVisitor`].

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use super::{
    Debugger, ObjectRef, StackFrameId, StepAction,
    host::{Host, stack_trace_frames},
};
use crate::debugger::NO_SOURCE_POSITION;

/// The stepping state of one JavaScript thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct ThreadLocal {
    break_frame_id: u64,
    suspended_generator: u64,
    ignore_step_into_function: u64,
    return_value: u64,
    last_step_action: i32,
    last_statement_position: i32,
    last_frame_count: i32,
    target_frame_count: i32,
    last_breakpoint_id: u32,
    fast_forward_to_return: u8,
    break_on_next_function_call: u8,
    _padding: [u8; 2],
}

const_assert_eq!(size_of::<ThreadLocal>(), 56);

/// Bytes [`Debugger::archive_debug`] writes per thread.
pub const ARCHIVE_SPACE_PER_THREAD: usize = size_of::<ThreadLocal>();

impl ThreadLocal {
    pub(crate) fn init() -> Self {
        Self {
            break_frame_id: 0,
            suspended_generator: 0,
            ignore_step_into_function: 0,
            return_value: 0,
            last_step_action: StepAction::None.into(),
            last_statement_position: NO_SOURCE_POSITION,
            last_frame_count: -1,
            target_frame_count: -1,
            last_breakpoint_id: 0,
            fast_forward_to_return: 0,
            break_on_next_function_call: 0,
            _padding: [0; 2],
        }
    }

    pub(crate) fn break_frame_id(&self) -> Option<StackFrameId> {
        StackFrameId::new(self.break_frame_id)
    }

    pub(crate) fn set_break_frame_id(&mut self, id: Option<StackFrameId>) {
        self.break_frame_id = id.map_or(0, StackFrameId::get);
    }

    pub(crate) fn suspended_generator(&self) -> Option<ObjectRef> {
        ObjectRef::new(self.suspended_generator)
    }

    pub(crate) fn set_suspended_generator(&mut self, generator: Option<ObjectRef>) {
        self.suspended_generator = generator.map_or(0, ObjectRef::address);
    }

    pub(crate) fn ignore_step_into_function(&self) -> Option<ObjectRef> {
        ObjectRef::new(self.ignore_step_into_function)
    }

    pub(crate) fn set_ignore_step_into_function(&mut self, closure: Option<ObjectRef>) {
        self.ignore_step_into_function = closure.map_or(0, ObjectRef::address);
    }

    pub(crate) fn return_value(&self) -> Option<ObjectRef> {
        ObjectRef::new(self.return_value)
    }

    pub(crate) fn set_return_value(&mut self, value: Option<ObjectRef>) {
        self.return_value = value.map_or(0, ObjectRef::address);
    }

    pub(crate) fn last_step_action(&self) -> StepAction {
        StepAction::try_from(self.last_step_action).unwrap_or(StepAction::None)
    }

    pub(crate) fn set_last_step_action(&mut self, action: StepAction) {
        self.last_step_action = action.into();
    }

    pub(crate) const fn last_statement_position(&self) -> i32 {
        self.last_statement_position
    }

    pub(crate) fn set_last_statement_position(&mut self, position: i32) {
        self.last_statement_position = position;
    }

    pub(crate) const fn last_frame_count(&self) -> i32 {
        self.last_frame_count
    }

    pub(crate) fn set_last_frame_count(&mut self, count: i32) {
        self.last_frame_count = count;
    }

    pub(crate) const fn target_frame_count(&self) -> i32 {
        self.target_frame_count
    }

    pub(crate) fn set_target_frame_count(&mut self, count: i32) {
        self.target_frame_count = count;
    }

    pub(crate) fn next_breakpoint_id(&mut self) -> u32 {
        self.last_breakpoint_id += 1;
        self.last_breakpoint_id
    }

    pub(crate) const fn fast_forward_to_return(&self) -> bool {
        self.fast_forward_to_return != 0
    }

    pub(crate) fn set_fast_forward_to_return(&mut self, enabled: bool) {
        self.fast_forward_to_return = u8::from(enabled);
    }

    pub(crate) const fn break_on_next_function_call(&self) -> bool {
        self.break_on_next_function_call != 0
    }

    pub(crate) fn set_break_on_next_function_call(&mut self, enabled: bool) {
        self.break_on_next_function_call = u8::from(enabled);
    }

    fn iterate(&mut self, visitor: &mut dyn RootVisitor) {
        for (root, slot) in [
            (Root::ReturnValue, &mut self.return_value),
            (Root::SuspendedGenerator, &mut self.suspended_generator),
            (Root::IgnoreStepIntoFunction, &mut self.ignore_step_into_function),
        ] {
            let mut object = ObjectRef::new(*slot);
            visitor.visit_root(root, &mut object);
            *slot = object.map_or(0, ObjectRef::address);
        }
    }
}

/// The strong object references held by the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    /// The value being returned at the current break.
    ReturnValue,
    /// The generator a step is waiting on.
    SuspendedGenerator,
    /// The closure a step-into must not stop in.
    IgnoreStepIntoFunction,
}

/// Visits debugger roots during garbage collection. The visitor may rewrite the slot when
/// the object moved.
pub trait RootVisitor {
    /// Visits one root slot.
    fn visit_root(&mut self, root: Root, slot: &mut Option<ObjectRef>);
}

impl<F> RootVisitor for F
where
    F: FnMut(Root, &mut Option<ObjectRef>),
{
    fn visit_root(&mut self, root: Root, slot: &mut Option<ObjectRef>) {
        self(root, slot);
    }
}

impl Debugger {
    /// Resets the stepping state for a thread entering the isolate for the first time.
    pub fn thread_init(&mut self) {
        debug_assert!(!self.in_debug_scope());
        self.thread_local = ThreadLocal::init();
        self.update_hook_on_function_call();
    }

    /// Writes the current thread's stepping state to the front of `storage` and resets it.
    /// Returns the unused rest of `storage`.
    ///
    /// # Panics
    ///
    /// Panics if `storage` is shorter than [`ARCHIVE_SPACE_PER_THREAD`] or a debug scope is
    /// open.
    pub fn archive_debug<'a>(&mut self, storage: &'a mut [u8]) -> &'a mut [u8] {
        assert!(
            !self.in_debug_scope(),
            "cannot switch threads while a debug scope is open"
        );
        let (head, rest) = storage.split_at_mut(ARCHIVE_SPACE_PER_THREAD);
        head.copy_from_slice(bytemuck::bytes_of(&self.thread_local));
        self.thread_init();
        rest
    }

    /// Restores a thread's stepping state from the front of `storage`, then re-establishes
    /// its pending step on the restored stack. Returns the unused rest of `storage`.
    pub fn restore_debug<'a>(&mut self, host: &mut dyn Host, storage: &'a [u8]) -> &'a [u8] {
        let (head, rest) = storage.split_at(ARCHIVE_SPACE_PER_THREAD);
        self.thread_local = bytemuck::pod_read_unaligned(head);

        self.with_debug_scope(host, |debugger, host| {
            debugger.clear_one_shot();
            let action = debugger.last_step_action();
            if action == StepAction::None {
                return;
            }
            let frames = stack_trace_frames(host);
            let target = debugger.thread_local.target_frame_count();
            let mut current = debugger.current_frame_count(host);
            let mut index = 0;
            if target >= 0 {
                while current > target && index + 1 < frames.len() {
                    current -= count_of(frames[index].function_count());
                    index += 1;
                }
            }
            debugger
                .thread_local
                .set_break_frame_id(frames.get(index).map(|frame| frame.id));
            debugger.prepare_step(host, action);
        });
        self.update_hook_on_function_call();
        rest
    }

    /// Visits the object references held by the current thread's stepping state.
    pub fn iterate_roots(&mut self, visitor: &mut dyn RootVisitor) {
        self.thread_local.iterate(visitor);
    }

    /// Visits the object references held by an archived thread's stepping state. Returns the
    /// unused rest of `storage`.
    pub fn iterate_archived<'a>(
        storage: &'a mut [u8],
        visitor: &mut dyn RootVisitor,
    ) -> &'a mut [u8] {
        let (head, rest) = storage.split_at_mut(ARCHIVE_SPACE_PER_THREAD);
        let mut state: ThreadLocal = bytemuck::pod_read_unaligned(head);
        state.iterate(visitor);
        head.copy_from_slice(bytemuck::bytes_of(&state));
        rest
    }
}

pub(crate) fn count_of(functions: usize) -> i32 {
    i32::try_from(functions).unwrap_or(i32::MAX)
}
