//! Scoped debugger states.
//!
//! Each guard saves a piece of state, changes it for the duration of a closure and restores
//! it afterwards, so nested uses compose.

use super::{Debugger, StackFrameId, host::{Host, stack_trace_frames}};

/// One open debug scope.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScopeRecord {
    saved_break_frame_id: Option<StackFrameId>,
    terminate_on_resume: bool,
}

impl Debugger {
    /// Runs `f` inside a debug scope.
    ///
    /// The break frame becomes the topmost stack-trace frame while the scope is open and
    /// the previous one is restored when it closes. A termination requested with
    /// [`Debugger::set_terminate_on_resume`] is forwarded to the enclosing scope, or to the
    /// engine when the outermost scope closes.
    pub fn with_debug_scope<R>(
        &mut self,
        host: &mut dyn Host,
        f: impl FnOnce(&mut Self, &mut dyn Host) -> R,
    ) -> R {
        self.scopes.push(ScopeRecord {
            saved_break_frame_id: self.thread_local.break_frame_id(),
            terminate_on_resume: false,
        });
        let top = stack_trace_frames(host).first().map(|frame| frame.id);
        self.thread_local.set_break_frame_id(top);
        self.update_state(host);

        let result = f(self, host);

        let Some(record) = self.scopes.pop() else {
            unreachable!("debug scope stack underflow");
        };
        if record.terminate_on_resume {
            match self.scopes.last_mut() {
                Some(outer) => outer.terminate_on_resume = true,
                None => host.request_terminate_execution(),
            }
        }
        self.thread_local
            .set_break_frame_id(record.saved_break_frame_id);
        self.update_state(host);
        result
    }

    /// Asks for execution to be terminated when the current debug scope closes.
    pub fn set_terminate_on_resume(&mut self) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.terminate_on_resume = true;
        }
    }

    /// Runs `f` with breaks disabled.
    pub fn with_break_disabled<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = std::mem::replace(&mut self.break_disabled, true);
        let result = f(self);
        self.break_disabled = previous;
        result
    }

    /// Runs `f` with debugger events suppressed.
    pub fn with_suppressed<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = std::mem::replace(&mut self.is_suppressed, true);
        let result = f(self);
        self.is_suppressed = previous;
        result
    }
}
