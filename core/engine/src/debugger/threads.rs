//! Archived stepping state of JavaScript threads that are not currently running.

use std::{
    cell::Cell,
    num::NonZeroU32,
    sync::atomic::{AtomicU32, Ordering},
};

use log::debug;
use rustc_hash::FxHashMap;

use super::{ARCHIVE_SPACE_PER_THREAD, Debugger, RootVisitor, host::Host};

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static CURRENT_THREAD_ID: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

/// Identifies an OS thread that runs JavaScript in an isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(NonZeroU32);

impl ThreadId {
    /// The id of the calling thread, assigned on first use.
    #[must_use]
    pub fn current() -> Self {
        CURRENT_THREAD_ID.with(|cell| {
            if let Some(id) = cell.get() {
                return id;
            }
            let raw = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            let Some(raw) = NonZeroU32::new(raw) else {
                panic!("thread id space exhausted");
            };
            let id = Self(raw);
            cell.set(Some(id));
            id
        })
    }

    /// The id of the calling thread, if it was ever assigned one.
    #[must_use]
    pub fn try_current() -> Option<Self> {
        CURRENT_THREAD_ID.with(Cell::get)
    }

    /// The raw value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

/// Keeps the archived stepping state of every thread that left the isolate.
///
/// The engine calls [`ThreadManager::archive_thread`] when a thread gives up the isolate
/// and [`ThreadManager::restore_thread`] when one acquires it.
#[derive(Debug, Default)]
pub struct ThreadManager {
    archived: FxHashMap<ThreadId, Box<[u8]>>,
}

impl ThreadManager {
    /// Creates a manager with no archived threads.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Archives the stepping state of `thread`, which is leaving the isolate.
    pub fn archive_thread(&mut self, debugger: &mut Debugger, thread: ThreadId) {
        let mut storage = vec![0; ARCHIVE_SPACE_PER_THREAD].into_boxed_slice();
        let rest = debugger.archive_debug(&mut storage);
        debug_assert!(rest.is_empty());
        debug!("archived debugger state of {thread:?}");
        self.archived.insert(thread, storage);
    }

    /// Restores the stepping state of `thread`, which is entering the isolate. A thread seen
    /// for the first time starts without any pending step.
    pub fn restore_thread(&mut self, debugger: &mut Debugger, host: &mut dyn Host, thread: ThreadId) {
        match self.archived.remove(&thread) {
            Some(storage) => {
                debug!("restoring debugger state of {thread:?}");
                debugger.restore_debug(host, &storage);
            }
            None => debugger.thread_init(),
        }
    }

    /// Visits the object references held by every archived state.
    pub fn iterate_archived_threads(&mut self, visitor: &mut dyn RootVisitor) {
        for storage in self.archived.values_mut() {
            Debugger::iterate_archived(storage, visitor);
        }
    }

    /// Whether `thread` has archived state.
    #[must_use]
    pub fn has_archived(&self, thread: ThreadId) -> bool {
        self.archived.contains_key(&thread)
    }

    /// Number of archived threads.
    #[must_use]
    pub fn archived_count(&self) -> usize {
        self.archived.len()
    }
}
