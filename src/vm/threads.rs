/// Thread support.
///
/// Each guest thread is an OS thread with its own frame stack. This module
/// provides:
/// - unique thread ids
/// - per-thread control blocks (interrupt flag, sleep, wake-up on interrupt)
/// - a spawner that owns join handles of guest threads
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::VmError;

use super::exception::Outcome;
use super::heap::ObjectRef;
use super::monitor::Monitor;

/// Thread ID counter for generating unique IDs.
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique thread ID.
pub fn next_thread_id() -> u64 {
    NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)
}

/// State of a guest thread that other threads may touch.
#[derive(Debug)]
pub struct ThreadControl {
    pub id: u64,
    interrupted: AtomicBool,
    parker: Mutex<()>,
    wake: Condvar,
    /// Monitor this thread is waiting on, so an interrupt can wake it.
    blocked_on: Mutex<Option<Arc<Monitor>>>,
    /// The guest `java/lang/Thread` object, once one exists.
    pub object: OnceLock<ObjectRef>,
}

impl ThreadControl {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            interrupted: AtomicBool::new(false),
            parker: Mutex::new(()),
            wake: Condvar::new(),
            blocked_on: Mutex::new(None),
            object: OnceLock::new(),
        }
    }

    /// Set the interrupt flag and wake the thread if it is sleeping or
    /// waiting on a monitor.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        {
            let _guard = self.parker.lock();
            self.wake.notify_all();
        }
        let monitor = self.blocked_on.lock().clone();
        if let Some(monitor) = monitor {
            monitor.wake();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Read and clear the interrupt flag.
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn set_blocked_on(&self, monitor: Option<Arc<Monitor>>) {
        *self.blocked_on.lock() = monitor;
    }

    /// Sleep for `duration`. Returns true (and clears the flag) if the
    /// sleep was interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.parker.lock();
        loop {
            if self.take_interrupt() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.wake.wait_until(&mut guard, deadline);
        }
    }
}

/// A handle to a spawned thread.
pub struct ThreadHandle {
    /// Unique thread ID
    pub id: u64,
    /// Join handle for the OS thread
    handle: Option<JoinHandle<Result<Outcome, VmError>>>,
}

impl ThreadHandle {
    /// Wait for the thread to complete and return its result.
    pub fn join(&mut self) -> Result<Outcome, VmError> {
        match self.handle.take() {
            Some(h) => h.join().map_err(|_| VmError::ThreadPanicked(self.id))?,
            None => Err(VmError::AlreadyJoined(self.id)),
        }
    }
}

/// Registry of live guest threads.
#[derive(Default)]
pub struct ThreadSpawner {
    controls: RwLock<HashMap<u64, Arc<ThreadControl>>>,
    handles: Mutex<HashMap<u64, ThreadHandle>>,
}

impl ThreadSpawner {
    /// Create a new thread spawner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thread's control block and return it.
    pub fn register(&self, id: u64) -> Arc<ThreadControl> {
        let control = Arc::new(ThreadControl::new(id));
        self.controls.write().insert(id, Arc::clone(&control));
        control
    }

    pub fn control(&self, id: u64) -> Option<Arc<ThreadControl>> {
        self.controls.read().get(&id).cloned()
    }

    /// Start an OS thread running `f`. The thread must already be
    /// registered under `id`.
    pub fn spawn<F>(&self, id: u64, f: F) -> Result<(), VmError>
    where
        F: FnOnce() -> Result<Outcome, VmError> + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("kettle-{}", id))
            .spawn(f)?;
        self.handles.lock().insert(
            id,
            ThreadHandle {
                id,
                handle: Some(handle),
            },
        );
        Ok(())
    }

    /// Join a thread by ID and return its result.
    pub fn join(&self, id: u64) -> Result<Outcome, VmError> {
        // Take the handle out so other threads can keep spawning and joining.
        let mut handle = self
            .handles
            .lock()
            .remove(&id)
            .ok_or(VmError::AlreadyJoined(id))?;
        let result = handle.join();
        self.controls.write().remove(&id);
        result
    }

    /// Whether a spawned thread is still registered and unjoined.
    pub fn is_alive(&self, id: u64) -> bool {
        self.handles
            .lock()
            .get(&id)
            .and_then(|h| h.handle.as_ref())
            .is_some_and(|h| !h.is_finished())
    }

    /// Join every thread that has not been joined yet.
    pub fn join_all(&self) -> Vec<(u64, Result<Outcome, VmError>)> {
        let ids: Vec<u64> = self.handles.lock().keys().copied().collect();
        ids.into_iter().map(|id| (id, self.join(id))).collect()
    }
}
