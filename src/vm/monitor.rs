//! Object monitors: reentrant locks with a wait set.
//!
//! Every object can act as a monitor. Monitors are created the first time
//! an object is locked or waited on and live as long as the VM.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::heap::ObjectRef;
use super::threads::ThreadControl;

/// The calling thread does not own the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("current thread is not owner")]
pub struct NotOwner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Notified,
    TimedOut,
    Interrupted,
}

#[derive(Debug, Default)]
struct MonitorState {
    owner: Option<u64>,
    count: u32,
    /// Waiting tickets, oldest first.
    waiters: VecDeque<u64>,
    /// Tickets picked by notify that have not woken up yet.
    notified: HashSet<u64>,
    next_ticket: u64,
}

impl MonitorState {
    fn owned_by(&self, thread: u64) -> Result<(), NotOwner> {
        if self.owner == Some(thread) {
            Ok(())
        } else {
            Err(NotOwner)
        }
    }

    fn forget(&mut self, ticket: u64) {
        self.waiters.retain(|t| *t != ticket);
    }
}

#[derive(Debug, Default)]
pub struct Monitor {
    state: Mutex<MonitorState>,
    cond: Condvar,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire, blocking while another thread owns the monitor.
    pub fn enter(&self, thread: u64) {
        let mut state = self.state.lock();
        if state.owner == Some(thread) {
            state.count += 1;
            return;
        }
        while state.owner.is_some() {
            self.cond.wait(&mut state);
        }
        state.owner = Some(thread);
        state.count = 1;
    }

    /// Release one level of ownership.
    pub fn exit(&self, thread: u64) -> Result<(), NotOwner> {
        let mut state = self.state.lock();
        state.owned_by(thread)?;
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Release ownership completely, wait to be notified, then reacquire
    /// with the previous entry count. `None` waits without a time limit.
    pub fn wait(
        self: &Arc<Self>,
        control: &ThreadControl,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, NotOwner> {
        let thread = control.id;
        control.set_blocked_on(Some(Arc::clone(self)));
        let mut state = self.state.lock();
        if let Err(e) = state.owned_by(thread) {
            drop(state);
            control.set_blocked_on(None);
            return Err(e);
        }

        let saved = state.count;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);
        state.owner = None;
        state.count = 0;
        self.cond.notify_all();

        let deadline = timeout.map(|d| Instant::now() + d);
        let outcome = loop {
            if state.notified.remove(&ticket) {
                break WaitOutcome::Notified;
            }
            if control.is_interrupted() {
                state.forget(ticket);
                break WaitOutcome::Interrupted;
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        state.forget(ticket);
                        break WaitOutcome::TimedOut;
                    }
                    self.cond.wait_until(&mut state, deadline);
                }
                None => self.cond.wait(&mut state),
            }
        };

        while state.owner.is_some() {
            self.cond.wait(&mut state);
        }
        state.owner = Some(thread);
        state.count = saved;
        drop(state);

        control.set_blocked_on(None);
        if outcome == WaitOutcome::Interrupted {
            control.take_interrupt();
        }
        Ok(outcome)
    }

    /// Wake the longest-waiting thread.
    pub fn notify(&self, thread: u64) -> Result<(), NotOwner> {
        let mut state = self.state.lock();
        state.owned_by(thread)?;
        if let Some(ticket) = state.waiters.pop_front() {
            state.notified.insert(ticket);
            self.cond.notify_all();
        }
        Ok(())
    }

    pub fn notify_all(&self, thread: u64) -> Result<(), NotOwner> {
        let mut state = self.state.lock();
        state.owned_by(thread)?;
        let woken: Vec<u64> = state.waiters.drain(..).collect();
        state.notified.extend(woken);
        self.cond.notify_all();
        Ok(())
    }

    pub fn owner(&self) -> Option<u64> {
        self.state.lock().owner
    }

    pub fn entry_count(&self) -> u32 {
        self.state.lock().count
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Wake every blocked thread so it re-checks its condition.
    pub(crate) fn wake(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }
}

/// Lazily created monitor per object.
///
/// Entries are never removed: a monitor lives as long as the engine, like
/// the objects of the arena heap it is keyed on. Every lookup for the same
/// object returns the same monitor, so owners and waiters always agree.
#[derive(Debug, Default)]
pub struct MonitorTable {
    monitors: Mutex<HashMap<ObjectRef, Arc<Monitor>>>,
}

impl MonitorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, obj: ObjectRef) -> Arc<Monitor> {
        Arc::clone(self.monitors.lock().entry(obj).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_table_keeps_released_monitors() {
        let table = MonitorTable::new();
        let obj = ObjectRef::from_index(3);
        let first = table.get(obj);
        first.enter(1);
        first.exit(1).unwrap();
        assert_eq!(first.owner(), None);
        drop(first);
        let again = table.get(obj);
        again.enter(2);
        assert!(Arc::ptr_eq(&again, &table.get(obj)));
        assert_eq!(table.get(obj).owner(), Some(2));
    }

    #[test]
    fn test_reentrant_enter_exit() {
        let m = Monitor::new();
        m.enter(1);
        m.enter(1);
        assert_eq!(m.entry_count(), 2);
        m.exit(1).unwrap();
        assert_eq!(m.owner(), Some(1));
        m.exit(1).unwrap();
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn test_exit_by_non_owner_leaves_monitor_untouched() {
        let m = Monitor::new();
        m.enter(1);
        assert_eq!(m.exit(2), Err(NotOwner));
        assert_eq!(m.owner(), Some(1));
        assert_eq!(m.entry_count(), 1);
        assert_eq!(Monitor::new().exit(1), Err(NotOwner));
    }

    #[test]
    fn test_notify_requires_ownership() {
        let m = Monitor::new();
        assert_eq!(m.notify(1), Err(NotOwner));
        assert_eq!(m.notify_all(1), Err(NotOwner));
        let control = ThreadControl::new(1);
        assert_eq!(Arc::new(Monitor::new()).wait(&control, None), Err(NotOwner));
    }

    #[test]
    fn test_enter_blocks_until_released() {
        let m = Arc::new(Monitor::new());
        m.enter(1);
        let acquired = Arc::new(AtomicBool::new(false));
        let t = {
            let m = Arc::clone(&m);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                m.enter(2);
                acquired.store(true, Ordering::SeqCst);
                m.exit(2).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!acquired.load(Ordering::SeqCst));
        m.exit(1).unwrap();
        t.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_wait_restores_entry_count() {
        let m = Arc::new(Monitor::new());
        let waiter = {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                let control = ThreadControl::new(1);
                m.enter(1);
                m.enter(1);
                let outcome = m.wait(&control, None).unwrap();
                let count = m.entry_count();
                m.exit(1).unwrap();
                m.exit(1).unwrap();
                (outcome, count)
            })
        };
        while m.waiting() == 0 {
            thread::yield_now();
        }
        m.enter(2);
        m.notify(2).unwrap();
        m.exit(2).unwrap();
        assert_eq!(waiter.join().unwrap(), (WaitOutcome::Notified, 2));
    }

    #[test]
    fn test_timed_wait() {
        let m = Arc::new(Monitor::new());
        let control = ThreadControl::new(1);
        m.enter(1);
        let outcome = m.wait(&control, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(m.owner(), Some(1));
        assert_eq!(m.waiting(), 0);
    }

    #[test]
    fn test_interrupt_wakes_waiter() {
        let m = Arc::new(Monitor::new());
        let control = Arc::new(ThreadControl::new(1));
        let waiter = {
            let m = Arc::clone(&m);
            let control = Arc::clone(&control);
            thread::spawn(move || {
                m.enter(1);
                let outcome = m.wait(&control, None).unwrap();
                m.exit(1).unwrap();
                outcome
            })
        };
        while m.waiting() == 0 {
            thread::yield_now();
        }
        control.interrupt();
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Interrupted);
        // the flag is consumed by the wait
        assert!(!control.is_interrupted());
    }

    #[test]
    fn test_table_returns_same_monitor() {
        let table = MonitorTable::new();
        let a = table.get(ObjectRef::from_index(1));
        let b = table.get(ObjectRef::from_index(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &table.get(ObjectRef::from_index(2))));
    }
}
