//! RAII lock guards and the per-task guard stack
//!
//! Each guard owns one slot on its task's guard stack. The top slot always
//! belongs to the most recently constructed guard still alive on the task's
//! path, and guards release in exact reverse order of acquisition.

use crate::error::ProtocolViolation;
use crate::event::{RtEvent, RtUserEvent};
use crate::frame::TaskFrame;
use crate::lock::LocalLock;
use crate::wait;
use std::cell::RefCell;
use std::sync::Arc;
use tessel_substrate::{Reservation, ReservationId, UserEvent};

struct GuardEntry {
    reservation: Arc<Reservation>,
    exclusive: bool,
    held: bool,
}

/// Locks taken by one task, oldest first
#[derive(Default)]
pub(crate) struct GuardStack {
    entries: Vec<GuardEntry>,
}

impl GuardStack {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Push an unheld slot, returning its depth
    fn push(&mut self, reservation: Arc<Reservation>, exclusive: bool) -> usize {
        self.entries.push(GuardEntry {
            reservation,
            exclusive,
            held: false,
        });
        self.entries.len() - 1
    }

    fn set_held(&mut self, depth: usize, held: bool) {
        if let Some(entry) = self.entries.get_mut(depth) {
            entry.held = held;
        }
    }

    fn truncate(&mut self, depth: usize) {
        self.entries.truncate(depth);
    }

    fn contains(&self, id: ReservationId) -> bool {
        self.entries.iter().any(|entry| entry.reservation.id() == id)
    }

    pub(crate) fn held_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.held).count()
    }

    /// Number of held slots taken in exclusive mode
    pub(crate) fn exclusive_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.held && entry.exclusive)
            .count()
    }

    /// Tell the reservation of every held slot below `count` that its holder
    /// sleeps until `guard` triggers
    pub(crate) fn advise_sleep_entry(&self, count: usize, guard: &UserEvent) {
        for entry in self.entries.iter().take(count).filter(|entry| entry.held) {
            entry.reservation.advise_sleep_entry(guard);
        }
    }

    pub(crate) fn advise_sleep_exit(&self, count: usize, guard: &UserEvent) {
        for entry in self.entries.iter().take(count).filter(|entry| entry.held) {
            if let Err(err) = entry.reservation.advise_sleep_exit(guard) {
                tracing::error!(%err, "sleep exit without matching entry");
            }
        }
    }
}

fn check_reentrant(frame: &TaskFrame, lock: &LocalLock) {
    if !frame.checks_enabled() {
        return;
    }
    let id = lock.id();
    let reentrant = frame.with_guards(|guards| guards.contains(id));
    frame.check(!reentrant, || ProtocolViolation::ReentrantAcquire(id));
}

/// Scoped hold on a [`LocalLock`]
///
/// Construction blocks the task (not the thread, where the processor helps
/// while waiting) until the lock is granted. Dropping the guard releases it.
pub struct AutoLock<'a> {
    frame: &'a TaskFrame,
    lock: &'a LocalLock,
    depth: usize,
    exclusive: bool,
    held: bool,
    on_stack: bool,
    sleeping_on: RefCell<Vec<UserEvent>>,
}

impl<'a> AutoLock<'a> {
    /// Take `lock` exclusively
    pub fn new(frame: &'a TaskFrame, lock: &'a LocalLock) -> Self {
        Self::with_mode(frame, lock, true)
    }

    /// Take `lock` shared
    pub fn shared(frame: &'a TaskFrame, lock: &'a LocalLock) -> Self {
        Self::with_mode(frame, lock, false)
    }

    /// Take `lock` in the given mode
    pub fn with_mode(frame: &'a TaskFrame, lock: &'a LocalLock, exclusive: bool) -> Self {
        let mut guard = Self::unacquired(frame, lock, exclusive);
        guard.push_slot();
        guard.acquire();
        guard
    }

    fn unacquired(frame: &'a TaskFrame, lock: &'a LocalLock, exclusive: bool) -> Self {
        check_reentrant(frame, lock);
        Self {
            frame,
            lock,
            depth: 0,
            exclusive,
            held: false,
            on_stack: false,
            sleeping_on: RefCell::new(Vec::new()),
        }
    }

    fn push_slot(&mut self) {
        let reservation = self.lock.reservation().clone();
        let exclusive = self.exclusive;
        self.depth = self.frame.with_guards(|guards| guards.push(reservation, exclusive));
        self.on_stack = true;
    }

    fn pop_slot(&mut self) {
        let depth = self.depth;
        self.frame.with_guards(|guards| guards.truncate(depth));
        self.on_stack = false;
    }

    fn mark_held(&mut self, held: bool) {
        let depth = self.depth;
        self.frame.with_guards(|guards| guards.set_held(depth, held));
        self.held = held;
    }

    /// Request, wait cooperatively if pending, retry until granted
    fn acquire(&mut self) {
        loop {
            let ready = if self.exclusive {
                self.lock.wrlock()
            } else {
                self.lock.rdlock()
            };
            if !ready.exists() {
                break;
            }
            // Release events never carry poison
            let _ = wait::suspend_on(self.frame, ready.handle(), false);
        }
        self.mark_held(true);
        tracing::trace!(lock = %self.lock.id(), depth = self.depth, exclusive = self.exclusive, "lock acquired");
    }

    fn is_top(&self) -> bool {
        let depth = self.depth;
        self.frame.with_guards(|guards| guards.len() == depth + 1)
    }

    /// Release the lock before the guard goes out of scope
    pub fn release(&mut self) {
        let lock = self.lock.id();
        self.frame.check(self.held, || ProtocolViolation::ReleaseWithoutHold(lock));
        if !self.held {
            return;
        }
        self.check_top();
        self.lock.unlock();
        self.held = false;
        self.pop_slot();
        tracing::trace!(lock = %lock, depth = self.depth, "lock released");
    }

    /// Take the lock again after [`release`](Self::release)
    pub fn reacquire(&mut self) {
        let lock = self.lock.id();
        self.frame.check(!self.held, || ProtocolViolation::ReacquireWhileHeld(lock));
        if self.held {
            return;
        }
        let depth = self.depth;
        let len = self.frame.lock_depth();
        self.frame.check(len == depth, || ProtocolViolation::OutOfOrderReacquire { lock, depth, len });
        check_reentrant(self.frame, self.lock);
        self.push_slot();
        self.acquire();
    }

    fn check_top(&self) {
        if !self.frame.checks_enabled() || self.is_top() {
            return;
        }
        let lock = self.lock.id();
        let depth = self.depth;
        let top = self.frame.lock_depth().saturating_sub(1);
        self.frame.check(false, || ProtocolViolation::OutOfOrderRelease { lock, depth, top });
    }

    /// Whether the guard currently holds its lock
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Whether the lock was taken exclusively
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// This guard's slot on the guard stack
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Tell this lock and every lock taken before it that the task is about
    /// to sleep until `guard` triggers
    pub fn advise_sleep_entry(&self, guard: &RtUserEvent) {
        let count = self.depth + 1;
        let guard = guard.as_user_event();
        self.frame.with_guards(|guards| guards.advise_sleep_entry(count, guard));
        self.sleeping_on.borrow_mut().push(guard.clone());
    }

    /// Undo the most recent [`advise_sleep_entry`](Self::advise_sleep_entry)
    pub fn advise_sleep_exit(&self) {
        let Some(guard) = self.sleeping_on.borrow_mut().pop() else {
            tracing::error!(lock = %self.lock.id(), "sleep exit without matching entry");
            return;
        };
        let count = self.depth + 1;
        self.frame.with_guards(|guards| guards.advise_sleep_exit(count, &guard));
    }
}

impl Drop for AutoLock<'_> {
    fn drop(&mut self) {
        if self.held {
            self.check_top();
            self.lock.unlock();
            self.held = false;
            tracing::trace!(lock = %self.lock.id(), depth = self.depth, "lock released");
        }
        if self.on_stack {
            self.pop_slot();
        }
    }
}

/// A single non-blocking attempt on a [`LocalLock`]
///
/// If the attempt fails the guard leaves no slot on the stack, and
/// [`try_next`](Self::try_next) names an event after which a retry may
/// succeed.
pub struct AutoTryLock<'a> {
    guard: AutoLock<'a>,
    ready: RtEvent,
}

impl<'a> AutoTryLock<'a> {
    /// Try to take `lock` exclusively
    pub fn new(frame: &'a TaskFrame, lock: &'a LocalLock) -> Self {
        Self::with_mode(frame, lock, true)
    }

    /// Try to take `lock` shared
    pub fn shared(frame: &'a TaskFrame, lock: &'a LocalLock) -> Self {
        Self::with_mode(frame, lock, false)
    }

    /// Try to take `lock` in the given mode
    pub fn with_mode(frame: &'a TaskFrame, lock: &'a LocalLock, exclusive: bool) -> Self {
        let mut guard = AutoLock::unacquired(frame, lock, exclusive);
        guard.push_slot();
        let granted = if exclusive {
            lock.trywrlock()
        } else {
            lock.tryrdlock()
        };
        let ready = if granted {
            guard.mark_held(true);
            RtEvent::NO_RT_EVENT
        } else {
            guard.pop_slot();
            lock.next_release()
        };
        tracing::trace!(lock = %lock.id(), granted, "lock attempt");
        Self { guard, ready }
    }

    /// Whether the attempt succeeded and the lock is still held
    pub fn has_lock(&self) -> bool {
        self.guard.is_held()
    }

    /// Event after which another attempt may succeed
    pub fn try_next(&self) -> RtEvent {
        self.ready.clone()
    }

    /// Release the lock early
    pub fn release(&mut self) {
        self.guard.release();
    }

    /// Take the lock again after [`release`](Self::release), blocking if needed
    pub fn reacquire(&mut self) {
        self.guard.reacquire();
    }
}
