//! Reader/writer reservations with deferred acquisition
//!
//! Acquisition never blocks. A request either succeeds and returns the
//! sentinel handle, or fails and returns a handle that triggers once the
//! reservation is released, after which the caller retries.

use crate::error::{SubstrateError, SubstrateResult};
use crate::event::{CompletionHandle, UserEvent};
use crate::id::ReservationId;
use parking_lot::Mutex;

/// Default number of attempts a spinning acquire makes before deferring
pub const DEFAULT_SPIN_LIMIT: u32 = 64;

/// How an acquire behaves while the reservation is contended
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum WaitMode {
    /// Spin briefly, but defer immediately if a holder is sleeping
    #[default]
    Spin,
    /// Spin until granted, even when a holder is sleeping
    AlwaysSpin,
    /// Never spin; defer on the first failure
    Wait,
}

#[derive(Default)]
struct ReservationState {
    writer: bool,
    readers: usize,
    sleepers: usize,
    sleep_guards: Vec<CompletionHandle>,
    waiters: Vec<UserEvent>,
}

impl ReservationState {
    fn is_free(&self) -> bool {
        !self.writer && self.readers == 0
    }

    fn try_grant(&mut self, exclusive: bool) -> bool {
        if exclusive {
            if self.is_free() {
                self.writer = true;
                return true;
            }
        } else if !self.writer {
            self.readers += 1;
            return true;
        }
        false
    }

    fn defer(&mut self) -> CompletionHandle {
        let waiter = UserEvent::create();
        let handle = waiter.event();
        self.waiters.push(waiter);
        handle
    }
}

/// A reader/writer reservation
///
/// Holds no owner identity: any thread may release a grant, which lets a
/// held reservation travel with a suspended task.
pub struct Reservation {
    id: ReservationId,
    spin_limit: u32,
    state: Mutex<ReservationState>,
}

impl Reservation {
    /// Create an unheld reservation
    pub fn new() -> Self {
        Self::with_spin_limit(DEFAULT_SPIN_LIMIT)
    }

    /// Create an unheld reservation with a custom spin budget
    pub fn with_spin_limit(spin_limit: u32) -> Self {
        Self {
            id: ReservationId::next(),
            spin_limit: spin_limit.max(1),
            state: Mutex::new(ReservationState::default()),
        }
    }

    /// Get the reservation ID
    pub fn id(&self) -> ReservationId {
        self.id
    }

    /// Request exclusive access
    ///
    /// Returns [`CompletionHandle::NO_EVENT`] when granted.
    pub fn wrlock(&self, mode: WaitMode) -> CompletionHandle {
        self.acquire(true, mode)
    }

    /// Request shared access
    pub fn rdlock(&self, mode: WaitMode) -> CompletionHandle {
        self.acquire(false, mode)
    }

    /// Request access in the given mode
    pub fn lock(&self, exclusive: bool, mode: WaitMode) -> CompletionHandle {
        self.acquire(exclusive, mode)
    }

    fn acquire(&self, exclusive: bool, mode: WaitMode) -> CompletionHandle {
        let mut attempts: u32 = 0;
        loop {
            let mut state = self.state.lock();
            if state.try_grant(exclusive) {
                tracing::trace!(reservation = %self.id, exclusive, attempts, "reservation granted");
                return CompletionHandle::NO_EVENT;
            }
            attempts = attempts.saturating_add(1);
            let keep_spinning = match mode {
                WaitMode::Spin => state.sleepers == 0 && attempts < self.spin_limit,
                WaitMode::AlwaysSpin => true,
                WaitMode::Wait => false,
            };
            if !keep_spinning {
                tracing::trace!(reservation = %self.id, exclusive, attempts, "reservation deferred");
                return state.defer();
            }
            drop(state);
            std::hint::spin_loop();
        }
    }

    /// Attempt exclusive access without deferring
    pub fn trylock(&self) -> bool {
        self.trywrlock()
    }

    /// Attempt exclusive access without deferring
    pub fn trywrlock(&self) -> bool {
        self.state.lock().try_grant(true)
    }

    /// Attempt shared access without deferring
    pub fn tryrdlock(&self) -> bool {
        self.state.lock().try_grant(false)
    }

    /// Release one grant
    ///
    /// Once the reservation is completely free every deferred requester is
    /// woken to retry.
    pub fn unlock(&self) -> SubstrateResult<()> {
        let waiters = {
            let mut state = self.state.lock();
            if state.writer {
                state.writer = false;
            } else if state.readers > 0 {
                state.readers -= 1;
            } else {
                return Err(SubstrateError::NotHeld(self.id));
            }
            if state.is_free() {
                std::mem::take(&mut state.waiters)
            } else {
                Vec::new()
            }
        };
        for waiter in waiters {
            // Waiters are private to this reservation and fire once
            let _ = waiter.trigger();
        }
        Ok(())
    }

    /// A handle that triggers at the next full release
    ///
    /// Returns the sentinel if the reservation is currently free.
    pub fn next_release(&self) -> CompletionHandle {
        let mut state = self.state.lock();
        if state.is_free() {
            CompletionHandle::NO_EVENT
        } else {
            state.defer()
        }
    }

    /// Note that a holder is about to sleep until `guard` triggers
    pub fn advise_sleep_entry(&self, guard: &UserEvent) {
        let mut state = self.state.lock();
        state.sleepers += 1;
        state.sleep_guards.push(guard.event());
        tracing::trace!(reservation = %self.id, sleepers = state.sleepers, "holder sleeping");
    }

    /// Note that the holder that slept on `guard` has resumed
    pub fn advise_sleep_exit(&self, guard: &UserEvent) -> SubstrateResult<()> {
        let mut state = self.state.lock();
        if state.sleepers == 0 {
            return Err(SubstrateError::NoSleeper(self.id));
        }
        state.sleepers -= 1;
        if state.sleepers == 0 {
            state.sleep_guards.clear();
        } else {
            let waking = guard.event();
            if let Some(pos) = state.sleep_guards.iter().position(|entry| *entry == waking) {
                state.sleep_guards.swap_remove(pos);
            }
        }
        tracing::trace!(reservation = %self.id, sleepers = state.sleepers, "holder awake");
        Ok(())
    }

    /// A handle that triggers once every currently sleeping holder wakes
    pub fn sleepers_awake(&self) -> CompletionHandle {
        let guards = self.state.lock().sleep_guards.clone();
        CompletionHandle::merge(guards)
    }

    /// Whether an exclusive grant is outstanding
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer
    }

    /// Number of outstanding shared grants
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers
    }

    /// Number of holders currently advised as sleeping
    pub fn sleeper_count(&self) -> usize {
        self.state.lock().sleepers
    }

    /// Number of deferred requesters waiting for a release
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl Default for Reservation {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("writer", &state.writer)
            .field("readers", &state.readers)
            .field("sleepers", &state.sleepers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_reservation_uncontended() {
        let rsrv = Reservation::new();
        assert!(!rsrv.wrlock(WaitMode::Spin).exists());
        assert!(rsrv.is_write_locked());
        rsrv.unlock().unwrap();
        assert!(!rsrv.is_write_locked());
    }

    #[test]
    fn test_shared_grants_coexist() {
        let rsrv = Reservation::new();
        assert!(!rsrv.rdlock(WaitMode::Wait).exists());
        assert!(!rsrv.rdlock(WaitMode::Wait).exists());
        assert_eq!(rsrv.reader_count(), 2);
        assert!(!rsrv.trywrlock());
        rsrv.unlock().unwrap();
        rsrv.unlock().unwrap();
        assert!(rsrv.trywrlock());
    }

    #[test]
    fn test_contended_returns_release_event() {
        let rsrv = Reservation::new();
        assert!(rsrv.trylock());

        let ready = rsrv.wrlock(WaitMode::Wait);
        assert!(ready.exists());
        assert!(!ready.has_triggered());
        assert_eq!(rsrv.waiter_count(), 1);

        rsrv.unlock().unwrap();
        assert!(ready.has_triggered());
        assert_eq!(rsrv.waiter_count(), 0);
        assert!(!rsrv.wrlock(WaitMode::Wait).exists());
    }

    #[test]
    fn test_writer_excludes_readers() {
        let rsrv = Reservation::new();
        assert!(rsrv.trywrlock());
        assert!(!rsrv.tryrdlock());
        let ready = rsrv.rdlock(WaitMode::Wait);
        assert!(ready.exists());
        rsrv.unlock().unwrap();
        assert!(ready.has_triggered());
    }

    #[test]
    fn test_readers_wake_writer_only_when_free() {
        let rsrv = Reservation::new();
        assert!(rsrv.tryrdlock());
        assert!(rsrv.tryrdlock());
        let ready = rsrv.wrlock(WaitMode::Wait);
        rsrv.unlock().unwrap();
        assert!(!ready.has_triggered());
        rsrv.unlock().unwrap();
        assert!(ready.has_triggered());
    }

    #[test]
    fn test_unlock_unheld_fails() {
        let rsrv = Reservation::new();
        let err = rsrv.unlock().unwrap_err();
        assert!(matches!(err, SubstrateError::NotHeld(id) if id == rsrv.id()));
    }

    #[test]
    fn test_next_release() {
        let rsrv = Reservation::new();
        assert!(!rsrv.next_release().exists());
        assert!(rsrv.trylock());
        let release = rsrv.next_release();
        assert!(!release.has_triggered());
        rsrv.unlock().unwrap();
        assert!(release.has_triggered());
    }

    #[test]
    fn test_sleep_advice() {
        let rsrv = Reservation::new();
        assert!(rsrv.trylock());
        let guard = UserEvent::create();
        rsrv.advise_sleep_entry(&guard);
        assert_eq!(rsrv.sleeper_count(), 1);

        let awake = rsrv.sleepers_awake();
        assert!(!awake.has_triggered());

        // Spin mode defers immediately while a holder sleeps
        let ready = rsrv.wrlock(WaitMode::Spin);
        assert!(ready.exists());

        rsrv.advise_sleep_exit(&guard).unwrap();
        guard.trigger().unwrap();
        assert!(awake.has_triggered());
        assert_eq!(rsrv.sleeper_count(), 0);
        assert!(rsrv.advise_sleep_exit(&guard).is_err());
        rsrv.unlock().unwrap();
    }

    #[test]
    fn test_sleep_exit_forgets_waking_holder() {
        let rsrv = Reservation::new();
        assert!(rsrv.tryrdlock());
        assert!(rsrv.tryrdlock());
        let (first, second) = (UserEvent::create(), UserEvent::create());
        rsrv.advise_sleep_entry(&first);
        rsrv.advise_sleep_entry(&second);

        // The first holder is awake before its guard triggers
        rsrv.advise_sleep_exit(&first).unwrap();
        assert_eq!(rsrv.sleeper_count(), 1);
        let awake = rsrv.sleepers_awake();
        assert!(!awake.has_triggered());
        second.trigger().unwrap();
        assert!(awake.has_triggered());
        assert!(!first.event().has_triggered());

        rsrv.advise_sleep_exit(&second).unwrap();
        rsrv.unlock().unwrap();
        rsrv.unlock().unwrap();
    }

    #[test]
    fn test_always_spin_waits_for_release() {
        let rsrv = Arc::new(Reservation::new());
        assert!(rsrv.trylock());
        let remote = rsrv.clone();
        let releaser = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(10));
            remote.unlock().unwrap();
        });
        assert!(!rsrv.wrlock(WaitMode::AlwaysSpin).exists());
        releaser.join().unwrap();
        assert!(rsrv.is_write_locked());
    }

    #[test]
    fn test_release_from_another_thread() {
        let rsrv = Arc::new(Reservation::new());
        assert!(rsrv.trylock());
        let ready = rsrv.wrlock(WaitMode::Wait);

        let remote = rsrv.clone();
        thread::spawn(move || remote.unlock().unwrap()).join().unwrap();
        assert_eq!(ready.external_wait_faultaware(), crate::Poison::Clean);
        assert!(rsrv.trylock());
    }
}
