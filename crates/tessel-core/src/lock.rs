//! Local locks: the runtime's owner of one substrate reservation
//!
//! A `LocalLock` tracks no owner. Who holds it lives only on the guard
//! stacks of the tasks that took it, so the only way to acquire one is
//! through [`AutoLock`](crate::AutoLock) or [`AutoTryLock`](crate::AutoTryLock).

use crate::config;
use crate::event::RtEvent;
use std::fmt;
use std::sync::Arc;
use tessel_substrate::{Reservation, ReservationId, WaitMode};

/// A reader/writer lock taken cooperatively by tasks
pub struct LocalLock {
    reservation: Arc<Reservation>,
    mode: WaitMode,
}

impl LocalLock {
    /// Create a lock using the process-wide default options
    pub fn new() -> Self {
        let options = config::global();
        Self::with_options(options.lock_wait_mode, options.lock_spin_limit)
    }

    /// Create a lock with an explicit wait mode
    pub fn with_wait_mode(mode: WaitMode) -> Self {
        Self::with_options(mode, config::global().lock_spin_limit)
    }

    /// Create a lock with an explicit wait mode and spin budget
    pub fn with_options(mode: WaitMode, spin_limit: u32) -> Self {
        Self {
            reservation: Arc::new(Reservation::with_spin_limit(spin_limit)),
            mode,
        }
    }

    /// Get the lock ID
    pub fn id(&self) -> ReservationId {
        self.reservation.id()
    }

    /// Wait mode used when the lock is contended
    pub fn wait_mode(&self) -> WaitMode {
        self.mode
    }

    /// Whether anyone holds the lock
    pub fn is_locked(&self) -> bool {
        self.reservation.is_write_locked() || self.reservation.reader_count() > 0
    }

    /// Whether an exclusive holder exists
    pub fn is_write_locked(&self) -> bool {
        self.reservation.is_write_locked()
    }

    /// Number of shared holders
    pub fn reader_count(&self) -> usize {
        self.reservation.reader_count()
    }

    /// Number of holders currently blocked in a wait
    pub fn sleeper_count(&self) -> usize {
        self.reservation.sleeper_count()
    }

    /// Request exclusive access; the sentinel means granted
    pub(crate) fn wrlock(&self) -> RtEvent {
        RtEvent::from_handle(self.reservation.wrlock(self.mode))
    }

    /// Request shared access; the sentinel means granted
    pub(crate) fn rdlock(&self) -> RtEvent {
        RtEvent::from_handle(self.reservation.rdlock(self.mode))
    }

    pub(crate) fn trywrlock(&self) -> bool {
        self.reservation.trywrlock()
    }

    pub(crate) fn tryrdlock(&self) -> bool {
        self.reservation.tryrdlock()
    }

    pub(crate) fn unlock(&self) {
        if let Err(err) = self.reservation.unlock() {
            tracing::error!(%err, "local lock release failed");
        }
    }

    /// Event that triggers on the next release
    pub(crate) fn next_release(&self) -> RtEvent {
        RtEvent::from_handle(self.reservation.next_release())
    }

    pub(crate) fn reservation(&self) -> &Arc<Reservation> {
        &self.reservation
    }
}

impl Default for LocalLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LocalLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLock")
            .field("id", &self.id())
            .field("mode", &self.mode)
            .finish()
    }
}
