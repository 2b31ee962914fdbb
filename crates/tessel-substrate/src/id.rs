//! Unique identifiers for substrate objects

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a completion handle
///
/// Zero is reserved for the "no event" sentinel; live events start at one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

impl EventId {
    /// Identity carried by every "no event" sentinel
    pub const NONE: EventId = EventId(0);

    pub(crate) fn next() -> Self {
        EventId(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create an EventId from a u64 value
    pub fn from_u64(id: u64) -> Self {
        EventId(id)
    }

    /// Whether this is the sentinel identity
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ev{:x}", self.0)
    }
}

/// Unique identifier for a Reservation
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationId(u64);

static NEXT_RESERVATION_ID: AtomicU64 = AtomicU64::new(1);

impl ReservationId {
    pub(crate) fn next() -> Self {
        ReservationId(NEXT_RESERVATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rsrv{:x}", self.0)
    }
}

/// Unique identifier for a Barrier
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BarrierId(u64);

static NEXT_BARRIER_ID: AtomicU64 = AtomicU64::new(1);

impl BarrierId {
    pub(crate) fn next() -> Self {
        BarrierId(NEXT_BARRIER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bar{:x}", self.0)
    }
}
