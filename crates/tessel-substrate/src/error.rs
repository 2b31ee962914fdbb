//! Substrate error types

use crate::id::{BarrierId, EventId, ReservationId};

/// Errors reported by substrate primitives
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    /// A user event was triggered a second time
    #[error("event {0} has already triggered")]
    AlreadyTriggered(EventId),

    /// Trigger or arrival attempted on a "no event" sentinel
    #[error("operation on a no-event sentinel")]
    NoEvent,

    /// Unlock called on a reservation nobody holds
    #[error("reservation {0} is not held")]
    NotHeld(ReservationId),

    /// Sleep exit advised without a matching sleep entry
    #[error("reservation {0} has no sleeping holder")]
    NoSleeper(ReservationId),

    /// Barrier created with zero expected arrivals
    #[error("barrier requires a positive arrival count, got {0}")]
    InvalidArrivalCount(usize),

    /// Arrival for a phase that has already completed
    #[error("barrier {barrier} phase {generation} has already completed")]
    PhaseComplete {
        /// Barrier identity
        barrier: BarrierId,
        /// Phase the arrival referenced
        generation: u64,
    },

    /// More arrivals than the phase still expects
    #[error("barrier {barrier} phase {generation}: {count} arrivals exceed the {remaining} remaining")]
    ArrivalOverflow {
        /// Barrier identity
        barrier: BarrierId,
        /// Phase the arrival referenced
        generation: u64,
        /// Arrivals requested
        count: usize,
        /// Arrivals the phase still expected
        remaining: usize,
    },

    /// Operation on a destroyed barrier
    #[error("barrier {0} has been destroyed")]
    BarrierDestroyed(BarrierId),

    /// Worker thread could not be spawned
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result alias for substrate operations
pub type SubstrateResult<T> = Result<T, SubstrateError>;
