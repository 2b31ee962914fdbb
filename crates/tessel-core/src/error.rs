//! Protocol violation and configuration errors

use tessel_substrate::ReservationId;

/// Misuse of the lock and suspension protocol
///
/// In checked mode a violation is logged and raised as a panic; in
/// unchecked mode the check is skipped entirely.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    /// A task tried to acquire a lock it already holds
    #[error("lock {0} is already on this task's guard stack")]
    ReentrantAcquire(ReservationId),

    /// A guard released while younger guards were still alive
    #[error("lock {lock} released at guard depth {depth} but the stack top is {top}")]
    OutOfOrderRelease {
        /// Lock being released
        lock: ReservationId,
        /// Stack slot of the releasing guard
        depth: usize,
        /// Current top slot of the stack
        top: usize,
    },

    /// Release on a guard that does not hold its lock
    #[error("lock {0} released without being held")]
    ReleaseWithoutHold(ReservationId),

    /// Reacquire on a guard that already holds its lock
    #[error("lock {0} reacquired while already held")]
    ReacquireWhileHeld(ReservationId),

    /// Reacquire on a guard that is no longer the stack top
    #[error("lock {lock} reacquired at guard depth {depth} but the stack holds {len} guards")]
    OutOfOrderReacquire {
        /// Lock being reacquired
        lock: ReservationId,
        /// Stack slot of the reacquiring guard
        depth: usize,
        /// Current stack length
        len: usize,
    },

    /// A detached guard stack came back to a frame that gained guards
    #[error("guard stack reattached over {0} guards installed during a wait")]
    GuardStackCorrupted(usize),

    /// A reference tracker was installed across a blocking wait
    #[error("reference tracker leaked across a blocking wait")]
    TrackerLeaked,

    /// A task finished with guards still on its stack
    #[error("task exited with {0} live lock guards")]
    GuardsOutlivedTask(usize),

    /// Resume into a frame whose previous task never suspended
    #[error("resume into an occupied frame ({guards} guards, tracker: {tracker})")]
    FrameOccupied {
        /// Guards found on the frame
        guards: usize,
        /// Whether a tracker was found on the frame
        tracker: bool,
    },

    /// A runtime call began while a reference tracker was active
    #[error("runtime call started with a reference tracker already active")]
    TrackerActiveAtRuntimeCall,
}

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A setting could not be parsed
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Setting name
        key: &'static str,
        /// Rejected value
        value: String,
    },
}
