//! Typed event wrappers
//!
//! Every runtime event is a substrate [`CompletionHandle`] tagged with what
//! it means:
//! - [`ApEvent`]: application-visible; may be poisoned by a failed upstream
//!   task, so only fault-aware observation (or an explicit opt-out) exists
//! - [`RtEvent`]: runtime-internal; never expected to carry poison
//! - [`PredEvent`]: predicate resolution
//!
//! Each family has a user-triggered variant and, for application and runtime
//! events, a barrier variant. Waits go through the suspension coordinator on
//! the calling thread's task frame.

use crate::frame::TaskFrame;
use crate::wait;
use std::fmt;
use std::sync::Arc;
use tessel_substrate::{
    Barrier, CompletionHandle, EventId, Poison, ReductionOp, SubstrateResult, UserEvent,
};

macro_rules! event_type {
    ($(#[$meta:meta])* $name:ident, $sentinel:ident, from_application = $from_app:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
        pub struct $name {
            handle: CompletionHandle,
        }

        impl $name {
            /// The "no event" sentinel; always counts as triggered
            pub const $sentinel: $name = $name {
                handle: CompletionHandle::NO_EVENT,
            };

            /// Wrap a substrate handle
            pub fn from_handle(handle: CompletionHandle) -> Self {
                Self { handle }
            }

            /// Whether this refers to a real event
            pub fn exists(&self) -> bool {
                self.handle.exists()
            }

            /// Identity of the event
            pub fn id(&self) -> EventId {
                self.handle.id()
            }

            /// Borrow the substrate handle
            pub fn handle(&self) -> &CompletionHandle {
                &self.handle
            }

            /// Unwrap the substrate handle
            pub fn into_handle(self) -> CompletionHandle {
                self.handle
            }

            /// Make the trigger visible to this process
            pub fn subscribe(&self) {
                self.handle.subscribe();
            }

            /// Trigger test reporting poison; `None` while pending
            pub fn has_triggered_faultaware(&self) -> Option<Poison> {
                self.handle.has_triggered_faultaware()
            }

            /// Suspend the running task until the event triggers
            pub fn wait_faultaware(&self) -> Poison {
                wait::suspend_on(&TaskFrame::current(), &self.handle, $from_app)
            }

            /// An event that triggers once every input has triggered
            pub fn merge<I>(events: I) -> Self
            where
                I: IntoIterator<Item = $name>,
            {
                Self::from_handle(CompletionHandle::merge(
                    events.into_iter().map(Self::into_handle),
                ))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.handle, f)
            }
        }
    };
}

event_type!(
    /// Application-visible event that may carry poison
    ApEvent,
    NO_AP_EVENT,
    from_application = true
);

event_type!(
    /// Runtime-internal event
    RtEvent,
    NO_RT_EVENT,
    from_application = false
);

event_type!(
    /// Predicate resolution event
    PredEvent,
    NO_PRED_EVENT,
    from_application = false
);

impl ApEvent {
    /// Trigger test that deliberately discards poison
    pub fn has_triggered_faultignorant(&self) -> bool {
        self.handle.has_triggered_faultaware().is_some()
    }

    /// Wait that deliberately discards poison
    pub fn wait_faultignorant(&self) {
        let _ = self.wait_faultaware();
    }

    /// A runtime event that triggers when this one does, poisoned or not
    pub fn protect(&self) -> RtEvent {
        RtEvent::from_handle(self.handle.ignorefaults())
    }
}

fn warn_poison(event: &CompletionHandle, poison: Poison) {
    if poison.is_poisoned() {
        tracing::warn!(%event, "poisoned event observed without fault awareness");
    }
}

impl RtEvent {
    /// Trigger test; poison is logged and dropped
    pub fn has_triggered(&self) -> bool {
        self.handle.has_triggered()
    }

    /// Suspend the running task until the event triggers
    pub fn wait(&self) {
        let poison = self.wait_faultaware();
        warn_poison(&self.handle, poison);
    }

    /// Block the OS thread, bypassing the task frame
    pub fn external_wait(&self) {
        self.handle.external_wait();
    }
}

impl PredEvent {
    /// Trigger test; poison is logged and dropped
    pub fn has_triggered(&self) -> bool {
        self.handle.has_triggered()
    }

    /// Suspend the running task until the predicate resolves
    pub fn wait(&self) {
        let poison = self.wait_faultaware();
        warn_poison(&self.handle, poison);
    }
}

impl From<PredEvent> for ApEvent {
    fn from(event: PredEvent) -> Self {
        ApEvent::from_handle(event.handle)
    }
}

impl From<PredEvent> for RtEvent {
    fn from(event: PredEvent) -> Self {
        RtEvent::from_handle(event.handle)
    }
}

macro_rules! user_event_type {
    ($(#[$meta:meta])* $name:ident, $sentinel:ident, $event:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
        pub struct $name {
            inner: UserEvent,
        }

        impl $name {
            /// The "no user event" sentinel
            pub const $sentinel: $name = $name {
                inner: UserEvent::NO_USER_EVENT,
            };

            /// Create a new untriggered event
            pub fn create() -> Self {
                Self {
                    inner: UserEvent::create(),
                }
            }

            /// Whether this refers to a real event
            pub fn exists(&self) -> bool {
                self.inner.exists()
            }

            /// Identity of the event
            pub fn id(&self) -> EventId {
                self.inner.id()
            }

            /// The event observers wait on
            pub fn event(&self) -> $event {
                $event::from_handle(self.inner.event())
            }

            /// Trigger clean
            pub fn trigger(&self) -> SubstrateResult<()> {
                self.inner.trigger()
            }

            /// Trigger poisoned
            pub fn poison(&self) -> SubstrateResult<()> {
                self.inner.poison()
            }

            /// Trigger once `precondition` triggers, inheriting its poison
            pub fn trigger_after(&self, precondition: &$event) -> SubstrateResult<()> {
                self.inner.trigger_after(precondition.handle())
            }

            /// Borrow the substrate user event
            pub fn as_user_event(&self) -> &UserEvent {
                &self.inner
            }
        }

        impl From<$name> for $event {
            fn from(event: $name) -> Self {
                event.event()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.inner.id(), f)
            }
        }
    };
}

user_event_type!(
    /// Application event triggered by its creator
    ApUserEvent,
    NO_AP_USER_EVENT,
    ApEvent
);

user_event_type!(
    /// Runtime event triggered by its creator
    RtUserEvent,
    NO_RT_USER_EVENT,
    RtEvent
);

user_event_type!(
    /// Predicate event resolved by its creator
    PredUserEvent,
    NO_PRED_USER_EVENT,
    PredEvent
);

macro_rules! barrier_type {
    ($(#[$meta:meta])* $name:ident, $sentinel:ident, $event:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
        pub struct $name {
            barrier: Barrier,
        }

        impl $name {
            /// The "no barrier" sentinel
            pub const $sentinel: $name = $name {
                barrier: Barrier::NO_BARRIER,
            };

            /// Create a barrier expecting `expected` arrivals per phase
            pub fn create(expected: usize) -> SubstrateResult<Self> {
                Barrier::create(expected).map(Self::from_barrier)
            }

            /// Create a barrier whose phases fold arrival values with `op`
            pub fn create_with_reduction(
                expected: usize,
                op: Arc<dyn ReductionOp>,
            ) -> SubstrateResult<Self> {
                Barrier::create_with_reduction(expected, op).map(Self::from_barrier)
            }

            /// Wrap a substrate barrier phase
            pub fn from_barrier(barrier: Barrier) -> Self {
                Self { barrier }
            }

            /// Borrow the substrate barrier phase
            pub fn barrier(&self) -> &Barrier {
                &self.barrier
            }

            /// Whether this refers to a real barrier
            pub fn exists(&self) -> bool {
                self.barrier.exists()
            }

            /// Phase this handle names
            pub fn timestamp(&self) -> u64 {
                self.barrier.timestamp()
            }

            /// Event for this phase
            pub fn event(&self) -> $event {
                $event::from_handle(self.barrier.phase_event())
            }

            /// Arrive `count` times at this phase
            pub fn arrive(&self, count: usize) -> SubstrateResult<()> {
                self.barrier.arrive(count)
            }

            /// Arrive and contribute to the phase's reduction
            pub fn arrive_with_value(&self, count: usize, value: &[u8]) -> SubstrateResult<()> {
                self.barrier.arrive_with_value(count, value)
            }

            /// Handle for the next phase
            pub fn advance(&self) -> Self {
                Self::from_barrier(self.barrier.advance())
            }

            /// Handle for the phase before this one
            pub fn get_previous_phase(&self) -> Self {
                Self::from_barrier(self.barrier.get_previous_phase())
            }

            /// Handle for the first phase that has not completed
            pub fn current_phase(&self) -> Self {
                Self::from_barrier(self.barrier.current_phase())
            }

            /// Copy this completed phase's reduction result into `buf`
            pub fn get_result(&self, buf: &mut [u8]) -> bool {
                self.barrier.get_result(buf)
            }

            /// Destroy the barrier
            pub fn destroy(&self) -> SubstrateResult<()> {
                self.barrier.destroy()
            }

            /// Make this phase's trigger visible to this process
            pub fn subscribe(&self) {
                self.barrier.phase_event().subscribe();
            }

            /// Trigger test reporting poison; `None` while pending
            pub fn has_triggered_faultaware(&self) -> Option<Poison> {
                self.event().has_triggered_faultaware()
            }

            /// Suspend the running task until this phase completes
            pub fn wait_faultaware(&self) -> Poison {
                self.event().wait_faultaware()
            }
        }

        impl From<$name> for $event {
            fn from(barrier: $name) -> Self {
                barrier.event()
            }
        }
    };
}

barrier_type!(
    /// Application barrier phase
    ApBarrier,
    NO_AP_BARRIER,
    ApEvent
);

barrier_type!(
    /// Runtime barrier phase
    RtBarrier,
    NO_RT_BARRIER,
    RtEvent
);

impl ApBarrier {
    /// Trigger test that deliberately discards poison
    pub fn has_triggered_faultignorant(&self) -> bool {
        self.event().has_triggered_faultignorant()
    }

    /// Wait that deliberately discards poison
    pub fn wait_faultignorant(&self) {
        self.event().wait_faultignorant();
    }
}

impl RtBarrier {
    /// Trigger test for this phase
    pub fn has_triggered(&self) -> bool {
        self.event().has_triggered()
    }

    /// Suspend the running task until this phase completes
    pub fn wait(&self) {
        self.event().wait();
    }
}
