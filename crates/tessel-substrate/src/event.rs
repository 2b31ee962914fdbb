//! Single-trigger completion handles and user events
//!
//! A [`CompletionHandle`] is the substrate's opaque asynchronous signal. It
//! triggers exactly once, may be observed by any number of waiters, and
//! carries an independent poison bit describing whether the operation it
//! tracks failed. Handles are cheap to clone; the default handle is the
//! "no event" sentinel, which counts as already triggered.

use crate::error::{SubstrateError, SubstrateResult};
use crate::id::EventId;
use crate::processor;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Whether an observed completion carried an upstream failure
#[must_use = "poison must be inspected by the caller"]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Poison {
    /// The upstream operation succeeded
    #[default]
    Clean,
    /// The upstream operation failed
    Poisoned,
}

impl Poison {
    /// Build from a raw poison flag
    pub fn from_flag(poisoned: bool) -> Self {
        if poisoned {
            Poison::Poisoned
        } else {
            Poison::Clean
        }
    }

    /// Check whether the completion was poisoned
    pub fn is_poisoned(self) -> bool {
        self == Poison::Poisoned
    }

    /// Combine two observations; poison wins
    pub fn merge(self, other: Poison) -> Poison {
        Poison::from_flag(self.is_poisoned() || other.is_poisoned())
    }
}

pub(crate) type TriggerCallback = Box<dyn FnOnce(Poison) + Send>;

struct EventStatus {
    outcome: Option<Poison>,
    subscribed: bool,
    callbacks: Vec<TriggerCallback>,
}

/// Shared state behind a live completion handle
pub(crate) struct EventCore {
    id: EventId,
    status: Mutex<EventStatus>,
    cond: Condvar,
}

impl EventCore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: EventId::next(),
            status: Mutex::new(EventStatus {
                outcome: None,
                subscribed: false,
                callbacks: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn id(&self) -> EventId {
        self.id
    }

    pub(crate) fn outcome(&self) -> Option<Poison> {
        self.status.lock().outcome
    }

    /// Trigger the event, waking blocked threads and running callbacks
    pub(crate) fn trigger(&self, poison: Poison) -> SubstrateResult<()> {
        let callbacks = {
            let mut status = self.status.lock();
            if status.outcome.is_some() {
                return Err(SubstrateError::AlreadyTriggered(self.id));
            }
            status.outcome = Some(poison);
            std::mem::take(&mut status.callbacks)
        };
        self.cond.notify_all();
        tracing::trace!(event = %self.id, poisoned = poison.is_poisoned(), "event triggered");
        for callback in callbacks {
            callback(poison);
        }
        Ok(())
    }

    /// Run `callback` once the event triggers (immediately if it already has)
    pub(crate) fn on_trigger(&self, callback: TriggerCallback) {
        let mut status = self.status.lock();
        let outcome = status.outcome;
        match outcome {
            Some(poison) => {
                drop(status);
                callback(poison);
            }
            None => status.callbacks.push(callback),
        }
    }

    /// Block the calling OS thread until the event triggers
    pub(crate) fn block(&self) -> Poison {
        let mut status = self.status.lock();
        loop {
            if let Some(poison) = status.outcome {
                return poison;
            }
            self.cond.wait(&mut status);
        }
    }

    /// Block for at most `timeout`, returning the outcome if triggered
    pub(crate) fn block_for(&self, timeout: Duration) -> Option<Poison> {
        let mut status = self.status.lock();
        if status.outcome.is_none() {
            self.cond.wait_for(&mut status, timeout);
        }
        status.outcome
    }

    fn subscribe(&self) {
        self.status.lock().subscribed = true;
    }

    fn is_subscribed(&self) -> bool {
        self.status.lock().subscribed
    }
}

/// Opaque single-trigger asynchronous signal
#[derive(Clone, Default)]
pub struct CompletionHandle {
    core: Option<Arc<EventCore>>,
}

impl CompletionHandle {
    /// The "no event" sentinel; always counts as triggered and clean
    pub const NO_EVENT: CompletionHandle = CompletionHandle { core: None };

    pub(crate) fn from_core(core: Arc<EventCore>) -> Self {
        Self { core: Some(core) }
    }

    /// A handle that has already triggered poisoned
    pub fn poisoned() -> Self {
        let core = EventCore::new();
        // A fresh core cannot have triggered yet
        let _ = core.trigger(Poison::Poisoned);
        Self::from_core(core)
    }

    /// Whether this handle refers to a real event
    pub fn exists(&self) -> bool {
        self.core.is_some()
    }

    /// Identity of the event ([`EventId::NONE`] for the sentinel)
    pub fn id(&self) -> EventId {
        self.core.as_ref().map_or(EventId::NONE, |core| core.id())
    }

    /// Poison-ignorant trigger test
    ///
    /// A poisoned event reads as triggered; the poison is logged and dropped.
    pub fn has_triggered(&self) -> bool {
        match self.has_triggered_faultaware() {
            Some(Poison::Poisoned) => {
                tracing::warn!(event = %self.id(), "poisoned event observed without fault awareness");
                true
            }
            Some(Poison::Clean) => true,
            None => false,
        }
    }

    /// Trigger test that reports poison; `None` while pending
    pub fn has_triggered_faultaware(&self) -> Option<Poison> {
        match &self.core {
            Some(core) => core.outcome(),
            None => Some(Poison::Clean),
        }
    }

    /// Wait for the event, ignoring poison
    ///
    /// On a processor worker this may run other queued jobs while parked.
    pub fn wait(&self) {
        if self.wait_faultaware().is_poisoned() {
            tracing::warn!(event = %self.id(), "poisoned event observed without fault awareness");
        }
    }

    /// Wait for the event and report its poison
    pub fn wait_faultaware(&self) -> Poison {
        let Some(core) = &self.core else {
            return Poison::Clean;
        };
        if let Some(poison) = core.outcome() {
            return poison;
        }
        processor::park(core)
    }

    /// Wait from a thread that is not a processor worker, ignoring poison
    pub fn external_wait(&self) {
        if self.external_wait_faultaware().is_poisoned() {
            tracing::warn!(event = %self.id(), "poisoned event observed without fault awareness");
        }
    }

    /// Wait from a thread that is not a processor worker
    pub fn external_wait_faultaware(&self) -> Poison {
        match &self.core {
            Some(core) => core.block(),
            None => Poison::Clean,
        }
    }

    /// Request that the trigger be made visible to this process
    ///
    /// Every event is local here, so the request only marks the handle as
    /// subscribed.
    pub fn subscribe(&self) {
        if let Some(core) = &self.core {
            core.subscribe();
        }
    }

    /// Whether [`subscribe`](Self::subscribe) has been called on this event
    pub fn is_subscribed(&self) -> bool {
        self.core.as_ref().is_some_and(|core| core.is_subscribed())
    }

    /// Run `callback` once the event triggers
    ///
    /// Runs immediately on the calling thread if the event has already
    /// triggered, otherwise on the thread that triggers it.
    pub fn on_trigger<F>(&self, callback: F)
    where
        F: FnOnce(Poison) + Send + 'static,
    {
        match &self.core {
            Some(core) => core.on_trigger(Box::new(callback)),
            None => callback(Poison::Clean),
        }
    }

    /// An event that triggers once every input has triggered
    ///
    /// The result is poisoned if any input was poisoned. If every input has
    /// already triggered clean, the sentinel is returned.
    pub fn merge<I>(events: I) -> CompletionHandle
    where
        I: IntoIterator<Item = CompletionHandle>,
    {
        let mut poison = Poison::Clean;
        let mut pending = Vec::new();
        for event in events {
            if let Some(core) = event.core {
                match core.outcome() {
                    Some(observed) => poison = poison.merge(observed),
                    None => pending.push(core),
                }
            }
        }

        if pending.is_empty() {
            return match poison {
                Poison::Clean => CompletionHandle::NO_EVENT,
                Poison::Poisoned => CompletionHandle::poisoned(),
            };
        }
        if pending.len() == 1 && !poison.is_poisoned() {
            return Self::from_core(pending.remove(0));
        }

        let merged = EventCore::new();
        let remaining = Arc::new(AtomicUsize::new(pending.len()));
        let poisoned = Arc::new(AtomicBool::new(poison.is_poisoned()));
        for core in pending {
            let merged = merged.clone();
            let remaining = remaining.clone();
            let poisoned = poisoned.clone();
            core.on_trigger(Box::new(move |observed| {
                if observed.is_poisoned() {
                    poisoned.store(true, Ordering::Release);
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let outcome = Poison::from_flag(poisoned.load(Ordering::Acquire));
                    // Only the last input reaches this point
                    let _ = merged.trigger(outcome);
                }
            }));
        }
        Self::from_core(merged)
    }

    /// An event that triggers clean when this one triggers, poisoned or not
    pub fn ignorefaults(&self) -> CompletionHandle {
        let Some(core) = &self.core else {
            return CompletionHandle::NO_EVENT;
        };
        if core.outcome().is_some() {
            return CompletionHandle::NO_EVENT;
        }
        let shielded = EventCore::new();
        let target = shielded.clone();
        core.on_trigger(Box::new(move |_| {
            let _ = target.trigger(Poison::Clean);
        }));
        Self::from_core(shielded)
    }
}

impl PartialEq for CompletionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for CompletionHandle {}

impl Hash for CompletionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompletionHandle").field(&self.id()).finish()
    }
}

impl fmt::Display for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id(), f)
    }
}

/// A completion handle triggered explicitly by its creator
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct UserEvent {
    handle: CompletionHandle,
}

impl UserEvent {
    /// The "no user event" sentinel
    pub const NO_USER_EVENT: UserEvent = UserEvent {
        handle: CompletionHandle::NO_EVENT,
    };

    /// Create a new untriggered user event
    pub fn create() -> Self {
        Self {
            handle: CompletionHandle::from_core(EventCore::new()),
        }
    }

    /// The completion handle observers wait on
    pub fn event(&self) -> CompletionHandle {
        self.handle.clone()
    }

    /// Borrow the completion handle
    pub fn as_handle(&self) -> &CompletionHandle {
        &self.handle
    }

    /// Whether this refers to a real event
    pub fn exists(&self) -> bool {
        self.handle.exists()
    }

    /// Identity of the event
    pub fn id(&self) -> EventId {
        self.handle.id()
    }

    /// Trigger the event clean
    pub fn trigger(&self) -> SubstrateResult<()> {
        self.fire(Poison::Clean)
    }

    /// Trigger the event poisoned
    pub fn poison(&self) -> SubstrateResult<()> {
        self.fire(Poison::Poisoned)
    }

    /// Trigger once `precondition` triggers, inheriting its poison
    pub fn trigger_after(&self, precondition: &CompletionHandle) -> SubstrateResult<()> {
        let core = self.handle.core.clone().ok_or(SubstrateError::NoEvent)?;
        precondition.on_trigger(move |poison| {
            if let Err(err) = core.trigger(poison) {
                tracing::warn!(%err, "deferred trigger dropped");
            }
        });
        Ok(())
    }

    fn fire(&self, poison: Poison) -> SubstrateResult<()> {
        match &self.handle.core {
            Some(core) => core.trigger(poison),
            None => Err(SubstrateError::NoEvent),
        }
    }
}
