//! Running task bodies on a processor group

use crate::event::{ApEvent, ApUserEvent};
use crate::frame::{TaskFrame, TaskState};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tessel_substrate::{Poison, ProcessorConfig, ProcessorGroup, SubstrateResult};

/// Launches task bodies onto worker threads, each inside its own frame state
pub struct TaskLauncher {
    group: ProcessorGroup,
}

impl TaskLauncher {
    /// Start a processor group and launch onto it
    pub fn start(config: ProcessorConfig) -> SubstrateResult<Self> {
        Ok(Self::new(ProcessorGroup::new(config)?))
    }

    /// Launch onto an existing group
    pub fn new(group: ProcessorGroup) -> Self {
        Self { group }
    }

    /// The underlying processor group
    pub fn group(&self) -> &ProcessorGroup {
        &self.group
    }

    /// Run `body` as a task with `state`
    ///
    /// The returned event triggers when the body returns. It triggers
    /// poisoned if the body panics or the group drops the job unrun.
    pub fn launch<F>(&self, state: TaskState, body: F) -> ApEvent
    where
        F: FnOnce() + Send + 'static,
    {
        let done = Completion::new();
        let completion = done.event();
        self.group.spawn(move || run_launched(state, body, done));
        completion
    }

    /// Run `body` once `precondition` triggers
    ///
    /// A poisoned precondition skips the body and poisons the result.
    pub fn launch_after<F>(&self, precondition: &ApEvent, state: TaskState, body: F) -> ApEvent
    where
        F: FnOnce() + Send + 'static,
    {
        let done = Completion::new();
        let completion = done.event();
        let spawner = self.group.spawner();
        precondition.handle().on_trigger(move |poison| {
            if poison.is_poisoned() {
                tracing::debug!(event = %done.event(), "precondition poisoned, task skipped");
                done.finish(Poison::Poisoned);
                return;
            }
            spawner.spawn(move || run_launched(state, body, done));
        });
        completion
    }

    /// Stop the processor group
    pub fn shutdown(&mut self) {
        self.group.shutdown();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

/// A task's completion event, poisoned if dropped before it fires
///
/// A job the processor group drops without running, whether rejected after
/// shutdown or still queued when workers stop, takes this with it.
struct Completion {
    event: Option<ApUserEvent>,
}

impl Completion {
    fn new() -> Self {
        Self {
            event: Some(ApUserEvent::create()),
        }
    }

    fn event(&self) -> ApEvent {
        self.event.as_ref().map_or(ApEvent::NO_AP_EVENT, ApUserEvent::event)
    }

    fn finish(mut self, poison: Poison) {
        if let Some(event) = self.event.take() {
            fire(&event, poison);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            tracing::warn!(event = %event, "task dropped without running, poisoning its completion");
            fire(&event, Poison::Poisoned);
        }
    }
}

fn fire(event: &ApUserEvent, poison: Poison) {
    let fired = match poison {
        Poison::Clean => event.trigger(),
        Poison::Poisoned => event.poison(),
    };
    if let Err(err) = fired {
        tracing::error!(%err, "task completion already triggered");
    }
}

fn run_launched<F>(state: TaskState, body: F, done: Completion)
where
    F: FnOnce(),
{
    let frame = TaskFrame::current();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| frame.run_task(state, body)));
    match outcome {
        Ok(()) => done.finish(Poison::Clean),
        Err(payload) => {
            tracing::warn!(
                event = %done.event(),
                panic = panic_message(payload.as_ref()),
                "task panicked, poisoning its completion"
            );
            done.finish(Poison::Poisoned);
        }
    }
}
