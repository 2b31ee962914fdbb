//! Suspension coordinator
//!
//! Every blocking wait in the runtime funnels through [`suspend_on`]. While
//! the task is parked its OS thread may run unrelated tasks, so the frame is
//! snapshotted before blocking and restored afterwards, and any locks the
//! task holds are advised that their holder is asleep.

use crate::context::{begin_context_wait, end_context_wait, ContextRef};
use crate::frame::TaskFrame;
use tessel_substrate::{CompletionHandle, Poison, UserEvent};

/// Suspend the task on `frame` until `handle` triggers
pub(crate) fn suspend_on(frame: &TaskFrame, handle: &CompletionHandle, from_application: bool) -> Poison {
    if let Some(poison) = handle.has_triggered_faultaware() {
        return poison;
    }

    let snapshot = frame.snapshot_for_wait();
    let context = snapshot.context().cloned();
    tracing::trace!(event = %handle, from_application, held = frame.held_locks(), "task suspending");

    let poison = match frame.detach_guards() {
        Some(guards) => {
            let count = guards.len();
            let done = UserEvent::create();
            guards.advise_sleep_entry(count, &done);
            let poison = blocking_wait(context.as_ref(), handle, from_application);
            guards.advise_sleep_exit(count, &done);
            if let Err(err) = done.trigger() {
                tracing::error!(%err, "sleep guard already triggered");
            }
            frame.reattach_guards(guards);
            poison
        }
        None => blocking_wait(context.as_ref(), handle, from_application),
    };

    frame.restore_after_wait(snapshot);
    tracing::trace!(event = %handle, poisoned = poison.is_poisoned(), "task resumed");
    poison
}

/// Primitive wait bracketed by the context's wait hooks
///
/// Without a context no accounting happens.
fn blocking_wait(context: Option<&ContextRef>, handle: &CompletionHandle, from_application: bool) -> Poison {
    match context {
        Some(ctx) => {
            begin_context_wait(ctx.as_ref(), from_application);
            let poison = handle.wait_faultaware();
            end_context_wait(ctx.as_ref(), from_application);
            poison
        }
        None => handle.wait_faultaware(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncOptions;
    use crate::context::{ContextId, ProfiledContext, TaskContext};
    use crate::frame::{ProvenanceId, TaskState};
    use crate::guard::AutoLock;
    use crate::lock::LocalLock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tessel_substrate::WaitMode;

    fn frame() -> TaskFrame {
        TaskFrame::new(SyncOptions::default())
    }

    fn trigger_later(event: UserEvent) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            event.trigger().unwrap();
        })
    }

    #[test]
    fn test_triggered_handle_skips_hooks() {
        let frame = frame();
        let ctx = Arc::new(ProfiledContext::new());
        frame.set_context(Some(ctx.clone()));

        let event = UserEvent::create();
        event.trigger().unwrap();
        assert_eq!(suspend_on(&frame, &event.event(), false), Poison::Clean);
        assert_eq!(suspend_on(&frame, &CompletionHandle::NO_EVENT, true), Poison::Clean);
        assert_eq!(ctx.wait_count(), 0);
    }

    #[test]
    fn test_wait_brackets_context_hooks() {
        let frame = frame();
        let ctx = Arc::new(ProfiledContext::with_profiling(false, true));
        frame.set_context(Some(ctx.clone()));

        let event = UserEvent::create();
        let waker = trigger_later(event.clone());
        assert_eq!(suspend_on(&frame, &event.event(), true), Poison::Clean);
        waker.join().unwrap();

        assert_eq!(ctx.wait_count(), 1);
        let intervals = ctx.wait_intervals().unwrap();
        assert!(intervals[0].from_application);
        assert!(intervals[0].end.is_some());
    }

    #[test]
    fn test_wait_without_context() {
        let frame = frame();
        let event = UserEvent::create();
        let waker = trigger_later(event.clone());
        assert_eq!(suspend_on(&frame, &event.event(), false), Poison::Clean);
        waker.join().unwrap();
    }

    #[test]
    fn test_poison_is_returned() {
        let frame = frame();
        let event = UserEvent::create();
        let poisoner = {
            let event = event.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                event.poison().unwrap();
            })
        };
        assert_eq!(suspend_on(&frame, &event.event(), true), Poison::Poisoned);
        poisoner.join().unwrap();
    }

    /// Context whose wait hook scribbles over the frame, standing in for an
    /// unrelated task borrowing the thread
    struct Scribbler {
        id: ContextId,
        observed: Arc<parking_lot::Mutex<Option<SnapshotSeen>>>,
    }

    #[derive(Debug, Clone, Copy)]
    struct SnapshotSeen {
        held_during_wait: usize,
    }

    impl TaskContext for Scribbler {
        fn context_id(&self) -> ContextId {
            self.id
        }

        fn begin_wait(&self, _from_application: bool) {
            let frame = TaskFrame::current();
            *self.observed.lock() = Some(SnapshotSeen {
                held_during_wait: frame.held_locks(),
            });
            frame.set_provenance(ProvenanceId::from_u64(999));
            frame.set_context(None);
        }
    }

    #[test]
    fn test_frame_survives_scribbling() {
        let frame = TaskFrame::current();
        let observed = Arc::new(parking_lot::Mutex::new(None));
        let ctx: ContextRef = Arc::new(Scribbler {
            id: ContextId::new(),
            observed: observed.clone(),
        });
        let state = TaskState {
            provenance: ProvenanceId::from_u64(5),
            ..TaskState::with_context(ctx.clone())
        };

        frame.run_task(state, || {
            let lock = LocalLock::with_wait_mode(WaitMode::Wait);
            let _guard = AutoLock::new(&frame, &lock);
            frame.defer_reference(|| {});

            let event = UserEvent::create();
            let waker = trigger_later(event.clone());
            assert_eq!(suspend_on(&frame, &event.event(), false), Poison::Clean);
            waker.join().unwrap();

            assert_eq!(frame.provenance(), ProvenanceId::from_u64(5));
            let restored = frame.context().unwrap();
            assert_eq!(restored.context_id(), ctx.context_id());
            assert!(frame.has_tracker());
            assert_eq!(frame.held_locks(), 1);
            assert_eq!(lock.sleeper_count(), 0);
        });

        // Guards were detached while the task slept
        let seen = observed.lock().take().unwrap();
        assert_eq!(seen.held_during_wait, 0);
    }

    #[test]
    fn test_held_locks_advised_while_sleeping() {
        let frame = frame();
        let lock = Arc::new(LocalLock::with_wait_mode(WaitMode::Wait));
        let _guard = AutoLock::new(&frame, &lock);

        let event = UserEvent::create();
        let observed = Arc::new(AtomicUsize::new(usize::MAX));
        let observer = {
            let lock = lock.clone();
            let observed = observed.clone();
            let event = event.clone();
            thread::spawn(move || {
                while lock.sleeper_count() == 0 {
                    thread::yield_now();
                }
                observed.store(lock.sleeper_count(), Ordering::SeqCst);
                event.trigger().unwrap();
            })
        };

        assert_eq!(suspend_on(&frame, &event.event(), false), Poison::Clean);
        observer.join().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(lock.sleeper_count(), 0);
    }
}
