//! Per-thread task frames
//!
//! Every OS thread owns one [`TaskFrame`] holding the ambient state of the
//! logical task running on it: task context, provenance, debug breadcrumbs,
//! registration-callback mode, deferred-reference tracker and lock guard
//! stack. The content belongs to whichever task currently runs on the thread
//! and is transferred, never shared, at every suspend/resume boundary.

use crate::config::{self, SyncOptions};
use crate::context::ContextRef;
use crate::error::ProtocolViolation;
use crate::guard::GuardStack;
use crate::tracker::ReferenceTracker;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::thread;

/// Identifies where a task's work originated, for profiling
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct ProvenanceId(u64);

impl ProvenanceId {
    /// No provenance recorded
    pub const NONE: ProvenanceId = ProvenanceId(0);

    /// Create a ProvenanceId from a u64 value
    pub fn from_u64(id: u64) -> Self {
        ProvenanceId(id)
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Identifies a kind of task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskKindId(pub u32);

/// Debugging breadcrumbs: which kind of task is running, and who called it
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Breadcrumbs {
    /// Kind of the running task
    pub kind: Option<TaskKindId>,
    /// Kind of the task that launched it
    pub caller: Option<TaskKindId>,
}

/// How the running task registers callbacks with the runtime
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RegistrationCallbackMode {
    /// Not inside a registration callback
    #[default]
    Outside,
    /// Inside a callback that registers with the local process only
    Local,
    /// Inside a callback that registers globally
    Global,
}

/// The ambient fields of a task that survive a blocking call
#[derive(Clone, Default)]
pub struct TaskState {
    /// Scheduler or profiler hooks of the task; `None` on non-task threads
    pub context: Option<ContextRef>,
    /// Provenance of the task
    pub provenance: ProvenanceId,
    /// Debug breadcrumbs
    pub breadcrumbs: Breadcrumbs,
    /// Registration-callback mode
    pub registration: RegistrationCallbackMode,
}

impl TaskState {
    /// State for a task running under `context`
    pub fn with_context(context: ContextRef) -> Self {
        Self {
            context: Some(context),
            ..Self::default()
        }
    }
}

impl fmt::Debug for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskState")
            .field("context", &self.context.as_ref().map(|ctx| ctx.context_id()))
            .field("provenance", &self.provenance)
            .field("breadcrumbs", &self.breadcrumbs)
            .field("registration", &self.registration)
            .finish()
    }
}

/// The full content of a frame, detached for transfer to another thread
#[must_use = "a suspended task is lost unless it is resumed"]
#[derive(Default)]
pub struct SavedFrame {
    state: TaskState,
    tracker: Option<ReferenceTracker>,
    guards: GuardStack,
}

impl SavedFrame {
    /// The saved ambient fields
    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// Number of lock guards travelling with the task
    pub fn guard_count(&self) -> usize {
        self.guards.len()
    }
}

impl fmt::Debug for SavedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SavedFrame")
            .field("state", &self.state)
            .field("tracker", &self.tracker.is_some())
            .field("guards", &self.guards.len())
            .finish()
    }
}

/// Fields saved across a blocking wait
pub(crate) struct WaitSnapshot {
    state: TaskState,
    tracker: Option<ReferenceTracker>,
}

impl WaitSnapshot {
    pub(crate) fn context(&self) -> Option<&ContextRef> {
        self.state.context.as_ref()
    }
}

/// Ambient state of the task running on this OS thread
pub struct TaskFrame {
    context: RefCell<Option<ContextRef>>,
    provenance: Cell<ProvenanceId>,
    breadcrumbs: Cell<Breadcrumbs>,
    registration: Cell<RegistrationCallbackMode>,
    tracker: RefCell<Option<ReferenceTracker>>,
    guards: RefCell<GuardStack>,
    options: Cell<SyncOptions>,
}

thread_local! {
    static CURRENT_FRAME: Rc<TaskFrame> = Rc::new(TaskFrame::new(config::global()));
}

impl TaskFrame {
    /// Create an empty frame
    ///
    /// Most callers want [`TaskFrame::current`]; a standalone frame is only
    /// useful for driving a task by hand.
    pub fn new(options: SyncOptions) -> Self {
        Self {
            context: RefCell::new(None),
            provenance: Cell::new(ProvenanceId::NONE),
            breadcrumbs: Cell::new(Breadcrumbs::default()),
            registration: Cell::new(RegistrationCallbackMode::Outside),
            tracker: RefCell::new(None),
            guards: RefCell::new(GuardStack::default()),
            options: Cell::new(options),
        }
    }

    /// The frame of the calling OS thread
    pub fn current() -> Rc<TaskFrame> {
        CURRENT_FRAME.with(Rc::clone)
    }

    /// Detach the whole frame content, leaving the frame empty
    pub fn suspend(&self) -> SavedFrame {
        let saved = SavedFrame {
            state: self.state(),
            tracker: self.tracker.borrow_mut().take(),
            guards: std::mem::take(&mut *self.guards.borrow_mut()),
        };
        self.install_state(TaskState::default());
        tracing::trace!(guards = saved.guards.len(), "frame suspended");
        saved
    }

    /// Install content previously detached by [`suspend`](Self::suspend)
    pub fn resume(&self, saved: SavedFrame) {
        let guards = self.guards.borrow().len();
        let tracker = self.tracker.borrow().is_some();
        self.check(guards == 0 && !tracker, || ProtocolViolation::FrameOccupied { guards, tracker });
        self.install(saved);
        tracing::trace!(guards = self.lock_depth(), "frame resumed");
    }

    /// Start running a task on this frame, returning the previous occupant
    pub fn enter(&self, state: TaskState) -> SavedFrame {
        let prior = self.suspend();
        self.install_state(state);
        prior
    }

    /// Finish the running task and reinstall the previous occupant
    ///
    /// Flushes the task's reference tracker.
    pub fn exit(&self, prior: SavedFrame) {
        let live = self.guards.borrow().len();
        self.check(live == 0, || ProtocolViolation::GuardsOutlivedTask(live));
        let finished = self.suspend();
        drop(finished);
        self.install(prior);
    }

    /// Run `body` as a task with `state`, restoring the previous occupant
    /// afterwards even if `body` panics
    pub fn run_task<F, R>(&self, state: TaskState, body: F) -> R
    where
        F: FnOnce() -> R,
    {
        struct ExitOnDrop<'a> {
            frame: &'a TaskFrame,
            prior: Option<SavedFrame>,
        }

        impl Drop for ExitOnDrop<'_> {
            fn drop(&mut self) {
                if let Some(prior) = self.prior.take() {
                    self.frame.exit(prior);
                }
            }
        }

        let scope = ExitOnDrop {
            frame: self,
            prior: Some(self.enter(state)),
        };
        let result = body();
        drop(scope);
        result
    }

    /// Snapshot of the ambient fields
    pub fn state(&self) -> TaskState {
        TaskState {
            context: self.context(),
            provenance: self.provenance(),
            breadcrumbs: self.breadcrumbs(),
            registration: self.registration_mode(),
        }
    }

    /// The running task's context
    pub fn context(&self) -> Option<ContextRef> {
        self.context.borrow().clone()
    }

    /// Replace the running task's context
    pub fn set_context(&self, context: Option<ContextRef>) -> Option<ContextRef> {
        self.context.replace(context)
    }

    /// The running task's provenance
    pub fn provenance(&self) -> ProvenanceId {
        self.provenance.get()
    }

    /// Set the running task's provenance
    pub fn set_provenance(&self, provenance: ProvenanceId) {
        self.provenance.set(provenance);
    }

    /// The running task's breadcrumbs
    pub fn breadcrumbs(&self) -> Breadcrumbs {
        self.breadcrumbs.get()
    }

    /// Set the running task's breadcrumbs
    pub fn set_breadcrumbs(&self, breadcrumbs: Breadcrumbs) {
        self.breadcrumbs.set(breadcrumbs);
    }

    /// The running task's registration-callback mode
    pub fn registration_mode(&self) -> RegistrationCallbackMode {
        self.registration.get()
    }

    /// Set the running task's registration-callback mode
    pub fn set_registration_mode(&self, mode: RegistrationCallbackMode) {
        self.registration.set(mode);
    }

    /// This frame's sync options
    pub fn options(&self) -> SyncOptions {
        self.options.get()
    }

    /// Override this frame's sync options
    pub fn set_options(&self, options: SyncOptions) {
        self.options.set(options);
    }

    /// Whether protocol checks run on this frame
    pub fn checks_enabled(&self) -> bool {
        self.options.get().checks.is_checked()
    }

    /// Install a reference tracker, returning any it replaces
    pub fn install_tracker(&self, tracker: ReferenceTracker) -> Option<ReferenceTracker> {
        self.tracker.replace(Some(tracker))
    }

    /// Remove the reference tracker without flushing it
    pub fn take_tracker(&self) -> Option<ReferenceTracker> {
        self.tracker.borrow_mut().take()
    }

    /// Whether a reference tracker is installed
    pub fn has_tracker(&self) -> bool {
        self.tracker.borrow().is_some()
    }

    /// Queue a reference operation on the tracker, creating one if needed
    pub fn defer_reference<F>(&self, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tracker
            .borrow_mut()
            .get_or_insert_with(ReferenceTracker::new)
            .defer(op);
    }

    /// Number of guards currently holding their lock
    pub fn held_locks(&self) -> usize {
        self.guards.borrow().held_count()
    }

    /// Number of guards on the stack, held or not
    pub fn lock_depth(&self) -> usize {
        self.guards.borrow().len()
    }

    pub(crate) fn with_guards<R>(&self, f: impl FnOnce(&mut GuardStack) -> R) -> R {
        f(&mut self.guards.borrow_mut())
    }

    /// Save the ambient fields and clear the tracker slot before blocking
    pub(crate) fn snapshot_for_wait(&self) -> WaitSnapshot {
        WaitSnapshot {
            state: self.state(),
            tracker: self.tracker.borrow_mut().take(),
        }
    }

    /// Detach the guard stack for the length of a wait
    pub(crate) fn detach_guards(&self) -> Option<GuardStack> {
        let mut guards = self.guards.borrow_mut();
        if guards.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *guards))
        }
    }

    pub(crate) fn reattach_guards(&self, detached: GuardStack) {
        let found = self.guards.borrow().len();
        self.check(found == 0, || ProtocolViolation::GuardStackCorrupted(found));
        *self.guards.borrow_mut() = detached;
    }

    /// Restore every snapshotted field after a wait
    pub(crate) fn restore_after_wait(&self, snapshot: WaitSnapshot) {
        let leaked = self.has_tracker();
        self.check(!leaked, || ProtocolViolation::TrackerLeaked);
        let WaitSnapshot { state, tracker } = snapshot;
        self.install_state(state);
        *self.tracker.borrow_mut() = tracker;
    }

    /// Raise `violation` unless `ok` or checks are disabled
    ///
    /// While the thread is already unwinding the violation is only logged.
    pub(crate) fn check<F>(&self, ok: bool, violation: F)
    where
        F: FnOnce() -> ProtocolViolation,
    {
        if ok || !self.checks_enabled() {
            return;
        }
        let violation = violation();
        if thread::panicking() {
            tracing::error!(%violation, "protocol violation during unwind");
            return;
        }
        tracing::error!(%violation, "protocol violation");
        panic!("{violation}");
    }

    fn install_state(&self, state: TaskState) {
        *self.context.borrow_mut() = state.context;
        self.provenance.set(state.provenance);
        self.breadcrumbs.set(state.breadcrumbs);
        self.registration.set(state.registration);
    }

    fn install(&self, saved: SavedFrame) {
        let SavedFrame {
            state,
            tracker,
            guards,
        } = saved;
        self.install_state(state);
        *self.tracker.borrow_mut() = tracker;
        *self.guards.borrow_mut() = guards;
    }
}

impl fmt::Debug for TaskFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFrame")
            .field("state", &self.state())
            .field("tracker", &self.has_tracker())
            .field("guards", &self.lock_depth())
            .field("exclusive", &self.guards.borrow().exclusive_count())
            .finish()
    }
}

/// Scope of a call from task code into the runtime
///
/// Begins by notifying the task context; ending flushes the reference
/// tracker and notifies the context again.
pub struct RuntimeCall<'a> {
    frame: &'a TaskFrame,
}

impl<'a> RuntimeCall<'a> {
    /// Enter the runtime on `frame`
    pub fn begin(frame: &'a TaskFrame) -> Self {
        frame.check(!frame.has_tracker(), || ProtocolViolation::TrackerActiveAtRuntimeCall);
        if let Some(ctx) = frame.context() {
            ctx.begin_runtime_call();
        }
        Self { frame }
    }
}

impl Drop for RuntimeCall<'_> {
    fn drop(&mut self) {
        if let Some(mut tracker) = self.frame.take_tracker() {
            tracker.flush();
        }
        if let Some(ctx) = self.frame.context() {
            ctx.end_runtime_call();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckMode;
    use crate::context::{ProfiledContext, TaskContext};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn frame() -> TaskFrame {
        TaskFrame::new(SyncOptions::default())
    }

    fn state(provenance: u64) -> TaskState {
        TaskState {
            context: Some(Arc::new(ProfiledContext::new())),
            provenance: ProvenanceId::from_u64(provenance),
            breadcrumbs: Breadcrumbs {
                kind: Some(TaskKindId(provenance as u32)),
                caller: None,
            },
            registration: RegistrationCallbackMode::Local,
        }
    }

    #[test]
    fn test_current_is_per_thread() {
        let a = TaskFrame::current();
        let b = TaskFrame::current();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_suspend_resume_round_trip() {
        let frame = frame();
        let _ = frame.enter(state(7));
        frame.defer_reference(|| {});

        let saved = frame.suspend();
        assert_eq!(frame.provenance(), ProvenanceId::NONE);
        assert!(frame.context().is_none());
        assert!(!frame.has_tracker());
        assert_eq!(saved.state().provenance, ProvenanceId::from_u64(7));

        frame.resume(saved);
        assert_eq!(frame.provenance(), ProvenanceId::from_u64(7));
        assert_eq!(frame.registration_mode(), RegistrationCallbackMode::Local);
        assert!(frame.has_tracker());
    }

    #[test]
    #[should_panic(expected = "resume into an occupied frame")]
    fn test_resume_into_occupied_frame() {
        let frame = frame();
        let saved = frame.suspend();
        frame.defer_reference(|| {});
        frame.resume(saved);
    }

    #[test]
    fn test_unchecked_frame_skips_violations() {
        let frame = TaskFrame::new(SyncOptions {
            checks: CheckMode::Unchecked,
            ..SyncOptions::default()
        });
        let saved = frame.suspend();
        frame.defer_reference(|| {});
        frame.resume(saved);
        assert!(!frame.has_tracker());
    }

    #[test]
    fn test_run_task_restores_previous_occupant() {
        let frame = frame();
        frame.set_provenance(ProvenanceId::from_u64(1));
        let inner = frame.run_task(state(2), || frame.provenance());
        assert_eq!(inner, ProvenanceId::from_u64(2));
        assert_eq!(frame.provenance(), ProvenanceId::from_u64(1));
    }

    #[test]
    fn test_run_task_restores_on_panic() {
        let frame = frame();
        frame.set_provenance(ProvenanceId::from_u64(3));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            frame.run_task(state(4), || panic!("task failed"));
        }));
        assert!(result.is_err());
        assert_eq!(frame.provenance(), ProvenanceId::from_u64(3));
    }

    #[test]
    fn test_exit_flushes_tracker() {
        let frame = frame();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        frame.run_task(TaskState::default(), || {
            frame.defer_reference(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(hits.load(Ordering::SeqCst), 0);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_runtime_call_flushes_and_notifies() {
        let frame = frame();
        let ctx = Arc::new(ProfiledContext::with_profiling(true, false));
        frame.set_context(Some(ctx.clone()));
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let _call = RuntimeCall::begin(&frame);
            let counter = hits.clone();
            frame.defer_reference(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!frame.has_tracker());
        assert!(ctx.overhead_times().is_some());
        assert_eq!(ctx.context_id(), frame.context().unwrap().context_id());
    }

    #[test]
    #[should_panic(expected = "runtime call started with a reference tracker already active")]
    fn test_runtime_call_rejects_active_tracker() {
        let frame = frame();
        frame.install_tracker(ReferenceTracker::new());
        let _call = RuntimeCall::begin(&frame);
    }

    #[test]
    fn test_wait_snapshot_restores_fields() {
        let frame = frame();
        let _ = frame.enter(state(9));
        frame.defer_reference(|| {});

        let snapshot = frame.snapshot_for_wait();
        assert!(!frame.has_tracker());
        frame.set_provenance(ProvenanceId::from_u64(100));
        frame.set_registration_mode(RegistrationCallbackMode::Global);

        frame.restore_after_wait(snapshot);
        assert_eq!(frame.provenance(), ProvenanceId::from_u64(9));
        assert_eq!(frame.registration_mode(), RegistrationCallbackMode::Local);
        assert!(frame.has_tracker());
    }

    #[test]
    #[should_panic(expected = "reference tracker leaked across a blocking wait")]
    fn test_tracker_leak_detected() {
        let frame = frame();
        let snapshot = frame.snapshot_for_wait();
        frame.install_tracker(ReferenceTracker::new());
        frame.restore_after_wait(snapshot);
    }
}
