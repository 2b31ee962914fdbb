//! Task contexts and blocked-time accounting

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Unique identifier for a task context
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ContextId {
    /// Create a new unique ContextId
    pub fn new() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Hooks a running task exposes to the synchronization core
///
/// Implemented by schedulers and profilers. Every hook defaults to a no-op.
pub trait TaskContext: Send + Sync {
    /// Identity of this context
    fn context_id(&self) -> ContextId;

    /// The task is about to block
    fn begin_wait(&self, _from_application: bool) {}

    /// The task has resumed after blocking
    fn end_wait(&self, _from_application: bool) {}

    /// The task entered the runtime
    fn begin_runtime_call(&self) {}

    /// The task returned from the runtime
    fn end_runtime_call(&self) {}
}

/// Shared reference to a task context
pub type ContextRef = Arc<dyn TaskContext>;

/// Notify `ctx` that its task is about to block
pub fn begin_context_wait(ctx: &dyn TaskContext, from_application: bool) {
    tracing::trace!(context = %ctx.context_id(), from_application, "context wait begin");
    ctx.begin_wait(from_application);
}

/// Notify `ctx` that its task has resumed
pub fn end_context_wait(ctx: &dyn TaskContext, from_application: bool) {
    ctx.end_wait(from_application);
    tracing::trace!(context = %ctx.context_id(), from_application, "context wait end");
}

/// Time split recorded by the overhead profiler
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct OverheadTimes {
    /// Time spent running application code
    pub application: Duration,
    /// Time spent inside runtime calls
    pub runtime: Duration,
    /// Time spent blocked
    pub wait: Duration,
}

/// One blocking interval recorded by the implicit profiler
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WaitInterval {
    /// When the task blocked
    pub start: Instant,
    /// When the task resumed; `None` while still blocked
    pub end: Option<Instant>,
    /// Whether the wait was on an application event
    pub from_application: bool,
}

impl WaitInterval {
    /// Length of the interval, if it has ended
    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end.saturating_duration_since(self.start))
    }
}

struct OverheadState {
    times: OverheadTimes,
    previous: Instant,
    inside_runtime_call: bool,
}

impl OverheadState {
    /// Charge the time since the last mark to application or runtime
    fn charge_running(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.previous);
        if self.inside_runtime_call {
            self.times.runtime += elapsed;
        } else {
            self.times.application += elapsed;
        }
        self.previous = now;
    }
}

/// A task context that records where its task spends time
pub struct ProfiledContext {
    id: ContextId,
    waits: AtomicUsize,
    overhead: Option<Mutex<OverheadState>>,
    implicit: Option<Mutex<Vec<WaitInterval>>>,
}

impl ProfiledContext {
    /// A context that only counts waits
    pub fn new() -> Self {
        Self::with_profiling(false, false)
    }

    /// A context with the selected profilers enabled
    pub fn with_profiling(overhead: bool, implicit: bool) -> Self {
        Self {
            id: ContextId::new(),
            waits: AtomicUsize::new(0),
            overhead: overhead.then(|| {
                Mutex::new(OverheadState {
                    times: OverheadTimes::default(),
                    previous: Instant::now(),
                    inside_runtime_call: false,
                })
            }),
            implicit: implicit.then(|| Mutex::new(Vec::new())),
        }
    }

    /// Number of waits begun on this context
    pub fn wait_count(&self) -> usize {
        self.waits.load(Ordering::Acquire)
    }

    /// Overhead split so far, if the overhead profiler is enabled
    pub fn overhead_times(&self) -> Option<OverheadTimes> {
        self.overhead.as_ref().map(|state| state.lock().times)
    }

    /// Recorded wait intervals, if the implicit profiler is enabled
    pub fn wait_intervals(&self) -> Option<Vec<WaitInterval>> {
        self.implicit.as_ref().map(|waits| waits.lock().clone())
    }
}

impl Default for ProfiledContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskContext for ProfiledContext {
    fn context_id(&self) -> ContextId {
        self.id
    }

    fn begin_wait(&self, from_application: bool) {
        self.waits.fetch_add(1, Ordering::AcqRel);
        let now = Instant::now();
        if let Some(overhead) = &self.overhead {
            overhead.lock().charge_running(now);
        }
        if let Some(implicit) = &self.implicit {
            implicit.lock().push(WaitInterval {
                start: now,
                end: None,
                from_application,
            });
        }
    }

    fn end_wait(&self, _from_application: bool) {
        let now = Instant::now();
        if let Some(overhead) = &self.overhead {
            let mut state = overhead.lock();
            let elapsed = now.saturating_duration_since(state.previous);
            state.times.wait += elapsed;
            state.previous = now;
        }
        if let Some(implicit) = &self.implicit {
            if let Some(last) = implicit.lock().last_mut() {
                last.end = Some(now);
            }
        }
    }

    fn begin_runtime_call(&self) {
        if let Some(overhead) = &self.overhead {
            let mut state = overhead.lock();
            state.charge_running(Instant::now());
            state.inside_runtime_call = true;
        }
    }

    fn end_runtime_call(&self) {
        if let Some(overhead) = &self.overhead {
            let mut state = overhead.lock();
            state.charge_running(Instant::now());
            state.inside_runtime_call = false;
        }
    }
}

impl fmt::Debug for ProfiledContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfiledContext")
            .field("id", &self.id)
            .field("waits", &self.wait_count())
            .finish()
    }
}
