//! Processor groups: a work-stealing pool of worker threads
//!
//! Each worker owns a LIFO deque. Idle workers pop locally, then steal
//! from a random peer, then take from the group's global injector. A worker
//! parked on a pending completion handle can optionally keep running other
//! queued jobs ("help while waiting"), which lets one OS thread host many
//! logical tasks across their blocking points.

use crate::error::SubstrateResult;
use crate::event::{EventCore, Poison};
use crossbeam_deque::{Injector, Steal, Stealer, Worker as CWorker};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A unit of work queued on a processor group
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Processor group configuration
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Number of worker threads
    pub workers: usize,

    /// Run other queued jobs while parked on a pending handle
    pub help_while_waiting: bool,

    /// Maximum nesting of jobs run while helping
    pub max_help_depth: usize,

    /// How long an idle worker sleeps before looking for work again
    pub idle_park: Duration,

    /// Worker thread name prefix
    pub thread_name: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            help_while_waiting: false,
            max_help_depth: 16,
            idle_park: Duration::from_micros(100),
            thread_name: "tessel-worker".to_string(),
        }
    }
}

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

struct Shared {
    id: u64,
    injector: Injector<Job>,
    stealers: Vec<Stealer<Job>>,
    shutdown: AtomicBool,
    config: ProcessorConfig,
}

impl Shared {
    fn spawn(self: &Arc<Self>, job: Job) {
        if self.shutdown.load(Ordering::Acquire) {
            tracing::warn!(group = self.id, "job submitted to a stopped processor group was dropped");
            return;
        }
        // Jobs spawned by one of our own workers stay on its local deque
        let mut pending = Some(job);
        let _ = CURRENT_WORKER.try_with(|slot| {
            if let Some(queues) = slot.borrow().as_ref() {
                if Arc::ptr_eq(&queues.shared, self) {
                    if let Some(job) = pending.take() {
                        queues.local.push(job);
                    }
                }
            }
        });
        if let Some(job) = pending {
            self.injector.push(job);
        }
    }
}

/// Per-thread view of a worker's queues
struct WorkerQueues {
    index: usize,
    local: CWorker<Job>,
    shared: Arc<Shared>,
    help_depth: Cell<usize>,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Rc<WorkerQueues>>> = const { RefCell::new(None) };
}

impl WorkerQueues {
    /// Find work: local pop, then steal, then inject
    fn find_work(&self) -> Option<Job> {
        if let Some(job) = self.local.pop() {
            return Some(job);
        }

        loop {
            if let Some(job) = self.steal_from_others() {
                return Some(job);
            }

            match self.shared.injector.steal_batch_and_pop(&self.local) {
                Steal::Success(job) => return Some(job),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    fn steal_from_others(&self) -> Option<Job> {
        use rand::Rng;

        let stealers = &self.shared.stealers;
        if stealers.len() < 2 {
            return None;
        }

        // Randomly select a victim
        let start = rand::thread_rng().gen_range(0..stealers.len());
        for i in 0..stealers.len() {
            let index = (start + i) % stealers.len();
            if index == self.index {
                continue;
            }
            loop {
                match stealers[index].steal() {
                    Steal::Success(job) => return Some(job),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// Run queued jobs until `core` triggers
    fn help_until(&self, core: &EventCore) -> Poison {
        let config = &self.shared.config;
        loop {
            if let Some(poison) = core.outcome() {
                return poison;
            }
            let depth = self.help_depth.get();
            if depth < config.max_help_depth && !self.shared.shutdown.load(Ordering::Acquire) {
                if let Some(job) = self.find_work() {
                    self.help_depth.set(depth + 1);
                    run_job(self.shared.id, self.index, job);
                    self.help_depth.set(depth);
                    continue;
                }
            }
            if let Some(poison) = core.block_for(config.idle_park) {
                return poison;
            }
        }
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

fn run_job(group: u64, worker: usize, job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        tracing::error!(group, worker, panic = panic_message(payload.as_ref()), "job panicked");
    }
}

/// Worker thread main loop
fn run_loop(index: usize, local: CWorker<Job>, shared: Arc<Shared>) {
    let idle_park = shared.config.idle_park;
    let queues = Rc::new(WorkerQueues {
        index,
        local,
        shared,
        help_depth: Cell::new(0),
    });
    CURRENT_WORKER.with(|slot| *slot.borrow_mut() = Some(queues.clone()));
    tracing::debug!(group = queues.shared.id, worker = index, "worker started");

    while !queues.shared.shutdown.load(Ordering::Acquire) {
        match queues.find_work() {
            Some(job) => run_job(queues.shared.id, index, job),
            // No work available, sleep briefly to avoid busy-waiting
            None => thread::sleep(idle_park),
        }
    }

    tracing::debug!(group = queues.shared.id, worker = index, "worker shutting down");
    CURRENT_WORKER.with(|slot| slot.borrow_mut().take());
    // Jobs left on the local deque are dropped here, not run
    while queues.local.pop().is_some() {}
}

/// A fixed pool of worker threads
pub struct ProcessorGroup {
    shared: Arc<Shared>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl ProcessorGroup {
    /// Start a group with the given configuration
    pub fn new(config: ProcessorConfig) -> SubstrateResult<Self> {
        let count = config.workers.max(1);
        let locals: Vec<CWorker<Job>> = (0..count).map(|_| CWorker::new_lifo()).collect();
        let stealers = locals.iter().map(CWorker::stealer).collect();
        let shared = Arc::new(Shared {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            injector: Injector::new(),
            stealers,
            shutdown: AtomicBool::new(false),
            config,
        });

        // On a spawn failure, dropping the partial group joins what started
        let mut group = Self {
            shared,
            handles: Vec::with_capacity(count),
        };
        for (index, local) in locals.into_iter().enumerate() {
            let shared = group.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", group.shared.config.thread_name, index))
                .spawn(move || run_loop(index, local, shared))?;
            group.handles.push(handle);
        }
        tracing::debug!(
            group = group.shared.id,
            workers = count,
            help_while_waiting = group.shared.config.help_while_waiting,
            "processor group started"
        );
        Ok(group)
    }

    /// Start a group with default configuration
    pub fn with_defaults() -> SubstrateResult<Self> {
        Self::new(ProcessorConfig::default())
    }

    /// Identity of this group
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.shared.stealers.len()
    }

    /// The group's configuration
    pub fn config(&self) -> &ProcessorConfig {
        &self.shared.config
    }

    /// Queue a job
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.spawn(Box::new(job));
    }

    /// A cloneable handle that can queue jobs on this group
    pub fn spawner(&self) -> Spawner {
        Spawner {
            shared: self.shared.clone(),
        }
    }

    /// Stop all workers and wait for them to exit
    ///
    /// Jobs still queued are dropped without running. Called from one of
    /// the group's own workers, that worker is detached instead of joined
    /// and exits once its current job returns.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            if handle.thread().id() == current {
                tracing::debug!(group = self.shared.id, "detaching the calling worker");
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(group = self.shared.id, "worker thread exited by panic");
            }
        }

        let mut dropped = 0usize;
        loop {
            match self.shared.injector.steal() {
                Steal::Success(job) => {
                    drop(job);
                    dropped += 1;
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        if dropped > 0 {
            tracing::debug!(group = self.shared.id, dropped, "queued jobs dropped at shutdown");
        }
    }

    /// Check if the group still has running workers
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty() && !self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for ProcessorGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Queues jobs on a processor group without owning its threads
#[derive(Clone)]
pub struct Spawner {
    shared: Arc<Shared>,
}

impl Spawner {
    /// Queue a job
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.spawn(Box::new(job));
    }

    /// Identity of the target group
    pub fn group_id(&self) -> u64 {
        self.shared.id
    }
}

/// Where the calling thread sits in a processor group
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Group identity
    pub group: u64,
    /// Worker index within the group
    pub index: usize,
    /// Number of jobs nested on this thread by help-while-waiting
    pub help_depth: usize,
}

/// Describe the calling worker thread, if it is one
pub fn current_worker() -> Option<WorkerInfo> {
    CURRENT_WORKER
        .try_with(|slot| {
            slot.borrow().as_ref().map(|queues| WorkerInfo {
                group: queues.shared.id,
                index: queues.index,
                help_depth: queues.help_depth.get(),
            })
        })
        .ok()
        .flatten()
}

/// Whether the calling thread is a processor group worker
pub fn is_worker_thread() -> bool {
    current_worker().is_some()
}

/// Park the calling thread until `core` triggers
pub(crate) fn park(core: &EventCore) -> Poison {
    let queues = CURRENT_WORKER
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten();
    match queues {
        Some(queues) if queues.shared.config.help_while_waiting => queues.help_until(core),
        _ => core.block(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::UserEvent;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn config(workers: usize, help: bool) -> ProcessorConfig {
        ProcessorConfig {
            workers,
            help_while_waiting: help,
            ..ProcessorConfig::default()
        }
    }

    #[test]
    fn test_group_start_stop() {
        let mut group = ProcessorGroup::new(config(2, false)).unwrap();
        assert_eq!(group.worker_count(), 2);
        assert!(group.is_running());
        group.shutdown();
        assert!(!group.is_running());
    }

    #[test]
    fn test_group_runs_jobs() {
        let group = ProcessorGroup::new(config(3, false)).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..32 {
            let tx = tx.clone();
            group.spawn(move || tx.send(i).unwrap());
        }
        let mut seen: Vec<i32> = (0..32).map(|_| rx.recv().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let group = ProcessorGroup::new(config(1, false)).unwrap();
        group.spawn(|| panic!("boom"));
        let (tx, rx) = mpsc::channel();
        group.spawn(move || tx.send(()).unwrap());
        rx.recv().unwrap();
    }

    #[test]
    fn test_current_worker_inside_job() {
        assert!(!is_worker_thread());
        let group = ProcessorGroup::new(config(1, false)).unwrap();
        let (tx, rx) = mpsc::channel();
        group.spawn(move || tx.send(current_worker()).unwrap());
        let info = rx.recv().unwrap().unwrap();
        assert_eq!(info.group, group.id());
        assert_eq!(info.index, 0);
        assert_eq!(info.help_depth, 0);
    }

    #[test]
    fn test_help_while_waiting_runs_nested_job() {
        let group = ProcessorGroup::new(config(1, true)).unwrap();
        let spawner = group.spawner();
        let (tx, rx) = mpsc::channel();
        let nested_depth = Arc::new(AtomicUsize::new(0));

        let depth = nested_depth.clone();
        group.spawn(move || {
            let gate = UserEvent::create();
            let opener = gate.clone();
            // The only worker is busy here, so this job runs nested
            spawner.spawn(move || {
                if let Some(info) = current_worker() {
                    depth.store(info.help_depth, Ordering::SeqCst);
                }
                opener.trigger().unwrap();
            });
            let poison = gate.event().wait_faultaware();
            tx.send(poison).unwrap();
        });

        assert_eq!(rx.recv().unwrap(), Poison::Clean);
        assert_eq!(nested_depth.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_after_shutdown_is_dropped() {
        let mut group = ProcessorGroup::new(config(1, false)).unwrap();
        let spawner = group.spawner();
        group.shutdown();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        spawner.spawn(move || flag.store(true, Ordering::SeqCst));
        thread::sleep(Duration::from_millis(10));
        assert!(!ran.load(Ordering::SeqCst));
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_shutdown_drops_queued_jobs() {
        let mut group = ProcessorGroup::new(config(1, false)).unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        group.spawn(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        started_rx.recv().unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let (flag, witness) = (ran.clone(), DropFlag(dropped.clone()));
        group.spawn(move || {
            let _witness = witness;
            flag.store(true, Ordering::SeqCst);
        });

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            release_tx.send(()).unwrap();
        });
        group.shutdown();
        releaser.join().unwrap();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_group_dropped_by_its_own_worker() {
        let group = ProcessorGroup::new(config(2, false)).unwrap();
        let spawner = group.spawner();
        let (tx, rx) = mpsc::channel();
        spawner.spawn(move || {
            drop(group);
            tx.send(is_worker_thread()).unwrap();
        });
        // A panicking join would drop the sender unsent
        assert!(rx.recv().unwrap());
    }
}
