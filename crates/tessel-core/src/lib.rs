//! Tessel synchronization core
//!
//! The layer every runtime subsystem calls into when it must wait:
//! - Typed events (application, runtime, predicate) over substrate handles
//! - [`LocalLock`] with RAII [`AutoLock`] / [`AutoTryLock`] guards
//! - Per-thread [`TaskFrame`]s carrying ambient task state across waits
//! - The suspension coordinator behind every `wait` / `wait_faultaware`
//!
//! Waiting on a worker of a processor group configured to help while
//! waiting lets the worker run other tasks until the event triggers.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod frame;
pub mod guard;
pub mod launch;
pub mod lock;
pub mod tracker;
mod wait;

pub use config::{CheckMode, SyncOptions};
pub use context::{
    begin_context_wait, end_context_wait, ContextId, ContextRef, OverheadTimes, ProfiledContext,
    TaskContext, WaitInterval,
};
pub use error::{ConfigError, ProtocolViolation};
pub use event::{
    ApBarrier, ApEvent, ApUserEvent, PredEvent, PredUserEvent, RtBarrier, RtEvent, RtUserEvent,
};
pub use frame::{
    Breadcrumbs, ProvenanceId, RegistrationCallbackMode, RuntimeCall, SavedFrame, TaskFrame,
    TaskKindId, TaskState,
};
pub use guard::{AutoLock, AutoTryLock};
pub use launch::TaskLauncher;
pub use lock::LocalLock;
pub use tracker::ReferenceTracker;

pub use tessel_substrate::{
    Poison, ProcessorConfig, ProcessorGroup, ReductionOp, SubstrateError, SubstrateResult, SumU64,
    WaitMode,
};
