//! Tessel execution substrate
//!
//! The primitives the synchronization core is built on:
//! - Single-trigger completion handles with poison metadata
//! - User events, merged events and fault-ignoring events
//! - Reader/writer reservations whose acquisition defers instead of blocking
//! - Phase-repeating barriers with optional reductions
//! - Work-stealing processor groups

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod barrier;
pub mod error;
pub mod event;
pub mod id;
pub mod processor;
pub mod reservation;

pub use barrier::{Barrier, ReductionOp, SumU64};
pub use error::{SubstrateError, SubstrateResult};
pub use event::{CompletionHandle, Poison, UserEvent};
pub use id::{BarrierId, EventId, ReservationId};
pub use processor::{
    current_worker, is_worker_thread, Job, ProcessorConfig, ProcessorGroup, Spawner, WorkerInfo,
};
pub use reservation::{Reservation, WaitMode, DEFAULT_SPIN_LIMIT};
