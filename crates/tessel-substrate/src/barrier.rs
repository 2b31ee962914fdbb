//! Phase-repeating barriers
//!
//! A barrier expects a fixed number of arrivals per phase. Each phase is
//! addressed by a timestamp; the handle for phase `t` triggers once `t` has
//! received all its arrivals and every earlier phase has completed.

use crate::error::{SubstrateError, SubstrateResult};
use crate::event::{CompletionHandle, EventCore, Poison};
use crate::id::BarrierId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A byte-level fold applied to values contributed at arrival
pub trait ReductionOp: Send + Sync {
    /// Initial accumulator for a phase
    fn identity(&self) -> Vec<u8>;

    /// Fold one contributed value into the accumulator
    fn fold(&self, acc: &mut [u8], value: &[u8]);
}

/// Wrapping sum of little-endian `u64` values
#[derive(Debug, Copy, Clone, Default)]
pub struct SumU64;

impl ReductionOp for SumU64 {
    fn identity(&self) -> Vec<u8> {
        0u64.to_le_bytes().to_vec()
    }

    fn fold(&self, acc: &mut [u8], value: &[u8]) {
        let (Ok(lhs), Ok(rhs)) = (<[u8; 8]>::try_from(&acc[..]), <[u8; 8]>::try_from(value)) else {
            tracing::warn!(acc = acc.len(), value = value.len(), "SumU64 ignores values that are not 8 bytes");
            return;
        };
        let sum = u64::from_le_bytes(lhs).wrapping_add(u64::from_le_bytes(rhs));
        acc.copy_from_slice(&sum.to_le_bytes());
    }
}

struct PhaseState {
    remaining: usize,
    event: Arc<EventCore>,
    value: Option<Vec<u8>>,
}

struct BarrierState {
    /// First generation that has not completed
    generation: u64,
    phases: BTreeMap<u64, PhaseState>,
    destroyed: bool,
}

pub(crate) struct BarrierCore {
    id: BarrierId,
    expected: usize,
    reduction: Option<Arc<dyn ReductionOp>>,
    state: Mutex<BarrierState>,
}

impl BarrierCore {
    fn phase<'a>(&self, state: &'a mut BarrierState, timestamp: u64) -> &'a mut PhaseState {
        state.phases.entry(timestamp).or_insert_with(|| PhaseState {
            remaining: self.expected,
            event: EventCore::new(),
            value: self.reduction.as_ref().map(|op| op.identity()),
        })
    }
}

/// Handle naming one phase of a barrier
#[derive(Clone, Default)]
pub struct Barrier {
    core: Option<Arc<BarrierCore>>,
    timestamp: u64,
}

impl Barrier {
    /// The "no barrier" sentinel
    pub const NO_BARRIER: Barrier = Barrier {
        core: None,
        timestamp: 0,
    };

    /// Create a barrier expecting `expected` arrivals per phase
    pub fn create(expected: usize) -> SubstrateResult<Self> {
        Self::build(expected, None)
    }

    /// Create a barrier whose phases fold arrival values with `op`
    pub fn create_with_reduction(expected: usize, op: Arc<dyn ReductionOp>) -> SubstrateResult<Self> {
        Self::build(expected, Some(op))
    }

    fn build(expected: usize, reduction: Option<Arc<dyn ReductionOp>>) -> SubstrateResult<Self> {
        if expected == 0 {
            return Err(SubstrateError::InvalidArrivalCount(expected));
        }
        let core = Arc::new(BarrierCore {
            id: BarrierId::next(),
            expected,
            reduction,
            state: Mutex::new(BarrierState {
                generation: 0,
                phases: BTreeMap::new(),
                destroyed: false,
            }),
        });
        tracing::debug!(barrier = %core.id, expected, "barrier created");
        Ok(Self {
            core: Some(core),
            timestamp: 0,
        })
    }

    /// Whether this handle refers to a real barrier
    pub fn exists(&self) -> bool {
        self.core.is_some()
    }

    /// Get the barrier ID
    pub fn id(&self) -> Option<BarrierId> {
        self.core.as_ref().map(|core| core.id)
    }

    /// Phase this handle names
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Arrivals each phase expects
    pub fn expected_arrivals(&self) -> usize {
        self.core.as_ref().map_or(0, |core| core.expected)
    }

    /// Arrive `count` times at this handle's phase
    pub fn arrive(&self, count: usize) -> SubstrateResult<()> {
        self.arrive_inner(count, None)
    }

    /// Arrive and contribute `value` to the phase's reduction
    pub fn arrive_with_value(&self, count: usize, value: &[u8]) -> SubstrateResult<()> {
        self.arrive_inner(count, Some(value))
    }

    fn arrive_inner(&self, count: usize, value: Option<&[u8]>) -> SubstrateResult<()> {
        let core = self.core.as_ref().ok_or(SubstrateError::NoEvent)?;
        let completed = {
            let mut state = core.state.lock();
            if state.destroyed {
                return Err(SubstrateError::BarrierDestroyed(core.id));
            }
            if self.timestamp < state.generation {
                return Err(SubstrateError::PhaseComplete {
                    barrier: core.id,
                    generation: self.timestamp,
                });
            }
            if count == 0 {
                return Ok(());
            }

            let phase = core.phase(&mut state, self.timestamp);
            if count > phase.remaining {
                return Err(SubstrateError::ArrivalOverflow {
                    barrier: core.id,
                    generation: self.timestamp,
                    count,
                    remaining: phase.remaining,
                });
            }
            phase.remaining -= count;
            if let (Some(op), Some(acc), Some(value)) = (&core.reduction, phase.value.as_mut(), value) {
                op.fold(acc, value);
            }

            // Phases complete strictly in order
            let mut completed = Vec::new();
            loop {
                let generation = state.generation;
                let Some(event) = state
                    .phases
                    .get(&generation)
                    .filter(|phase| phase.remaining == 0)
                    .map(|phase| phase.event.clone())
                else {
                    break;
                };
                completed.push(event);
                state.generation += 1;
            }
            if !completed.is_empty() {
                let keep_from = state.generation.saturating_sub(1);
                state.phases = state.phases.split_off(&keep_from);
            }
            completed
        };

        for event in completed {
            tracing::trace!(barrier = %core.id, event = %event.id(), "barrier phase complete");
            // Phase events are private to the barrier and fire once
            let _ = event.trigger(Poison::Clean);
        }
        Ok(())
    }

    /// Handle for the next phase
    pub fn advance(&self) -> Barrier {
        Barrier {
            core: self.core.clone(),
            timestamp: self.timestamp.saturating_add(1),
        }
    }

    /// Handle for the phase before this one
    ///
    /// The first phase has no predecessor and yields the sentinel.
    pub fn get_previous_phase(&self) -> Barrier {
        if self.timestamp == 0 {
            return Barrier::NO_BARRIER;
        }
        Barrier {
            core: self.core.clone(),
            timestamp: self.timestamp - 1,
        }
    }

    /// Handle for the first phase that has not yet completed
    pub fn current_phase(&self) -> Barrier {
        let timestamp = self
            .core
            .as_ref()
            .map_or(0, |core| core.state.lock().generation);
        Barrier {
            core: self.core.clone(),
            timestamp,
        }
    }

    /// Completion handle for this handle's phase
    ///
    /// Phases old enough to have been forgotten report the sentinel, which
    /// counts as triggered.
    pub fn phase_event(&self) -> CompletionHandle {
        let Some(core) = &self.core else {
            return CompletionHandle::NO_EVENT;
        };
        let mut state = core.state.lock();
        if self.timestamp < state.generation && !state.phases.contains_key(&self.timestamp) {
            return CompletionHandle::NO_EVENT;
        }
        CompletionHandle::from_core(core.phase(&mut state, self.timestamp).event.clone())
    }

    /// Copy the reduction result of this completed phase into `buf`
    ///
    /// Returns false if the phase is still pending or has been forgotten.
    /// It is also false when the barrier has no reduction or `buf` cannot
    /// hold the whole value.
    pub fn get_result(&self, buf: &mut [u8]) -> bool {
        let Some(core) = &self.core else {
            return false;
        };
        let state = core.state.lock();
        if self.timestamp >= state.generation {
            return false;
        }
        match state.phases.get(&self.timestamp).and_then(|phase| phase.value.as_ref()) {
            Some(value) if buf.len() < value.len() => {
                tracing::warn!(
                    barrier = %core.id,
                    needed = value.len(),
                    available = buf.len(),
                    "reduction result does not fit the buffer"
                );
                false
            }
            Some(value) => {
                buf[..value.len()].copy_from_slice(value);
                true
            }
            None => false,
        }
    }

    /// Destroy the barrier; later arrivals fail
    ///
    /// Waiters still parked on pending phases are not woken.
    pub fn destroy(&self) -> SubstrateResult<()> {
        let core = self.core.as_ref().ok_or(SubstrateError::NoEvent)?;
        let mut state = core.state.lock();
        if state.destroyed {
            return Err(SubstrateError::BarrierDestroyed(core.id));
        }
        state.destroyed = true;
        tracing::debug!(barrier = %core.id, generation = state.generation, "barrier destroyed");
        Ok(())
    }
}

impl PartialEq for Barrier {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && self.timestamp == other.timestamp
    }
}

impl Eq for Barrier {}

impl Hash for Barrier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
        self.timestamp.hash(state);
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("id", &self.id())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
