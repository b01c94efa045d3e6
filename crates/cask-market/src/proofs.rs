//! Proof-of-storage obligations.
//!
//! The marketplace consumes proofs through [`ProofSystem`]; how proofs are
//! constructed and verified is outside this crate. [`SimulatedProofs`] is a
//! deterministic in-memory implementation: time is cut into fixed periods
//! and a tracked slot is challenged in a period when
//! `blake3(slot_id ‖ period) mod probability == 0`.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::ids::SlotId;

/// Errors reported by a proof system.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    /// Proof failed verification.
    #[error("invalid proof")]
    InvalidProof,

    /// A proof for this period was already received.
    #[error("proof already submitted for period {0}")]
    AlreadySubmitted(u64),

    /// No proof was required for the slot in this period.
    #[error("proof was not required in period {0}")]
    NotRequired(u64),

    /// The period has not ended yet.
    #[error("period {0} has not ended")]
    PeriodNotEnded(u64),

    /// Too late to mark the period as missed.
    #[error("validation timed out for period {0}")]
    ValidationTimedOut(u64),

    /// Period was already marked as missed.
    #[error("proof already marked missing for period {0}")]
    AlreadyMarked(u64),
}

/// Interface to the proof obligation tracker.
pub trait ProofSystem {
    /// Per-slot state captured before an entry point runs.
    type Checkpoint;

    /// Starts requiring proofs for `slot` from the period containing `now`.
    fn start_requiring(&mut self, slot: SlotId, probability: u64, now: u64);

    /// Stops requiring proofs for `slot` and forgets its history.
    fn stop_requiring(&mut self, slot: &SlotId);

    /// Records a proof for the current period.
    fn submit_proof(&mut self, slot: &SlotId, proof: &[u8], now: u64) -> Result<(), ProofError>;

    /// Records that the proof for `period` was missed.
    fn mark_missing(&mut self, slot: &SlotId, period: u64, now: u64) -> Result<(), ProofError>;

    /// Number of proofs missed since requirements started.
    fn missing_proofs(&self, slot: &SlotId) -> u64;

    /// Whether a proof is required for `slot` in the current period.
    fn is_proof_required(&self, slot: &SlotId, now: u64) -> bool;

    /// Period containing `now`.
    fn period_of(&self, now: u64) -> u64;

    /// Captures everything tracked for `slot`.
    fn checkpoint(&self, slot: &SlotId) -> Self::Checkpoint;

    /// Puts `slot` back to a captured state.
    fn restore(&mut self, slot: &SlotId, checkpoint: Self::Checkpoint);
}

/// Timing of proof periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofConfig {
    /// Length of one period in seconds.
    pub period_secs: u64,
    /// Time after a period ends during which it can be marked missed.
    pub timeout_secs: u64,
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            period_secs: 10,
            timeout_secs: 5,
        }
    }
}

/// Obligations of one tracked slot.
///
/// `received` and `marked` only hold periods that can still be marked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSlot {
    probability: u64,
    since: u64,
    received: BTreeSet<u64>,
    marked: BTreeSet<u64>,
    missed: u64,
}

impl TrackedSlot {
    /// First period the slot owes proofs for.
    #[must_use]
    pub const fn since(&self) -> u64 {
        self.since
    }

    fn prune(&mut self, oldest_live: u64) {
        self.received = self.received.split_off(&oldest_live);
        self.marked = self.marked.split_off(&oldest_live);
    }
}

/// In-memory proof tracker.
#[derive(Debug, Clone)]
pub struct SimulatedProofs {
    config: ProofConfig,
    slots: HashMap<SlotId, TrackedSlot>,
}

impl SimulatedProofs {
    /// Create a tracker with the given period timing.
    #[must_use]
    pub fn new(config: ProofConfig) -> Self {
        Self {
            config,
            slots: HashMap::new(),
        }
    }

    /// Tracked state of `slot`, if proofs are required.
    #[must_use]
    pub fn tracked(&self, slot: &SlotId) -> Option<&TrackedSlot> {
        self.slots.get(slot)
    }

    fn period_end(&self, period: u64) -> u64 {
        period.saturating_add(1).saturating_mul(self.config.period_secs)
    }

    /// Oldest period whose marking window is still open at `now`.
    fn oldest_live(&self, now: u64) -> u64 {
        now.saturating_sub(self.config.timeout_secs) / self.config.period_secs.max(1)
    }

    fn challenged(&self, slot: &SlotId, period: u64) -> bool {
        let Some(tracked) = self.slots.get(slot) else {
            return false;
        };
        if period < tracked.since {
            return false;
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(slot.as_bytes());
        hasher.update(&period.to_be_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_be_bytes(head) % tracked.probability.max(1) == 0
    }
}

impl ProofSystem for SimulatedProofs {
    type Checkpoint = Option<TrackedSlot>;

    fn start_requiring(&mut self, slot: SlotId, probability: u64, now: u64) {
        let since = self.period_of(now);
        self.slots.insert(
            slot,
            TrackedSlot {
                probability,
                since,
                received: BTreeSet::new(),
                marked: BTreeSet::new(),
                missed: 0,
            },
        );
        debug!(slot_id = %slot, probability, since, "proofs required");
    }

    fn stop_requiring(&mut self, slot: &SlotId) {
        self.slots.remove(slot);
    }

    fn submit_proof(&mut self, slot: &SlotId, proof: &[u8], now: u64) -> Result<(), ProofError> {
        let period = self.period_of(now);
        let oldest_live = self.oldest_live(now);
        let Some(tracked) = self.slots.get_mut(slot) else {
            return Err(ProofError::NotRequired(period));
        };
        if proof.is_empty() {
            return Err(ProofError::InvalidProof);
        }
        tracked.prune(oldest_live);
        if !tracked.received.insert(period) {
            return Err(ProofError::AlreadySubmitted(period));
        }
        debug!(slot_id = %slot, period, "proof received");
        Ok(())
    }

    fn mark_missing(&mut self, slot: &SlotId, period: u64, now: u64) -> Result<(), ProofError> {
        if now < self.period_end(period) {
            return Err(ProofError::PeriodNotEnded(period));
        }
        if now >= self.period_end(period).saturating_add(self.config.timeout_secs) {
            return Err(ProofError::ValidationTimedOut(period));
        }
        if self
            .slots
            .get(slot)
            .is_some_and(|tracked| tracked.received.contains(&period))
        {
            return Err(ProofError::AlreadySubmitted(period));
        }
        if !self.challenged(slot, period) {
            return Err(ProofError::NotRequired(period));
        }
        let oldest_live = self.oldest_live(now);
        let Some(tracked) = self.slots.get_mut(slot) else {
            return Err(ProofError::NotRequired(period));
        };
        tracked.prune(oldest_live);
        if !tracked.marked.insert(period) {
            return Err(ProofError::AlreadyMarked(period));
        }
        tracked.missed += 1;
        debug!(slot_id = %slot, period, missed = tracked.missed, "proof marked missing");
        Ok(())
    }

    fn missing_proofs(&self, slot: &SlotId) -> u64 {
        self.slots.get(slot).map_or(0, |tracked| tracked.missed)
    }

    fn is_proof_required(&self, slot: &SlotId, now: u64) -> bool {
        self.challenged(slot, self.period_of(now))
    }

    fn period_of(&self, now: u64) -> u64 {
        now / self.config.period_secs.max(1)
    }

    fn checkpoint(&self, slot: &SlotId) -> Self::Checkpoint {
        self.slots.get(slot).cloned()
    }

    fn restore(&mut self, slot: &SlotId, checkpoint: Self::Checkpoint) {
        match checkpoint {
            Some(tracked) => self.slots.insert(*slot, tracked),
            None => self.slots.remove(slot),
        };
    }
}
