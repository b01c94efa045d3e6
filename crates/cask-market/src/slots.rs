//! Slot assignments.
//!
//! A slot record exists only while a host is linked to it; a missing record
//! reads as [`SlotState::Free`]. The state callers observe is derived from the
//! record and the owning request's computed state, so a slot finishes the
//! moment its request does without any slot-level write.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use cask_token::Address;
use serde::{Deserialize, Serialize};

use crate::collateral::WithdrawalPermission;
use crate::error::Result;
use crate::ids::{RequestId, SlotId};
use crate::requests::{RequestRegistry, RequestState};

/// Observable state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// No host.
    Free,
    /// A host is storing the data and owes proofs.
    Filled,
    /// The request is over; the host can collect payment.
    Finished,
    /// The request failed; no payment is due.
    Failed,
    /// The host was paid. Never derived away.
    Paid,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "Free"),
            Self::Filled => write!(f, "Filled"),
            Self::Finished => write!(f, "Finished"),
            Self::Failed => write!(f, "Failed"),
            Self::Paid => write!(f, "Paid"),
        }
    }
}

/// A host's assignment to one slot of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Owning request.
    pub request_id: RequestId,
    /// Position within the request.
    pub slot_index: u64,
    /// Host storing the data.
    pub host: Address,
    /// Stored state, either `Filled` or `Paid`.
    pub state: SlotState,
}

/// Combines a stored slot state with its request's computed state.
#[must_use]
pub const fn derive_state(stored: SlotState, request: RequestState) -> SlotState {
    match (stored, request) {
        (SlotState::Paid, _) => SlotState::Paid,
        (_, RequestState::Cancelled | RequestState::Finished) => SlotState::Finished,
        (_, RequestState::Failed) => SlotState::Failed,
        (stored, _) => stored,
    }
}

/// A slot record and its index membership, captured for rollback.
#[derive(Debug, Clone)]
pub(crate) struct SlotCheckpoint {
    slot_id: SlotId,
    slot: Option<Slot>,
    active: Vec<(Address, bool)>,
}

impl SlotCheckpoint {
    pub(crate) const fn slot_id(&self) -> SlotId {
        self.slot_id
    }
}

/// Slot records and the host → active slots index.
#[derive(Debug, Clone, Default)]
pub struct SlotRegistry {
    slots: HashMap<SlotId, Slot>,
    active: HashMap<Address, BTreeSet<SlotId>>,
}

impl SlotRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored record, if a host is linked.
    #[must_use]
    pub fn get(&self, slot_id: &SlotId) -> Option<&Slot> {
        self.slots.get(slot_id)
    }

    /// Observable state at `now`.
    pub fn state(&self, slot_id: &SlotId, requests: &RequestRegistry, now: u64) -> Result<SlotState> {
        match self.slots.get(slot_id) {
            None => Ok(SlotState::Free),
            Some(slot) => {
                let request = requests.computed_state(&slot.request_id, now)?;
                Ok(derive_state(slot.state, request))
            }
        }
    }

    /// State the slot would have if linked to `request_id`.
    ///
    /// An unlinked slot of a request that is already over reads as over, so
    /// it can't be filled.
    pub fn state_within(
        &self,
        slot_id: &SlotId,
        request_id: &RequestId,
        requests: &RequestRegistry,
        now: u64,
    ) -> Result<SlotState> {
        let stored = self
            .slots
            .get(slot_id)
            .map_or(SlotState::Free, |slot| slot.state);
        let request = requests.computed_state(request_id, now)?;
        Ok(derive_state(stored, request))
    }

    /// Links `host` to the slot and marks it active for the host.
    pub fn fill(&mut self, slot_id: SlotId, request_id: RequestId, slot_index: u64, host: Address) {
        self.slots.insert(
            slot_id,
            Slot {
                request_id,
                slot_index,
                host,
                state: SlotState::Filled,
            },
        );
        self.active.entry(host).or_default().insert(slot_id);
    }

    /// Drops the record, returning the slot to `Free`.
    pub fn clear(&mut self, slot_id: &SlotId) -> Option<Slot> {
        let slot = self.slots.remove(slot_id)?;
        self.release(&slot.host, slot_id);
        Some(slot)
    }

    /// Marks the slot paid. Sticky.
    pub fn mark_paid(&mut self, slot_id: &SlotId) {
        if let Some(slot) = self.slots.get_mut(slot_id) {
            slot.state = SlotState::Paid;
        }
    }

    /// Removes the slot from the host's active set.
    pub fn release(&mut self, host: &Address, slot_id: &SlotId) {
        if let Some(slots) = self.active.get_mut(host) {
            slots.remove(slot_id);
            if slots.is_empty() {
                self.active.remove(host);
            }
        }
    }

    /// Captures the record of `slot_id` and whether each of `hosts` lists it
    /// as active.
    pub(crate) fn checkpoint(&self, slot_id: &SlotId, hosts: &[Address]) -> SlotCheckpoint {
        SlotCheckpoint {
            slot_id: *slot_id,
            slot: self.slots.get(slot_id).cloned(),
            active: hosts
                .iter()
                .map(|host| {
                    let active = self
                        .active
                        .get(host)
                        .is_some_and(|slots| slots.contains(slot_id));
                    (*host, active)
                })
                .collect(),
        }
    }

    /// Puts a captured record and index membership back.
    pub(crate) fn restore(&mut self, checkpoint: SlotCheckpoint) {
        let slot_id = checkpoint.slot_id;
        match checkpoint.slot {
            Some(slot) => self.slots.insert(slot_id, slot),
            None => self.slots.remove(&slot_id),
        };
        for (host, active) in checkpoint.active {
            if active {
                self.active.entry(host).or_default().insert(slot_id);
            } else {
                self.release(&host, &slot_id);
            }
        }
    }

    /// Slots the host currently backs.
    #[must_use]
    pub fn active_slots(&self, host: &Address) -> Vec<SlotId> {
        self.active
            .get(host)
            .map(|slots| slots.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether the host backs any slot.
    #[must_use]
    pub fn has_active_slots(&self, host: &Address) -> bool {
        self.active.contains_key(host)
    }
}

/// Hosts may only withdraw collateral that backs no slot.
impl WithdrawalPermission for SlotRegistry {
    fn may_withdraw(&self, account: &Address) -> bool {
        !self.has_active_slots(account)
    }
}
