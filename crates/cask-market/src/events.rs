//! Marketplace events.
//!
//! Events are the externally observable log. They are buffered while an
//! entry point runs and committed only if it succeeds.

use cask_token::{Address, Amount};
use serde::{Deserialize, Serialize};

use crate::ids::{RequestId, SlotId};
use crate::requests::Ask;

/// Something that happened in the marketplace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MarketEvent {
    /// A client submitted a request.
    StorageRequested {
        /// New request.
        request_id: RequestId,
        /// Its terms.
        ask: Ask,
        /// Unix time after which it is cancelled if not started.
        expiry: u64,
    },
    /// Every slot of a request is filled.
    RequestFulfilled {
        /// Started request.
        request_id: RequestId,
    },
    /// A request lost more slots than it tolerates.
    RequestFailed {
        /// Failed request.
        request_id: RequestId,
    },
    /// A client withdrew the funds of an expired request.
    RequestCancelled {
        /// Cancelled request.
        request_id: RequestId,
    },
    /// A host filled a slot.
    SlotFilled {
        /// Owning request.
        request_id: RequestId,
        /// Slot position.
        slot_index: u64,
        /// Slot id.
        slot_id: SlotId,
        /// Host now storing the slot.
        host: Address,
    },
    /// A slot was released before completion.
    SlotFreed {
        /// Owning request.
        request_id: RequestId,
        /// Released slot.
        slot_id: SlotId,
    },
    /// A host was paid for a completed slot.
    SlotPaid {
        /// Owning request.
        request_id: RequestId,
        /// Paid slot.
        slot_id: SlotId,
        /// Paid host.
        host: Address,
        /// Payment.
        amount: Amount,
    },
    /// A host's collateral was slashed for missed proofs.
    HostSlashed {
        /// Slashed host.
        host: Address,
        /// Slot whose proofs were missed.
        slot_id: SlotId,
        /// Collateral removed.
        amount: Amount,
    },
    /// Collateral was deposited.
    CollateralDeposited {
        /// Depositor.
        account: Address,
        /// Deposit.
        amount: Amount,
    },
    /// Collateral was withdrawn.
    CollateralWithdrawn {
        /// Withdrawer.
        account: Address,
        /// Withdrawal.
        amount: Amount,
    },
}

impl MarketEvent {
    /// Short snake-case name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StorageRequested { .. } => "storage_requested",
            Self::RequestFulfilled { .. } => "request_fulfilled",
            Self::RequestFailed { .. } => "request_failed",
            Self::RequestCancelled { .. } => "request_cancelled",
            Self::SlotFilled { .. } => "slot_filled",
            Self::SlotFreed { .. } => "slot_freed",
            Self::SlotPaid { .. } => "slot_paid",
            Self::HostSlashed { .. } => "host_slashed",
            Self::CollateralDeposited { .. } => "collateral_deposited",
            Self::CollateralWithdrawn { .. } => "collateral_withdrawn",
        }
    }
}
