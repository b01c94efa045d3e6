//! Error types for cask-market.
//!
//! Every variant rejects the current entry point as a whole; the marketplace
//! rolls back all state touched by the call before returning it.

use cask_token::{Amount, TokenError};
use thiserror::Error;

use crate::proofs::ProofError;

/// Result type alias for marketplace operations.
pub type Result<T> = std::result::Result<T, MarketError>;

/// Errors that can occur in marketplace operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarketError {
    /// Caller does not match the request's client.
    #[error("invalid client address")]
    InvalidClient,

    /// A request with the same id already exists.
    #[error("request already exists: {0}")]
    DuplicateRequest(String),

    /// No request with this id.
    #[error("unknown request: {0}")]
    UnknownRequest(String),

    /// Request terms failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Slot index is not below the request's slot count.
    #[error("invalid slot index {index}: request has {slots} slots")]
    InvalidSlotIndex {
        /// Requested index.
        index: u64,
        /// Slots in the request.
        slots: u64,
    },

    /// Slot is not free to be filled.
    #[error("slot is not free")]
    SlotNotFree,

    /// Slot is already free.
    #[error("slot is already free")]
    SlotAlreadyFree,

    /// Slot has already been paid out.
    #[error("slot already paid")]
    AlreadyPaid,

    /// Caller is not the host of the slot.
    #[error("slot filled by other host")]
    WrongHost,

    /// Slot is not in a state that accepts proofs.
    #[error("slot not accepting proofs")]
    SlotNotAcceptingProofs,

    /// Host collateral is below the amount required to fill a slot.
    #[error("insufficient collateral: required {required}, available {available}")]
    InsufficientCollateral {
        /// Collateral required.
        required: Amount,
        /// Collateral held.
        available: Amount,
    },

    /// Request has not expired yet.
    #[error("request not yet timed out")]
    NotYetExpired,

    /// Request funds cannot be withdrawn in its current state.
    #[error("request cannot be cancelled")]
    NotCancellable,

    /// Pulling or returning funds through the token ledger failed.
    #[error("transfer failed: {0}")]
    TransferFailed(#[source] TokenError),

    /// Paying a host failed.
    #[error("payment failed: {0}")]
    PaymentFailed(#[source] TokenError),

    /// Withdrawal permission denied.
    #[error("withdrawal locked")]
    WithdrawalLocked,

    /// Slash percentage above 100.
    #[error("invalid percentage: {0}")]
    InvalidPercentage(u8),

    /// Illegal request lifecycle transition.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
    },

    /// Proof system rejected the operation.
    #[error("proof error: {0}")]
    Proof(#[from] ProofError),

    /// Arithmetic overflow in accounting.
    #[error("arithmetic overflow")]
    Overflow,

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
}
