//! Error types for token operations.

use thiserror::Error;

use crate::amount::Amount;

/// Result type alias for token operations.
pub type Result<T> = std::result::Result<T, TokenError>;

/// Errors a [`TokenLedger`](crate::TokenLedger) can report.
///
/// A ledger that returns any of these must not have moved funds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Sender balance is below the transfer amount.
    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance {
        /// Current balance.
        have: Amount,
        /// Required balance.
        need: Amount,
    },

    /// Spender allowance is below the transfer amount.
    #[error("insufficient allowance: approved {approved}, need {need}")]
    InsufficientAllowance {
        /// Currently approved amount.
        approved: Amount,
        /// Required allowance.
        need: Amount,
    },

    /// Invalid address encoding.
    #[error("invalid address: {message}")]
    InvalidAddress {
        /// Description of the address error.
        message: String,
    },

    /// The ledger refused the transfer.
    #[error("transfer rejected: {reason}")]
    Rejected {
        /// Reason for the rejection.
        reason: String,
    },

    /// Arithmetic overflow on the recipient side.
    #[error("balance overflow")]
    Overflow,
}

impl TokenError {
    /// Create an invalid address error.
    #[must_use]
    pub fn invalid_address(message: impl Into<String>) -> Self {
        Self::InvalidAddress {
            message: message.into(),
        }
    }

    /// Create a rejected-transfer error.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}
