//! Marketplace escrow counters and the conservation check.

use cask_token::Amount;
use serde::{Deserialize, Serialize};

use crate::error::{MarketError, Result};

/// Client funds held by the marketplace.
///
/// `received == balance + sent` at every entry-point boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceFunds {
    /// Escrow currently held.
    pub balance: Amount,
    /// Everything ever escrowed.
    pub received: Amount,
    /// Everything ever paid out or refunded.
    pub sent: Amount,
}

impl MarketplaceFunds {
    /// Records escrowed funds.
    pub fn receive(&mut self, amount: Amount) -> Result<()> {
        let received = self.received.checked_add(amount).ok_or(MarketError::Overflow)?;
        let balance = self.balance.checked_add(amount).ok_or(MarketError::Overflow)?;
        self.received = received;
        self.balance = balance;
        Ok(())
    }

    /// Records funds leaving escrow.
    pub fn send(&mut self, amount: Amount) -> Result<()> {
        let balance = self.balance.checked_sub(amount).ok_or(MarketError::Overflow)?;
        let sent = self.sent.checked_add(amount).ok_or(MarketError::Overflow)?;
        self.balance = balance;
        self.sent = sent;
        Ok(())
    }

    /// Whether `received == balance + sent`.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.balance.checked_add(self.sent) == Some(self.received)
    }
}

/// Snapshot taken at the start of an entry point, checked at the end.
#[derive(Debug, Clone, Copy)]
#[must_use = "a funds check does nothing unless finished"]
pub struct FundsCheck {
    before: MarketplaceFunds,
}

impl FundsCheck {
    /// Captures the counters and asserts they balance.
    ///
    /// # Panics
    ///
    /// Panics if the counters are already out of balance.
    pub fn begin(funds: &MarketplaceFunds) -> Self {
        assert!(funds.is_balanced(), "marketplace funds unbalanced on entry: {funds:?}");
        Self { before: *funds }
    }

    /// Asserts the counters still balance and never went backwards.
    ///
    /// # Panics
    ///
    /// Panics on any violation; these are bugs, not recoverable errors.
    pub fn finish(self, after: &MarketplaceFunds) {
        assert!(after.is_balanced(), "marketplace funds unbalanced on exit: {after:?}");
        assert!(after.received >= self.before.received, "received decreased");
        assert!(after.sent >= self.before.sent, "sent decreased");
    }
}
