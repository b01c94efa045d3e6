//! The token transfer interface and an in-memory ledger.
//!
//! The marketplace never touches balances directly; every movement of funds
//! goes through [`TokenLedger`]. [`InMemoryToken`] simulates an allowance
//! based fungible token for development, tests and scenario replay.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::address::Address;
use crate::amount::Amount;
use crate::error::{Result, TokenError};

/// Narrow interface to an external fungible-token ledger.
///
/// Implementations must be all-or-nothing: when a call returns an error no
/// balance or allowance has changed.
pub trait TokenLedger {
    /// Pull `amount` from `owner` into `recipient`, consuming the allowance
    /// `owner` granted to `recipient`.
    fn transfer_from(&mut self, owner: &Address, recipient: &Address, amount: Amount)
    -> Result<()>;

    /// Move `amount` from `sender` to `recipient`.
    fn transfer(&mut self, sender: &Address, recipient: &Address, amount: Amount) -> Result<()>;

    /// Current balance of `account`.
    fn balance_of(&self, account: &Address) -> Amount;
}

/// Simulated token ledger.
#[derive(Debug, Clone, Default)]
pub struct InMemoryToken {
    balances: HashMap<Address, Amount>,
    allowances: HashMap<(Address, Address), Amount>,
    total_supply: Amount,
    fail_transfers: bool,
}

impl InMemoryToken {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit `amount` new tokens to `account`.
    ///
    /// Saturates at [`Amount::MAX`]; minting is a test/simulation facility.
    pub fn mint(&mut self, account: &Address, amount: Amount) {
        let balance = self.balances.entry(*account).or_default();
        let minted = Amount::MAX.saturating_sub(*balance).min(amount);
        *balance = balance.checked_add(minted).unwrap_or(Amount::MAX);
        self.total_supply = self.total_supply.checked_add(minted).unwrap_or(Amount::MAX);
        info!(account = %account, amount = %minted, "tokens minted");
    }

    /// Allow `spender` to pull up to `amount` from `owner`.
    pub fn approve(&mut self, owner: &Address, spender: &Address, amount: Amount) {
        self.allowances.insert((*owner, *spender), amount);
        debug!(owner = %owner, spender = %spender, amount = %amount, "allowance set");
    }

    /// Remaining allowance `owner` granted to `spender`.
    #[must_use]
    pub fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.allowances
            .get(&(*owner, *spender))
            .copied()
            .unwrap_or_default()
    }

    /// Make every subsequent transfer fail with [`TokenError::Rejected`].
    pub fn set_fail_transfers(&mut self, fail: bool) {
        self.fail_transfers = fail;
    }

    /// Sum of all minted tokens.
    #[must_use]
    pub const fn total_supply(&self) -> Amount {
        self.total_supply
    }

    /// Validates a move and returns the post-transfer balances.
    fn plan_move(
        &self,
        sender: &Address,
        recipient: &Address,
        amount: Amount,
    ) -> Result<(Amount, Amount)> {
        if self.fail_transfers {
            return Err(TokenError::rejected("transfers are disabled"));
        }
        let have = self.balance_of(sender);
        let sender_after = have
            .checked_sub(amount)
            .ok_or(TokenError::InsufficientBalance { have, need: amount })?;
        let recipient_before = if sender == recipient {
            sender_after
        } else {
            self.balance_of(recipient)
        };
        let recipient_after = recipient_before
            .checked_add(amount)
            .ok_or(TokenError::Overflow)?;
        Ok((sender_after, recipient_after))
    }

    fn apply_move(
        &mut self,
        sender: &Address,
        recipient: &Address,
        sender_after: Amount,
        recipient_after: Amount,
    ) {
        self.balances.insert(*sender, sender_after);
        self.balances.insert(*recipient, recipient_after);
    }
}

impl TokenLedger for InMemoryToken {
    fn transfer_from(
        &mut self,
        owner: &Address,
        recipient: &Address,
        amount: Amount,
    ) -> Result<()> {
        let approved = self.allowance(owner, recipient);
        let remaining = approved
            .checked_sub(amount)
            .ok_or(TokenError::InsufficientAllowance {
                approved,
                need: amount,
            })?;
        let (owner_after, recipient_after) = self.plan_move(owner, recipient, amount)?;

        self.allowances.insert((*owner, *recipient), remaining);
        self.apply_move(owner, recipient, owner_after, recipient_after);

        debug!(owner = %owner, recipient = %recipient, amount = %amount, "transfer_from completed");
        Ok(())
    }

    fn transfer(&mut self, sender: &Address, recipient: &Address, amount: Amount) -> Result<()> {
        let (sender_after, recipient_after) = self.plan_move(sender, recipient, amount)?;
        self.apply_move(sender, recipient, sender_after, recipient_after);

        debug!(sender = %sender, recipient = %recipient, amount = %amount, "transfer completed");
        Ok(())
    }

    fn balance_of(&self, account: &Address) -> Amount {
        self.balances.get(account).copied().unwrap_or_default()
    }
}
