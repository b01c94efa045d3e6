//! Host collateral accounting.
//!
//! The ledger keeps per-account balances and three running totals. Deposits
//! and withdrawals move tokens through the [`TokenLedger`]; slashing only
//! moves balance into the `slashed` total, the tokens stay in custody.
//!
//! `deposited - withdrawn - slashed` always equals the sum of balances.

use std::collections::HashMap;

use cask_token::{Address, Amount, TokenLedger};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MarketError, Result};

/// Decides whether an account may withdraw its collateral.
pub trait WithdrawalPermission {
    /// True if `account` may withdraw now.
    fn may_withdraw(&self, account: &Address) -> bool;
}

impl<F> WithdrawalPermission for F
where
    F: Fn(&Address) -> bool,
{
    fn may_withdraw(&self, account: &Address) -> bool {
        self(account)
    }
}

/// Lifetime totals of the collateral ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralTotals {
    /// Everything ever deposited.
    pub deposited: Amount,
    /// Everything ever withdrawn.
    pub withdrawn: Amount,
    /// Everything ever slashed.
    pub slashed: Amount,
}

impl CollateralTotals {
    /// Sum of balances implied by the totals.
    #[must_use]
    pub fn outstanding(&self) -> Option<Amount> {
        self.deposited
            .checked_sub(self.withdrawn)?
            .checked_sub(self.slashed)
    }

    /// Asserts no total decreased since `before`.
    ///
    /// # Panics
    ///
    /// Panics if any total went down.
    pub fn assert_progressed_from(&self, before: &Self) {
        assert!(self.deposited >= before.deposited, "deposited total decreased");
        assert!(self.withdrawn >= before.withdrawn, "withdrawn total decreased");
        assert!(self.slashed >= before.slashed, "slashed total decreased");
    }
}

/// Balances of some accounts plus the totals, captured for rollback.
#[derive(Debug, Clone)]
pub(crate) struct CollateralCheckpoint {
    balances: Vec<(Address, Option<Amount>)>,
    totals: CollateralTotals,
}

/// Per-account collateral held in custody.
#[derive(Debug, Clone, Default)]
pub struct CollateralLedger {
    balances: HashMap<Address, Amount>,
    totals: CollateralTotals,
}

impl CollateralLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collateral held for `account`.
    #[must_use]
    pub fn balance_of(&self, account: &Address) -> Amount {
        self.balances.get(account).copied().unwrap_or_default()
    }

    /// Lifetime totals.
    #[must_use]
    pub const fn totals(&self) -> CollateralTotals {
        self.totals
    }

    /// Pulls `amount` from `account` into `custody` and credits it.
    pub fn deposit<T: TokenLedger + ?Sized>(
        &mut self,
        token: &mut T,
        custody: &Address,
        account: &Address,
        amount: Amount,
    ) -> Result<()> {
        let balance = self
            .balance_of(account)
            .checked_add(amount)
            .ok_or(MarketError::Overflow)?;
        let deposited = self
            .totals
            .deposited
            .checked_add(amount)
            .ok_or(MarketError::Overflow)?;

        token
            .transfer_from(account, custody, amount)
            .map_err(MarketError::TransferFailed)?;

        self.balances.insert(*account, balance);
        self.totals.deposited = deposited;
        info!(account = %account, amount = %amount, balance = %balance, "collateral deposited");
        Ok(())
    }

    /// Withdraws the whole balance of `account` from `custody`.
    ///
    /// Returns the withdrawn amount.
    pub fn withdraw<T, W>(
        &mut self,
        token: &mut T,
        custody: &Address,
        account: &Address,
        permission: &W,
    ) -> Result<Amount>
    where
        T: TokenLedger + ?Sized,
        W: WithdrawalPermission + ?Sized,
    {
        if !permission.may_withdraw(account) {
            return Err(MarketError::WithdrawalLocked);
        }
        let amount = self.balance_of(account);
        let withdrawn = self
            .totals
            .withdrawn
            .checked_add(amount)
            .ok_or(MarketError::Overflow)?;

        token
            .transfer(custody, account, amount)
            .map_err(MarketError::TransferFailed)?;

        self.balances.remove(account);
        self.totals.withdrawn = withdrawn;
        info!(account = %account, amount = %amount, "collateral withdrawn");
        Ok(amount)
    }

    /// Burns `percentage`% of the account's balance, rounding down.
    ///
    /// Returns the slashed amount. The tokens stay in custody.
    pub fn slash(&mut self, account: &Address, percentage: u8) -> Result<Amount> {
        if percentage > 100 {
            return Err(MarketError::InvalidPercentage(percentage));
        }
        let balance = self.balance_of(account);
        let amount = balance.percent(percentage);
        let remaining = balance.checked_sub(amount).ok_or(MarketError::Overflow)?;
        let slashed = self
            .totals
            .slashed
            .checked_add(amount)
            .ok_or(MarketError::Overflow)?;

        self.balances.insert(*account, remaining);
        self.totals.slashed = slashed;
        debug!(account = %account, percentage, amount = %amount, remaining = %remaining, "collateral slashed");
        Ok(amount)
    }

    /// Captures the balances of `accounts` and the totals.
    pub(crate) fn checkpoint(&self, accounts: &[Address]) -> CollateralCheckpoint {
        CollateralCheckpoint {
            balances: accounts
                .iter()
                .map(|account| (*account, self.balances.get(account).copied()))
                .collect(),
            totals: self.totals,
        }
    }

    /// Puts captured balances and totals back.
    pub(crate) fn restore(&mut self, checkpoint: CollateralCheckpoint) {
        for (account, balance) in checkpoint.balances {
            match balance {
                Some(balance) => self.balances.insert(account, balance),
                None => self.balances.remove(&account),
            };
        }
        self.totals = checkpoint.totals;
    }

    /// Sum of all account balances.
    #[must_use]
    pub fn total_balance(&self) -> Amount {
        self.balances.values().copied().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_token::InMemoryToken;
    use proptest::prelude::*;

    fn setup(funds: u64) -> (InMemoryToken, Address, Address) {
        let custody = Address::from_label("custody");
        let host = Address::from_label("host");
        let mut token = InMemoryToken::new();
        token.mint(&host, Amount::new(funds));
        token.approve(&host, &custody, Amount::new(funds));
        (token, custody, host)
    }

    fn allow_all(_: &Address) -> bool {
        true
    }

    #[test]
    fn deposit_credits_balance_and_custody() {
        let (mut token, custody, host) = setup(1000);
        let mut ledger = CollateralLedger::new();

        ledger
            .deposit(&mut token, &custody, &host, Amount::new(300))
            .expect("deposit");

        assert_eq!(ledger.balance_of(&host), Amount::new(300));
        assert_eq!(ledger.totals().deposited, Amount::new(300));
        assert_eq!(token.balance_of(&custody), Amount::new(300));
        assert_eq!(token.balance_of(&host), Amount::new(700));
    }

    #[test]
    fn failed_deposit_changes_nothing() {
        let (mut token, custody, host) = setup(100);
        let mut ledger = CollateralLedger::new();

        let err = ledger
            .deposit(&mut token, &custody, &host, Amount::new(101))
            .expect_err("should fail");

        assert!(matches!(err, MarketError::TransferFailed(_)));
        assert!(ledger.balance_of(&host).is_zero());
        assert_eq!(ledger.totals(), CollateralTotals::default());
    }

    #[test]
    fn withdraw_takes_whole_balance() {
        let (mut token, custody, host) = setup(1000);
        let mut ledger = CollateralLedger::new();
        ledger
            .deposit(&mut token, &custody, &host, Amount::new(400))
            .expect("deposit");

        let withdrawn = ledger
            .withdraw(&mut token, &custody, &host, &allow_all)
            .expect("withdraw");

        assert_eq!(withdrawn, Amount::new(400));
        assert!(ledger.balance_of(&host).is_zero());
        assert_eq!(ledger.totals().withdrawn, Amount::new(400));
        assert_eq!(token.balance_of(&host), Amount::new(1000));
    }

    #[test]
    fn withdraw_respects_permission() {
        let (mut token, custody, host) = setup(1000);
        let mut ledger = CollateralLedger::new();
        ledger
            .deposit(&mut token, &custody, &host, Amount::new(400))
            .expect("deposit");

        let deny = |_: &Address| false;
        let err = ledger
            .withdraw(&mut token, &custody, &host, &deny)
            .expect_err("should fail");

        assert_eq!(err, MarketError::WithdrawalLocked);
        assert_eq!(ledger.balance_of(&host), Amount::new(400));
    }

    #[test]
    fn failed_withdraw_transfer_keeps_balance() {
        let (mut token, custody, host) = setup(1000);
        let mut ledger = CollateralLedger::new();
        ledger
            .deposit(&mut token, &custody, &host, Amount::new(400))
            .expect("deposit");
        token.set_fail_transfers(true);

        let err = ledger
            .withdraw(&mut token, &custody, &host, &allow_all)
            .expect_err("should fail");

        assert!(matches!(err, MarketError::TransferFailed(_)));
        assert_eq!(ledger.balance_of(&host), Amount::new(400));
        assert!(ledger.totals().withdrawn.is_zero());
    }

    #[test]
    fn slash_rounds_down_and_keeps_tokens() {
        let (mut token, custody, host) = setup(1000);
        let mut ledger = CollateralLedger::new();
        ledger
            .deposit(&mut token, &custody, &host, Amount::new(99))
            .expect("deposit");

        let slashed = ledger.slash(&host, 10).expect("slash");

        assert_eq!(slashed, Amount::new(9));
        assert_eq!(ledger.balance_of(&host), Amount::new(90));
        assert_eq!(ledger.totals().slashed, Amount::new(9));
        assert_eq!(token.balance_of(&custody), Amount::new(99));
    }

    #[test]
    fn slash_rejects_above_hundred() {
        let mut ledger = CollateralLedger::new();
        assert_eq!(
            ledger.slash(&Address::from_label("host"), 101),
            Err(MarketError::InvalidPercentage(101))
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Deposit(u64),
        Withdraw,
        Slash(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..500).prop_map(Op::Deposit),
            Just(Op::Withdraw),
            (0u8..=100).prop_map(Op::Slash),
        ]
    }

    proptest! {
        #[test]
        fn totals_monotonic_and_custody_covered(
            ops in proptest::collection::vec((0usize..3, op()), 0..64)
        ) {
            let custody = Address::from_label("custody");
            let accounts: Vec<Address> =
                (0..3).map(|i| Address::from_label(&format!("acct-{i}"))).collect();
            let mut token = InMemoryToken::new();
            for account in &accounts {
                token.mint(account, Amount::new(10_000));
                token.approve(account, &custody, Amount::new(10_000));
            }
            let mut ledger = CollateralLedger::new();

            for (who, op) in ops {
                let account = &accounts[who];
                let before = ledger.totals();
                let _ = match op {
                    Op::Deposit(units) => {
                        ledger.deposit(&mut token, &custody, account, Amount::new(units)).map(|()| Amount::ZERO)
                    }
                    Op::Withdraw => ledger.withdraw(&mut token, &custody, account, &allow_all),
                    Op::Slash(pct) => ledger.slash(account, pct),
                };
                let after = ledger.totals();
                after.assert_progressed_from(&before);

                let custody_balance = token.balance_of(&custody);
                prop_assert_eq!(after.outstanding(), Some(ledger.total_balance()));
                prop_assert!(custody_balance >= after.deposited.saturating_sub(after.withdrawn));
                prop_assert!(custody_balance >= after.slashed);
                for a in &accounts {
                    prop_assert!(ledger.balance_of(a) <= custody_balance.saturating_sub(after.slashed));
                }
            }
        }
    }
}
