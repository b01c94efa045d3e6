//! Token amount representation.
//!
//! Amounts are plain token units. All marketplace accounting goes through the
//! checked operations so that overflow is an error, never a wrap.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;

use crate::TOKEN_SYMBOL;

/// An amount of tokens.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    /// Zero tokens.
    pub const ZERO: Self = Self(0);

    /// Maximum amount.
    pub const MAX: Self = Self(u64::MAX);

    /// Create an amount from token units.
    #[must_use]
    pub const fn new(units: u64) -> Self {
        Self(units)
    }

    /// Get the amount in token units.
    #[must_use]
    pub const fn units(self) -> u64 {
        self.0
    }

    /// Check if the amount is zero.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Checked addition.
    #[must_use]
    pub const fn checked_add(self, rhs: Self) -> Option<Self> {
        match self.0.checked_add(rhs.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Checked subtraction.
    #[must_use]
    pub const fn checked_sub(self, rhs: Self) -> Option<Self> {
        match self.0.checked_sub(rhs.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Checked multiplication by a scalar.
    #[must_use]
    pub const fn checked_mul(self, rhs: u64) -> Option<Self> {
        match self.0.checked_mul(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Saturating subtraction.
    #[must_use]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// `percentage`% of this amount, rounded down.
    ///
    /// Uses a `u128` intermediate, so any `percentage` is overflow-free; the
    /// result is only meaningful for `percentage <= 100`.
    #[must_use]
    pub const fn percent(self, percentage: u8) -> Self {
        Self((self.0 as u128 * percentage as u128 / 100) as u64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {TOKEN_SYMBOL}", self.0)
    }
}

impl From<u64> for Amount {
    fn from(units: u64) -> Self {
        Self(units)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|a| a.0).sum())
    }
}
