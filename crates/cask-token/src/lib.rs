//! # cask-token
//!
//! Token primitives for the Cask storage marketplace.
//!
//! This crate provides:
//! - [`Amount`]: token units with checked arithmetic
//! - [`Address`]: 32-byte account identifiers (base58 rendered)
//! - [`TokenLedger`]: the narrow transfer interface the marketplace consumes
//! - [`InMemoryToken`]: a simulated ledger with allowances and failure injection
//!
//! ## Example
//!
//! ```rust
//! use cask_token::{Address, Amount, InMemoryToken, TokenLedger};
//!
//! # fn example() -> cask_token::Result<()> {
//! let mut token = InMemoryToken::new();
//! let alice = Address::from_label("alice");
//! let bob = Address::from_label("bob");
//!
//! token.mint(&alice, Amount::new(100));
//! token.transfer(&alice, &bob, Amount::new(40))?;
//! assert_eq!(token.balance_of(&bob), Amount::new(40));
//! # Ok(())
//! # }
//! # example().expect("example");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod amount;
pub mod error;
pub mod ledger;

pub use address::Address;
pub use amount::Amount;
pub use error::{Result, TokenError};
pub use ledger::{InMemoryToken, TokenLedger};

/// Ticker used when rendering amounts.
pub const TOKEN_SYMBOL: &str = "CASK";
