//! # cask-market
//!
//! State machine of the Cask decentralized storage marketplace.
//!
//! Clients escrow payment for storage [`Request`]s; each request is split
//! into slots that hosts fill by staking collateral and proving they hold
//! the data. Hosts are paid when storage completes and slashed when they
//! miss proofs.
//!
//! - [`Marketplace`]: the orchestrator and its entry points
//! - [`RequestRegistry`] / [`SlotRegistry`]: lifecycle bookkeeping
//! - [`CollateralLedger`]: host collateral and slashing
//! - [`ProofSystem`]: proof obligations consumed by the marketplace
//! - [`MarketConfig`]: collateral and proof-period policy
//!
//! ## Example
//!
//! ```rust
//! use cask_market::{Ask, Content, ManualClock, MarketConfig, Request, RequestState, SimulatedMarketplace};
//! use cask_token::{Address, Amount};
//!
//! # fn example() -> cask_market::Result<()> {
//! let clock = ManualClock::new(1_000);
//! let mut market = SimulatedMarketplace::simulated(MarketConfig::default(), clock)?;
//! let custody = *market.custody();
//! let client = Address::from_label("client");
//! market.token_mut().mint(&client, Amount::new(1_000));
//! market.token_mut().approve(&client, &custody, Amount::new(1_000));
//!
//! let request = Request {
//!     client,
//!     ask: Ask {
//!         slots: 1,
//!         slot_size: 1024,
//!         duration: 60,
//!         proof_probability: 4,
//!         reward: Amount::new(2),
//!         max_slot_loss: 0,
//!     },
//!     content: Content { cid: "cid".into(), merkle_root: [0; 32] },
//!     expiry: 1_100,
//!     nonce: [0; 32],
//! };
//! let id = market.request_storage(&client, request)?;
//! assert_eq!(market.request_state(&id)?, RequestState::New);
//! # Ok(())
//! # }
//! # example().expect("example");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod collateral;
pub mod config;
pub mod error;
pub mod events;
pub mod funds;
pub mod ids;
pub mod marketplace;
pub mod proofs;
pub mod requests;
pub mod shared;
pub mod slots;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collateral::{CollateralLedger, CollateralTotals, WithdrawalPermission};
pub use config::{CollateralConfig, MarketConfig};
pub use error::{MarketError, Result};
pub use events::MarketEvent;
pub use funds::{FundsCheck, MarketplaceFunds};
pub use ids::{RequestId, SlotId};
pub use marketplace::{Marketplace, SIMULATED_CUSTODY, SimulatedMarketplace};
pub use proofs::{ProofConfig, ProofError, ProofSystem, SimulatedProofs, TrackedSlot};
pub use requests::{Ask, Content, Request, RequestContext, RequestRegistry, RequestState};
pub use shared::SharedMarketplace;
pub use slots::{Slot, SlotRegistry, SlotState};
