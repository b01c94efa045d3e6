//! Shared handle for concurrent callers.
//!
//! Entry points are serialized through one mutex, so every caller observes
//! them as if executed one at a time.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::marketplace::Marketplace;
use crate::proofs::ProofSystem;
use cask_token::TokenLedger;

/// Cloneable, thread-safe handle to a [`Marketplace`].
#[derive(Debug)]
pub struct SharedMarketplace<T, P, C> {
    inner: Arc<Mutex<Marketplace<T, P, C>>>,
}

impl<T, P, C> Clone for SharedMarketplace<T, P, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, P, C> SharedMarketplace<T, P, C>
where
    T: TokenLedger,
    P: ProofSystem,
    C: Clock,
{
    /// Wrap a marketplace.
    pub fn new(market: Marketplace<T, P, C>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(market)),
        }
    }

    /// Run `f` with exclusive access to the marketplace.
    pub fn with<R>(&self, f: impl FnOnce(&mut Marketplace<T, P, C>) -> R) -> R {
        let mut market = self.inner.lock();
        f(&mut market)
    }
}
