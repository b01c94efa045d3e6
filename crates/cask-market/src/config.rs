//! Marketplace configuration.
//!
//! Loaded once from TOML and immutable afterwards:
//!
//! ```toml
//! [collateral]
//! initial_amount = 100
//! minimum_amount = 40
//! slash_criterion = 2
//! slash_percentage = 10
//!
//! [proofs]
//! period_secs = 10
//! timeout_secs = 5
//! ```

use std::path::Path;

use cask_token::Amount;
use serde::{Deserialize, Serialize};

use crate::error::{MarketError, Result};
use crate::proofs::ProofConfig;

/// Collateral requirements and slashing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralConfig {
    /// Collateral a host must hold to fill a slot.
    pub initial_amount: Amount,
    /// Below this after slashing, the host loses the slot.
    pub minimum_amount: Amount,
    /// Slash on every `slash_criterion`-th missed proof.
    pub slash_criterion: u64,
    /// Percentage of the balance slashed.
    pub slash_percentage: u8,
}

impl Default for CollateralConfig {
    fn default() -> Self {
        Self {
            initial_amount: Amount::new(100),
            minimum_amount: Amount::new(40),
            slash_criterion: 2,
            slash_percentage: 10,
        }
    }
}

/// Complete marketplace configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Collateral policy.
    #[serde(default)]
    pub collateral: CollateralConfig,
    /// Proof period timing.
    #[serde(default)]
    pub proofs: ProofConfig,
}

impl MarketConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            MarketError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| MarketError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let collateral = &self.collateral;
        if collateral.slash_criterion == 0 {
            return Err(MarketError::Config(
                "collateral.slash_criterion must be greater than 0".to_string(),
            ));
        }
        if collateral.slash_percentage > 100 {
            return Err(MarketError::Config(
                "collateral.slash_percentage cannot exceed 100".to_string(),
            ));
        }
        if collateral.minimum_amount > collateral.initial_amount {
            return Err(MarketError::Config(
                "collateral.minimum_amount cannot exceed collateral.initial_amount".to_string(),
            ));
        }
        if self.proofs.period_secs == 0 {
            return Err(MarketError::Config(
                "proofs.period_secs must be greater than 0".to_string(),
            ));
        }
        if self.proofs.timeout_secs == 0 {
            return Err(MarketError::Config(
                "proofs.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
