//! CLI error types.

use cask_market::MarketError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// A marketplace entry point rejected the call.
    #[error(transparent)]
    Market(#[from] MarketError),

    /// A step referred to a request name never defined.
    #[error("unknown request name: {0}")]
    UnknownRequest(String),

    /// A step defined a request name twice.
    #[error("request name already used: {0}")]
    DuplicateName(String),

    /// A scenario step failed and the replay stopped.
    #[error("step {index} ({op}) failed: {source}")]
    StepFailed {
        /// Zero-based step position.
        index: usize,
        /// Step operation name.
        op: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<CliError>,
    },

    /// Scenario file could not be parsed.
    #[error("invalid scenario: {0}")]
    Scenario(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
