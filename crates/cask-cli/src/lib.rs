//! # cask-cli
//!
//! Command-line tooling for the Cask storage marketplace.
//!
//! - [`cli`]: clap argument definitions
//! - [`scenario`]: JSON scenario replay against a simulated marketplace
//! - [`error`]: CLI error type

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod error;
pub mod scenario;

pub use error::CliError;
