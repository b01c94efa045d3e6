//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Cask storage marketplace tools.
#[derive(Parser, Debug, Clone)]
#[command(name = "cask")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true, env = "CASK_LOG_JSON")]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Load and validate a marketplace config, printing it as JSON.
    CheckConfig {
        /// Path to the TOML config.
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Replay a JSON scenario against a simulated marketplace.
    Simulate {
        /// Path to the scenario file.
        #[arg(short, long)]
        scenario: PathBuf,

        /// Path to the TOML config; defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Report failing steps and continue instead of stopping.
        #[arg(long)]
        keep_going: bool,
    },
}
