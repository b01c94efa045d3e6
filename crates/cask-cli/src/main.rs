//! cask - Cask storage marketplace CLI
//!
//! Validates marketplace configuration and replays scenarios against a
//! simulated marketplace.

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use cask_cli::cli::{Cli, Commands};
use cask_cli::scenario::{self, Scenario};
use cask_market::MarketConfig;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_json) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("cask=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(io::stderr)).init();
    }
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::CheckConfig { config } => check_config(&config),
        Commands::Simulate {
            scenario,
            config,
            keep_going,
        } => simulate(&scenario, config.as_deref(), keep_going),
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = MarketConfig::from_file(path)?;
    info!(config = %path.display(), "config valid");
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn simulate(path: &Path, config: Option<&Path>, keep_going: bool) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => MarketConfig::from_file(path)?,
        None => MarketConfig::default(),
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read scenario '{}'", path.display()))?;
    let scenario = Scenario::from_json(&content)?;
    info!(scenario = %path.display(), steps = scenario.steps.len(), "replaying scenario");

    let mut stdout = io::stdout().lock();
    let summary = scenario::replay(&scenario, config, keep_going, &mut stdout)?;
    serde_json::to_writer(&mut stdout, &serde_json::json!({ "event": "summary", "summary": summary }))?;
    writeln!(stdout)?;
    Ok(())
}
