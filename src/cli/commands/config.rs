//! `fleet-loop config`: show or validate the effective configuration.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the merged configuration
    Show,
    /// Check the configuration and report problems
    Validate,
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct ConfigOutput(Config);

impl CommandOutput for ConfigOutput {
    fn to_human(&self) -> String {
        serde_yaml::to_string(&self.0).unwrap_or_else(|e| format!("<unprintable config: {e}>"))
    }
}

#[derive(Debug, Serialize)]
struct ValidationOutput {
    valid: bool,
    oracle: String,
    max_cycles: Option<u64>,
}

impl CommandOutput for ValidationOutput {
    fn to_human(&self) -> String {
        let cycles = self
            .max_cycles
            .map_or_else(|| "unbounded".to_string(), |n| n.to_string());
        format!("Configuration is valid (oracle: {}, cycles: {cycles})", self.oracle)
    }
}

/// `config` has already been loaded and validated by the caller; a bad
/// configuration never gets this far.
pub async fn execute(args: ConfigArgs, config: &Config, json_mode: bool) -> Result<()> {
    match args.command {
        ConfigCommands::Show => output(&ConfigOutput(config.clone()), json_mode),
        ConfigCommands::Validate => output(
            &ValidationOutput {
                valid: true,
                oracle: config.oracle.kind.as_str().to_string(),
                max_cycles: config.control.max_cycles,
            },
            json_mode,
        ),
    }
    Ok(())
}
