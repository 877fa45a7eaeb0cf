//! CLI type definitions
//!
//! This module contains clap command structures that define the CLI interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::commands::config::ConfigArgs;
use super::commands::run::RunArgs;
use super::commands::tick::TickArgs;

#[derive(Parser, Debug)]
#[command(name = "fleet-loop")]
#[command(about = "Fleet logistics control loop", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Configuration file; defaults to .fleet/config.yaml layering
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control loop, reading operator commands from stdin
    Run(RunArgs),

    /// Run a single cycle and print what it decided
    Tick(TickArgs),

    /// Inspect configuration
    Config(ConfigArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "fleet-loop",
            "--json",
            "run",
            "--fleet",
            "fleet.yaml",
            "--max-cycles",
            "3",
            "--auto-approve",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.fleet, PathBuf::from("fleet.yaml"));
                assert_eq!(args.max_cycles, Some(3));
                assert!(args.auto_approve);
                assert!(args.interval.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_fleet_is_required() {
        assert!(Cli::try_parse_from(["fleet-loop", "tick"]).is_err());
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["fleet-loop", "config", "show", "--config", "custom.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("custom.yaml")));
    }
}
