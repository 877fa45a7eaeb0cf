//! Command-line interface.

pub mod commands;
pub mod output;
pub mod types;

use std::path::Path;

use anyhow::Result;

pub use types::{Cli, Commands};

use crate::domain::models::Config;
use crate::infrastructure::{ConfigLoader, LogConfig, LoggerImpl};

/// Load `path` if given, otherwise the `.fleet/` layering in the working
/// directory. Validation errors are returned, never defaulted over.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

/// Console logs go to stderr so stdout only carries command output.
pub fn init_logging(config: &Config) -> Result<LoggerImpl> {
    LoggerImpl::init(&LogConfig::from(&config.logging).on_stderr())
}

/// Dispatch a parsed command line.
pub async fn execute(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let _logger = init_logging(&config)?;

    match cli.command {
        Commands::Run(args) => commands::run::execute(args, &config, cli.json).await,
        Commands::Tick(args) => commands::tick::execute(args, &config, cli.json).await,
        Commands::Config(args) => commands::config::execute(args, &config, cli.json).await,
    }
}

/// Report a failed command and exit non-zero.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let chain: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        let body = serde_json::json!({ "error": err.to_string(), "causes": chain });
        println!("{body}");
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1);
}
