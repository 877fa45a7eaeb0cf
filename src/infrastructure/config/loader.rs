use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::{Config, OracleKind};

/// Configuration error types
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),

    #[error("Invalid {name}: {value}. Must be between 0 and 1")]
    OutOfUnitRange { name: &'static str, value: f64 },

    #[error(
        "Invalid fallback_confidence ({fallback}): must be below oracle_confidence_floor ({floor})"
    )]
    FallbackAboveFloor { fallback: f64, floor: f64 },

    #[error("Invalid {0}: must be greater than zero")]
    NonPositive(&'static str),

    #[error("Invalid scoring weights: all weights must be non-negative and sum above zero")]
    InvalidWeights,

    #[error("Invalid standstill_factor: {0}. Must be at least 1.0")]
    InvalidTrafficCeiling(f64),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .fleet/config.yaml (project config)
    /// 3. .fleet/local.yaml (local overrides, optional)
    /// 4. Environment variables (FLEET_* prefix, `__` separates sections)
    pub fn load() -> Result<Config> {
        Self::load_from_dir(".")
    }

    /// Same as [`ConfigLoader::load`] with `.fleet/` resolved under `base`.
    pub fn load_from_dir(base: impl AsRef<Path>) -> Result<Config> {
        let dir = base.as_ref().join(".fleet");
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")))
            .merge(Env::prefixed("FLEET_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file; environment overrides still apply.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("FLEET_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let unit = |name: &'static str, value: f64| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::OutOfUnitRange { name, value })
            }
        };

        // Loop timing
        if config.control.phase_timeout_seconds == 0 {
            return Err(ConfigError::NonPositive("phase_timeout_seconds"));
        }
        if config.control.approval_ttl_seconds == 0 {
            return Err(ConfigError::NonPositive("approval_ttl_seconds"));
        }
        if config.control.plan_workers == 0 {
            return Err(ConfigError::NonPositive("plan_workers"));
        }

        // Observation
        if config.observation.max_speed_kmh <= 0.0 {
            return Err(ConfigError::NonPositive("max_speed_kmh"));
        }
        if config.observation.max_clock_skew_seconds < 0 {
            return Err(ConfigError::ValidationFailed(format!(
                "max_clock_skew_seconds ({}) must not be negative",
                config.observation.max_clock_skew_seconds
            )));
        }
        if config.observation.stuck_readings == 0 {
            return Err(ConfigError::NonPositive("stuck_readings"));
        }

        // Reasoning
        let reasoning = &config.reasoning;
        if reasoning.oracle_timeout_seconds == 0 {
            return Err(ConfigError::NonPositive("oracle_timeout_seconds"));
        }
        unit("oracle_confidence_floor", reasoning.oracle_confidence_floor)?;
        unit("fallback_confidence", reasoning.fallback_confidence)?;
        unit("low_fuel_fraction", reasoning.low_fuel_fraction)?;
        if reasoning.fallback_confidence >= reasoning.oracle_confidence_floor {
            return Err(ConfigError::FallbackAboveFloor {
                fallback: reasoning.fallback_confidence,
                floor: reasoning.oracle_confidence_floor,
            });
        }

        // Routing
        if config.routing.standstill_factor < 1.0 || !config.routing.standstill_factor.is_finite() {
            return Err(ConfigError::InvalidTrafficCeiling(config.routing.standstill_factor));
        }
        if config.routing.average_speed_kmh <= 0.0 {
            return Err(ConfigError::NonPositive("average_speed_kmh"));
        }

        // Assignment
        if config.assignment.search_radius_km <= 0.0 {
            return Err(ConfigError::NonPositive("search_radius_km"));
        }
        unit("usable_fuel_fraction", config.assignment.usable_fuel_fraction)?;

        // Decision
        unit("approval_threshold", config.decision.approval_threshold)?;
        if !config.decision.weights.is_valid() {
            return Err(ConfigError::InvalidWeights);
        }

        // Learning rate and step live in (0, 1]
        for (name, value) in [
            ("learning_rate", config.learning.learning_rate),
            ("max_step", config.learning.max_step),
        ] {
            if value <= 0.0 {
                return Err(ConfigError::NonPositive(name));
            }
            unit(name, value)?;
        }
        if !(0.0..0.25).contains(&config.learning.min_weight) {
            return Err(ConfigError::ValidationFailed(format!(
                "min_weight ({}) must be in [0, 0.25) so four weights can sum to 1",
                config.learning.min_weight
            )));
        }

        // Retry config
        if config.retry.initial_backoff_ms >= config.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.retry.initial_backoff_ms,
                config.retry.max_backoff_ms,
            ));
        }

        // Oracle
        if config.oracle.kind == OracleKind::Http
            && config.oracle.endpoint.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::ValidationFailed(
                "oracle.endpoint is required when oracle.kind is http".to_string(),
            ));
        }

        // Logging
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidRotation(config.logging.rotation.clone()));
        }

        Ok(())
    }
}
