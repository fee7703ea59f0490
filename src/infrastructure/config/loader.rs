use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::config::WaypointConfig;

/// Default project-local configuration directory
pub const CONFIG_DIR: &str = ".waypoint";

/// Prefix for environment overrides; `__` separates nested keys
pub const ENV_PREFIX: &str = "WAYPOINT_";

/// Upper bound on `knowledge.expiry_days`, roughly a century
pub const MAX_EXPIRY_DAYS: i64 = 36_500;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid tasks.max_retained: {0}. Must be at least 1")]
    InvalidMaxRetained(usize),

    #[error("Invalid registry.reliability_smoothing: {0}. Must be in (0, 1]")]
    InvalidSmoothing(f64),

    #[error("Invalid {field}: {value}. Must be between 0 and 1")]
    InvalidFraction { field: &'static str, value: f64 },

    #[error("Invalid planner.max_concurrency: {0}. Must be at least 1")]
    InvalidConcurrency(usize),

    #[error("Invalid planner.default_deadline_ms: {0}. Must be positive")]
    InvalidDeadline(u64),

    #[error("Invalid knowledge.expiry_days: {0}. Must be between 0 and {MAX_EXPIRY_DAYS}")]
    InvalidExpiryDays(i64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .waypoint/config.yaml (project config)
    /// 3. .waypoint/local.yaml (local overrides, optional)
    /// 4. Environment variables (WAYPOINT_* prefix)
    pub fn load() -> Result<WaypointConfig> {
        Self::load_from_dir(CONFIG_DIR)
    }

    /// Same precedence as [`ConfigLoader::load`], rooted at `dir`.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<WaypointConfig> {
        let dir = dir.as_ref();
        let config: WaypointConfig = Figment::new()
            .merge(Serialized::defaults(WaypointConfig::default()))
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<WaypointConfig> {
        let config: WaypointConfig = Figment::new()
            .merge(Serialized::defaults(WaypointConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &WaypointConfig) -> Result<(), ConfigError> {
        if config.tasks.max_retained == 0 {
            return Err(ConfigError::InvalidMaxRetained(config.tasks.max_retained));
        }

        let alpha = config.registry.reliability_smoothing;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ConfigError::InvalidSmoothing(alpha));
        }

        let fractions = [
            ("registry.cpu_ceiling", config.registry.cpu_ceiling),
            ("registry.pressure_cpu_load", config.registry.pressure_cpu_load),
            ("planner.success_confidence", config.planner.success_confidence),
            ("planner.failure_confidence", config.planner.failure_confidence),
            (
                "knowledge.expiry_below_confidence",
                config.knowledge.expiry_below_confidence,
            ),
        ];
        for (field, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidFraction { field, value });
            }
        }

        if config.planner.max_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(config.planner.max_concurrency));
        }

        if config.planner.default_deadline_ms == 0 {
            return Err(ConfigError::InvalidDeadline(config.planner.default_deadline_ms));
        }

        if !(0..=MAX_EXPIRY_DAYS).contains(&config.knowledge.expiry_days) {
            return Err(ConfigError::InvalidExpiryDays(config.knowledge.expiry_days));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        if config.persistence.path.trim().is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }

        Ok(())
    }
}
