//! Configuration management for fetchpool
//!
//! Settings are layered, lowest priority first:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables
//!
//! # Usage
//!
//! ```no_run
//! use fetchpool::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Pool size: {}", config.pool.size);
//! ```
//!
//! # Environment Variables
//!
//! Any key can be overridden with `FETCHPOOL__<section>__<key>`:
//! - `FETCHPOOL__POOL__SIZE=32`
//! - `FETCHPOOL__POOL__MAX_BODY_SIZE=1MB`
//! - `FETCHPOOL__HTTP__PROXY=http://proxy:3128`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/fetchpool.toml`.
//! This can be overridden using the `FETCHPOOL_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{Config, HttpSettings, PoolSettings};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed or a value
    /// fails validation (zero pool size, zero timeouts, bad proxy URL).
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Re-check after applying overrides on top of a loaded configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate(self)
    }
}
