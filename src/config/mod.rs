//! Application configuration module
//!
//! This module provides type-safe configuration loading from environment variables
//! using the `config` and `dotenvy` crates. Configuration is loaded with the
//! `ECOMMERCE` prefix and nested values use double underscores as separators.
//!
//! # Example
//!
//! ```no_run
//! use ecommerce_common::config::AppConfig;
//!
//! let config = AppConfig::load().expect("Failed to load configuration");
//! config.validate().expect("Invalid configuration");
//!
//! println!("Publishing to exchange {}", config.broker.exchange);
//! ```

mod broker;
mod database;
mod error;
mod telemetry;

pub use broker::BrokerConfig;
pub use database::DatabaseConfig;
pub use error::{ConfigError, ValidationError};
pub use telemetry::{LogFormat, TelemetryConfig};

use serde::Deserialize;

/// Root configuration for a service using this toolkit
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Message broker connection and exchange
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Entity store (PostgreSQL)
    pub database: DatabaseConfig,

    /// Logging
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// This function:
    /// 1. Loads `.env` file if present (for development)
    /// 2. Reads environment variables with `ECOMMERCE` prefix
    /// 3. Uses `__` (double underscore) to separate nested values
    /// 4. Deserializes into typed configuration structs
    ///
    /// # Environment Variable Format
    ///
    /// - `ECOMMERCE__BROKER__HOST=rabbitmq` -> `broker.host = "rabbitmq"`
    /// - `ECOMMERCE__DATABASE__URL=...` -> `database.url = ...`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required values are missing or cannot be
    /// parsed into the expected types.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("ECOMMERCE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Validate all configuration sections
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for the first invalid value found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.broker.validate()?;
        self.database.validate()?;
        self.telemetry.validate()?;
        Ok(())
    }
}
