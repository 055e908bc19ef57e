//! Shim configuration.
//!
//! [`ShimConfig`] carries broker addresses, topics, pool sizing, lifecycle
//! bounds and policies. It can be built from defaults, read from `HIVE_SHIM_*`
//! environment variables, or parsed from TOML. Every loader validates before
//! returning.
//!
//! # Example
//!
//! ```no_run
//! use hive_shim_runtime::config::ShimConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ShimConfig::from_env()?;
//! let listener = config.listener();
//!
//! println!("Consuming {} with {} workers", listener.topic, listener.worker_count);
//! # Ok(())
//! # }
//! ```

use crate::listener::{ListenerConfig, RestartPolicy, StartupPolicy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Prefix of every environment variable read by [`ShimConfig::from_env`].
pub const ENV_PREFIX: &str = "HIVE_SHIM_";

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable could not be parsed
    #[error("Invalid value for {key}: {value}")]
    InvalidValue {
        /// Variable or field name
        key: String,
        /// Rejected value
        value: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// How the pool reacts to worker faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartMode {
    /// Continue with reduced capacity
    #[default]
    Degrade,
    /// Spawn replacements up to `max_restarts`
    Replace,
}

impl FromStr for RestartMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "degrade" => Ok(Self::Degrade),
            "replace" => Ok(Self::Replace),
            _ => Err(ConfigError::InvalidValue {
                key: "restart_policy".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl FromStr for StartupPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "degrade" => Ok(Self::Degrade),
            "abort" => Ok(Self::Abort),
            _ => Err(ConfigError::InvalidValue {
                key: "startup_policy".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Shim configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimConfig {
    /// Comma-separated bootstrap servers
    pub brokers: String,
    /// Topic requests are published to
    pub request_topic: String,
    /// Shared topic responses are consumed from
    pub response_topic: String,
    /// Consumer group shared by all response workers
    pub consumer_group: String,
    /// Number of response consumer workers
    pub consumer_threads: usize,
    /// Startup barrier bound in milliseconds
    pub startup_timeout_ms: u64,
    /// Shutdown drain bound in milliseconds
    pub shutdown_timeout_ms: u64,
    /// Default per-call timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Partial readiness handling
    pub startup_policy: StartupPolicy,
    /// Worker fault handling
    pub restart_policy: RestartMode,
    /// Restart budget when `restart_policy` is `replace`
    pub max_restarts: u32,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            request_topic: "request_topic".to_string(),
            response_topic: "response_topic".to_string(),
            consumer_group: "response-consumer-group".to_string(),
            consumer_threads: 3,
            startup_timeout_ms: 5000,
            shutdown_timeout_ms: 5000,
            request_timeout_ms: 10_000,
            startup_policy: StartupPolicy::Degrade,
            restart_policy: RestartMode::Degrade,
            max_restarts: 3,
        }
    }
}

impl ShimConfig {
    /// Load configuration from `HIVE_SHIM_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed or the result is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, called with full variable names
    /// such as `HIVE_SHIM_BROKERS`.
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be parsed or the result is invalid
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(brokers) = var("BROKERS") {
            config.brokers = brokers;
        }
        if let Some(topic) = var("REQUEST_TOPIC") {
            config.request_topic = topic;
        }
        if let Some(topic) = var("RESPONSE_TOPIC") {
            config.response_topic = topic;
        }
        if let Some(group) = var("CONSUMER_GROUP") {
            config.consumer_group = group;
        }
        if let Some(value) = var("CONSUMER_THREADS") {
            config.consumer_threads = parse("CONSUMER_THREADS", &value)?;
        }
        if let Some(value) = var("STARTUP_TIMEOUT_MS") {
            config.startup_timeout_ms = parse("STARTUP_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout_ms = parse("SHUTDOWN_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = parse("REQUEST_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("STARTUP_POLICY") {
            config.startup_policy = value.parse()?;
        }
        if let Some(value) = var("RESTART_POLICY") {
            config.restart_policy = value.parse()?;
        }
        if let Some(value) = var("MAX_RESTARTS") {
            config.max_restarts = parse("MAX_RESTARTS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the document cannot be parsed or the result is invalid
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(document).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("brokers", &self.brokers),
            ("request_topic", &self.request_topic),
            ("response_topic", &self.response_topic),
            ("consumer_group", &self.consumer_group),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!("{name} cannot be empty")));
            }
        }
        if self.consumer_threads == 0 {
            return Err(ConfigError::ValidationError(
                "consumer_threads must be > 0".to_string(),
            ));
        }
        if self.startup_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "startup_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "request_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Get startup barrier bound as Duration
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Get shutdown drain bound as Duration
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Get default call timeout as Duration
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Effective restart policy.
    #[must_use]
    pub const fn restart(&self) -> RestartPolicy {
        match self.restart_policy {
            RestartMode::Degrade => RestartPolicy::Degrade,
            RestartMode::Replace => RestartPolicy::Replace {
                max_restarts: self.max_restarts,
            },
        }
    }

    /// Pool configuration for the response listener.
    #[must_use]
    pub fn listener(&self) -> ListenerConfig {
        self.pool_on(&self.response_topic)
    }

    /// Pool configuration for a request server.
    #[must_use]
    pub fn server(&self) -> ListenerConfig {
        self.pool_on(&self.request_topic)
    }

    fn pool_on(&self, topic: &str) -> ListenerConfig {
        ListenerConfig::new(topic)
            .with_worker_count(self.consumer_threads)
            .with_startup_timeout(self.startup_timeout())
            .with_shutdown_timeout(self.shutdown_timeout())
            .with_startup_policy(self.startup_policy)
            .with_restart_policy(self.restart())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
    })
}
