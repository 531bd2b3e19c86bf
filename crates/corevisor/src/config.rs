//! Supervisor Configuration
//!
//! Provides the opaque start payload handed to the engine and the
//! tunables that bound every wait the supervisor performs.

use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Default bound on engine startup
const DEFAULT_START_TIMEOUT_MS: u64 = 10_000;

/// Default bound on engine shutdown
const DEFAULT_STOP_TIMEOUT_MS: u64 = 5_000;

/// Default bound on a single latency probe
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3_000;

/// Default per-subscriber status queue depth
const DEFAULT_STATUS_QUEUE_CAPACITY: usize = 8;

/// Core configuration blob
///
/// The supervisor never interprets the document; it only checks that it
/// is a non-empty JSON object before handing it to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    /// Human-readable label for the run (shown in logs)
    pub remark: Option<String>,
    /// Full engine configuration document
    pub document: Value,
}

impl CoreConfig {
    /// Wrap an already-parsed document
    pub fn new(document: Value) -> Self {
        Self {
            remark: None,
            document,
        }
    }

    /// Parse a configuration from JSON text
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let document =
            serde_json::from_str(text).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        Ok(Self::new(document))
    }

    /// Attach a remark
    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }

    /// Label used in log lines
    pub fn label(&self) -> &str {
        self.remark.as_deref().unwrap_or("unnamed")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.document {
            Value::Object(map) if !map.is_empty() => Ok(()),
            Value::Object(_) => Err(ConfigError::Empty),
            _ => Err(ConfigError::NotAnObject),
        }
    }
}

/// Supervisor tunables
///
/// Every field has a default, so an empty TOML document is valid.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Bound on `Engine::start`
    pub start_timeout_ms: u64,
    /// Bound on `Engine::stop`
    pub stop_timeout_ms: u64,
    /// Bound on `Engine::probe_latency`
    pub probe_timeout_ms: u64,
    /// Depth of each subscriber's status queue
    pub status_queue_capacity: usize,
    /// Log level for hosts that install a subscriber
    pub log_level: String,
}

impl SupervisorSettings {
    /// Parse settings from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            toml::from_str(text).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_timeout_ms == 0 || self.stop_timeout_ms == 0 || self.probe_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.status_queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            status_queue_capacity: DEFAULT_STATUS_QUEUE_CAPACITY,
            log_level: "info".to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration is missing")]
    Missing,

    #[error("Malformed configuration: {0}")]
    Malformed(String),

    #[error("Configuration must be a JSON object")]
    NotAnObject,

    #[error("Configuration object is empty")]
    Empty,

    #[error("Timeouts must be non-zero")]
    ZeroTimeout,

    #[error("Status queue capacity must be at least 1")]
    ZeroQueueCapacity,
}
