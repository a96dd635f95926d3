//! Configuration types and loading

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Resource name the object storage breaker is registered under
pub const DEFAULT_STORAGE_RESOURCE: &str = "object-storage";

/// Path layout used when none is configured
pub const DEFAULT_PATH_PATTERN: &str = ":class/:attachment/:id_partition/:style/:filename";

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Object storage configuration
    pub storage: StorageConfig,

    /// Circuit breaker policy
    pub circuit: CircuitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Breaker resource name shared by every storage call
    pub resource_name: String,
    /// Skip deleting previous files when saving
    pub keep_old_files: bool,
    /// Interpolated storage path for each style
    pub path_pattern: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            resource_name: DEFAULT_STORAGE_RESOURCE.to_string(),
            keep_old_files: false,
            path_pattern: DEFAULT_PATH_PATTERN.to_string(),
        }
    }
}

/// Shortest failure window and open period a breaker runs with
pub const MIN_COOL_OFF: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct CircuitConfig {
    /// Countable failures within one window that open the circuit
    pub threshold: u32,
    /// Failure window and open period
    #[serde(rename = "cool_off_seconds", with = "seconds")]
    cool_off: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            cool_off: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Zero values are raised to the smallest usable policy: a threshold of
    /// one and a [`MIN_COOL_OFF`] window.
    pub fn new(threshold: u32, cool_off: Duration) -> Self {
        Self {
            threshold,
            cool_off,
        }
        .clamped()
    }

    pub fn cool_off(&self) -> Duration {
        self.cool_off
    }

    /// Copy with zero threshold or cool-off raised to the minimum
    pub fn clamped(self) -> Self {
        Self {
            threshold: self.threshold.max(1),
            cool_off: self.cool_off.max(MIN_COOL_OFF),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold == 0 {
            return Err(ConfigError::invalid("threshold", "must be greater than zero"));
        }
        if self.cool_off.is_zero() {
            return Err(ConfigError::invalid(
                "cool_off_seconds",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// `Duration` as fractional seconds
mod seconds {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Storage
        if let Some(name) = lookup("CLIP_STORAGE_RESOURCE") {
            config.storage.resource_name = name;
        }
        if let Some(v) = lookup("CLIP_KEEP_OLD_FILES") {
            config.storage.keep_old_files = parse_bool("CLIP_KEEP_OLD_FILES", &v)?;
        }
        if let Some(pattern) = lookup("CLIP_PATH_PATTERN") {
            config.storage.path_pattern = pattern;
        }

        // Circuit breaker
        if let Some(v) = lookup("CLIP_CIRCUIT_THRESHOLD") {
            config.circuit.threshold = v
                .parse()
                .map_err(|e| ConfigError::invalid("CLIP_CIRCUIT_THRESHOLD", format!("{}", e)))?;
        }
        if let Some(v) = lookup("CLIP_CIRCUIT_COOL_OFF_SECONDS") {
            let secs: u64 = v.parse().map_err(|e| {
                ConfigError::invalid("CLIP_CIRCUIT_COOL_OFF_SECONDS", format!("{}", e))
            })?;
            config.circuit.cool_off = Duration::from_secs(secs);
        }

        config.circuit.validate()?;

        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("not a boolean: {}", other))),
    }
}
