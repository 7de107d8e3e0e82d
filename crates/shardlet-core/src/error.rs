//! Error types for shardlet

use thiserror::Error;

use crate::placement::PlacementFailure;

/// Main error type for shardlet
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Malformed or out-of-range metric sample or request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Device id not present in the registry
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Operation attempted before startup or during/after shutdown
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Zero or negative total capacity, or a cap that cannot be honored
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// Shards that could not be placed, with per-shard reasons
    #[error("Placement infeasible: {0}")]
    Infeasible(PlacementFailure),

    /// Device has been forced into the paused state
    #[error("Thermal limit on device {device_id}: {temperature_c:.1}°C")]
    ThermalLimit {
        device_id: String,
        temperature_c: f64,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Telemetry message with a schema version this build does not speak
    #[error("Unsupported schema version: {0}")]
    UnsupportedSchema(u32),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for shardlet operations
pub type ClusterResult<T> = Result<T, ClusterError>;

impl ClusterError {
    /// Whether this error belongs to the capacity class (bad weights or
    /// an infeasible placement)
    pub fn is_capacity(&self) -> bool {
        matches!(self, ClusterError::Capacity(_) | ClusterError::Infeasible(_))
    }

    /// Whether this error is a validation rejection
    pub fn is_validation(&self) -> bool {
        matches!(self, ClusterError::Validation(_))
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ClusterError {
    fn from(err: toml::de::Error) -> Self {
        ClusterError::Config(err.to_string())
    }
}
