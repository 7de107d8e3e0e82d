//! Configuration types for shardlet

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{ClusterError, ClusterResult};

/// Top-level cluster configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Telemetry collection
    pub telemetry: TelemetryConfig,
    /// Device scoring
    pub scoring: ScoringConfig,
    /// Shard placement
    pub placement: PlacementConfig,
    /// Thermal prediction and throttling
    pub thermal: ThermalConfig,
    /// Shutdown behavior
    pub shutdown: ShutdownConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl ClusterConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> ClusterResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClusterError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> ClusterResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ClusterError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> ClusterResult<()> {
        self.telemetry.validate()?;
        self.scoring.validate()?;
        self.placement.validate()?;
        self.thermal.validate()?;
        Ok(())
    }
}

/// Telemetry collection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Sampling interval in milliseconds
    pub sample_interval_ms: u64,
    /// Samples retained per device
    pub history_capacity: usize,
    /// Minimum movement that produces a change notification
    pub change_thresholds: ChangeThresholds,
    /// Capacity of the change-notification channel
    pub event_buffer: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2000,
            history_capacity: 100,
            change_thresholds: ChangeThresholds::default(),
            event_buffer: 256,
        }
    }
}

impl TelemetryConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    fn validate(&self) -> ClusterResult<()> {
        if self.sample_interval_ms == 0 {
            return Err(ClusterError::Config(
                "telemetry.sample_interval_ms must be positive".to_string(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(ClusterError::Config(
                "telemetry.history_capacity must be positive".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ClusterError::Config(
                "telemetry.event_buffer must be positive".to_string(),
            ));
        }
        self.change_thresholds.validate()
    }
}

/// Deltas beyond which a new sample is reported downstream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeThresholds {
    /// Utilization movement in percentage points
    pub utilization_pct: f64,
    /// Temperature movement in degrees Celsius
    pub temperature_c: f64,
    /// Movement of the used-memory fraction (0-1)
    pub memory_fraction: f64,
}

impl Default for ChangeThresholds {
    fn default() -> Self {
        Self {
            utilization_pct: 5.0,
            temperature_c: 2.0,
            memory_fraction: 0.05,
        }
    }
}

impl ChangeThresholds {
    fn validate(&self) -> ClusterResult<()> {
        for (name, value) in [
            ("utilization_pct", self.utilization_pct),
            ("temperature_c", self.temperature_c),
            ("memory_fraction", self.memory_fraction),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ClusterError::Config(format!(
                    "telemetry.change_thresholds.{} must be non-negative, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Device scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Weight of the free-memory fraction
    pub memory_weight: f64,
    /// Weight of idle compute
    pub utilization_weight: f64,
    /// Temperature where the thermal penalty starts
    pub high_water_c: f64,
    /// Temperature where the score reaches zero
    pub critical_c: f64,
    /// Multiplier applied to devices running at reduced precision
    pub precision_reduced_factor: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            memory_weight: 0.6,
            utilization_weight: 0.4,
            high_water_c: 80.0,
            critical_c: 100.0,
            precision_reduced_factor: 0.5,
        }
    }
}

impl ScoringConfig {
    fn validate(&self) -> ClusterResult<()> {
        require_finite(&[
            ("scoring.memory_weight", self.memory_weight),
            ("scoring.utilization_weight", self.utilization_weight),
            ("scoring.high_water_c", self.high_water_c),
            ("scoring.critical_c", self.critical_c),
            ("scoring.precision_reduced_factor", self.precision_reduced_factor),
        ])?;
        if self.memory_weight < 0.0 || self.utilization_weight < 0.0 {
            return Err(ClusterError::Config(
                "scoring weights must be non-negative".to_string(),
            ));
        }
        if ((self.memory_weight + self.utilization_weight) - 1.0).abs() > 1e-6 {
            return Err(ClusterError::Config(format!(
                "scoring weights must sum to 1, got {}",
                self.memory_weight + self.utilization_weight
            )));
        }
        if self.critical_c <= self.high_water_c {
            return Err(ClusterError::Config(format!(
                "scoring.critical_c ({}) must exceed scoring.high_water_c ({})",
                self.critical_c, self.high_water_c
            )));
        }
        if !(0.0..=1.0).contains(&self.precision_reduced_factor) {
            return Err(ClusterError::Config(
                "scoring.precision_reduced_factor must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shard placement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Wall-clock limit for the backtracking search, in milliseconds
    pub timeout_ms: u64,
    /// Relative total-memory difference (percent of the larger device)
    /// beyond which two devices count as different
    pub memory_tolerance_pct: f64,
    /// Utilization difference in percentage points beyond which two
    /// devices count as different
    pub utilization_tolerance_pct: f64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            memory_tolerance_pct: 20.0,
            utilization_tolerance_pct: 20.0,
        }
    }
}

impl PlacementConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> ClusterResult<()> {
        if !self.memory_tolerance_pct.is_finite() || self.memory_tolerance_pct < 0.0 {
            return Err(ClusterError::Config(
                "placement.memory_tolerance_pct must be non-negative".to_string(),
            ));
        }
        if !self.utilization_tolerance_pct.is_finite() || self.utilization_tolerance_pct < 0.0 {
            return Err(ClusterError::Config(
                "placement.utilization_tolerance_pct must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Thermal prediction and throttling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalConfig {
    /// Hard limit; reaching it always pauses the device
    pub critical_c: f64,
    /// Distance below critical at which the forecast triggers mitigation
    pub soft_margin_c: f64,
    /// Distance below critical the device must cool past before resuming
    pub resume_margin_c: f64,
    /// Forecast horizon in seconds
    pub horizon_secs: f64,
    /// Ambient temperature assumed by the thermal model
    pub ambient_c: f64,
    /// Whether the execution collaborator can lower precision
    pub precision_reduction: bool,
    /// Thermal samples retained per device
    pub history_capacity: usize,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            critical_c: 85.0,
            soft_margin_c: 5.0,
            resume_margin_c: 10.0,
            horizon_secs: 5.0,
            ambient_c: 25.0,
            precision_reduction: true,
            history_capacity: 60,
        }
    }
}

impl ThermalConfig {
    /// Forecast temperature that triggers mitigation
    pub fn soft_limit_c(&self) -> f64 {
        self.critical_c - self.soft_margin_c
    }

    /// Temperature a paused device must drop below to resume
    pub fn resume_below_c(&self) -> f64 {
        self.critical_c - self.resume_margin_c
    }

    fn validate(&self) -> ClusterResult<()> {
        require_finite(&[
            ("thermal.critical_c", self.critical_c),
            ("thermal.soft_margin_c", self.soft_margin_c),
            ("thermal.resume_margin_c", self.resume_margin_c),
            ("thermal.horizon_secs", self.horizon_secs),
            ("thermal.ambient_c", self.ambient_c),
        ])?;
        if self.soft_margin_c < 0.0 {
            return Err(ClusterError::Config(
                "thermal.soft_margin_c must be non-negative".to_string(),
            ));
        }
        if self.resume_margin_c <= self.soft_margin_c {
            return Err(ClusterError::Config(format!(
                "thermal.resume_margin_c ({}) must exceed thermal.soft_margin_c ({})",
                self.resume_margin_c, self.soft_margin_c
            )));
        }
        if self.horizon_secs <= 0.0 {
            return Err(ClusterError::Config(
                "thermal.horizon_secs must be positive".to_string(),
            ));
        }
        if self.ambient_c >= self.resume_below_c() {
            return Err(ClusterError::Config(
                "thermal.ambient_c must be below the resume threshold".to_string(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(ClusterError::Config(
                "thermal.history_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// NaN slips through every ordered comparison, so check it first
fn require_finite(fields: &[(&str, f64)]) -> ClusterResult<()> {
    match fields.iter().find(|(_, v)| !v.is_finite()) {
        Some((name, v)) => Err(ClusterError::Config(format!(
            "{} must be a finite number, got {}",
            name, v
        ))),
        None => Ok(()),
    }
}

/// Shutdown configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long to wait for in-flight operations, in milliseconds
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 100,
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (text or compact)
    pub format: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}
