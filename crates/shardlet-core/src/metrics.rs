//! Per-device telemetry samples and cluster rollups

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ClusterError, ClusterResult, DeviceId};

/// Lowest physically meaningful temperature
pub const ABSOLUTE_ZERO_C: f64 = -273.15;

/// One telemetry sample for a device
///
/// Byte counts are signed so that a malformed sample from a backend can be
/// rejected by [`DeviceMetrics::validate`] instead of wrapping around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    /// Device this sample belongs to
    pub device_id: DeviceId,
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
    /// Memory in use, in bytes
    pub memory_used_bytes: i64,
    /// Total memory, in bytes
    pub memory_total_bytes: i64,
    /// Compute utilization percentage (0-100)
    pub utilization_pct: f64,
    /// Board power draw in watts
    pub power_watts: f64,
    /// Die temperature in degrees Celsius
    pub temperature_c: f64,
    /// Current core clock in MHz
    pub clock_mhz: u32,
}

impl DeviceMetrics {
    /// Create an idle sample taken now
    pub fn new(device_id: impl Into<String>, memory_used_bytes: i64, memory_total_bytes: i64) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            memory_used_bytes,
            memory_total_bytes,
            utilization_pct: 0.0,
            power_watts: 0.0,
            temperature_c: 25.0,
            clock_mhz: 0,
        }
    }

    pub fn with_utilization(mut self, utilization_pct: f64) -> Self {
        self.utilization_pct = utilization_pct;
        self
    }

    pub fn with_temperature(mut self, temperature_c: f64) -> Self {
        self.temperature_c = temperature_c;
        self
    }

    pub fn with_power(mut self, power_watts: f64) -> Self {
        self.power_watts = power_watts;
        self
    }

    pub fn with_clock(mut self, clock_mhz: u32) -> Self {
        self.clock_mhz = clock_mhz;
        self
    }

    /// Free memory in bytes
    pub fn available_bytes(&self) -> u64 {
        (self.memory_total_bytes - self.memory_used_bytes).max(0) as u64
    }

    /// Fraction of memory in use (0-1)
    pub fn used_fraction(&self) -> f64 {
        if self.memory_total_bytes <= 0 {
            return 0.0;
        }
        self.memory_used_bytes as f64 / self.memory_total_bytes as f64
    }

    /// Reject malformed or physically impossible samples
    pub fn validate(&self) -> ClusterResult<()> {
        if !self.utilization_pct.is_finite() || !(0.0..=100.0).contains(&self.utilization_pct) {
            return Err(ClusterError::Validation(format!(
                "utilization out of range [0, 100] for {}: {}%",
                self.device_id, self.utilization_pct
            )));
        }
        if self.memory_used_bytes < 0 {
            return Err(ClusterError::Validation(format!(
                "memory used cannot be negative for {}: {}",
                self.device_id, self.memory_used_bytes
            )));
        }
        if self.memory_total_bytes <= 0 {
            return Err(ClusterError::Validation(format!(
                "total memory must be positive for {}: {}",
                self.device_id, self.memory_total_bytes
            )));
        }
        if self.memory_used_bytes > self.memory_total_bytes {
            return Err(ClusterError::Validation(format!(
                "used memory ({}) exceeds total ({}) for {}",
                self.memory_used_bytes, self.memory_total_bytes, self.device_id
            )));
        }
        if !self.temperature_c.is_finite() || self.temperature_c < ABSOLUTE_ZERO_C {
            return Err(ClusterError::Validation(format!(
                "temperature below absolute zero for {}: {}°C",
                self.device_id, self.temperature_c
            )));
        }
        if !self.power_watts.is_finite() || self.power_watts < 0.0 {
            return Err(ClusterError::Validation(format!(
                "power draw must be a non-negative number for {}: {}W",
                self.device_id, self.power_watts
            )));
        }
        Ok(())
    }
}

/// Device holding the highest current temperature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HottestDevice {
    pub device_id: DeviceId,
    pub temperature_c: f64,
}

/// Cluster-wide rollup of the current samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAggregate {
    /// Number of devices with a current sample
    pub device_count: usize,
    /// Mean compute utilization across devices
    pub mean_utilization_pct: f64,
    /// Mean temperature across devices
    pub mean_temperature_c: f64,
    /// Sum of total memory
    pub total_memory_bytes: u64,
    /// Sum of used memory
    pub used_memory_bytes: u64,
    /// Sum of free memory
    pub available_memory_bytes: u64,
    /// Sum of power draw
    pub total_power_watts: f64,
    /// Hottest device, if any sample exists
    pub hottest: Option<HottestDevice>,
    /// When the rollup was computed
    pub computed_at: DateTime<Utc>,
}

impl ClusterAggregate {
    /// Roll up a set of current samples
    pub fn from_samples<'a>(samples: impl IntoIterator<Item = &'a DeviceMetrics>) -> Self {
        let mut device_count = 0usize;
        let mut utilization = 0.0;
        let mut temperature = 0.0;
        let mut total_memory = 0u64;
        let mut used_memory = 0u64;
        let mut power = 0.0;
        let mut hottest: Option<HottestDevice> = None;

        for m in samples {
            device_count += 1;
            utilization += m.utilization_pct;
            temperature += m.temperature_c;
            total_memory += m.memory_total_bytes.max(0) as u64;
            used_memory += m.memory_used_bytes.max(0) as u64;
            power += m.power_watts;

            let hotter = match &hottest {
                None => true,
                Some(h) => {
                    m.temperature_c > h.temperature_c
                        || (m.temperature_c == h.temperature_c && m.device_id < h.device_id)
                }
            };
            if hotter {
                hottest = Some(HottestDevice {
                    device_id: m.device_id.clone(),
                    temperature_c: m.temperature_c,
                });
            }
        }

        let n = device_count.max(1) as f64;
        Self {
            device_count,
            mean_utilization_pct: if device_count > 0 { utilization / n } else { 0.0 },
            mean_temperature_c: if device_count > 0 { temperature / n } else { 0.0 },
            total_memory_bytes: total_memory,
            used_memory_bytes: used_memory,
            available_memory_bytes: total_memory.saturating_sub(used_memory),
            total_power_watts: power,
            hottest,
            computed_at: Utc::now(),
        }
    }
}
