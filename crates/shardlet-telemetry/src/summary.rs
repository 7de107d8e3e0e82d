//! Windowed statistics over a device's metric history

use shardlet_core::{DeviceMetrics, RingHistory};

/// Fraction of memory in use above which a sample counts as a memory alert
pub const HIGH_MEMORY_FRACTION: f64 = 0.9;

/// Temperature above which a sample counts as a thermal alert
pub const HIGH_TEMPERATURE_C: f64 = 75.0;

/// Thermal alerts within one window that suggest hardware throttling
const THROTTLE_ALERT_COUNT: usize = 3;

/// Avg/peak/current of one metric over the window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stat {
    pub avg: f64,
    pub peak: f64,
    pub current: f64,
}

impl Stat {
    fn over(values: impl ExactSizeIterator<Item = f64> + Clone) -> Option<Self> {
        let n = values.len();
        let current = values.clone().last()?;
        let sum: f64 = values.clone().sum();
        let peak = values.fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            avg: sum / n as f64,
            peak,
            current,
        })
    }
}

/// Summary of the samples currently held for a device
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub device_id: String,
    /// Samples the summary covers
    pub samples: usize,
    /// Used memory in bytes
    pub memory_used: Stat,
    pub utilization_pct: Stat,
    pub temperature_c: Stat,
    pub power_watts: Stat,
    /// Samples above [`HIGH_MEMORY_FRACTION`]
    pub high_memory_alerts: usize,
    /// Samples above [`HIGH_TEMPERATURE_C`]
    pub high_temperature_alerts: usize,
    /// More than a handful of thermal alerts in the window
    pub throttle_suspected: bool,
}

impl MetricsSummary {
    /// Summarize a history buffer, `None` when it is empty
    pub fn from_history(device_id: &str, history: &RingHistory<DeviceMetrics>) -> Option<Self> {
        if history.is_empty() {
            return None;
        }

        let high_memory_alerts = history
            .iter()
            .filter(|m| m.used_fraction() > HIGH_MEMORY_FRACTION)
            .count();
        let high_temperature_alerts = history
            .iter()
            .filter(|m| m.temperature_c > HIGH_TEMPERATURE_C)
            .count();

        Some(Self {
            device_id: device_id.to_string(),
            samples: history.len(),
            memory_used: Stat::over(history.iter().map(|m| m.memory_used_bytes as f64))?,
            utilization_pct: Stat::over(history.iter().map(|m| m.utilization_pct))?,
            temperature_c: Stat::over(history.iter().map(|m| m.temperature_c))?,
            power_watts: Stat::over(history.iter().map(|m| m.power_watts))?,
            high_memory_alerts,
            high_temperature_alerts,
            throttle_suspected: high_temperature_alerts > THROTTLE_ALERT_COUNT,
        })
    }
}
