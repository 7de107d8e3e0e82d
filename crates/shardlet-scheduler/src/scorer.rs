//! Device suitability scoring

use serde::{Deserialize, Serialize};
use shardlet_core::{DeviceId, DeviceMetrics, GpuDevice, ScoringConfig};
use std::cmp::Ordering;

/// Breakdown of a composite score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponents {
    /// Free fraction of device memory
    pub memory: f64,
    /// Idle fraction of compute
    pub compute: f64,
    /// Multiplier from temperature, 1.0 below the high-water mark
    pub thermal_penalty: f64,
    /// Multiplier from the device's execution mode
    pub mode_factor: f64,
}

/// Normalized suitability of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceScore {
    pub device_id: DeviceId,
    /// Composite value in [0, 1]
    pub value: f64,
    /// Free memory the score was computed from
    pub available_bytes: u64,
    pub components: ScoreComponents,
}

/// A device together with the sample it is scored on
#[derive(Debug, Clone, Copy)]
pub struct ScoringCandidate<'a> {
    pub device: &'a GpuDevice,
    pub metrics: &'a DeviceMetrics,
    /// Device is executing at reduced precision
    pub precision_reduced: bool,
}

impl<'a> ScoringCandidate<'a> {
    pub fn new(device: &'a GpuDevice, metrics: &'a DeviceMetrics) -> Self {
        Self {
            device,
            metrics,
            precision_reduced: false,
        }
    }

    pub fn with_precision_reduced(mut self, reduced: bool) -> Self {
        self.precision_reduced = reduced;
        self
    }
}

/// Converts capabilities and live metrics into a comparable score
#[derive(Debug, Clone)]
pub struct DeviceScorer {
    config: ScoringConfig,
}

impl DeviceScorer {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Linear falloff from 1 at the high-water mark to 0 at critical
    pub fn thermal_penalty(&self, temperature_c: f64) -> f64 {
        let ScoringConfig {
            high_water_c,
            critical_c,
            ..
        } = self.config;
        if temperature_c <= high_water_c {
            1.0
        } else if temperature_c >= critical_c {
            0.0
        } else {
            (critical_c - temperature_c) / (critical_c - high_water_c)
        }
    }

    /// Score a single device
    pub fn score(&self, candidate: &ScoringCandidate<'_>) -> DeviceScore {
        let metrics = candidate.metrics;
        // Prefer the registered capacity, fall back to what the sample reports
        let total = if candidate.device.memory_total > 0 {
            candidate.device.memory_total
        } else {
            metrics.memory_total_bytes.max(0) as u64
        };
        let used = metrics.memory_used_bytes.max(0) as u64;
        let available_bytes = total.saturating_sub(used);

        let memory = if total == 0 {
            0.0
        } else {
            available_bytes as f64 / total as f64
        };
        let compute = (1.0 - metrics.utilization_pct / 100.0).clamp(0.0, 1.0);
        let thermal_penalty = self.thermal_penalty(metrics.temperature_c);
        let mode_factor = if candidate.precision_reduced {
            self.config.precision_reduced_factor
        } else {
            1.0
        };

        let raw = self.config.memory_weight * memory + self.config.utilization_weight * compute;
        let value = (raw * thermal_penalty * mode_factor).clamp(0.0, 1.0);

        DeviceScore {
            device_id: candidate.device.id.clone(),
            value,
            available_bytes,
            components: ScoreComponents {
                memory,
                compute,
                thermal_penalty,
                mode_factor,
            },
        }
    }

    /// Every candidate, best first; equal scores order by device id
    pub fn rank_all<'a, I>(&self, candidates: I) -> Vec<DeviceScore>
    where
        I: IntoIterator<Item = ScoringCandidate<'a>>,
    {
        let mut scores: Vec<DeviceScore> = candidates.into_iter().map(|c| self.score(&c)).collect();
        scores.sort_by(compare_scores);
        scores
    }

    /// Highest-scoring candidate with at least `min_free_bytes` free
    ///
    /// Devices below the requirement are excluded, not down-scored.
    pub fn select_best<'a, I>(&self, candidates: I, min_free_bytes: u64) -> Option<DeviceScore>
    where
        I: IntoIterator<Item = ScoringCandidate<'a>>,
    {
        candidates
            .into_iter()
            .map(|c| self.score(&c))
            .filter(|s| s.available_bytes >= min_free_bytes)
            .min_by(compare_scores)
    }
}

/// Descending value, then ascending device id
pub fn compare_scores(a: &DeviceScore, b: &DeviceScore) -> Ordering {
    b.value
        .total_cmp(&a.value)
        .then_with(|| a.device_id.cmp(&b.device_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardlet_core::GpuVendor;

    const GB: u64 = 1 << 30;

    fn device(id: &str, memory: u64) -> GpuDevice {
        GpuDevice::new(id, GpuVendor::Nvidia, memory)
    }

    fn sample(id: &str, used: u64, total: u64, util: f64, temp: f64) -> DeviceMetrics {
        DeviceMetrics::new(id, used as i64, total as i64)
            .with_utilization(util)
            .with_temperature(temp)
    }

    fn scorer() -> DeviceScorer {
        DeviceScorer::new(&ScoringConfig::default())
    }

    #[test]
    fn test_weighted_formula() {
        let d = device("a", 16 * GB);
        let m = sample("a", 4 * GB, 16 * GB, 50.0, 60.0);
        let score = scorer().score(&ScoringCandidate::new(&d, &m));

        // 0.6 * 0.75 + 0.4 * 0.5
        assert!((score.value - 0.65).abs() < 1e-9);
        assert_eq!(score.available_bytes, 12 * GB);
        assert_eq!(score.components.thermal_penalty, 1.0);
    }

    #[test]
    fn test_thermal_penalty_falls_linearly() {
        let s = scorer();
        assert_eq!(s.thermal_penalty(80.0), 1.0);
        assert!((s.thermal_penalty(90.0) - 0.5).abs() < 1e-9);
        assert_eq!(s.thermal_penalty(100.0), 0.0);
        assert_eq!(s.thermal_penalty(120.0), 0.0);

        let d = device("a", 8 * GB);
        let m = sample("a", 0, 8 * GB, 0.0, 90.0);
        let score = s.score(&ScoringCandidate::new(&d, &m));
        assert!((score.value - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_score_always_in_unit_interval() {
        let s = scorer();
        let d = device("a", 8 * GB);
        for used in [0, GB, 4 * GB, 8 * GB] {
            for util in [0.0, 33.3, 100.0] {
                for temp in [-20.0, 25.0, 85.0, 99.0, 150.0] {
                    let m = sample("a", used, 8 * GB, util, temp);
                    let v = s.score(&ScoringCandidate::new(&d, &m)).value;
                    assert!((0.0..=1.0).contains(&v), "score {} out of range", v);
                }
            }
        }
    }

    #[test]
    fn test_precision_reduced_factor() {
        let d = device("a", 8 * GB);
        let m = sample("a", 0, 8 * GB, 0.0, 40.0);
        let full = scorer().score(&ScoringCandidate::new(&d, &m));
        let reduced = scorer().score(&ScoringCandidate::new(&d, &m).with_precision_reduced(true));
        assert!((reduced.value - full.value * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_rank_all_ties_break_by_id() {
        let devices = [device("b", 8 * GB), device("a", 8 * GB), device("c", 8 * GB)];
        let metrics = [
            sample("b", 0, 8 * GB, 10.0, 50.0),
            sample("a", 0, 8 * GB, 10.0, 50.0),
            sample("c", 0, 8 * GB, 90.0, 50.0),
        ];
        let ranked = scorer().rank_all(
            devices
                .iter()
                .zip(metrics.iter())
                .map(|(d, m)| ScoringCandidate::new(d, m)),
        );
        let ids: Vec<&str> = ranked.iter().map(|s| s.device_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_select_best_excludes_low_memory() {
        let devices = [device("roomy", 16 * GB), device("fast", 16 * GB)];
        let metrics = [
            sample("roomy", 2 * GB, 16 * GB, 90.0, 50.0),
            // Idle but nearly full
            sample("fast", 15 * GB, 16 * GB, 0.0, 50.0),
        ];
        let candidates = || {
            devices
                .iter()
                .zip(metrics.iter())
                .map(|(d, m)| ScoringCandidate::new(d, m))
        };

        let best = scorer().select_best(candidates(), 4 * GB).unwrap();
        assert_eq!(best.device_id, "roomy");
        assert!(scorer().select_best(candidates(), 32 * GB).is_none());
    }
}
