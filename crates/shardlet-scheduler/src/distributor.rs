//! Splitting task lists across devices

use serde::{Deserialize, Serialize};
use shardlet_core::{ClusterError, ClusterResult, DeviceId};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// How items are split across devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    /// Equal contiguous chunks in device order
    #[default]
    Uniform,
    /// Proportional to per-device weights
    Capacity,
}

impl fmt::Display for DistributionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistributionStrategy::Uniform => write!(f, "uniform"),
            DistributionStrategy::Capacity => write!(f, "capacity"),
        }
    }
}

impl FromStr for DistributionStrategy {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uniform" | "even" => Ok(DistributionStrategy::Uniform),
            "capacity" | "weighted" => Ok(DistributionStrategy::Capacity),
            other => Err(ClusterError::Validation(format!(
                "unknown distribution strategy: {}",
                other
            ))),
        }
    }
}

/// Items per device
pub type Distribution<T> = BTreeMap<DeviceId, Vec<T>>;

/// Splits work across a set of devices
#[derive(Debug, Clone, Default)]
pub struct WorkloadDistributor {
    max_per_device: Option<usize>,
}

impl WorkloadDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit how many items any single device may receive
    pub fn with_max_per_device(mut self, cap: usize) -> Self {
        self.max_per_device = Some(cap);
        self
    }

    pub fn max_per_device(&self) -> Option<usize> {
        self.max_per_device
    }

    /// Equal split in the given device order
    ///
    /// The first `items % devices` devices take one extra item. Every device
    /// appears in the result, possibly with no items.
    pub fn distribute_uniform<T>(&self, devices: &[DeviceId], items: Vec<T>) -> ClusterResult<Distribution<T>> {
        let mut seen = HashSet::with_capacity(devices.len());
        if let Some(dup) = devices.iter().find(|d| !seen.insert(d.as_str())) {
            return Err(ClusterError::Validation(format!(
                "device {} listed more than once",
                dup
            )));
        }
        if devices.is_empty() {
            return empty_or_capacity_error(items);
        }

        let n = items.len();
        let base = n / devices.len();
        let extra = n % devices.len();
        let mut counts: Vec<usize> = (0..devices.len())
            .map(|i| base + usize::from(i < extra))
            .collect();

        let eligible = vec![true; devices.len()];
        self.apply_cap(&mut counts, &eligible)?;

        debug!(devices = devices.len(), items = n, "Uniform distribution");
        Ok(split(devices.iter().cloned(), &counts, items))
    }

    /// Split proportionally to weights
    ///
    /// Each device gets `floor(n * w / total)` items; the rounding remainder
    /// goes to the highest-weight device, ties to the smaller id. Negative,
    /// non-finite, or all-zero weights are rejected.
    pub fn distribute_by_capacity<T>(
        &self,
        capacities: &BTreeMap<DeviceId, f64>,
        items: Vec<T>,
    ) -> ClusterResult<Distribution<T>> {
        if let Some((id, w)) = capacities.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(ClusterError::Capacity(format!(
                "device {} has invalid capacity {}",
                id, w
            )));
        }
        if capacities.is_empty() {
            return empty_or_capacity_error(items);
        }
        let total: f64 = capacities.values().sum();
        if total <= 0.0 {
            return Err(ClusterError::Capacity(format!(
                "total capacity must be positive, got {}",
                total
            )));
        }

        let n = items.len();
        let weights: Vec<f64> = capacities.values().copied().collect();
        let mut counts = Vec::with_capacity(weights.len());
        let mut assigned = 0usize;
        for w in &weights {
            let share = ((n as f64) * w / total).floor() as usize;
            let share = share.min(n - assigned);
            assigned += share;
            counts.push(share);
        }

        // Strictly greater keeps the earliest (smallest id) on ties
        let heaviest = weights
            .iter()
            .enumerate()
            .fold(0, |best, (i, w)| if *w > weights[best] { i } else { best });
        counts[heaviest] += n - assigned;

        let eligible: Vec<bool> = weights.iter().map(|w| *w > 0.0).collect();
        self.apply_cap(&mut counts, &eligible)?;

        debug!(
            devices = capacities.len(),
            items = n,
            total_capacity = total,
            "Capacity-weighted distribution"
        );
        Ok(split(capacities.keys().cloned(), &counts, items))
    }

    /// Move items above the cap onto eligible devices with room, in order
    fn apply_cap(&self, counts: &mut [usize], eligible: &[bool]) -> ClusterResult<()> {
        let cap = match self.max_per_device {
            Some(cap) => cap,
            None => return Ok(()),
        };

        let total: usize = counts.iter().sum();
        let room = eligible.iter().filter(|e| **e).count() * cap;
        if total > room {
            return Err(ClusterError::Capacity(format!(
                "{} items exceed the cap of {} per device across {} eligible devices",
                total,
                cap,
                eligible.iter().filter(|e| **e).count()
            )));
        }

        let mut excess = 0;
        for count in counts.iter_mut() {
            if *count > cap {
                excess += *count - cap;
                *count = cap;
            }
        }
        while excess > 0 {
            for (count, ok) in counts.iter_mut().zip(eligible) {
                if excess == 0 {
                    break;
                }
                if *ok && *count < cap {
                    *count += 1;
                    excess -= 1;
                }
            }
        }
        Ok(())
    }
}

fn empty_or_capacity_error<T>(items: Vec<T>) -> ClusterResult<Distribution<T>> {
    if items.is_empty() {
        Ok(BTreeMap::new())
    } else {
        Err(ClusterError::Capacity(format!(
            "no devices to receive {} items",
            items.len()
        )))
    }
}

/// Hand out contiguous runs of `items` following `counts`
fn split<T>(devices: impl Iterator<Item = DeviceId>, counts: &[usize], items: Vec<T>) -> Distribution<T> {
    let mut items = items.into_iter();
    devices
        .zip(counts)
        .map(|(device, &count)| (device, items.by_ref().take(count).collect()))
        .collect()
}
