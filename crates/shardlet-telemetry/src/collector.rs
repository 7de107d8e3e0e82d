//! Validated per-device metrics store

use async_trait::async_trait;
use shardlet_core::{
    ChangeThresholds, ClusterAggregate, ClusterError, ClusterResult, DeviceId, DeviceMetrics,
    RingHistory, TelemetryConfig,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::sampler::MetricsSink;
use crate::summary::MetricsSummary;

/// Current value and bounded history for one device
///
/// Guarded by its own mutex so that a reader never sees `current` and
/// `history` disagree.
#[derive(Debug)]
struct DeviceSlot {
    current: Option<DeviceMetrics>,
    history: RingHistory<DeviceMetrics>,
    last_notified: Option<DeviceMetrics>,
}

impl DeviceSlot {
    fn new(capacity: usize) -> Self {
        Self {
            current: None,
            history: RingHistory::new(capacity),
            last_notified: None,
        }
    }
}

type SlotsMap = HashMap<DeviceId, Arc<Mutex<DeviceSlot>>>;

/// Emitted when a sample moves beyond the configured thresholds
#[derive(Debug, Clone)]
pub struct MetricsChange {
    /// The sample that triggered the notification
    pub metrics: DeviceMetrics,
    /// First sample ever seen for the device
    pub first_sample: bool,
    /// Utilization movement since the last notification
    pub utilization_delta: f64,
    /// Temperature movement since the last notification
    pub temperature_delta: f64,
    /// Used-memory fraction movement since the last notification
    pub memory_fraction_delta: f64,
}

impl MetricsChange {
    fn between(previous: Option<&DeviceMetrics>, metrics: &DeviceMetrics) -> Self {
        match previous {
            None => Self {
                metrics: metrics.clone(),
                first_sample: true,
                utilization_delta: 0.0,
                temperature_delta: 0.0,
                memory_fraction_delta: 0.0,
            },
            Some(prev) => Self {
                metrics: metrics.clone(),
                first_sample: false,
                utilization_delta: metrics.utilization_pct - prev.utilization_pct,
                temperature_delta: metrics.temperature_c - prev.temperature_c,
                memory_fraction_delta: metrics.used_fraction() - prev.used_fraction(),
            },
        }
    }

    fn exceeds(&self, thresholds: &ChangeThresholds) -> bool {
        self.first_sample
            || self.utilization_delta.abs() > thresholds.utilization_pct
            || self.temperature_delta.abs() > thresholds.temperature_c
            || self.memory_fraction_delta.abs() > thresholds.memory_fraction
    }
}

/// Collects validated metric samples for registered devices
pub struct TelemetryCollector {
    /// Slots indexed by device ID
    slots: RwLock<SlotsMap>,
    /// Samples retained per device
    history_capacity: usize,
    /// Change-notification thresholds
    thresholds: ChangeThresholds,
    /// Change-notification channel
    events: broadcast::Sender<MetricsChange>,
}

impl TelemetryCollector {
    /// Create a new collector
    pub fn new(config: &TelemetryConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            slots: RwLock::new(HashMap::new()),
            history_capacity: config.history_capacity.max(1),
            thresholds: config.change_thresholds.clone(),
            events,
        }
    }

    /// Start accepting samples for a device
    ///
    /// Returns false if the device was already registered.
    pub async fn register_device(&self, device_id: &str) -> bool {
        let mut slots = self.slots.write().await;
        if slots.contains_key(device_id) {
            return false;
        }
        slots.insert(
            device_id.to_string(),
            Arc::new(Mutex::new(DeviceSlot::new(self.history_capacity))),
        );
        debug!(device_id = %device_id, "Registered device with telemetry collector");
        true
    }

    /// Stop tracking a device and drop its history
    pub async fn remove_device(&self, device_id: &str) -> bool {
        let removed = self.slots.write().await.remove(device_id).is_some();
        if removed {
            debug!(device_id = %device_id, "Removed device from telemetry collector");
        }
        removed
    }

    /// Whether the device is registered
    pub async fn is_registered(&self, device_id: &str) -> bool {
        self.slots.read().await.contains_key(device_id)
    }

    /// Number of registered devices
    pub async fn device_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Validate and store a sample
    ///
    /// Replaces the device's current value and appends to its history.
    /// Returns the change notification if one was emitted.
    pub async fn record(&self, metrics: DeviceMetrics) -> ClusterResult<Option<MetricsChange>> {
        let slot = {
            let slots = self.slots.read().await;
            slots
                .get(&metrics.device_id)
                .cloned()
                .ok_or_else(|| ClusterError::UnknownDevice(metrics.device_id.clone()))?
        };

        if let Err(e) = metrics.validate() {
            warn!(device_id = %metrics.device_id, error = %e, "Rejected metrics sample");
            return Err(e);
        }

        let change = {
            let mut slot = slot.lock().await;
            slot.current = Some(metrics.clone());
            slot.history.push(metrics.clone());

            let change = MetricsChange::between(slot.last_notified.as_ref(), &metrics);
            if change.exceeds(&self.thresholds) {
                slot.last_notified = Some(metrics);
                Some(change)
            } else {
                None
            }
        };

        if let Some(change) = &change {
            debug!(
                device_id = %change.metrics.device_id,
                utilization = change.metrics.utilization_pct,
                temperature = change.metrics.temperature_c,
                "Metrics changed"
            );
            // No subscribers is not an error
            let _ = self.events.send(change.clone());
        }

        Ok(change)
    }

    /// Latest sample for a device, `None` if unknown or never sampled
    pub async fn current(&self, device_id: &str) -> Option<DeviceMetrics> {
        let slot = self.slots.read().await.get(device_id).cloned()?;
        let slot = slot.lock().await;
        slot.current.clone()
    }

    /// Latest sample of every device that has one
    pub async fn current_all(&self) -> Vec<DeviceMetrics> {
        let slots: Vec<Arc<Mutex<DeviceSlot>>> =
            self.slots.read().await.values().cloned().collect();
        let mut samples = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(current) = slot.lock().await.current.clone() {
                samples.push(current);
            }
        }
        samples.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        samples
    }

    /// Samples for a device from oldest to newest
    pub async fn history(&self, device_id: &str) -> Vec<DeviceMetrics> {
        let Some(slot) = self.slots.read().await.get(device_id).cloned() else {
            return Vec::new();
        };
        let slot = slot.lock().await;
        slot.history.to_vec()
    }

    /// Windowed statistics over a device's history
    pub async fn summary(&self, device_id: &str) -> Option<MetricsSummary> {
        let slot = self.slots.read().await.get(device_id).cloned()?;
        let slot = slot.lock().await;
        MetricsSummary::from_history(device_id, &slot.history)
    }

    /// Cluster-wide rollup of the current samples
    pub async fn aggregate(&self) -> ClusterAggregate {
        let samples = self.current_all().await;
        ClusterAggregate::from_samples(&samples)
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<MetricsChange> {
        self.events.subscribe()
    }

    /// Samples retained per device
    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    /// Drop every device and all samples at once
    pub async fn clear(&self) {
        let mut slots = self.slots.write().await;
        let count = slots.len();
        slots.clear();
        info!(devices = count, "Cleared telemetry state");
    }
}

#[async_trait]
impl MetricsSink for TelemetryCollector {
    async fn ingest(&self, metrics: DeviceMetrics) -> ClusterResult<()> {
        self.record(metrics).await.map(|_| ())
    }
}
