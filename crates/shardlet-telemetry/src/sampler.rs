//! Periodic per-device sampling

use async_trait::async_trait;
use futures::future::join_all;
use shardlet_core::{ClusterError, ClusterResult, DeviceId, DeviceMetrics};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Backend that can be queried for a device's raw metrics
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Take one sample for a device
    async fn sample(&self, device_id: &str) -> ClusterResult<DeviceMetrics>;

    /// Get the source name
    fn name(&self) -> &'static str;
}

/// Destination for sampled metrics
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Accept one sample
    async fn ingest(&self, metrics: DeviceMetrics) -> ClusterResult<()>;
}

type TasksMap = HashMap<DeviceId, JoinHandle<()>>;

/// Runs one sampling task per device
pub struct TelemetrySampler {
    source: Arc<dyn MetricsSource>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<TasksMap>,
}

impl TelemetrySampler {
    /// Create a sampler; no tasks run until devices are added
    pub fn new(source: Arc<dyn MetricsSource>, sink: Arc<dyn MetricsSink>, interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            source,
            sink,
            interval,
            shutdown_tx,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start sampling a device
    ///
    /// Returns false if the device is already being sampled or the sampler
    /// has been shut down.
    pub async fn spawn_device(&self, device_id: &str) -> bool {
        if *self.shutdown_tx.borrow() {
            return false;
        }
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(device_id) {
            return false;
        }

        let handle = tokio::spawn(sample_loop(
            device_id.to_string(),
            self.interval,
            self.source.clone(),
            self.sink.clone(),
            self.shutdown_tx.subscribe(),
        ));
        tasks.insert(device_id.to_string(), handle);

        debug!(
            device_id = %device_id,
            source = self.source.name(),
            interval_ms = self.interval.as_millis() as u64,
            "Started sampling task"
        );
        true
    }

    /// Stop sampling a single device
    pub async fn stop_device(&self, device_id: &str) -> bool {
        match self.tasks.lock().await.remove(device_id) {
            Some(handle) => {
                handle.abort();
                debug!(device_id = %device_id, "Stopped sampling task");
                true
            }
            None => false,
        }
    }

    /// Devices currently being sampled
    pub async fn running_devices(&self) -> Vec<DeviceId> {
        let tasks = self.tasks.lock().await;
        let mut devices: Vec<DeviceId> = tasks
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        devices.sort();
        devices
    }

    /// Signal every task to stop and wait for them to exit
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain().map(|(_, h)| h).collect();
        let count = handles.len();
        for result in join_all(handles).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!(error = %e, "Sampling task ended abnormally");
                }
            }
        }
        info!(tasks = count, "Telemetry sampler stopped");
    }
}

async fn sample_loop(
    device_id: DeviceId,
    interval: Duration,
    source: Arc<dyn MetricsSource>,
    sink: Arc<dyn MetricsSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let metrics = match source.sample(&device_id).await {
                    Ok(metrics) => metrics,
                    Err(e) => {
                        warn!(device_id = %device_id, error = %e, "Failed to sample device");
                        continue;
                    }
                };
                match sink.ingest(metrics).await {
                    Ok(()) => {}
                    Err(ClusterError::NotInitialized(_)) => {
                        debug!(device_id = %device_id, "Sink no longer accepting samples");
                        break;
                    }
                    Err(e) => {
                        warn!(device_id = %device_id, error = %e, "Sample rejected");
                    }
                }
            }
        }
    }
}
