//! Cluster-wide registry of adaptive executors

use crate::executor::{AdaptiveExecutor, ComputePermit, ExecutorMode, ThermalState, ThermalTransition};
use crate::predictor::{RcThermalModel, ThermalParams};
use shardlet_core::{ClusterError, ClusterResult, DeviceId, DeviceMetrics, ThermalConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

type ExecutorMap = HashMap<DeviceId, Arc<Mutex<AdaptiveExecutor>>>;

/// Tracks the thermal state of every registered device
pub struct ThermalMonitor {
    executors: RwLock<ExecutorMap>,
    config: ThermalConfig,
    events: broadcast::Sender<ThermalTransition>,
}

impl ThermalMonitor {
    pub fn new(config: &ThermalConfig, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            executors: RwLock::new(HashMap::new()),
            config: config.clone(),
            events,
        }
    }

    /// Start tracking a device; false if it is already tracked
    pub async fn register_device(&self, device_id: &str, params: ThermalParams) -> bool {
        let mut executors = self.executors.write().await;
        if executors.contains_key(device_id) {
            return false;
        }
        let model = RcThermalModel::new(params, self.config.ambient_c);
        executors.insert(
            device_id.to_string(),
            Arc::new(Mutex::new(AdaptiveExecutor::new(device_id, model, &self.config))),
        );
        debug!(
            device_id = %device_id,
            resistance_c_per_w = params.resistance_c_per_w,
            time_constant_secs = params.time_constant_secs,
            "Thermal tracking enabled"
        );
        true
    }

    pub async fn remove_device(&self, device_id: &str) -> bool {
        self.executors.write().await.remove(device_id).is_some()
    }

    async fn executor(&self, device_id: &str) -> ClusterResult<Arc<Mutex<AdaptiveExecutor>>> {
        self.executors
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownDevice(device_id.to_string()))
    }

    /// Feed a sample to the device's executor
    ///
    /// Returns the mode change, if any; transitions are also broadcast.
    pub async fn observe(&self, metrics: &DeviceMetrics) -> ClusterResult<Option<ThermalTransition>> {
        let executor = self.executor(&metrics.device_id).await?;
        let transition = executor
            .lock()
            .await
            .observe(metrics.temperature_c, metrics.power_watts, metrics.timestamp);

        if let Some(ref t) = transition {
            // No subscribers is fine
            let _ = self.events.send(t.clone());
        }
        Ok(transition)
    }

    pub async fn state(&self, device_id: &str) -> Option<ThermalState> {
        let executor = self.executor(device_id).await.ok()?;
        let guard = executor.lock().await;
        guard.state().cloned()
    }

    /// Current mode; `None` for an untracked device
    pub async fn mode(&self, device_id: &str) -> Option<ExecutorMode> {
        let executor = self.executor(device_id).await.ok()?;
        let mode = executor.lock().await.mode();
        Some(mode)
    }

    /// Modes of every tracked device
    pub async fn modes(&self) -> HashMap<DeviceId, ExecutorMode> {
        let executors: Vec<(DeviceId, Arc<Mutex<AdaptiveExecutor>>)> = self
            .executors
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();

        let mut modes = HashMap::with_capacity(executors.len());
        for (id, executor) in executors {
            modes.insert(id, executor.lock().await.mode());
        }
        modes
    }

    /// Snapshots of every device observed at least once, sorted by id
    pub async fn states(&self) -> Vec<ThermalState> {
        let executors: Vec<Arc<Mutex<AdaptiveExecutor>>> =
            self.executors.read().await.values().cloned().collect();

        let mut states = Vec::with_capacity(executors.len());
        for executor in executors {
            if let Some(state) = executor.lock().await.state() {
                states.push(state.clone());
            }
        }
        states.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        states
    }

    /// Device with the highest measured temperature
    pub async fn hottest(&self) -> Option<ThermalState> {
        self.states().await.into_iter().fold(None, |best, s| match best {
            Some(b) if b.current_temperature_c >= s.current_temperature_c => Some(b),
            _ => Some(s),
        })
    }

    /// Admit one unit of compute on a device
    pub async fn begin_compute(&self, device_id: &str) -> ClusterResult<ComputePermit> {
        let executor = self.executor(device_id).await?;
        let guard = executor.lock().await;
        guard.try_begin_compute()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThermalTransition> {
        self.events.subscribe()
    }

    pub async fn device_count(&self) -> usize {
        self.executors.read().await.len()
    }

    /// Drop every executor
    pub async fn clear(&self) {
        let drained = std::mem::take(&mut *self.executors.write().await);
        debug!(devices = drained.len(), "Thermal monitor cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(id: &str, temperature_c: f64, power_watts: f64) -> DeviceMetrics {
        DeviceMetrics::new(id, 0, 1 << 30)
            .with_temperature(temperature_c)
            .with_power(power_watts)
    }

    async fn monitor() -> ThermalMonitor {
        let monitor = ThermalMonitor::new(&ThermalConfig::default(), 16);
        assert!(monitor.register_device("gpu-0", ThermalParams::default()).await);
        assert!(monitor.register_device("gpu-1", ThermalParams::default()).await);
        monitor
    }

    #[tokio::test]
    async fn test_register_twice() {
        let monitor = monitor().await;
        assert!(!monitor.register_device("gpu-0", ThermalParams::default()).await);
        assert_eq!(monitor.device_count().await, 2);
    }

    #[tokio::test]
    async fn test_observe_unknown_device() {
        let monitor = monitor().await;
        let err = monitor.observe(&metrics("ghost", 50.0, 0.0)).await.unwrap_err();
        assert!(matches!(err, ClusterError::UnknownDevice(_)));
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast() {
        let monitor = monitor().await;
        let mut rx = monitor.subscribe();

        assert!(monitor.observe(&metrics("gpu-0", 40.0, 0.0)).await.unwrap().is_none());
        let t = monitor.observe(&metrics("gpu-0", 88.0, 300.0)).await.unwrap().unwrap();
        assert_eq!(t.to, ExecutorMode::Paused);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.device_id, "gpu-0");
        assert_eq!(event.to, ExecutorMode::Paused);
        assert_eq!(monitor.mode("gpu-0").await, Some(ExecutorMode::Paused));
        assert_eq!(monitor.mode("gpu-1").await, Some(ExecutorMode::Running));
    }

    #[tokio::test]
    async fn test_begin_compute_respects_pause() {
        let monitor = monitor().await;
        let permit = monitor.begin_compute("gpu-1").await.unwrap();

        monitor.observe(&metrics("gpu-1", 90.0, 300.0)).await.unwrap();
        assert!(monitor.begin_compute("gpu-1").await.is_err());
        drop(permit);

        monitor.observe(&metrics("gpu-1", 60.0, 0.0)).await.unwrap();
        assert!(monitor.begin_compute("gpu-1").await.is_ok());
        assert!(matches!(
            monitor.begin_compute("ghost").await,
            Err(ClusterError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_hottest_and_states() {
        let monitor = monitor().await;
        assert!(monitor.hottest().await.is_none());

        monitor.observe(&metrics("gpu-0", 55.0, 0.0)).await.unwrap();
        monitor.observe(&metrics("gpu-1", 62.0, 0.0)).await.unwrap();

        let states = monitor.states().await;
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].device_id, "gpu-0");
        assert_eq!(monitor.hottest().await.unwrap().device_id, "gpu-1");
    }

    #[tokio::test]
    async fn test_clear() {
        let monitor = monitor().await;
        monitor.observe(&metrics("gpu-0", 55.0, 0.0)).await.unwrap();
        monitor.clear().await;
        assert_eq!(monitor.device_count().await, 0);
        assert!(monitor.state("gpu-0").await.is_none());
        assert!(monitor.modes().await.is_empty());
    }
}
