//! Cluster manager: device registry, lifecycle and the public API

use async_trait::async_trait;
use shardlet_core::{
    ClusterAggregate, ClusterConfig, ClusterError, ClusterResult, DeviceId, DeviceMetrics,
    DeviceRegistration, GpuDevice, Heartbeat, ShardAssignment, ShardPlacementRequest,
    TelemetryEnvelope, TelemetryMessage,
};
use shardlet_scheduler::{
    DeviceScore, DeviceScorer, Distribution, DistributionStrategy, PlacementSolver, PoolDevice,
    ScoringCandidate, WorkloadDistributor,
};
use shardlet_telemetry::{
    MetricsChange, MetricsSink, MetricsSource, MetricsSummary, TelemetryCollector,
    TelemetrySampler,
};
use shardlet_thermal::{
    ComputePermit, ExecutorMode, ThermalMonitor, ThermalParams, ThermalState, ThermalTransition,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle state of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Not started, failed to start, or fully shut down
    Uninitialized,
    Ready,
    /// Rejecting new work while in-flight calls drain
    ShuttingDown,
}

impl ManagerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ManagerState::Ready,
            2 => ManagerState::ShuttingDown,
            _ => ManagerState::Uninitialized,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ManagerState::Uninitialized => 0,
            ManagerState::Ready => 1,
            ManagerState::ShuttingDown => 2,
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Uninitialized => write!(f, "uninitialized"),
            ManagerState::Ready => write!(f, "ready"),
            ManagerState::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

/// A device in the registry
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredDevice {
    pub device: GpuDevice,
    /// `host:port` of the worker that announced the device
    pub endpoint: Option<String>,
    /// Cleared by a heartbeat reporting the device unavailable
    pub available: bool,
    pub last_error: Option<String>,
}

impl RegisteredDevice {
    fn new(device: GpuDevice) -> Self {
        Self {
            device,
            endpoint: None,
            available: true,
            last_error: None,
        }
    }
}

struct Components {
    collector: Arc<TelemetryCollector>,
    thermal: Arc<ThermalMonitor>,
    scorer: DeviceScorer,
    solver: PlacementSolver,
}

/// Device eligible for scoring: available, sampled and not paused
struct Eligible {
    device: GpuDevice,
    metrics: DeviceMetrics,
    mode: ExecutorMode,
}

impl Eligible {
    fn candidate(&self) -> ScoringCandidate<'_> {
        ScoringCandidate::new(&self.device, &self.metrics)
            .with_precision_reduced(self.mode == ExecutorMode::PrecisionReduced)
    }
}

/// Counts an operation as in flight until dropped
struct InFlight<'a> {
    manager: &'a ClusteringManager,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.manager.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.manager.drained.notify_waiters();
        }
    }
}

/// Owns the device registry and every scheduling component
pub struct ClusteringManager {
    config: ClusterConfig,
    state: AtomicU8,
    registry: RwLock<HashMap<DeviceId, RegisteredDevice>>,
    /// Held across the collector write and thermal observation of a sample
    record_order: RwLock<HashMap<DeviceId, Arc<Mutex<()>>>>,
    components: RwLock<Option<Arc<Components>>>,
    sampler: Mutex<Option<Arc<TelemetrySampler>>>,
    assignments: RwLock<HashMap<Uuid, ShardAssignment>>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl ClusteringManager {
    /// Create a manager; components are built by [`initialize`](Self::initialize)
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(ManagerState::Uninitialized.as_u8()),
            registry: RwLock::new(HashMap::new()),
            record_order: RwLock::new(HashMap::new()),
            components: RwLock::new(None),
            sampler: Mutex::new(None),
            assignments: RwLock::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Create and initialize in one step
    pub async fn start(config: ClusterConfig) -> ClusterResult<Self> {
        let manager = Self::new(config);
        manager.initialize().await?;
        Ok(manager)
    }

    /// Build the components and start accepting calls
    ///
    /// On failure the manager stays uninitialized. Calling this on a ready
    /// manager is a no-op; a shut-down manager may be initialized again.
    pub async fn initialize(&self) -> ClusterResult<()> {
        let mut components = self.components.write().await;
        match self.state() {
            ManagerState::Ready => return Ok(()),
            ManagerState::ShuttingDown => {
                return Err(ClusterError::NotInitialized(
                    "shutdown in progress".to_string(),
                ))
            }
            ManagerState::Uninitialized => {}
        }

        if let Err(e) = self.config.validate() {
            warn!(error = %e, "Cluster manager failed to initialize");
            return Err(e);
        }

        let config = &self.config;
        *components = Some(Arc::new(Components {
            collector: Arc::new(TelemetryCollector::new(&config.telemetry)),
            thermal: Arc::new(ThermalMonitor::new(
                &config.thermal,
                config.telemetry.event_buffer,
            )),
            scorer: DeviceScorer::new(&config.scoring),
            solver: PlacementSolver::new(&config.placement),
        }));
        self.state
            .store(ManagerState::Ready.as_u8(), Ordering::SeqCst);

        info!(
            history_capacity = config.telemetry.history_capacity,
            placement_timeout_ms = config.placement.timeout_ms,
            critical_c = config.thermal.critical_c,
            "Cluster manager initialized"
        );
        Ok(())
    }

    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    async fn enter(&self, operation: &str) -> ClusterResult<(InFlight<'_>, Arc<Components>)> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight { manager: self };

        let state = self.state();
        if state != ManagerState::Ready {
            return Err(ClusterError::NotInitialized(format!(
                "{} rejected: manager is {}",
                operation, state
            )));
        }
        let components = self.components.read().await.clone().ok_or_else(|| {
            ClusterError::NotInitialized(format!("{} rejected: no components", operation))
        })?;
        Ok((guard, components))
    }

    /// A device vanishing mid-call during teardown is a shutdown rejection
    fn closed_or(&self, err: ClusterError) -> ClusterError {
        match err {
            ClusterError::UnknownDevice(id) if self.state() != ManagerState::Ready => {
                ClusterError::NotInitialized(format!("device {} torn down by shutdown", id))
            }
            other => other,
        }
    }

    async fn ensure_registered(&self, device_id: &str) -> ClusterResult<()> {
        if self.registry.read().await.contains_key(device_id) {
            Ok(())
        } else {
            Err(ClusterError::UnknownDevice(device_id.to_string()))
        }
    }

    // Registry

    /// Add a device
    ///
    /// Returns true if the device was new. Registering a known id again
    /// with the same descriptor is a no-op; a different descriptor is
    /// rejected.
    pub async fn register_device(&self, device: GpuDevice) -> ClusterResult<bool> {
        let (_guard, components) = self.enter("register_device").await?;
        self.register_with(&components, device, None).await
    }

    async fn register_with(
        &self,
        components: &Components,
        device: GpuDevice,
        endpoint: Option<String>,
    ) -> ClusterResult<bool> {
        device.validate()?;
        let id = device.id.clone();
        let vendor = device.vendor;
        let memory_total = device.memory_total;
        let class = device.device_class;

        let is_new = {
            let mut registry = self.registry.write().await;
            match registry.get_mut(&id) {
                // Descriptors are fixed once discovered; a repeat only
                // refreshes where the device was announced from
                Some(entry) => {
                    if entry.device != device {
                        return Err(ClusterError::Validation(format!(
                            "device {} is already registered with a different descriptor",
                            id
                        )));
                    }
                    if endpoint.is_some() {
                        entry.endpoint = endpoint;
                    }
                    false
                }
                None => {
                    let mut entry = RegisteredDevice::new(device);
                    entry.endpoint = endpoint;
                    registry.insert(id.clone(), entry);
                    self.record_order
                        .write()
                        .await
                        .insert(id.clone(), Arc::new(Mutex::new(())));
                    components.collector.register_device(&id).await;
                    components
                        .thermal
                        .register_device(&id, ThermalParams::for_class(class))
                        .await;
                    true
                }
            }
        };

        if is_new {
            let sampler = self.sampler.lock().await.clone();
            if let Some(sampler) = sampler {
                sampler.spawn_device(&id).await;
            }
        }

        info!(
            device_id = %id,
            vendor = %vendor,
            memory_total = memory_total,
            new = is_new,
            "Device registered"
        );
        Ok(is_new)
    }

    /// Handle loss of a device
    ///
    /// Drops its telemetry and thermal state and invalidates every stored
    /// assignment that placed a shard on it; their ids are returned.
    pub async fn remove_device(&self, device_id: &str) -> ClusterResult<Vec<Uuid>> {
        let (_guard, components) = self.enter("remove_device").await?;
        if self.registry.write().await.remove(device_id).is_none() {
            return Err(ClusterError::UnknownDevice(device_id.to_string()));
        }
        self.record_order.write().await.remove(device_id);

        let sampler = self.sampler.lock().await.clone();
        if let Some(sampler) = sampler {
            sampler.stop_device(device_id).await;
        }
        components.collector.remove_device(device_id).await;
        components.thermal.remove_device(device_id).await;

        let mut invalidated: Vec<Uuid> = {
            let mut assignments = self.assignments.write().await;
            let ids: Vec<Uuid> = assignments
                .values()
                .filter(|a| a.references(device_id))
                .map(|a| a.id)
                .collect();
            for id in &ids {
                assignments.remove(id);
            }
            ids
        };
        invalidated.sort();

        warn!(
            device_id = %device_id,
            invalidated_assignments = invalidated.len(),
            "Device removed"
        );
        Ok(invalidated)
    }

    /// Registered devices sorted by id
    pub async fn devices(&self) -> ClusterResult<Vec<RegisteredDevice>> {
        let (_guard, _) = self.enter("devices").await?;
        let mut devices: Vec<RegisteredDevice> =
            self.registry.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.device.id.cmp(&b.device.id));
        Ok(devices)
    }

    pub async fn device(&self, device_id: &str) -> ClusterResult<RegisteredDevice> {
        let (_guard, _) = self.enter("device").await?;
        self.registry
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownDevice(device_id.to_string()))
    }

    // Telemetry

    /// Record one sample
    ///
    /// Validation failures leave every stored value untouched. Returns the
    /// thermal mode change the sample caused, if any.
    pub async fn record_metrics(&self, metrics: DeviceMetrics) -> ClusterResult<Option<ThermalTransition>> {
        let (_guard, components) = self.enter("record_metrics").await?;
        self.record_with(&components, metrics).await
    }

    async fn record_with(
        &self,
        components: &Components,
        metrics: DeviceMetrics,
    ) -> ClusterResult<Option<ThermalTransition>> {
        let order = self
            .record_order
            .read()
            .await
            .get(&metrics.device_id)
            .cloned()
            .ok_or_else(|| self.closed_or(ClusterError::UnknownDevice(metrics.device_id.clone())))?;
        let _serialized = order.lock().await;

        components
            .collector
            .record(metrics.clone())
            .await
            .map_err(|e| self.closed_or(e))?;
        components
            .thermal
            .observe(&metrics)
            .await
            .map_err(|e| self.closed_or(e))
    }

    /// Record many samples; one failure does not stop the rest
    pub async fn record_batch(
        &self,
        batch: Vec<DeviceMetrics>,
    ) -> ClusterResult<Vec<ClusterResult<Option<ThermalTransition>>>> {
        let (_guard, components) = self.enter("record_batch").await?;
        let mut results = Vec::with_capacity(batch.len());
        for metrics in batch {
            results.push(self.record_with(&components, metrics).await);
        }
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            debug!(samples = results.len(), failed = failed, "Batch recorded with rejections");
        }
        Ok(results)
    }

    /// Latest sample; `Ok(None)` for a registered device never sampled
    pub async fn current_metrics(&self, device_id: &str) -> ClusterResult<Option<DeviceMetrics>> {
        let (_guard, components) = self.enter("current_metrics").await?;
        self.ensure_registered(device_id).await?;
        Ok(components.collector.current(device_id).await)
    }

    pub async fn metrics_history(&self, device_id: &str) -> ClusterResult<Vec<DeviceMetrics>> {
        let (_guard, components) = self.enter("metrics_history").await?;
        self.ensure_registered(device_id).await?;
        Ok(components.collector.history(device_id).await)
    }

    pub async fn metrics_summary(&self, device_id: &str) -> ClusterResult<Option<MetricsSummary>> {
        let (_guard, components) = self.enter("metrics_summary").await?;
        self.ensure_registered(device_id).await?;
        Ok(components.collector.summary(device_id).await)
    }

    pub async fn aggregate_metrics(&self) -> ClusterResult<ClusterAggregate> {
        let (_guard, components) = self.enter("aggregate_metrics").await?;
        Ok(components.collector.aggregate().await)
    }

    pub async fn subscribe_metrics(&self) -> ClusterResult<broadcast::Receiver<MetricsChange>> {
        let (_guard, components) = self.enter("subscribe_metrics").await?;
        Ok(components.collector.subscribe())
    }

    /// Sample every registered device from `source` in the background
    ///
    /// Devices registered later are picked up automatically. Returns the
    /// number of sampling tasks started.
    pub async fn start_sampling(self: &Arc<Self>, source: Arc<dyn MetricsSource>) -> ClusterResult<usize> {
        let (_guard, _) = self.enter("start_sampling").await?;
        let mut slot = self.sampler.lock().await;
        if slot.is_some() {
            return Err(ClusterError::Validation(
                "telemetry sampling already running".to_string(),
            ));
        }

        let source_name = source.name();
        let sink: Arc<dyn MetricsSink> = Arc::new(ManagerSink {
            manager: Arc::downgrade(self),
        });
        let sampler = Arc::new(TelemetrySampler::new(
            source,
            sink,
            self.config.telemetry.sample_interval(),
        ));

        let ids: Vec<DeviceId> = self.registry.read().await.keys().cloned().collect();
        let mut started = 0;
        for id in &ids {
            if sampler.spawn_device(id).await {
                started += 1;
            }
        }
        *slot = Some(sampler);

        info!(
            source = source_name,
            devices = started,
            interval_ms = self.config.telemetry.sample_interval_ms,
            "Telemetry sampling started"
        );
        Ok(started)
    }

    // Scoring and placement

    async fn eligible(&self, components: &Components) -> Vec<Eligible> {
        let devices: Vec<GpuDevice> = self
            .registry
            .read()
            .await
            .values()
            .filter(|e| e.available)
            .map(|e| e.device.clone())
            .collect();

        let mut eligible = Vec::with_capacity(devices.len());
        for device in devices {
            let Some(metrics) = components.collector.current(&device.id).await else {
                continue;
            };
            let mode = components
                .thermal
                .mode(&device.id)
                .await
                .unwrap_or(ExecutorMode::Running);
            if mode == ExecutorMode::Paused {
                continue;
            }
            eligible.push(Eligible {
                device,
                metrics,
                mode,
            });
        }
        eligible
    }

    /// Every eligible device, best first
    pub async fn rank_devices(&self) -> ClusterResult<Vec<DeviceScore>> {
        let (_guard, components) = self.enter("rank_devices").await?;
        let eligible = self.eligible(&components).await;
        Ok(components
            .scorer
            .rank_all(eligible.iter().map(Eligible::candidate)))
    }

    /// Best eligible device with at least `min_free_bytes` free
    pub async fn select_best_device(&self, min_free_bytes: u64) -> ClusterResult<Option<DeviceScore>> {
        let (_guard, components) = self.enter("select_best_device").await?;
        let eligible = self.eligible(&components).await;
        Ok(components
            .scorer
            .select_best(eligible.iter().map(Eligible::candidate), min_free_bytes))
    }

    /// Place shards on the eligible devices and keep the assignment
    pub async fn place_shards(&self, request: ShardPlacementRequest) -> ClusterResult<ShardAssignment> {
        let (_guard, components) = self.enter("place_shards").await?;
        {
            let registry = self.registry.read().await;
            if let Some(missing) = request.candidates.iter().find(|id| !registry.contains_key(*id)) {
                return Err(ClusterError::UnknownDevice(missing.clone()));
            }
        }

        let pool: Vec<PoolDevice> = self
            .eligible(&components)
            .await
            .iter()
            .map(|e| {
                let score = components.scorer.score(&e.candidate());
                PoolDevice::new(&e.device, &e.metrics, score.value)
            })
            .collect();
        debug!(
            shards = request.shard_sizes.len(),
            pool = pool.len(),
            "Solving placement"
        );

        let solver = components.solver.clone();
        let assignment = tokio::task::spawn_blocking(move || solver.solve(&request, &pool))
            .await
            .map_err(|e| ClusterError::Internal(format!("placement task failed: {}", e)))??;

        // A device lost while solving must not end up in a stored assignment
        let registry = self.registry.read().await;
        if let Some(lost) = assignment
            .bytes_per_device
            .keys()
            .find(|id| !registry.contains_key(*id))
        {
            return Err(ClusterError::UnknownDevice(lost.clone()));
        }
        self.assignments
            .write()
            .await
            .insert(assignment.id, assignment.clone());
        Ok(assignment)
    }

    pub async fn assignment(&self, id: Uuid) -> ClusterResult<Option<ShardAssignment>> {
        let (_guard, _) = self.enter("assignment").await?;
        Ok(self.assignments.read().await.get(&id).cloned())
    }

    /// Stored assignments, oldest first
    pub async fn assignments(&self) -> ClusterResult<Vec<ShardAssignment>> {
        let (_guard, _) = self.enter("assignments").await?;
        let mut assignments: Vec<ShardAssignment> =
            self.assignments.read().await.values().cloned().collect();
        assignments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(assignments)
    }

    /// Discard an assignment whose instance was torn down or rebalanced
    pub async fn release_assignment(&self, id: Uuid) -> ClusterResult<bool> {
        let (_guard, _) = self.enter("release_assignment").await?;
        let released = self.assignments.write().await.remove(&id).is_some();
        if released {
            debug!(assignment_id = %id, "Assignment released");
        }
        Ok(released)
    }

    /// Split `items` across registered devices
    ///
    /// The capacity strategy weights each device by its compute units.
    pub async fn distribute_workload<T>(
        &self,
        devices: &[DeviceId],
        items: Vec<T>,
        strategy: DistributionStrategy,
        max_per_device: Option<usize>,
    ) -> ClusterResult<Distribution<T>> {
        let (_guard, _) = self.enter("distribute_workload").await?;
        let distributor = distributor(max_per_device);
        match strategy {
            DistributionStrategy::Uniform => {
                for id in devices {
                    self.ensure_registered(id).await?;
                }
                distributor.distribute_uniform(devices, items)
            }
            DistributionStrategy::Capacity => {
                let registry = self.registry.read().await;
                let mut capacities = BTreeMap::new();
                for id in devices {
                    let entry = registry
                        .get(id)
                        .ok_or_else(|| ClusterError::UnknownDevice(id.clone()))?;
                    capacities.insert(id.clone(), entry.device.compute_units as f64);
                }
                distributor.distribute_by_capacity(&capacities, items)
            }
        }
    }

    /// Split `items` by explicit weights
    pub async fn distribute_by_capacity<T>(
        &self,
        capacities: &BTreeMap<DeviceId, f64>,
        items: Vec<T>,
        max_per_device: Option<usize>,
    ) -> ClusterResult<Distribution<T>> {
        let (_guard, _) = self.enter("distribute_by_capacity").await?;
        for id in capacities.keys() {
            self.ensure_registered(id).await?;
        }
        distributor(max_per_device).distribute_by_capacity(capacities, items)
    }

    // Thermal

    /// Thermal snapshot; `Ok(None)` before the device's first sample
    pub async fn thermal_state(&self, device_id: &str) -> ClusterResult<Option<ThermalState>> {
        let (_guard, components) = self.enter("thermal_state").await?;
        self.ensure_registered(device_id).await?;
        Ok(components.thermal.state(device_id).await)
    }

    pub async fn thermal_states(&self) -> ClusterResult<Vec<ThermalState>> {
        let (_guard, components) = self.enter("thermal_states").await?;
        Ok(components.thermal.states().await)
    }

    /// Mode changes, for the collaborator issuing compute
    pub async fn subscribe_thermal(&self) -> ClusterResult<broadcast::Receiver<ThermalTransition>> {
        let (_guard, components) = self.enter("subscribe_thermal").await?;
        Ok(components.thermal.subscribe())
    }

    /// Admit one unit of compute on a device; refused while it is paused
    pub async fn begin_compute(&self, device_id: &str) -> ClusterResult<ComputePermit> {
        let (_guard, components) = self.enter("begin_compute").await?;
        components.thermal.begin_compute(device_id).await
    }

    // Wire protocol

    /// Apply a registration or heartbeat from a remote host
    pub async fn ingest(&self, message: TelemetryMessage) -> ClusterResult<Option<ThermalTransition>> {
        let (_guard, components) = self.enter("ingest").await?;
        message.validate()?;
        match message {
            TelemetryMessage::Registration(registration) => {
                let endpoint = format!("{}:{}", registration.hostname, registration.port);
                self.register_with(&components, registration.device, Some(endpoint))
                    .await?;
                Ok(None)
            }
            TelemetryMessage::Heartbeat(heartbeat) => {
                {
                    let mut registry = self.registry.write().await;
                    let entry = registry
                        .get_mut(&heartbeat.device_id)
                        .ok_or_else(|| ClusterError::UnknownDevice(heartbeat.device_id.clone()))?;
                    if entry.available != heartbeat.is_available {
                        info!(
                            device_id = %heartbeat.device_id,
                            available = heartbeat.is_available,
                            "Device availability changed"
                        );
                    }
                    entry.available = heartbeat.is_available;
                    entry.last_error = heartbeat.error_message.clone();
                }
                if let Some(error) = &heartbeat.error_message {
                    warn!(device_id = %heartbeat.device_id, error = %error, "Host reported device error");
                }
                self.record_with(&components, heartbeat.metrics).await
            }
        }
    }

    /// Decode a JSON envelope and apply it
    pub async fn ingest_json(&self, json: &str) -> ClusterResult<Option<ThermalTransition>> {
        let envelope = TelemetryEnvelope::decode(json)?;
        self.ingest(envelope.message).await
    }

    /// Envelope announcing a registered device
    pub async fn registration_message(
        &self,
        device_id: &str,
        hostname: &str,
        port: u16,
    ) -> ClusterResult<TelemetryEnvelope> {
        let entry = self.device(device_id).await?;
        Ok(TelemetryEnvelope::new(TelemetryMessage::Registration(
            DeviceRegistration {
                hostname: hostname.to_string(),
                port,
                device: entry.device,
            },
        )))
    }

    /// Envelope carrying a device's latest sample and availability
    pub async fn heartbeat_message(&self, device_id: &str) -> ClusterResult<TelemetryEnvelope> {
        let entry = self.device(device_id).await?;
        let metrics = self.current_metrics(device_id).await?.ok_or_else(|| {
            ClusterError::Validation(format!("no metrics recorded for device {}", device_id))
        })?;
        Ok(TelemetryEnvelope::new(TelemetryMessage::Heartbeat(Heartbeat {
            device_id: device_id.to_string(),
            metrics,
            is_available: entry.available,
            error_message: entry.last_error,
        })))
    }

    // Lifecycle

    async fn wait_for_in_flight(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work, drain, and release all state
    ///
    /// New calls are rejected as soon as this starts. In-flight calls get
    /// the configured grace period, then the sampler, telemetry, thermal
    /// state, registry and assignments are released in that order.
    pub async fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                ManagerState::Ready.as_u8(),
                ManagerState::ShuttingDown.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!(state = %self.state(), "Shutdown requested while not running");
            return;
        }
        info!("Cluster manager shutting down");

        let grace = self.config.shutdown.grace_period();
        if tokio::time::timeout(grace, self.wait_for_in_flight())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.in_flight.load(Ordering::SeqCst),
                grace_ms = grace.as_millis() as u64,
                "Grace period elapsed with operations in flight"
            );
        }

        let sampler = self.sampler.lock().await.take();
        if let Some(sampler) = sampler {
            sampler.shutdown().await;
        }

        let mut components = self.components.write().await;
        if let Some(c) = components.as_ref() {
            c.collector.clear().await;
            c.thermal.clear().await;
        }
        let devices = {
            let mut registry = self.registry.write().await;
            let n = registry.len();
            registry.clear();
            n
        };
        self.record_order.write().await.clear();
        let assignments = {
            let mut assignments = self.assignments.write().await;
            let n = assignments.len();
            assignments.clear();
            n
        };
        *components = None;
        self.state
            .store(ManagerState::Uninitialized.as_u8(), Ordering::SeqCst);

        info!(
            devices = devices,
            assignments = assignments,
            "Cluster manager shut down"
        );
    }
}

fn distributor(max_per_device: Option<usize>) -> WorkloadDistributor {
    match max_per_device {
        Some(cap) => WorkloadDistributor::new().with_max_per_device(cap),
        None => WorkloadDistributor::new(),
    }
}

/// Routes sampler output into the manager without keeping it alive
struct ManagerSink {
    manager: Weak<ClusteringManager>,
}

#[async_trait]
impl MetricsSink for ManagerSink {
    async fn ingest(&self, metrics: DeviceMetrics) -> ClusterResult<()> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| ClusterError::NotInitialized("cluster manager dropped".to_string()))?;
        manager.record_metrics(metrics).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardlet_core::{GpuVendor, PlacementMethod};
    use std::time::Duration;

    const GB: u64 = 1 << 30;

    fn gpu(id: &str, memory_gb: u64) -> GpuDevice {
        GpuDevice::new(id, GpuVendor::Nvidia, memory_gb * GB)
    }

    fn sample(id: &str, used_gb: u64, total_gb: u64) -> DeviceMetrics {
        DeviceMetrics::new(id, (used_gb * GB) as i64, (total_gb * GB) as i64)
            .with_utilization(10.0)
            .with_temperature(50.0)
    }

    async fn ready() -> ClusteringManager {
        ClusteringManager::start(ClusterConfig::default()).await.unwrap()
    }

    async fn with_pair() -> ClusteringManager {
        let manager = ready().await;
        manager.register_device(gpu("gpu-8", 8)).await.unwrap();
        manager.register_device(gpu("gpu-16", 16)).await.unwrap();
        manager.record_metrics(sample("gpu-8", 0, 8)).await.unwrap();
        manager.record_metrics(sample("gpu-16", 0, 16)).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_uninitialized_rejects_everything() {
        let manager = ClusteringManager::new(ClusterConfig::default());
        assert_eq!(manager.state(), ManagerState::Uninitialized);

        let err = manager.register_device(gpu("gpu-0", 8)).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotInitialized(_)));
        let err = manager.record_metrics(sample("gpu-0", 1, 8)).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotInitialized(_)));
        assert!(manager.rank_devices().await.is_err());

        manager.initialize().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Ready);
        assert!(manager.register_device(gpu("gpu-0", 8)).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_initialization_stays_uninitialized() {
        let mut config = ClusterConfig::default();
        config.scoring.memory_weight = 0.9;

        let manager = ClusteringManager::new(config);
        assert!(matches!(manager.initialize().await, Err(ClusterError::Config(_))));
        assert_eq!(manager.state(), ManagerState::Uninitialized);
        assert!(matches!(
            manager.aggregate_metrics().await,
            Err(ClusterError::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn test_record_then_current_returns_sample() {
        let manager = ready().await;
        manager.register_device(gpu("gpu-0", 8)).await.unwrap();
        assert_eq!(manager.current_metrics("gpu-0").await.unwrap(), None);

        let m = sample("gpu-0", 3, 8).with_power(120.0).with_clock(1800);
        manager.record_metrics(m.clone()).await.unwrap();
        assert_eq!(manager.current_metrics("gpu-0").await.unwrap(), Some(m));

        assert!(matches!(
            manager.current_metrics("ghost").await,
            Err(ClusterError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_utilization_leaves_state_untouched() {
        let manager = ready().await;
        manager.register_device(gpu("gpu-0", 8)).await.unwrap();
        let good = sample("gpu-0", 2, 8);
        manager.record_metrics(good.clone()).await.unwrap();

        let err = manager
            .record_metrics(sample("gpu-0", 2, 8).with_utilization(150.0))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        assert_eq!(manager.current_metrics("gpu-0").await.unwrap(), Some(good));
        assert_eq!(manager.metrics_history("gpu-0").await.unwrap().len(), 1);
        assert_eq!(manager.state(), ManagerState::Ready);
    }

    #[tokio::test]
    async fn test_descriptor_fixed_after_registration() {
        let manager = ready().await;
        assert!(manager.register_device(gpu("g", 16)).await.unwrap());
        assert!(!manager.register_device(gpu("g", 16)).await.unwrap());

        let mut swapped = GpuDevice::new("g", GpuVendor::Amd, GB);
        swapped.device_class = shardlet_core::DeviceClass::Mobile;
        let err = manager.register_device(swapped.clone()).await.unwrap_err();
        assert!(err.is_validation());

        let registration = TelemetryMessage::Registration(DeviceRegistration {
            hostname: "node-b".to_string(),
            port: 9100,
            device: swapped,
        });
        assert!(manager.ingest(registration).await.unwrap_err().is_validation());

        let stored = manager.device("g").await.unwrap();
        assert_eq!(stored.device.vendor, GpuVendor::Nvidia);
        assert_eq!(stored.device.memory_total, 16 * GB);
        assert_eq!(stored.endpoint, None);

        // Same descriptor from a host only refreshes the endpoint
        let registration = TelemetryMessage::Registration(DeviceRegistration {
            hostname: "node-a".to_string(),
            port: 9000,
            device: gpu("g", 16),
        });
        manager.ingest(registration).await.unwrap();
        let stored = manager.device("g").await.unwrap();
        assert_eq!(stored.endpoint.as_deref(), Some("node-a:9000"));
        assert_eq!(stored.device, gpu("g", 16));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_samples_keep_telemetry_and_thermal_in_step() {
        let manager = Arc::new(ready().await);
        manager.register_device(gpu("gpu-0", 8)).await.unwrap();

        for round in 0..10 {
            let mut tasks = Vec::new();
            for i in 0..16 {
                let m = manager.clone();
                let temperature = 40.0 + (round * 16 + i) as f64 * 0.1;
                tasks.push(tokio::spawn(async move {
                    m.record_metrics(sample("gpu-0", 1, 8).with_temperature(temperature))
                        .await
                }));
            }
            for result in futures::future::join_all(tasks).await {
                result.unwrap().unwrap();
            }

            let current = manager.current_metrics("gpu-0").await.unwrap().unwrap();
            let thermal = manager.thermal_state("gpu-0").await.unwrap().unwrap();
            assert_eq!(thermal.current_temperature_c, current.temperature_c);
        }
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let manager = ready().await;
        let err = manager.record_metrics(sample("ghost", 1, 8)).await.unwrap_err();
        assert!(matches!(err, ClusterError::UnknownDevice(_)));
    }

    #[tokio::test]
    async fn test_record_batch_isolates_failures() {
        let manager = ready().await;
        manager.register_device(gpu("a", 8)).await.unwrap();
        manager.register_device(gpu("b", 8)).await.unwrap();

        let results = manager
            .record_batch(vec![
                sample("a", 1, 8),
                sample("b", 9, 8),
                sample("ghost", 1, 8),
                sample("b", 2, 8),
            ])
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_validation());
        assert!(matches!(results[2], Err(ClusterError::UnknownDevice(_))));
        assert!(results[3].is_ok());
        assert_eq!(manager.metrics_history("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heterogeneous_placement_and_device_loss() {
        let manager = with_pair().await;
        let request = ShardPlacementRequest::new(vec![4 * GB, 4 * GB, 4 * GB]);

        let assignment = manager.place_shards(request).await.unwrap();
        assert!(assignment.heterogeneous);
        assert_eq!(assignment.len(), 3);
        for (device, bytes) in &assignment.bytes_per_device {
            let limit = if device == "gpu-8" { 8 * GB } else { 16 * GB };
            assert!(*bytes <= limit);
        }
        assert_eq!(manager.assignments().await.unwrap().len(), 1);

        let victim = assignment.bytes_per_device.keys().next().unwrap().clone();
        let invalidated = manager.remove_device(&victim).await.unwrap();
        assert_eq!(invalidated, vec![assignment.id]);
        assert!(manager.assignment(assignment.id).await.unwrap().is_none());
        assert!(matches!(
            manager.remove_device(&victim).await,
            Err(ClusterError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_release_assignment() {
        let manager = with_pair().await;
        let assignment = manager
            .place_shards(ShardPlacementRequest::new(vec![GB]))
            .await
            .unwrap();
        assert!(manager.release_assignment(assignment.id).await.unwrap());
        assert!(!manager.release_assignment(assignment.id).await.unwrap());
        assert!(manager.assignments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_infeasible_placement_names_shards() {
        let manager = with_pair().await;
        let err = manager
            .place_shards(ShardPlacementRequest::new(vec![12 * GB, 12 * GB]))
            .await
            .unwrap_err();
        assert!(err.is_capacity());
        match err {
            ClusterError::Infeasible(failure) => assert_eq!(failure.shard_indices(), vec![1]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(manager.assignments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_candidate_rejected() {
        let manager = with_pair().await;
        let request = ShardPlacementRequest::new(vec![GB]).with_candidates(vec!["ghost".to_string()]);
        assert!(matches!(
            manager.place_shards(request).await,
            Err(ClusterError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_thermal_pause_and_resume() {
        let manager = ready().await;
        manager.register_device(gpu("gpu-0", 8)).await.unwrap();
        let mut events = manager.subscribe_thermal().await.unwrap();

        assert!(manager.record_metrics(sample("gpu-0", 1, 8)).await.unwrap().is_none());
        let permit = manager.begin_compute("gpu-0").await.unwrap();

        let transition = manager
            .record_metrics(sample("gpu-0", 1, 8).with_temperature(90.0).with_power(300.0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transition.to, ExecutorMode::Paused);
        assert_eq!(events.recv().await.unwrap().to, ExecutorMode::Paused);

        // Paused devices take no new work and drop out of scheduling
        assert!(matches!(
            manager.begin_compute("gpu-0").await,
            Err(ClusterError::ThermalLimit { .. })
        ));
        assert!(manager.rank_devices().await.unwrap().is_empty());
        drop(permit);

        // Exactly at the resume threshold stays paused
        let none = manager
            .record_metrics(sample("gpu-0", 1, 8).with_temperature(75.0))
            .await
            .unwrap();
        assert!(none.is_none());
        let state = manager.thermal_state("gpu-0").await.unwrap().unwrap();
        assert_eq!(state.mode, ExecutorMode::Paused);

        let transition = manager
            .record_metrics(sample("gpu-0", 1, 8).with_temperature(70.0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transition.to, ExecutorMode::Running);
        assert_eq!(manager.rank_devices().await.unwrap().len(), 1);
        assert!(manager.begin_compute("gpu-0").await.is_ok());
    }

    #[tokio::test]
    async fn test_paused_device_excluded_from_placement() {
        let manager = with_pair().await;
        manager
            .record_metrics(sample("gpu-16", 0, 16).with_temperature(92.0))
            .await
            .unwrap();

        let assignment = manager
            .place_shards(ShardPlacementRequest::new(vec![2 * GB, 2 * GB]))
            .await
            .unwrap();
        assert!(assignment.placements.values().all(|d| d == "gpu-8"));
        assert_eq!(assignment.method, PlacementMethod::Greedy);

        let best = manager.select_best_device(GB).await.unwrap().unwrap();
        assert_eq!(best.device_id, "gpu-8");
    }

    #[tokio::test]
    async fn test_unsampled_device_not_eligible() {
        let manager = ready().await;
        manager.register_device(gpu("fresh", 8)).await.unwrap();
        assert!(manager.rank_devices().await.unwrap().is_empty());
        assert!(manager.select_best_device(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_availability_and_wire_roundtrip() {
        let manager = ready().await;
        let mut device = gpu("cuda:0", 24);
        device.compute_units = 128;
        let registration = TelemetryEnvelope::new(TelemetryMessage::Registration(DeviceRegistration {
            hostname: "node-a".to_string(),
            port: 9000,
            device,
        }));
        manager
            .ingest_json(&registration.encode().unwrap())
            .await
            .unwrap();
        assert_eq!(
            manager.device("cuda:0").await.unwrap().endpoint.as_deref(),
            Some("node-a:9000")
        );

        let heartbeat = TelemetryEnvelope::new(TelemetryMessage::Heartbeat(Heartbeat {
            device_id: "cuda:0".to_string(),
            metrics: sample("cuda:0", 4, 24),
            is_available: false,
            error_message: Some("ECC error".to_string()),
        }));
        manager.ingest_json(&heartbeat.encode().unwrap()).await.unwrap();

        assert!(manager.rank_devices().await.unwrap().is_empty());
        let outgoing = manager.heartbeat_message("cuda:0").await.unwrap();
        match outgoing.message {
            TelemetryMessage::Heartbeat(h) => {
                assert!(!h.is_available);
                assert_eq!(h.error_message.as_deref(), Some("ECC error"));
                assert_eq!(h.metrics.memory_used_bytes, (4 * GB) as i64);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let outgoing = manager.registration_message("cuda:0", "node-a", 9000).await.unwrap();
        let decoded = TelemetryEnvelope::decode(&outgoing.encode().unwrap()).unwrap();
        assert_eq!(decoded.message.device_id(), "cuda:0");
    }

    #[tokio::test]
    async fn test_unsupported_schema_version() {
        let manager = ready().await;
        let envelope = TelemetryEnvelope::new(TelemetryMessage::Registration(DeviceRegistration {
            hostname: "node-a".to_string(),
            port: 9000,
            device: gpu("cuda:0", 8),
        }));
        let json = envelope
            .encode()
            .unwrap()
            .replacen("\"version\":1", "\"version\":99", 1);
        assert!(matches!(
            manager.ingest_json(&json).await,
            Err(ClusterError::UnsupportedSchema(99))
        ));
    }

    #[tokio::test]
    async fn test_distribute_workload() {
        let manager = ready().await;
        let mut big = gpu("big", 16);
        big.compute_units = 3;
        let mut small = gpu("small", 8);
        small.compute_units = 1;
        manager.register_device(big).await.unwrap();
        manager.register_device(small).await.unwrap();
        let ids = vec!["big".to_string(), "small".to_string()];

        let dist = manager
            .distribute_workload(&ids, (0..8).collect(), DistributionStrategy::Capacity, None)
            .await
            .unwrap();
        assert_eq!(dist["big"].len(), 6);
        assert_eq!(dist["small"].len(), 2);

        let dist = manager
            .distribute_workload(&ids, (0..8).collect(), DistributionStrategy::Uniform, Some(4))
            .await
            .unwrap();
        assert_eq!(dist["big"], vec![0, 1, 2, 3]);
        assert_eq!(dist["small"], vec![4, 5, 6, 7]);

        let zero: BTreeMap<DeviceId, f64> =
            [("big".to_string(), 0.0), ("small".to_string(), 0.0)].into_iter().collect();
        assert!(manager
            .distribute_by_capacity(&zero, vec![1, 2, 3], None)
            .await
            .unwrap_err()
            .is_capacity());

        let unknown = vec!["ghost".to_string()];
        assert!(matches!(
            manager
                .distribute_workload(&unknown, vec![1], DistributionStrategy::Uniform, None)
                .await,
            Err(ClusterError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let manager = with_pair().await;
        manager
            .place_shards(ShardPlacementRequest::new(vec![GB]))
            .await
            .unwrap();

        manager.shutdown().await;
        assert_eq!(manager.state(), ManagerState::Uninitialized);
        assert!(matches!(
            manager.metrics_history("gpu-8").await,
            Err(ClusterError::NotInitialized(_))
        ));
        // Second shutdown is a no-op
        manager.shutdown().await;

        manager.initialize().await.unwrap();
        assert!(manager.devices().await.unwrap().is_empty());
        assert!(manager.assignments().await.unwrap().is_empty());
        assert_eq!(manager.aggregate_metrics().await.unwrap().device_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_shutdown_and_record() {
        let manager = Arc::new(ready().await);
        manager.register_device(gpu("gpu-0", 8)).await.unwrap();
        let capacity = manager.config().telemetry.history_capacity;

        let mut writers = Vec::new();
        for i in 0..200 {
            let m = manager.clone();
            writers.push(tokio::spawn(async move {
                m.record_metrics(sample("gpu-0", 1, 8).with_utilization((i % 100) as f64))
                    .await
            }));
        }
        let mut readers = Vec::new();
        for _ in 0..20 {
            let m = manager.clone();
            readers.push(tokio::spawn(async move { m.metrics_history("gpu-0").await }));
        }

        let m = manager.clone();
        let shutdown = tokio::spawn(async move { m.shutdown().await });

        for result in futures::future::join_all(writers).await {
            match result.unwrap() {
                Ok(_) | Err(ClusterError::NotInitialized(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        for result in futures::future::join_all(readers).await {
            match result.unwrap() {
                Ok(history) => {
                    assert!(history.len() <= capacity);
                    assert!(history.iter().all(|m| m.device_id == "gpu-0"));
                }
                Err(ClusterError::NotInitialized(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        shutdown.await.unwrap();

        assert_eq!(manager.state(), ManagerState::Uninitialized);
        assert!(matches!(
            manager.record_metrics(sample("gpu-0", 1, 8)).await,
            Err(ClusterError::NotInitialized(_))
        ));
    }

    struct SteadySource;

    #[async_trait]
    impl MetricsSource for SteadySource {
        async fn sample(&self, device_id: &str) -> ClusterResult<DeviceMetrics> {
            Ok(sample(device_id, 2, 8))
        }

        fn name(&self) -> &'static str {
            "steady"
        }
    }

    #[tokio::test]
    async fn test_background_sampling() {
        let mut config = ClusterConfig::default();
        config.telemetry.sample_interval_ms = 5;
        let manager = Arc::new(ClusteringManager::start(config).await.unwrap());
        manager.register_device(gpu("gpu-0", 8)).await.unwrap();

        assert_eq!(manager.start_sampling(Arc::new(SteadySource)).await.unwrap(), 1);
        assert!(manager.start_sampling(Arc::new(SteadySource)).await.is_err());

        // Registered after sampling started
        manager.register_device(gpu("gpu-1", 8)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(!manager.metrics_history("gpu-0").await.unwrap().is_empty());
        assert!(!manager.metrics_history("gpu-1").await.unwrap().is_empty());

        manager.shutdown().await;
        assert_eq!(manager.state(), ManagerState::Uninitialized);
    }
}
