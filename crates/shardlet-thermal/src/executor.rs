//! Per-device thermal state machine

use crate::predictor::RcThermalModel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardlet_core::{ClusterError, ClusterResult, DeviceId, RingHistory, ThermalConfig};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Execution mode of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    Running,
    PrecisionReduced,
    Paused,
}

impl ExecutorMode {
    /// Whether new compute may start in this mode
    pub fn accepts_work(&self) -> bool {
        !matches!(self, ExecutorMode::Paused)
    }
}

impl fmt::Display for ExecutorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorMode::Running => write!(f, "running"),
            ExecutorMode::PrecisionReduced => write!(f, "precision_reduced"),
            ExecutorMode::Paused => write!(f, "paused"),
        }
    }
}

/// Temperature boundaries driving mode transitions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalThresholds {
    /// Hard limit; reaching it pauses from any mode
    pub critical_c: f64,
    /// Predicted temperature at which throttling starts
    pub soft_limit_c: f64,
    /// A paused device resumes strictly below this
    pub resume_below_c: f64,
    /// Whether precision reduction is available before pausing
    pub precision_reduction: bool,
}

impl From<&ThermalConfig> for ThermalThresholds {
    fn from(config: &ThermalConfig) -> Self {
        Self {
            critical_c: config.critical_c,
            soft_limit_c: config.soft_limit_c(),
            resume_below_c: config.resume_below_c(),
            precision_reduction: config.precision_reduction,
        }
    }
}

/// Next mode given the current mode, measured and predicted temperatures
///
/// The resume threshold sits below the soft limit, so a device hovering at
/// one temperature cannot oscillate between modes.
pub fn next_mode(
    mode: ExecutorMode,
    current_c: f64,
    predicted_c: f64,
    thresholds: &ThermalThresholds,
) -> ExecutorMode {
    if current_c >= thresholds.critical_c {
        return ExecutorMode::Paused;
    }
    match mode {
        ExecutorMode::Running => {
            if predicted_c >= thresholds.soft_limit_c {
                if thresholds.precision_reduction {
                    ExecutorMode::PrecisionReduced
                } else {
                    ExecutorMode::Paused
                }
            } else {
                ExecutorMode::Running
            }
        }
        ExecutorMode::PrecisionReduced => {
            if current_c >= thresholds.soft_limit_c {
                ExecutorMode::Paused
            } else if predicted_c < thresholds.resume_below_c {
                ExecutorMode::Running
            } else {
                ExecutorMode::PrecisionReduced
            }
        }
        ExecutorMode::Paused => {
            if current_c < thresholds.resume_below_c {
                ExecutorMode::Running
            } else {
                ExecutorMode::Paused
            }
        }
    }
}

/// One observed temperature/power pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermalSample {
    pub timestamp: DateTime<Utc>,
    pub temperature_c: f64,
    pub power_watts: f64,
}

/// Snapshot of a device's thermal condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalState {
    pub device_id: DeviceId,
    pub current_temperature_c: f64,
    /// Forecast at `horizon_secs` under the current power draw
    pub predicted_temperature_c: f64,
    pub horizon_secs: f64,
    /// Headroom to the critical limit from the hotter of current and predicted
    pub safety_margin_c: f64,
    pub mode: ExecutorMode,
    pub updated_at: DateTime<Utc>,
}

/// A mode change, broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalTransition {
    pub device_id: DeviceId,
    pub from: ExecutorMode,
    pub to: ExecutorMode,
    pub temperature_c: f64,
    pub predicted_temperature_c: f64,
    pub at: DateTime<Utc>,
}

/// Token for one unit of in-flight compute; released on drop
#[derive(Debug)]
pub struct ComputePermit {
    device_id: DeviceId,
    in_flight: Arc<AtomicUsize>,
}

impl ComputePermit {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Drop for ComputePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Gates compute on one device by forecast temperature
#[derive(Debug)]
pub struct AdaptiveExecutor {
    device_id: DeviceId,
    model: RcThermalModel,
    thresholds: ThermalThresholds,
    horizon_secs: f64,
    mode: ExecutorMode,
    state: Option<ThermalState>,
    history: RingHistory<ThermalSample>,
    in_flight: Arc<AtomicUsize>,
}

impl AdaptiveExecutor {
    pub fn new(device_id: impl Into<DeviceId>, model: RcThermalModel, config: &ThermalConfig) -> Self {
        Self {
            device_id: device_id.into(),
            model,
            thresholds: ThermalThresholds::from(config),
            horizon_secs: config.horizon_secs,
            mode: ExecutorMode::Running,
            state: None,
            history: RingHistory::new(config.history_capacity),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn mode(&self) -> ExecutorMode {
        self.mode
    }

    pub fn model(&self) -> &RcThermalModel {
        &self.model
    }

    /// Latest snapshot, `None` before the first observation
    pub fn state(&self) -> Option<&ThermalState> {
        self.state.as_ref()
    }

    pub fn history(&self) -> Vec<ThermalSample> {
        self.history.to_vec()
    }

    /// Compute units currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Feed one reading and re-evaluate the mode
    pub fn observe(
        &mut self,
        temperature_c: f64,
        power_watts: f64,
        at: DateTime<Utc>,
    ) -> Option<ThermalTransition> {
        self.history.push(ThermalSample {
            timestamp: at,
            temperature_c,
            power_watts,
        });

        let predicted = self.model.predict(temperature_c, power_watts, self.horizon_secs);
        let next = next_mode(self.mode, temperature_c, predicted, &self.thresholds);

        self.state = Some(ThermalState {
            device_id: self.device_id.clone(),
            current_temperature_c: temperature_c,
            predicted_temperature_c: predicted,
            horizon_secs: self.horizon_secs,
            safety_margin_c: self.thresholds.critical_c - temperature_c.max(predicted),
            mode: next,
            updated_at: at,
        });

        if next == self.mode {
            return None;
        }

        let previous = std::mem::replace(&mut self.mode, next);
        match next {
            ExecutorMode::Paused => warn!(
                device_id = %self.device_id,
                temperature_c = temperature_c,
                predicted_c = predicted,
                in_flight = self.in_flight(),
                "Pausing device"
            ),
            ExecutorMode::PrecisionReduced => warn!(
                device_id = %self.device_id,
                temperature_c = temperature_c,
                predicted_c = predicted,
                "Reducing precision"
            ),
            ExecutorMode::Running => info!(
                device_id = %self.device_id,
                from = %previous,
                temperature_c = temperature_c,
                "Device resumed full execution"
            ),
        }

        Some(ThermalTransition {
            device_id: self.device_id.clone(),
            from: previous,
            to: next,
            temperature_c,
            predicted_temperature_c: predicted,
            at,
        })
    }

    /// Admit one unit of compute
    ///
    /// Refused while paused. Permits already handed out are left to finish.
    pub fn try_begin_compute(&self) -> ClusterResult<ComputePermit> {
        if !self.mode.accepts_work() {
            let temperature_c = self
                .state
                .as_ref()
                .map(|s| s.current_temperature_c)
                .unwrap_or(self.thresholds.critical_c);
            return Err(ClusterError::ThermalLimit {
                device_id: self.device_id.clone(),
                temperature_c,
            });
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(ComputePermit {
            device_id: self.device_id.clone(),
            in_flight: self.in_flight.clone(),
        })
    }
}
