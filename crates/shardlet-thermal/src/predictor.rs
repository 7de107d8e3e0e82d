//! First-order RC thermal model
//!
//! The die is treated as a single thermal capacitance charged through a
//! thermal resistance to ambient. Under constant power `P` the temperature
//! relaxes exponentially toward the steady state
//!
//! ```text
//! T_ss = T_ambient + P * R
//! T(t) = T_ss + (T_0 - T_ss) * exp(-t / tau)
//! ```
//!
//! With `P = 0` the same equation decays toward ambient.

use serde::{Deserialize, Serialize};
use shardlet_core::DeviceClass;

/// Thermal resistance and time constant for a device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermalParams {
    /// Die-to-ambient thermal resistance in °C per watt
    pub resistance_c_per_w: f64,
    /// Time constant (R * C) in seconds
    pub time_constant_secs: f64,
}

impl ThermalParams {
    /// Calibration for a device form factor
    pub fn for_class(class: DeviceClass) -> Self {
        match class {
            DeviceClass::Datacenter => Self {
                resistance_c_per_w: 0.075,
                time_constant_secs: 45.0,
            },
            DeviceClass::Desktop => Self {
                resistance_c_per_w: 0.11,
                time_constant_secs: 25.0,
            },
            DeviceClass::Mobile => Self {
                resistance_c_per_w: 4.0,
                time_constant_secs: 12.0,
            },
            DeviceClass::Integrated => Self {
                resistance_c_per_w: 1.3,
                time_constant_secs: 15.0,
            },
        }
    }
}

impl Default for ThermalParams {
    /// High resistance and a short time constant, so the forecast runs
    /// hotter and sooner than any calibrated class
    fn default() -> Self {
        Self {
            resistance_c_per_w: 0.15,
            time_constant_secs: 10.0,
        }
    }
}

/// Temperature forecaster for one device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RcThermalModel {
    params: ThermalParams,
    ambient_c: f64,
}

impl RcThermalModel {
    pub fn new(params: ThermalParams, ambient_c: f64) -> Self {
        Self { params, ambient_c }
    }

    pub fn params(&self) -> ThermalParams {
        self.params
    }

    pub fn ambient_c(&self) -> f64 {
        self.ambient_c
    }

    /// Asymptotic temperature under constant power
    pub fn steady_state_c(&self, power_w: f64) -> f64 {
        self.ambient_c + power_w.max(0.0) * self.params.resistance_c_per_w
    }

    fn decay(&self, secs: f64) -> f64 {
        (-secs.max(0.0) / self.params.time_constant_secs).exp()
    }

    /// Temperature after `horizon_secs` at constant power
    pub fn predict(&self, current_c: f64, power_w: f64, horizon_secs: f64) -> f64 {
        let steady = self.steady_state_c(power_w);
        steady + (current_c - steady) * self.decay(horizon_secs)
    }

    /// Seconds until `target_c` is reached at constant power
    ///
    /// `None` when the trajectory never gets there, i.e. the target lies
    /// beyond the steady state or behind the current temperature.
    pub fn time_to_reach(&self, current_c: f64, power_w: f64, target_c: f64) -> Option<f64> {
        if (current_c - target_c).abs() < f64::EPSILON {
            return Some(0.0);
        }
        let steady = self.steady_state_c(power_w);
        let gap = current_c - steady;
        if gap.abs() < f64::EPSILON {
            return None;
        }
        let ratio = (target_c - steady) / gap;
        if ratio <= 0.0 || ratio >= 1.0 {
            return None;
        }
        Some(-self.params.time_constant_secs * ratio.ln())
    }

    /// Constant power that lands exactly on `target_c` after `horizon_secs`
    ///
    /// Clamped at zero: if the device would overshoot even while idle, the
    /// best available answer is to draw nothing.
    pub fn estimate_power_for_temperature(
        &self,
        current_c: f64,
        target_c: f64,
        horizon_secs: f64,
    ) -> f64 {
        if horizon_secs <= 0.0 {
            return 0.0;
        }
        let d = self.decay(horizon_secs);
        let steady = (target_c - current_c * d) / (1.0 - d);
        ((steady - self.ambient_c) / self.params.resistance_c_per_w).max(0.0)
    }
}
