//! Thermal forecasting and compute throttling
//!
//! An [`RcThermalModel`] forecasts each device's temperature a few seconds
//! ahead, and an [`AdaptiveExecutor`] moves the device between full
//! execution, reduced precision and pause before the hardware limit is hit.

pub mod executor;
pub mod monitor;
pub mod predictor;

pub use executor::{
    next_mode, AdaptiveExecutor, ComputePermit, ExecutorMode, ThermalSample, ThermalState,
    ThermalThresholds, ThermalTransition,
};
pub use monitor::ThermalMonitor;
pub use predictor::{RcThermalModel, ThermalParams};
