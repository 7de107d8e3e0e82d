//! shardlet-telemetry: Per-device telemetry for shardlet
//!
//! This crate provides the telemetry pipeline:
//! - Validated current-value and bounded-history store per device
//! - Threshold-based change notifications
//! - Windowed summaries and cluster rollups
//! - Periodic sampling tasks driven by an external metrics source

pub mod collector;
pub mod sampler;
pub mod summary;

pub use collector::{MetricsChange, TelemetryCollector};
pub use sampler::{MetricsSink, MetricsSource, TelemetrySampler};
pub use summary::{MetricsSummary, Stat};
