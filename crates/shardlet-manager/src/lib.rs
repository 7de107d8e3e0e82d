//! shardlet-manager: Cluster manager for heterogeneous GPU pools
//!
//! This crate ties the pipeline together behind one handle:
//! - Device registry and lifecycle (initialize, drain, shutdown)
//! - Telemetry ingestion, directly or from remote hosts
//! - Scoring, shard placement and workload distribution
//! - Thermal gating of compute
//! - Tracing setup

pub mod logging;
pub mod manager;

pub use logging::init_tracing;
pub use manager::{ClusteringManager, ManagerState, RegisteredDevice};

pub use shardlet_core as core;
pub use shardlet_scheduler as scheduler;
pub use shardlet_telemetry as telemetry;
pub use shardlet_thermal as thermal;
