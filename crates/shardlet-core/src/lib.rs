//! shardlet-core: Core types for the shardlet GPU cluster scheduler
//!
//! This crate provides the fundamental types used throughout shardlet:
//! - Device descriptors and telemetry samples
//! - Shard placement requests, assignments and failure reports
//! - The versioned telemetry wire schema
//! - A fixed-capacity history buffer
//! - Configuration types
//! - Error handling

pub mod config;
pub mod device;
pub mod error;
pub mod history;
pub mod metrics;
pub mod placement;
pub mod protocol;

pub use config::*;
pub use device::*;
pub use error::*;
pub use history::RingHistory;
pub use metrics::*;
pub use placement::*;
pub use protocol::*;
