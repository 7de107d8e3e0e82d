//! shardlet-scheduler: scheduling logic for heterogeneous GPU pools
//!
//! This crate turns device capabilities and telemetry into decisions:
//! - Device scoring and ranking
//! - Shard placement with bounded search and greedy fallback
//! - Task distribution across selected devices

pub mod distributor;
pub mod scorer;
pub mod solver;

pub use distributor::{Distribution, DistributionStrategy, WorkloadDistributor};
pub use scorer::{DeviceScore, DeviceScorer, ScoreComponents, ScoringCandidate};
pub use solver::{is_heterogeneous, verify_assignment, PlacementSolver, PoolDevice};
