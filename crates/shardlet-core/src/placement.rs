//! Shard placement requests, assignments and failure reports

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DeviceId, Precision};

/// Request to place an ordered list of shards
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardPlacementRequest {
    /// Shard sizes in bytes, in model layer order
    pub shard_sizes: Vec<u64>,
    /// Devices that may receive shards; empty means every eligible device
    #[serde(default)]
    pub candidates: Vec<DeviceId>,
    /// Precision every chosen device must support
    #[serde(default)]
    pub required_precision: Option<Precision>,
    /// Topology group every chosen device must belong to
    #[serde(default)]
    pub topology_group: Option<String>,
}

impl ShardPlacementRequest {
    /// Create a request with no hard constraints beyond memory
    pub fn new(shard_sizes: Vec<u64>) -> Self {
        Self {
            shard_sizes,
            ..Default::default()
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<DeviceId>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.required_precision = Some(precision);
        self
    }

    pub fn with_topology_group(mut self, group: impl Into<String>) -> Self {
        self.topology_group = Some(group.into());
        self
    }

    /// Sum of all shard sizes, saturating at `u64::MAX`
    pub fn total_bytes(&self) -> u64 {
        self.shard_sizes
            .iter()
            .fold(0u64, |total, size| total.saturating_add(*size))
    }
}

/// How an assignment was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementMethod {
    /// Backtracking constraint search completed
    Search,
    /// Pool was homogeneous, single-pass greedy used directly
    Greedy,
    /// Search exceeded its time limit and greedy took over
    GreedyFallback,
}

impl std::fmt::Display for PlacementMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlacementMethod::Search => write!(f, "search"),
            PlacementMethod::Greedy => write!(f, "greedy"),
            PlacementMethod::GreedyFallback => write!(f, "greedy-fallback"),
        }
    }
}

/// A complete, valid mapping of shards to devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardAssignment {
    /// Assignment identifier
    pub id: Uuid,
    /// Shard index to device
    pub placements: BTreeMap<usize, DeviceId>,
    /// Bytes assigned to each device
    pub bytes_per_device: BTreeMap<DeviceId, u64>,
    /// Algorithm that produced the assignment
    pub method: PlacementMethod,
    /// Whether the pool was judged heterogeneous
    pub heterogeneous: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl ShardAssignment {
    /// Build an assignment from a shard-to-device mapping
    pub fn new(
        placements: BTreeMap<usize, DeviceId>,
        shard_sizes: &[u64],
        method: PlacementMethod,
        heterogeneous: bool,
    ) -> Self {
        let mut bytes_per_device: BTreeMap<DeviceId, u64> = BTreeMap::new();
        for (shard, device) in &placements {
            let size = shard_sizes.get(*shard).copied().unwrap_or(0);
            *bytes_per_device.entry(device.clone()).or_insert(0) += size;
        }
        Self {
            id: Uuid::new_v4(),
            placements,
            bytes_per_device,
            method,
            heterogeneous,
            created_at: Utc::now(),
        }
    }

    /// Device holding a shard
    pub fn device_for(&self, shard: usize) -> Option<&DeviceId> {
        self.placements.get(&shard)
    }

    /// Whether any shard is placed on the device
    pub fn references(&self, device_id: &str) -> bool {
        self.bytes_per_device.contains_key(device_id)
    }

    /// Number of placed shards
    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }
}

/// Why a shard could not be placed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum UnplacedReason {
    /// No device had enough free memory left
    InsufficientMemory { largest_free_bytes: u64 },
    /// No candidate device supports the required precision
    PrecisionIncompatible { required: Precision },
    /// No candidate device belongs to the requested topology group
    OutsideTopologyGroup { group: String },
    /// The candidate set was empty after filtering
    NoCandidates,
}

impl std::fmt::Display for UnplacedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnplacedReason::InsufficientMemory { largest_free_bytes } => write!(
                f,
                "insufficient memory (largest free block {} bytes)",
                largest_free_bytes
            ),
            UnplacedReason::PrecisionIncompatible { required } => {
                write!(f, "no candidate supports {}", required)
            }
            UnplacedReason::OutsideTopologyGroup { group } => {
                write!(f, "no candidate in topology group {}", group)
            }
            UnplacedReason::NoCandidates => write!(f, "no candidate devices"),
        }
    }
}

/// A shard left without a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnplacedShard {
    pub index: usize,
    pub bytes: u64,
    pub reason: UnplacedReason,
}

/// Report of an infeasible placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementFailure {
    /// Every shard that could not be placed
    pub unplaced: Vec<UnplacedShard>,
    /// Total bytes requested
    pub required_bytes: u64,
    /// Total free bytes across eligible devices
    pub available_bytes: u64,
}

impl PlacementFailure {
    /// Indices of the unplaced shards
    pub fn shard_indices(&self) -> Vec<usize> {
        self.unplaced.iter().map(|u| u.index).collect()
    }
}

impl std::fmt::Display for PlacementFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} shard(s) unplaced (required {} bytes, available {} bytes)",
            self.unplaced.len(),
            self.required_bytes,
            self.available_bytes
        )?;
        for shard in &self.unplaced {
            write!(f, "; shard {} ({} bytes): {}", shard.index, shard.bytes, shard.reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_bytes_per_device() {
        let mut placements = BTreeMap::new();
        placements.insert(0, "a".to_string());
        placements.insert(1, "b".to_string());
        placements.insert(2, "a".to_string());

        let assignment =
            ShardAssignment::new(placements, &[4, 6, 2], PlacementMethod::Search, true);
        assert_eq!(assignment.bytes_per_device["a"], 6);
        assert_eq!(assignment.bytes_per_device["b"], 6);
        assert!(assignment.references("a"));
        assert!(!assignment.references("c"));
        assert_eq!(assignment.device_for(1).unwrap(), "b");
        assert_eq!(assignment.len(), 3);
    }

    #[test]
    fn test_total_bytes_saturates() {
        assert_eq!(ShardPlacementRequest::new(vec![3, 4]).total_bytes(), 7);
        assert_eq!(
            ShardPlacementRequest::new(vec![u64::MAX, 1, 2]).total_bytes(),
            u64::MAX
        );
    }

    #[test]
    fn test_failure_display_names_shards() {
        let failure = PlacementFailure {
            unplaced: vec![
                UnplacedShard {
                    index: 2,
                    bytes: 100,
                    reason: UnplacedReason::InsufficientMemory {
                        largest_free_bytes: 50,
                    },
                },
                UnplacedShard {
                    index: 3,
                    bytes: 10,
                    reason: UnplacedReason::PrecisionIncompatible {
                        required: Precision::Int4,
                    },
                },
            ],
            required_bytes: 110,
            available_bytes: 50,
        };
        let text = failure.to_string();
        assert!(text.starts_with("2 shard(s) unplaced"));
        assert!(text.contains("shard 2 (100 bytes): insufficient memory"));
        assert!(text.contains("shard 3 (10 bytes): no candidate supports int4"));
        assert_eq!(failure.shard_indices(), vec![2, 3]);
    }

    #[test]
    fn test_request_builder() {
        let request = ShardPlacementRequest::new(vec![1, 2, 3])
            .with_precision(Precision::Fp16)
            .with_topology_group("rack-1");
        assert_eq!(request.total_bytes(), 6);
        assert_eq!(request.required_precision, Some(Precision::Fp16));
        assert_eq!(request.topology_group.as_deref(), Some("rack-1"));
    }
}
