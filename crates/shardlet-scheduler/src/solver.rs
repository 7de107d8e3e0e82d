//! Shard-to-device placement
//!
//! Heterogeneous pools are solved with a backtracking constraint search
//! (most-constrained shard first, best-scoring device first) under a
//! wall-clock limit. Homogeneous pools, and searches that run out of time,
//! use a single greedy pass instead.

use shardlet_core::{
    ClusterError, ClusterResult, DeviceId, DeviceMetrics, GpuDevice, PlacementConfig,
    PlacementFailure, PlacementMethod, Precision, ShardAssignment, ShardPlacementRequest,
    UnplacedReason, UnplacedShard,
};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A device as seen by the solver
#[derive(Debug, Clone, PartialEq)]
pub struct PoolDevice {
    pub device_id: DeviceId,
    pub total_bytes: u64,
    /// Free memory at the time of the placement call
    pub available_bytes: u64,
    pub utilization_pct: f64,
    pub precisions: Vec<Precision>,
    pub topology_group: Option<String>,
    /// Suitability score; higher is tried first
    pub score: f64,
}

impl PoolDevice {
    pub fn new(device: &GpuDevice, metrics: &DeviceMetrics, score: f64) -> Self {
        let total_bytes = if device.memory_total > 0 {
            device.memory_total
        } else {
            metrics.memory_total_bytes.max(0) as u64
        };
        Self {
            device_id: device.id.clone(),
            total_bytes,
            available_bytes: total_bytes.saturating_sub(metrics.memory_used_bytes.max(0) as u64),
            utilization_pct: metrics.utilization_pct,
            precisions: device.precisions.clone(),
            topology_group: device.topology_group.clone(),
            score,
        }
    }
}

/// Whether any two devices differ beyond the given tolerances
///
/// Memory is compared relative to the larger device; utilization in
/// absolute percentage points. Pairwise extremes are the min/max pair, so
/// a single pass suffices.
pub fn is_heterogeneous(pool: &[PoolDevice], memory_tolerance_pct: f64, utilization_tolerance_pct: f64) -> bool {
    if pool.len() < 2 {
        return false;
    }
    let (min_mem, max_mem) = pool.iter().fold((u64::MAX, 0u64), |(lo, hi), d| {
        (lo.min(d.total_bytes), hi.max(d.total_bytes))
    });
    let (min_util, max_util) = pool
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), d| {
            (lo.min(d.utilization_pct), hi.max(d.utilization_pct))
        });

    let memory_diff_pct = if max_mem == 0 {
        0.0
    } else {
        (max_mem - min_mem) as f64 / max_mem as f64 * 100.0
    };
    memory_diff_pct > memory_tolerance_pct || (max_util - min_util) > utilization_tolerance_pct
}

/// Check that no device is assigned more bytes than it has free
pub fn verify_assignment(assignment: &ShardAssignment, pool: &[PoolDevice]) -> ClusterResult<()> {
    for (device_id, bytes) in &assignment.bytes_per_device {
        let device = pool
            .iter()
            .find(|d| &d.device_id == device_id)
            .ok_or_else(|| ClusterError::UnknownDevice(device_id.clone()))?;
        if *bytes > device.available_bytes {
            return Err(ClusterError::Validation(format!(
                "device {} assigned {} bytes but has {} free",
                device_id, bytes, device.available_bytes
            )));
        }
    }
    Ok(())
}

/// Assigns shards to devices
#[derive(Debug, Clone)]
pub struct PlacementSolver {
    timeout: Duration,
    memory_tolerance_pct: f64,
    utilization_tolerance_pct: f64,
}

impl PlacementSolver {
    pub fn new(config: &PlacementConfig) -> Self {
        Self {
            timeout: config.timeout(),
            memory_tolerance_pct: config.memory_tolerance_pct,
            utilization_tolerance_pct: config.utilization_tolerance_pct,
        }
    }

    /// Override the search time limit
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Place every shard of `request` on `pool`
    ///
    /// Either all shards are placed, or the error lists each shard that
    /// could not be and why.
    pub fn solve(&self, request: &ShardPlacementRequest, pool: &[PoolDevice]) -> ClusterResult<ShardAssignment> {
        if request.shard_sizes.is_empty() {
            return Err(ClusterError::Validation(
                "placement request has no shards".to_string(),
            ));
        }
        let sizes = &request.shard_sizes;

        let eligible = self.filter_pool(request, pool)?;
        let available_bytes = total_available(&eligible);
        let order = score_order(&eligible);

        // Shards no single device can hold fail before any search
        let largest_free = eligible.iter().map(|d| d.available_bytes).max().unwrap_or(0);
        let oversized: Vec<UnplacedShard> = sizes
            .iter()
            .enumerate()
            .filter(|(_, size)| **size > largest_free)
            .map(|(index, size)| UnplacedShard {
                index,
                bytes: *size,
                reason: UnplacedReason::InsufficientMemory {
                    largest_free_bytes: largest_free,
                },
            })
            .collect();
        if !oversized.is_empty() {
            return Err(infeasible(oversized, request, available_bytes));
        }

        if request.total_bytes() > available_bytes {
            let (_, unplaced) = greedy(sizes, &eligible, &order);
            return Err(infeasible(unplaced, request, available_bytes));
        }

        let heterogeneous = is_heterogeneous(
            &eligible,
            self.memory_tolerance_pct,
            self.utilization_tolerance_pct,
        );

        let (placements, method) = if heterogeneous {
            self.search_or_fallback(sizes, &eligible, &order)
        } else {
            match greedy(sizes, &eligible, &order) {
                (placements, unplaced) if unplaced.is_empty() => (Some(placements), PlacementMethod::Greedy),
                _ => {
                    // Near-identical devices can still defeat a single pass on
                    // awkward shard sizes
                    debug!("Greedy pass incomplete on homogeneous pool, searching");
                    self.search_or_fallback(sizes, &eligible, &order)
                }
            }
        };

        let placements = match placements {
            Some(placements) => placements,
            None => {
                let (_, unplaced) = greedy(sizes, &eligible, &order);
                return Err(infeasible(unplaced, request, available_bytes));
            }
        };

        let assignment = ShardAssignment::new(placements, sizes, method, heterogeneous);
        info!(
            assignment_id = %assignment.id,
            shards = sizes.len(),
            devices = assignment.bytes_per_device.len(),
            method = %method,
            heterogeneous = heterogeneous,
            "Shards placed"
        );
        Ok(assignment)
    }

    fn filter_pool(&self, request: &ShardPlacementRequest, pool: &[PoolDevice]) -> ClusterResult<Vec<PoolDevice>> {
        let fail_all = |reason: UnplacedReason, available_bytes: u64| {
            let unplaced = request
                .shard_sizes
                .iter()
                .enumerate()
                .map(|(index, bytes)| UnplacedShard {
                    index,
                    bytes: *bytes,
                    reason: reason.clone(),
                })
                .collect();
            infeasible(unplaced, request, available_bytes)
        };

        let mut devices: Vec<PoolDevice> = pool
            .iter()
            .filter(|d| request.candidates.is_empty() || request.candidates.contains(&d.device_id))
            .cloned()
            .collect();
        if devices.is_empty() {
            return Err(fail_all(UnplacedReason::NoCandidates, 0));
        }

        if let Some(group) = &request.topology_group {
            let before = total_available(&devices);
            devices.retain(|d| d.topology_group.as_ref() == Some(group));
            if devices.is_empty() {
                return Err(fail_all(
                    UnplacedReason::OutsideTopologyGroup {
                        group: group.clone(),
                    },
                    before,
                ));
            }
        }

        if let Some(precision) = request.required_precision {
            let before = total_available(&devices);
            devices.retain(|d| d.precisions.contains(&precision));
            if devices.is_empty() {
                return Err(fail_all(
                    UnplacedReason::PrecisionIncompatible {
                        required: precision,
                    },
                    before,
                ));
            }
        }

        Ok(devices)
    }

    fn search_or_fallback(
        &self,
        sizes: &[u64],
        pool: &[PoolDevice],
        order: &[usize],
    ) -> (Option<BTreeMap<usize, DeviceId>>, PlacementMethod) {
        let started = Instant::now();
        let mut search = Search::new(sizes, pool, order, started + self.timeout);

        match search.run() {
            Ok(true) => {
                debug!(
                    nodes = search.nodes,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "Placement search completed"
                );
                (Some(search.placements(pool)), PlacementMethod::Search)
            }
            Ok(false) => (None, PlacementMethod::Search),
            Err(DeadlineExceeded) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    nodes = search.nodes,
                    "Placement search timed out, falling back to greedy"
                );
                let (placements, unplaced) = greedy(sizes, pool, order);
                let placements = if unplaced.is_empty() { Some(placements) } else { None };
                (placements, PlacementMethod::GreedyFallback)
            }
        }
    }
}

fn infeasible(unplaced: Vec<UnplacedShard>, request: &ShardPlacementRequest, available_bytes: u64) -> ClusterError {
    let failure = PlacementFailure {
        unplaced,
        required_bytes: request.total_bytes(),
        available_bytes,
    };
    warn!(error = %failure, "Placement infeasible");
    ClusterError::Infeasible(failure)
}

fn total_available(pool: &[PoolDevice]) -> u64 {
    pool.iter()
        .fold(0u64, |total, d| total.saturating_add(d.available_bytes))
}

/// Pool indices by descending score, ties by device id
fn score_order(pool: &[PoolDevice]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..pool.len()).collect();
    order.sort_by(|&a, &b| {
        pool[b]
            .score
            .total_cmp(&pool[a].score)
            .then_with(|| pool[a].device_id.cmp(&pool[b].device_id))
    });
    order
}

/// Single pass in request order onto the best device with room
fn greedy(sizes: &[u64], pool: &[PoolDevice], order: &[usize]) -> (BTreeMap<usize, DeviceId>, Vec<UnplacedShard>) {
    let mut remaining: Vec<u64> = pool.iter().map(|d| d.available_bytes).collect();
    let mut placements = BTreeMap::new();
    let mut unplaced = Vec::new();

    for (index, &size) in sizes.iter().enumerate() {
        match order.iter().copied().find(|&d| remaining[d] >= size) {
            Some(d) => {
                remaining[d] -= size;
                placements.insert(index, pool[d].device_id.clone());
            }
            None => unplaced.push(UnplacedShard {
                index,
                bytes: size,
                reason: UnplacedReason::InsufficientMemory {
                    largest_free_bytes: remaining.iter().copied().max().unwrap_or(0),
                },
            }),
        }
    }
    (placements, unplaced)
}

#[derive(Debug)]
struct DeadlineExceeded;

/// Backtracking state; abandoned wholesale on timeout
struct Search<'a> {
    sizes: &'a [u64],
    order: &'a [usize],
    remaining: Vec<u64>,
    assigned: Vec<Option<usize>>,
    deadline: Instant,
    nodes: u64,
}

impl<'a> Search<'a> {
    fn new(sizes: &'a [u64], pool: &[PoolDevice], order: &'a [usize], deadline: Instant) -> Self {
        Self {
            sizes,
            order,
            remaining: pool.iter().map(|d| d.available_bytes).collect(),
            assigned: vec![None; sizes.len()],
            deadline,
            nodes: 0,
        }
    }

    fn run(&mut self) -> Result<bool, DeadlineExceeded> {
        self.step(0)
    }

    /// Unassigned shard with the fewest devices that still fit it
    ///
    /// Ties go to the larger shard, then the lower index. `None` when every
    /// shard is assigned; a zero count means the branch is dead.
    fn most_constrained(&self) -> Option<(usize, usize)> {
        self.assigned
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_none())
            .map(|(shard, _)| {
                let size = self.sizes[shard];
                let fits = self.remaining.iter().filter(|&&r| r >= size).count();
                (shard, fits)
            })
            .min_by(|(sa, fa), (sb, fb)| {
                fa.cmp(fb)
                    .then_with(|| self.sizes[*sb].cmp(&self.sizes[*sa]))
                    .then_with(|| sa.cmp(sb))
            })
    }

    fn step(&mut self, placed: usize) -> Result<bool, DeadlineExceeded> {
        if Instant::now() >= self.deadline {
            return Err(DeadlineExceeded);
        }
        self.nodes += 1;
        if placed == self.sizes.len() {
            return Ok(true);
        }

        let (shard, fits) = match self.most_constrained() {
            Some(choice) => choice,
            None => return Ok(true),
        };
        if fits == 0 {
            return Ok(false);
        }

        let size = self.sizes[shard];
        for &device in self.order {
            if self.remaining[device] < size {
                continue;
            }
            self.remaining[device] -= size;
            self.assigned[shard] = Some(device);
            if self.step(placed + 1)? {
                return Ok(true);
            }
            self.remaining[device] += size;
            self.assigned[shard] = None;
        }
        Ok(false)
    }

    fn placements(&self, pool: &[PoolDevice]) -> BTreeMap<usize, DeviceId> {
        self.assigned
            .iter()
            .enumerate()
            .filter_map(|(shard, device)| device.map(|d| (shard, pool[d].device_id.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1 << 30;

    fn pool_device(id: &str, total: u64, used: u64, util: f64, score: f64) -> PoolDevice {
        PoolDevice {
            device_id: id.to_string(),
            total_bytes: total,
            available_bytes: total - used,
            utilization_pct: util,
            precisions: vec![Precision::Fp32, Precision::Fp16],
            topology_group: None,
            score,
        }
    }

    fn solver() -> PlacementSolver {
        PlacementSolver::new(&PlacementConfig::default())
    }

    #[test]
    fn test_heterogeneous_pair_respects_memory() {
        let pool = vec![
            pool_device("small", 8 * GB, 0, 10.0, 0.9),
            pool_device("large", 16 * GB, 0, 10.0, 0.8),
        ];
        let request = ShardPlacementRequest::new(vec![5 * GB, 4 * GB, 3 * GB]);

        let assignment = solver().solve(&request, &pool).unwrap();
        assert!(assignment.heterogeneous);
        assert_eq!(assignment.method, PlacementMethod::Search);
        assert_eq!(assignment.len(), 3);
        verify_assignment(&assignment, &pool).unwrap();
        assert!(assignment.bytes_per_device.get("small").copied().unwrap_or(0) <= 8 * GB);
        assert!(assignment.bytes_per_device.get("large").copied().unwrap_or(0) <= 16 * GB);
    }

    #[test]
    fn test_homogeneous_pool_uses_greedy() {
        let pool = vec![
            pool_device("a", 16 * GB, 0, 10.0, 0.9),
            pool_device("b", 16 * GB, GB, 15.0, 0.8),
        ];
        let request = ShardPlacementRequest::new(vec![4 * GB; 5]);

        let assignment = solver().solve(&request, &pool).unwrap();
        assert!(!assignment.heterogeneous);
        assert_eq!(assignment.method, PlacementMethod::Greedy);
        // Best-scoring device fills first
        assert_eq!(assignment.bytes_per_device["a"], 16 * GB);
        assert_eq!(assignment.bytes_per_device["b"], 4 * GB);
    }

    #[test]
    fn test_search_finds_packing_greedy_misses() {
        // Greedy in request order stacks 3 and 4 on "a" and strands the 5
        let pool = vec![
            pool_device("a", 8 * GB, 0, 0.0, 0.9),
            pool_device("b", 4 * GB, 0, 60.0, 0.5),
        ];
        let request = ShardPlacementRequest::new(vec![3 * GB, 4 * GB, 5 * GB]);
        let (_, unplaced) = greedy(&request.shard_sizes, &pool, &score_order(&pool));
        assert!(!unplaced.is_empty());

        let assignment = solver().solve(&request, &pool).unwrap();
        assert_eq!(assignment.method, PlacementMethod::Search);
        assert_eq!(assignment.device_for(1).unwrap(), "b");
        assert_eq!(assignment.device_for(2).unwrap(), "a");
        verify_assignment(&assignment, &pool).unwrap();
    }

    #[test]
    fn test_zero_timeout_falls_back_quickly() {
        let pool = vec![
            pool_device("a", 24 * GB, 0, 5.0, 0.9),
            pool_device("b", 8 * GB, 0, 70.0, 0.4),
            pool_device("c", 12 * GB, 0, 40.0, 0.6),
        ];
        let request = ShardPlacementRequest::new(vec![2 * GB; 12]);

        for timeout in [Duration::ZERO, Duration::from_millis(1)] {
            let started = Instant::now();
            let assignment = solver().with_timeout(timeout).solve(&request, &pool).unwrap();
            assert!(started.elapsed() < Duration::from_millis(100));
            assert_eq!(assignment.len(), 12);
            verify_assignment(&assignment, &pool).unwrap();
            if timeout.is_zero() {
                assert_eq!(assignment.method, PlacementMethod::GreedyFallback);
            }
        }
    }

    #[test]
    fn test_timeout_mid_search_falls_back() {
        // Twenty 11 GB devices take one 6 GB shard each and the 5 GB device
        // none, so the 21st shard sends the search through every permutation
        let mut pool: Vec<PoolDevice> = (0..20)
            .map(|i| pool_device(&format!("d{:02}", i), 11 * GB, 0, 10.0, 0.8))
            .collect();
        pool.push(pool_device("tiny", 5 * GB, 0, 10.0, 0.9));
        let request = ShardPlacementRequest::new(vec![6 * GB; 21]);

        let started = Instant::now();
        let result = solver()
            .with_timeout(Duration::from_millis(1))
            .solve(&request, &pool);
        assert!(started.elapsed() < Duration::from_millis(100));

        match result {
            Ok(assignment) => assert_eq!(assignment.method, PlacementMethod::GreedyFallback),
            Err(ClusterError::Infeasible(failure)) => {
                assert_eq!(failure.shard_indices(), vec![20]);
                assert_eq!(failure.required_bytes, 126 * GB);
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_overflowing_request_is_infeasible() {
        let pool = vec![pool_device("a", 8 * GB, 0, 0.0, 0.9)];
        let request = ShardPlacementRequest::new(vec![u64::MAX, 1]);

        match solver().solve(&request, &pool).unwrap_err() {
            ClusterError::Infeasible(failure) => {
                assert_eq!(failure.shard_indices(), vec![0]);
                assert_eq!(failure.required_bytes, u64::MAX);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_total_exceeds_memory_reports_unplaced() {
        let pool = vec![
            pool_device("a", 8 * GB, 0, 0.0, 0.9),
            pool_device("b", 4 * GB, 0, 50.0, 0.5),
        ];
        let request = ShardPlacementRequest::new(vec![4 * GB, 4 * GB, 4 * GB, 2 * GB]);

        let err = solver().solve(&request, &pool).unwrap_err();
        assert!(err.is_capacity());
        match err {
            ClusterError::Infeasible(failure) => {
                assert_eq!(failure.required_bytes, 14 * GB);
                assert_eq!(failure.available_bytes, 12 * GB);
                assert_eq!(failure.shard_indices(), vec![3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_oversized_shard_named() {
        let pool = vec![pool_device("a", 8 * GB, 0, 0.0, 0.9)];
        let request = ShardPlacementRequest::new(vec![GB, 10 * GB]);

        match solver().solve(&request, &pool).unwrap_err() {
            ClusterError::Infeasible(failure) => {
                assert_eq!(failure.shard_indices(), vec![1]);
                assert_eq!(
                    failure.unplaced[0].reason,
                    UnplacedReason::InsufficientMemory {
                        largest_free_bytes: 8 * GB
                    }
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_precision_constraint() {
        let mut int8 = pool_device("int8", 8 * GB, 0, 0.0, 0.5);
        int8.precisions.push(Precision::Int8);
        let pool = vec![pool_device("fp", 16 * GB, 0, 0.0, 0.9), int8];

        let request = ShardPlacementRequest::new(vec![2 * GB, 2 * GB]).with_precision(Precision::Int8);
        let assignment = solver().solve(&request, &pool).unwrap();
        assert!(assignment.placements.values().all(|d| d == "int8"));

        let request = ShardPlacementRequest::new(vec![GB]).with_precision(Precision::Int4);
        match solver().solve(&request, &pool).unwrap_err() {
            ClusterError::Infeasible(failure) => assert_eq!(
                failure.unplaced[0].reason,
                UnplacedReason::PrecisionIncompatible {
                    required: Precision::Int4
                }
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_topology_group_and_candidates() {
        let mut a = pool_device("a", 8 * GB, 0, 0.0, 0.9);
        a.topology_group = Some("node-1".to_string());
        let mut b = pool_device("b", 8 * GB, 0, 0.0, 0.8);
        b.topology_group = Some("node-2".to_string());
        let pool = vec![a, b];

        let request = ShardPlacementRequest::new(vec![GB, GB]).with_topology_group("node-2");
        let assignment = solver().solve(&request, &pool).unwrap();
        assert!(assignment.placements.values().all(|d| d == "b"));

        let request = ShardPlacementRequest::new(vec![GB]).with_topology_group("node-9");
        assert!(matches!(
            solver().solve(&request, &pool),
            Err(ClusterError::Infeasible(_))
        ));

        let request = ShardPlacementRequest::new(vec![GB]).with_candidates(vec!["missing".to_string()]);
        match solver().solve(&request, &pool).unwrap_err() {
            ClusterError::Infeasible(failure) => {
                assert_eq!(failure.unplaced[0].reason, UnplacedReason::NoCandidates)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_request_rejected() {
        let pool = vec![pool_device("a", 8 * GB, 0, 0.0, 0.9)];
        let err = solver().solve(&ShardPlacementRequest::new(vec![]), &pool).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_heterogeneity_gate() {
        let same = vec![
            pool_device("a", 16 * GB, 0, 30.0, 0.5),
            pool_device("b", 14 * GB, 0, 45.0, 0.5),
        ];
        assert!(!is_heterogeneous(&same, 20.0, 20.0));

        let memory = vec![
            pool_device("a", 16 * GB, 0, 30.0, 0.5),
            pool_device("b", 8 * GB, 0, 30.0, 0.5),
        ];
        assert!(is_heterogeneous(&memory, 20.0, 20.0));

        let load = vec![
            pool_device("a", 16 * GB, 0, 5.0, 0.5),
            pool_device("b", 16 * GB, 0, 80.0, 0.5),
        ];
        assert!(is_heterogeneous(&load, 20.0, 20.0));
        assert!(!is_heterogeneous(&load[..1], 0.0, 0.0));
    }

    #[test]
    fn test_verify_rejects_overcommit() {
        let pool = vec![pool_device("a", 4 * GB, 0, 0.0, 0.9)];
        let mut placements = BTreeMap::new();
        placements.insert(0, "a".to_string());
        let assignment = ShardAssignment::new(placements, &[5 * GB], PlacementMethod::Greedy, false);
        assert!(verify_assignment(&assignment, &pool).is_err());
    }
}
