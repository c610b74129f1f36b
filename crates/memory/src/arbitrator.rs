//! The arbitrator contract, its statistics, the pluggable factory registry,
//! and the noop (fixed-isolation) variant.

use std::collections::HashMap;
use std::fmt;
use std::ops::Sub;
use std::sync::{Arc, Mutex, OnceLock};

use arbor_common::{succinct_bytes, succinct_micros, ArborError, MemoryConfig, Result, MAX_MEMORY};
use tracing::warn;

use crate::pool::MemoryPool;

/// Observability hook invoked at the start of every arbitration with the
/// requestor pool; used by tests to assert serialization.
pub type ArbitrationStateCheck = Arc<dyn Fn(&MemoryPool) + Send + Sync>;

/// Runtime configuration for creating an arbitrator.
#[derive(Clone)]
pub struct ArbitratorConfig {
    /// Arbitrator kind; empty selects the noop arbitrator.
    pub kind: String,
    /// Total node capacity distributable across queries.
    pub capacity: u64,
    /// Initial capacity granted to a newly registered root pool.
    pub pool_initial_capacity: u64,
    /// Minimum capacity unit moved by one arbitration step.
    pub pool_transfer_capacity: u64,
    /// Optional per-arbitration observability hook.
    pub state_check: Option<ArbitrationStateCheck>,
}

impl fmt::Debug for ArbitratorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArbitratorConfig")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("pool_initial_capacity", &self.pool_initial_capacity)
            .field("pool_transfer_capacity", &self.pool_transfer_capacity)
            .field("state_check", &self.state_check.as_ref().map(|_| ".."))
            .finish()
    }
}

impl Default for ArbitratorConfig {
    fn default() -> Self {
        Self::from(&MemoryConfig::default())
    }
}

impl From<&MemoryConfig> for ArbitratorConfig {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            kind: config.arbitrator_kind.clone(),
            capacity: config.capacity_bytes,
            pool_initial_capacity: config.pool_initial_capacity,
            pool_transfer_capacity: config.pool_transfer_capacity,
            state_check: None,
        }
    }
}

/// Arbitration statistics.
///
/// All fields except the two gauges (`max_capacity_bytes`,
/// `free_capacity_bytes`) are monotonically increasing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbitratorStats {
    /// Arbitration requests received.
    pub num_requests: u64,
    /// Requests that were granted.
    pub num_succeeded: u64,
    /// Victim pools aborted to free memory.
    pub num_aborted: u64,
    /// Requests that failed.
    pub num_failures: u64,
    /// Time requests spent queued for the serialized slot, in microseconds.
    pub queue_time_us: u64,
    /// Time requests spent arbitrating after dequeue, in microseconds.
    pub arbitration_time_us: u64,
    /// Unused reserved capacity shrunk from pools without spilling.
    pub num_shrunk_bytes: u64,
    /// Used capacity reclaimed from pools via spilling.
    pub num_reclaimed_bytes: u64,
    /// Gauge: total arbitrable capacity.
    pub max_capacity_bytes: u64,
    /// Gauge: capacity currently free for grants.
    pub free_capacity_bytes: u64,
    /// Time spent in reclaim callbacks, in microseconds.
    pub reclaim_time_us: u64,
    /// Reclaim attempts refused because the target was not reclaimable.
    pub num_non_reclaimable_attempts: u64,
    /// Initial capacity reservation requests from new pools.
    pub num_reserve_request: u64,
    /// Capacity release requests from destroyed pools.
    pub num_release_request: u64,
}

impl ArbitratorStats {
    fn counters(&self) -> [u64; 12] {
        [
            self.num_requests,
            self.num_succeeded,
            self.num_aborted,
            self.num_failures,
            self.queue_time_us,
            self.arbitration_time_us,
            self.num_shrunk_bytes,
            self.num_reclaimed_bytes,
            self.reclaim_time_us,
            self.num_non_reclaimable_attempts,
            self.num_reserve_request,
            self.num_release_request,
        ]
    }
}

impl Sub for ArbitratorStats {
    type Output = ArbitratorStats;

    /// Coordinate-wise counter difference; the gauge fields are taken from
    /// the minuend.
    fn sub(self, other: ArbitratorStats) -> ArbitratorStats {
        ArbitratorStats {
            num_requests: self.num_requests - other.num_requests,
            num_succeeded: self.num_succeeded - other.num_succeeded,
            num_aborted: self.num_aborted - other.num_aborted,
            num_failures: self.num_failures - other.num_failures,
            queue_time_us: self.queue_time_us - other.queue_time_us,
            arbitration_time_us: self.arbitration_time_us - other.arbitration_time_us,
            num_shrunk_bytes: self.num_shrunk_bytes - other.num_shrunk_bytes,
            num_reclaimed_bytes: self.num_reclaimed_bytes - other.num_reclaimed_bytes,
            max_capacity_bytes: self.max_capacity_bytes,
            free_capacity_bytes: self.free_capacity_bytes,
            reclaim_time_us: self.reclaim_time_us - other.reclaim_time_us,
            num_non_reclaimable_attempts: self.num_non_reclaimable_attempts
                - other.num_non_reclaimable_attempts,
            num_reserve_request: self.num_reserve_request - other.num_reserve_request,
            num_release_request: self.num_release_request - other.num_release_request,
        }
    }
}

/// The order on stats is partial, not total: `a < b` means every counter of
/// `a` is at most the corresponding counter of `b` and at least one is
/// strictly below. Snapshots with mixed counter movement are incomparable
/// (`partial_cmp` returns `None`), so stats must never be sorted by this.
impl PartialOrd for ArbitratorStats {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        let mut less = false;
        let mut greater = false;
        for (a, b) in self.counters().iter().zip(other.counters().iter()) {
            match a.cmp(b) {
                std::cmp::Ordering::Less => less = true,
                std::cmp::Ordering::Greater => greater = true,
                std::cmp::Ordering::Equal => {}
            }
        }
        match (less, greater) {
            (true, true) => None,
            (true, false) => Some(std::cmp::Ordering::Less),
            (false, true) => Some(std::cmp::Ordering::Greater),
            // Counters all equal: comparable only if the gauges agree too.
            (false, false) => (self == other).then_some(std::cmp::Ordering::Equal),
        }
    }
}

impl fmt::Display for ArbitratorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "STATS[numRequests {} numSucceeded {} numAborted {} numFailures {} \
             numNonReclaimableAttempts {} numReserveRequest {} numReleaseRequest {} \
             queueTime {} arbitrationTime {} reclaimTime {} shrunkMemory {} \
             reclaimedMemory {} maxCapacity {} freeCapacity {}]",
            self.num_requests,
            self.num_succeeded,
            self.num_aborted,
            self.num_failures,
            self.num_non_reclaimable_attempts,
            self.num_reserve_request,
            self.num_release_request,
            succinct_micros(self.queue_time_us),
            succinct_micros(self.arbitration_time_us),
            succinct_micros(self.reclaim_time_us),
            succinct_bytes(self.num_shrunk_bytes),
            succinct_bytes(self.num_reclaimed_bytes),
            succinct_bytes(self.max_capacity_bytes),
            succinct_bytes(self.free_capacity_bytes),
        )
    }
}

/// Global capacity distributor across query root pools.
pub trait MemoryArbitrator: Send + Sync {
    /// The kind string this arbitrator was registered under.
    fn kind(&self) -> &str;

    /// Grant an initial capacity to a newly registered root pool, up to
    /// `bytes`, from the free pool.
    fn reserve_memory(&self, pool: &Arc<MemoryPool>, bytes: u64);

    /// Return a destroyed pool's capacity to the free pool.
    fn release_memory(&self, pool: &MemoryPool);

    /// Try to grant `pool` at least `target_bytes` additional capacity,
    /// possibly reclaiming from `candidates`. Returns whether the growth was
    /// granted; aborts of the requestor surface as errors.
    fn grow_memory(
        &self,
        pool: &Arc<MemoryPool>,
        candidates: &[Arc<MemoryPool>],
        target_bytes: u64,
    ) -> Result<bool>;

    /// Voluntarily return up to `target_bytes` of unused capacity from
    /// `pools` to the free pool. Optional per variant.
    fn shrink_memory(&self, pools: &[Arc<MemoryPool>], target_bytes: u64) -> Result<u64>;

    /// Current statistics snapshot.
    fn stats(&self) -> ArbitratorStats;

    /// One-line human-readable summary, `ARBITRATOR[<kind> CAPACITY[..] ..]`.
    fn describe(&self) -> String;
}

/// Fixed per-query isolation: every pool is immediately granted its max
/// capacity and there is no sharing. A pool exceeding its max fails fast with
/// `CapacityExceeded` instead of arbitrating.
#[derive(Debug)]
pub struct NoopArbitrator {
    capacity: u64,
}

/// Kind string of the noop arbitrator.
pub const NOOP_ARBITRATOR_KIND: &str = "NOOP";

impl NoopArbitrator {
    /// Create a noop arbitrator from `config`.
    pub fn new(config: &ArbitratorConfig) -> Self {
        if config.capacity != MAX_MEMORY {
            warn!(
                capacity = %succinct_bytes(config.capacity),
                "node capacity is set for the NOOP arbitrator, which has no capacity enforcement",
            );
        }
        Self {
            capacity: config.capacity,
        }
    }
}

impl MemoryArbitrator for NoopArbitrator {
    fn kind(&self) -> &str {
        NOOP_ARBITRATOR_KIND
    }

    fn reserve_memory(&self, pool: &Arc<MemoryPool>, _bytes: u64) {
        pool.grow(pool.max_capacity() - pool.capacity());
    }

    fn release_memory(&self, _pool: &MemoryPool) {}

    fn grow_memory(
        &self,
        _pool: &Arc<MemoryPool>,
        _candidates: &[Arc<MemoryPool>],
        _target_bytes: u64,
    ) -> Result<bool> {
        // Pools are pre-grown to their max capacity; there is nothing to grant.
        Ok(false)
    }

    fn shrink_memory(&self, _pools: &[Arc<MemoryPool>], _target_bytes: u64) -> Result<u64> {
        Ok(0)
    }

    fn stats(&self) -> ArbitratorStats {
        ArbitratorStats {
            max_capacity_bytes: MAX_MEMORY,
            ..ArbitratorStats::default()
        }
    }

    fn describe(&self) -> String {
        format!(
            "ARBITRATOR[{} CAPACITY[{}]]",
            self.kind(),
            succinct_bytes(self.capacity),
        )
    }
}

/// Factory producing an arbitrator from a config.
pub type ArbitratorFactory = Arc<dyn Fn(&ArbitratorConfig) -> Arc<dyn MemoryArbitrator> + Send + Sync>;

fn factories() -> &'static Mutex<HashMap<String, ArbitratorFactory>> {
    static FACTORIES: OnceLock<Mutex<HashMap<String, ArbitratorFactory>>> = OnceLock::new();
    FACTORIES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register an arbitrator factory under `kind`. Returns `false` when a
/// factory is already registered under that kind.
pub fn register_arbitrator_factory(kind: &str, factory: ArbitratorFactory) -> bool {
    let mut map = factories().lock().unwrap();
    if map.contains_key(kind) {
        return false;
    }
    map.insert(kind.to_string(), factory);
    true
}

/// Remove the factory registered under `kind`. Returns whether one existed.
pub fn unregister_arbitrator_factory(kind: &str) -> bool {
    factories().lock().unwrap().remove(kind).is_some()
}

/// Create an arbitrator for `config`: an empty kind yields the noop
/// arbitrator, any other kind must have a registered factory.
pub fn create_arbitrator(config: &ArbitratorConfig) -> Result<Arc<dyn MemoryArbitrator>> {
    if config.kind.is_empty() {
        return Ok(Arc::new(NoopArbitrator::new(config)));
    }
    let factory = {
        let map = factories().lock().unwrap();
        map.get(&config.kind).cloned()
    };
    match factory {
        Some(factory) => Ok(factory(config)),
        None => Err(ArborError::InvalidConfig(format!(
            "arbitrator factory for kind '{}' is not registered",
            config.kind
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_with(requests: u64, succeeded: u64) -> ArbitratorStats {
        ArbitratorStats {
            num_requests: requests,
            num_succeeded: succeeded,
            ..ArbitratorStats::default()
        }
    }

    #[test]
    fn stats_difference_is_coordinate_wise_with_gauges_from_minuend() {
        let mut a = stats_with(10, 7);
        a.free_capacity_bytes = 555;
        a.max_capacity_bytes = 1000;
        let mut b = stats_with(4, 2);
        b.free_capacity_bytes = 900;
        let d = a - b;
        assert_eq!(d.num_requests, 6);
        assert_eq!(d.num_succeeded, 5);
        assert_eq!(d.free_capacity_bytes, 555);
        assert_eq!(d.max_capacity_bytes, 1000);
    }

    #[test]
    fn stats_order_is_partial() {
        let low = stats_with(1, 1);
        let high = stats_with(2, 1);
        assert!(low < high);
        assert!(high > low);
        assert!(low <= low);

        // Mixed movement: incomparable, not ordered either way.
        let mixed_a = stats_with(3, 1);
        let mixed_b = stats_with(1, 3);
        assert_eq!(mixed_a.partial_cmp(&mixed_b), None);
        assert!(!(mixed_a < mixed_b));
        assert!(!(mixed_a > mixed_b));
    }

    #[test]
    fn stats_display_is_single_line() {
        let s = stats_with(3, 2);
        let text = s.to_string();
        assert!(text.starts_with("STATS[numRequests 3"));
        assert!(!text.contains('\n'));
    }

    #[test]
    fn registry_rejects_duplicates_and_creates_noop_for_empty_kind() {
        let factory: ArbitratorFactory =
            Arc::new(|config| Arc::new(NoopArbitrator::new(config)) as Arc<dyn MemoryArbitrator>);
        assert!(register_arbitrator_factory("test-kind", factory.clone()));
        assert!(!register_arbitrator_factory("test-kind", factory));
        assert!(unregister_arbitrator_factory("test-kind"));
        assert!(!unregister_arbitrator_factory("test-kind"));

        let arbitrator = create_arbitrator(&ArbitratorConfig::default()).expect("noop");
        assert_eq!(arbitrator.kind(), NOOP_ARBITRATOR_KIND);
        assert!(arbitrator.describe().starts_with("ARBITRATOR[NOOP"));

        let missing = create_arbitrator(&ArbitratorConfig {
            kind: "unknown".to_string(),
            ..ArbitratorConfig::default()
        });
        assert!(missing.is_err());
    }
}
