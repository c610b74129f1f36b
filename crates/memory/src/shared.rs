//! Dynamic memory sharing across running queries.
//!
//! When a pool exceeds its granted capacity, the shared arbitrator tries to
//! grow it: first from free node capacity, then by shrinking unused
//! reservations of other queries, then by asking reclaimable candidates to
//! spill. If everything falls short it aborts the query with the largest
//! capacity footprint rather than deadlocking the node.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use arbor_common::{metrics::global_metrics, succinct_bytes, ArborError, Result};
use futures::channel::oneshot;
use futures::executor::block_on;
use tracing::{error, info, warn};

use crate::arbitrator::{
    register_arbitrator_factory, unregister_arbitrator_factory, ArbitrationStateCheck,
    ArbitratorConfig, ArbitratorStats, MemoryArbitrator,
};
use crate::context::ScopedArbitrationContext;
use crate::pool::MemoryPool;
use crate::reclaimer::ReclaimerStats;

/// Kind string of the shared arbitrator.
pub const SHARED_ARBITRATOR_KIND: &str = "SHARED";

/// Snapshot of one candidate pool's reclaim profile, taken at the start of an
/// arbitration and used only inside it.
struct Candidate {
    reclaimable: bool,
    reclaimable_bytes: u64,
    free_bytes: u64,
    pool: Arc<MemoryPool>,
}

struct ArbitrationQueue {
    free_capacity: u64,
    /// Whether an arbitration is currently executing.
    running: bool,
    /// One-shot promises of queued requests, fulfilled in FIFO order.
    wait_promises: VecDeque<oneshot::Sender<()>>,
}

/// Arbitrator that redistributes a bounded node capacity across queries.
pub struct SharedArbitrator {
    capacity: u64,
    pool_initial_capacity: u64,
    pool_transfer_capacity: u64,
    state_check: Option<ArbitrationStateCheck>,

    state: Mutex<ArbitrationQueue>,

    num_requests: AtomicU64,
    num_succeeded: AtomicU64,
    num_aborted: AtomicU64,
    num_failures: AtomicU64,
    queue_time_us: AtomicU64,
    arbitration_time_us: AtomicU64,
    num_shrunk_bytes: AtomicU64,
    num_reclaimed_bytes: AtomicU64,
    reclaim_time_us: AtomicU64,
    num_non_reclaimable_attempts: AtomicU64,
    num_reserve_request: AtomicU64,
    num_release_request: AtomicU64,
}

/// One serialized arbitration: installs the thread-local arbitration context,
/// waits for the FIFO slot, and on drop (normal return or unwind) accounts the
/// arbitration time and hands the slot to the next waiter.
struct ScopedArbitration<'a> {
    arbitrator: &'a SharedArbitrator,
    _ctx: ScopedArbitrationContext,
    queue_us: u64,
    run_started: Instant,
}

impl<'a> ScopedArbitration<'a> {
    fn new(arbitrator: &'a SharedArbitrator, requestor: &Arc<MemoryPool>) -> Self {
        let ctx = ScopedArbitrationContext::new(requestor.clone());
        let queue_us = arbitrator.start_arbitration();
        if let Some(check) = &arbitrator.state_check {
            check(requestor);
        }
        Self {
            arbitrator,
            _ctx: ctx,
            queue_us,
            run_started: Instant::now(),
        }
    }
}

impl Drop for ScopedArbitration<'_> {
    fn drop(&mut self) {
        let run_us = self.run_started.elapsed().as_micros() as u64;
        self.arbitrator
            .arbitration_time_us
            .fetch_add(run_us, Ordering::AcqRel);
        self.arbitrator.finish_arbitration();
    }
}

fn max_grow_bytes(pool: &MemoryPool) -> u64 {
    pool.max_capacity() - pool.capacity()
}

fn capacity_after_growth(pool: &MemoryPool, target_bytes: u64) -> u64 {
    pool.capacity().saturating_add(target_bytes)
}

fn aborted_error(pool: &MemoryPool) -> ArborError {
    match pool.abort_error() {
        Some(cause) => ArborError::Aborted(format!("memory pool '{}': {cause}", pool.name())),
        None => ArborError::Aborted(format!("memory pool '{}' has been aborted", pool.name())),
    }
}

fn pool_abort_message(victim: &MemoryPool, requestor: &MemoryPool, grow_bytes: u64) -> String {
    if std::ptr::eq(victim, requestor) {
        format!(
            "memory pool '{}' aborted by itself when trying to grow {}; usage: {victim}",
            victim.name(),
            succinct_bytes(grow_bytes),
        )
    } else {
        format!(
            "memory pool '{}' aborted when requestor '{}' tried to grow {}; usage: {victim}",
            victim.name(),
            requestor.name(),
            succinct_bytes(grow_bytes),
        )
    }
}

impl SharedArbitrator {
    /// Create a shared arbitrator with `config.capacity` distributable bytes.
    pub fn new(config: &ArbitratorConfig) -> Self {
        Self {
            capacity: config.capacity,
            pool_initial_capacity: config.pool_initial_capacity,
            pool_transfer_capacity: config.pool_transfer_capacity,
            state_check: config.state_check.clone(),
            state: Mutex::new(ArbitrationQueue {
                free_capacity: config.capacity,
                running: false,
                wait_promises: VecDeque::new(),
            }),
            num_requests: AtomicU64::new(0),
            num_succeeded: AtomicU64::new(0),
            num_aborted: AtomicU64::new(0),
            num_failures: AtomicU64::new(0),
            queue_time_us: AtomicU64::new(0),
            arbitration_time_us: AtomicU64::new(0),
            num_shrunk_bytes: AtomicU64::new(0),
            num_reclaimed_bytes: AtomicU64::new(0),
            reclaim_time_us: AtomicU64::new(0),
            num_non_reclaimable_attempts: AtomicU64::new(0),
            num_reserve_request: AtomicU64::new(0),
            num_release_request: AtomicU64::new(0),
        }
    }

    /// Register the shared arbitrator factory under [`SHARED_ARBITRATOR_KIND`].
    pub fn register_factory() -> bool {
        register_arbitrator_factory(
            SHARED_ARBITRATOR_KIND,
            Arc::new(|config| Arc::new(SharedArbitrator::new(config)) as Arc<dyn MemoryArbitrator>),
        )
    }

    /// Remove the shared arbitrator factory registration.
    pub fn unregister_factory() -> bool {
        unregister_arbitrator_factory(SHARED_ARBITRATOR_KIND)
    }

    fn decrement_free_capacity(&self, bytes: u64) -> u64 {
        let mut state = self.state.lock().unwrap();
        Self::decrement_free_capacity_locked(&mut state, bytes)
    }

    fn decrement_free_capacity_locked(state: &mut ArbitrationQueue, bytes: u64) -> u64 {
        let granted = state.free_capacity.min(bytes);
        state.free_capacity -= granted;
        granted
    }

    fn increment_free_capacity(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.free_capacity += bytes;
        assert!(
            state.free_capacity <= self.capacity,
            "free capacity {} exceeds the node capacity {}",
            succinct_bytes(state.free_capacity),
            succinct_bytes(self.capacity),
        );
    }

    /// Wait for the serialized arbitration slot in FIFO order. Returns the
    /// queueing time in microseconds.
    fn start_arbitration(&self) -> u64 {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            self.num_requests.fetch_add(1, Ordering::AcqRel);
            if state.running {
                let (tx, rx) = oneshot::channel();
                state.wait_promises.push_back(tx);
                Some(rx)
            } else {
                debug_assert!(state.wait_promises.is_empty());
                state.running = true;
                None
            }
        };
        match waiter {
            Some(rx) => {
                let started = Instant::now();
                let _ = block_on(rx);
                let waited = started.elapsed().as_micros() as u64;
                self.queue_time_us.fetch_add(waited, Ordering::AcqRel);
                waited
            }
            None => 0,
        }
    }

    /// Hand the arbitration slot to the longest-waiting request, if any.
    fn finish_arbitration(&self) {
        let next = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(state.running);
            match state.wait_promises.pop_front() {
                Some(promise) => Some(promise),
                None => {
                    state.running = false;
                    None
                }
            }
        };
        if let Some(promise) = next {
            let _ = promise.send(());
        }
    }

    fn check_capacity_growth(&self, pool: &MemoryPool, target_bytes: u64) -> bool {
        max_grow_bytes(pool) >= target_bytes
            && capacity_after_growth(pool, target_bytes) <= self.capacity
    }

    /// If the requestor itself is too close to its max capacity for the
    /// requested growth, reclaim from the requestor first and return the
    /// freed capacity to the free pool. Fails early when even that cannot
    /// make the growth admissible.
    fn ensure_capacity(&self, requestor: &Arc<MemoryPool>, target_bytes: u64) -> Result<bool> {
        if target_bytes > self.capacity || target_bytes > requestor.max_capacity() {
            return Ok(false);
        }
        if self.check_capacity_growth(requestor, target_bytes) {
            return Ok(true);
        }
        let reclaimed = self.reclaim_pool(requestor, target_bytes);
        self.increment_free_capacity(reclaimed);
        if requestor.aborted() {
            self.num_failures.fetch_add(1, Ordering::AcqRel);
            return Err(aborted_error(requestor));
        }
        Ok(self.check_capacity_growth(requestor, target_bytes))
    }

    fn candidate_stats(pools: &[Arc<MemoryPool>]) -> Vec<Candidate> {
        pools
            .iter()
            .map(|pool| {
                let reclaimable_bytes = pool.reclaimable_bytes();
                Candidate {
                    reclaimable: reclaimable_bytes.is_some(),
                    reclaimable_bytes: reclaimable_bytes.unwrap_or(0),
                    free_bytes: pool.free_bytes(),
                    pool: pool.clone(),
                }
            })
            .collect()
    }

    fn arbitrate_memory(
        &self,
        requestor: &Arc<MemoryPool>,
        candidates: &mut [Candidate],
        target_bytes: u64,
    ) -> Result<bool> {
        let grow_target = max_grow_bytes(requestor)
            .min(self.pool_transfer_capacity.max(target_bytes));
        let mut freed = self.decrement_free_capacity(grow_target);
        if freed >= target_bytes {
            requestor.grow(freed);
            return Ok(true);
        }

        freed += self.reclaim_free_memory_from_candidates(candidates, grow_target - freed);
        if freed >= target_bytes {
            let bytes_to_grow = freed.min(grow_target);
            requestor.grow(bytes_to_grow);
            self.increment_free_capacity(freed - bytes_to_grow);
            return Ok(true);
        }

        freed +=
            self.reclaim_used_memory_from_candidates(requestor, candidates, grow_target - freed);
        if requestor.aborted() {
            self.increment_free_capacity(freed);
            self.num_failures.fetch_add(1, Ordering::AcqRel);
            return Err(aborted_error(requestor));
        }

        if freed < target_bytes {
            self.increment_free_capacity(freed);
            warn!(
                pool = requestor.name(),
                target = %succinct_bytes(target_bytes),
                freed = %succinct_bytes(freed),
                "failed to arbitrate sufficient memory",
            );
            return Ok(false);
        }

        let bytes_to_grow = freed.min(grow_target);
        requestor.grow(bytes_to_grow);
        self.increment_free_capacity(freed - bytes_to_grow);
        Ok(true)
    }

    /// Shrink unused reserved capacity from candidates, most free first.
    /// No spilling happens in this pass.
    fn reclaim_free_memory_from_candidates(
        &self,
        candidates: &mut [Candidate],
        target_bytes: u64,
    ) -> u64 {
        // Stable sort keeps the original order among equally free candidates.
        candidates.sort_by(|lhs, rhs| rhs.free_bytes.cmp(&lhs.free_bytes));

        let mut freed = 0;
        for candidate in candidates.iter() {
            if candidate.free_bytes == 0 {
                break;
            }
            let bytes_to_shrink = (target_bytes - freed).min(candidate.free_bytes);
            if bytes_to_shrink == 0 {
                break;
            }
            freed += candidate.pool.shrink(bytes_to_shrink);
            if freed >= target_bytes {
                break;
            }
        }
        self.num_shrunk_bytes.fetch_add(freed, Ordering::AcqRel);
        freed
    }

    /// Reclaim used memory from candidates by spilling, most reclaimable
    /// first, until the target is covered or the requestor gets aborted.
    fn reclaim_used_memory_from_candidates(
        &self,
        requestor: &Arc<MemoryPool>,
        candidates: &mut [Candidate],
        target_bytes: u64,
    ) -> u64 {
        // Non-reclaimable candidates sink to the end; the sort is stable so
        // equally reclaimable candidates keep their original order.
        candidates.sort_by(|lhs, rhs| {
            rhs.reclaimable
                .cmp(&lhs.reclaimable)
                .then_with(|| rhs.reclaimable_bytes.cmp(&lhs.reclaimable_bytes))
        });

        let mut freed = 0;
        for candidate in candidates.iter() {
            if !candidate.reclaimable || candidate.reclaimable_bytes == 0 {
                break;
            }
            let bytes_to_reclaim = (target_bytes - freed).max(self.pool_transfer_capacity);
            freed += self.reclaim_pool(&candidate.pool, bytes_to_reclaim);
            if freed >= target_bytes || requestor.aborted() {
                break;
            }
        }
        freed
    }

    /// Reclaim up to `target_bytes` of capacity from `pool`: shrink its free
    /// reservation first, then run its reclaimer. Reclaim failures never
    /// propagate; a failing pool is aborted and its capacity recovered. The
    /// returned amount is the pool's capacity delta.
    fn reclaim_pool(&self, pool: &Arc<MemoryPool>, target_bytes: u64) -> u64 {
        let started = Instant::now();
        let mut reclaimer_stats = ReclaimerStats::default();
        let old_capacity = pool.capacity();
        let mut shrunk = pool.shrink(target_bytes);
        if shrunk < target_bytes {
            match pool.reclaim(target_bytes - shrunk, &mut reclaimer_stats) {
                Ok(_) => {}
                Err(e) => {
                    error!(
                        pool = pool.name(),
                        error = %e,
                        "failed to reclaim from memory pool, aborting it",
                    );
                    self.abort_pool(pool, Arc::new(e));
                    shrunk += pool.shrink(0);
                }
            }
        }
        let new_capacity = pool.capacity();
        debug_assert!(old_capacity >= new_capacity);
        let reclaimed = old_capacity.saturating_sub(new_capacity);
        let duration_us = started.elapsed().as_micros() as u64;

        self.num_reclaimed_bytes
            .fetch_add(reclaimed.saturating_sub(shrunk), Ordering::AcqRel);
        self.num_shrunk_bytes.fetch_add(shrunk, Ordering::AcqRel);
        self.reclaim_time_us.fetch_add(duration_us, Ordering::AcqRel);
        self.num_non_reclaimable_attempts.fetch_add(
            reclaimer_stats.num_non_reclaimable_attempts,
            Ordering::AcqRel,
        );
        global_metrics().record_reclaim(
            SHARED_ARBITRATOR_KIND,
            shrunk,
            reclaimed.saturating_sub(shrunk),
            duration_us as f64 / 1e6,
        );
        info!(
            pool = pool.name(),
            target = %succinct_bytes(target_bytes),
            shrunk = %succinct_bytes(shrunk),
            reclaimed = %succinct_bytes(reclaimed.saturating_sub(shrunk)),
            "reclaimed from memory pool",
        );
        reclaimed
    }

    fn abort_pool(&self, pool: &Arc<MemoryPool>, error: Arc<ArborError>) {
        self.num_aborted.fetch_add(1, Ordering::AcqRel);
        pool.abort(&error);
        debug_assert!(pool.aborted());
    }

    /// Abort the candidate with the largest capacity to free up memory. For
    /// the requestor, the capacity comparison includes the requested growth.
    /// Ties keep the earliest candidate in the original snapshot order, so
    /// behavior is deterministic under equal peers. A requestor picked as its
    /// own victim fails the arbitration instead (the caller decides whether
    /// to retry or give up). Returns whether a victim was aborted.
    fn handle_oom(
        &self,
        requestor: &Arc<MemoryPool>,
        target_bytes: u64,
        candidates: &[Candidate],
    ) -> bool {
        let mut victim: Option<&Candidate> = None;
        let mut max_capacity = 0;
        for candidate in candidates {
            let is_requestor = Arc::ptr_eq(&candidate.pool, requestor);
            let capacity = candidate.pool.capacity() + if is_requestor { target_bytes } else { 0 };
            if victim.is_none() || capacity > max_capacity {
                victim = Some(candidate);
                max_capacity = capacity;
            }
        }
        let Some(victim) = victim.map(|c| c.pool.clone()) else {
            return false;
        };
        if Arc::ptr_eq(&victim, requestor) {
            error!(
                pool = requestor.name(),
                "requestor selected as the victim memory pool, failing the arbitration",
            );
            return false;
        }
        warn!(
            victim = victim.name(),
            requestor = requestor.name(),
            "aborting victim memory pool to free up memory",
        );
        let message = pool_abort_message(&victim, requestor, target_bytes);
        self.abort_pool(&victim, Arc::new(ArborError::Aborted(message)));
        // The aborted pool's entire unused capacity goes back to the free pool.
        self.increment_free_capacity(victim.shrink(0));
        true
    }

    fn grow_memory_inner(
        &self,
        requestor: &Arc<MemoryPool>,
        candidate_pools: &[Arc<MemoryPool>],
        target_bytes: u64,
    ) -> Result<bool> {
        if requestor.aborted() {
            self.num_failures.fetch_add(1, Ordering::AcqRel);
            return Err(aborted_error(requestor));
        }

        if !self.ensure_capacity(requestor, target_bytes)? {
            self.num_failures.fetch_add(1, Ordering::AcqRel);
            error!(
                pool = requestor.name(),
                capacity = %succinct_bytes(requestor.capacity()),
                target = %succinct_bytes(target_bytes),
                max_capacity = %succinct_bytes(requestor.max_capacity()),
                "cannot grow pool capacity beyond its max capacity",
            );
            return Ok(false);
        }

        let mut retries = 0;
        loop {
            // Refresh candidate stats before each arbitration attempt.
            let mut candidates = Self::candidate_stats(candidate_pools);
            if self.arbitrate_memory(requestor, &mut candidates, target_bytes)? {
                self.num_succeeded.fetch_add(1, Ordering::AcqRel);
                return Ok(true);
            }
            if retries > 0 {
                break;
            }
            retries += 1;
            if !self.handle_oom(requestor, target_bytes, &candidates) {
                break;
            }
        }
        error!(
            pool = requestor.name(),
            target = %succinct_bytes(target_bytes),
            state = %self.describe(),
            "failed to arbitrate sufficient memory",
        );
        self.num_failures.fetch_add(1, Ordering::AcqRel);
        Ok(false)
    }

    fn stats_locked(&self, free_capacity: u64) -> ArbitratorStats {
        ArbitratorStats {
            num_requests: self.num_requests.load(Ordering::Acquire),
            num_succeeded: self.num_succeeded.load(Ordering::Acquire),
            num_aborted: self.num_aborted.load(Ordering::Acquire),
            num_failures: self.num_failures.load(Ordering::Acquire),
            queue_time_us: self.queue_time_us.load(Ordering::Acquire),
            arbitration_time_us: self.arbitration_time_us.load(Ordering::Acquire),
            num_shrunk_bytes: self.num_shrunk_bytes.load(Ordering::Acquire),
            num_reclaimed_bytes: self.num_reclaimed_bytes.load(Ordering::Acquire),
            max_capacity_bytes: self.capacity,
            free_capacity_bytes: free_capacity,
            reclaim_time_us: self.reclaim_time_us.load(Ordering::Acquire),
            num_non_reclaimable_attempts: self
                .num_non_reclaimable_attempts
                .load(Ordering::Acquire),
            num_reserve_request: self.num_reserve_request.load(Ordering::Acquire),
            num_release_request: self.num_release_request.load(Ordering::Acquire),
        }
    }
}

impl MemoryArbitrator for SharedArbitrator {
    fn kind(&self) -> &str {
        SHARED_ARBITRATOR_KIND
    }

    fn reserve_memory(&self, pool: &Arc<MemoryPool>, _bytes: u64) {
        let bytes_to_reserve = max_grow_bytes(pool).min(self.pool_initial_capacity);
        let granted = {
            let mut state = self.state.lock().unwrap();
            self.num_reserve_request.fetch_add(1, Ordering::AcqRel);
            if state.running {
                // A running arbitration owns the free pool right now; the new
                // pool grows its capacity on demand through arbitration later.
                return;
            }
            Self::decrement_free_capacity_locked(&mut state, bytes_to_reserve)
        };
        pool.grow(granted);
    }

    fn release_memory(&self, pool: &MemoryPool) {
        self.num_release_request.fetch_add(1, Ordering::AcqRel);
        let freed = pool.shrink(0);
        self.increment_free_capacity(freed);
    }

    fn grow_memory(
        &self,
        pool: &Arc<MemoryPool>,
        candidate_pools: &[Arc<MemoryPool>],
        target_bytes: u64,
    ) -> Result<bool> {
        let requestor = if pool.is_root() { pool.clone() } else { pool.root() };
        let scope = ScopedArbitration::new(self, &requestor);

        let result = self.grow_memory_inner(&requestor, candidate_pools, target_bytes);

        let outcome = match &result {
            Ok(true) => "succeeded",
            Ok(false) => "failed",
            Err(_) => "aborted",
        };
        global_metrics().record_arbitration(
            SHARED_ARBITRATOR_KIND,
            outcome,
            scope.queue_us as f64 / 1e6,
            scope.run_started.elapsed().as_secs_f64(),
        );
        drop(scope);
        global_metrics()
            .set_free_capacity(SHARED_ARBITRATOR_KIND, self.state.lock().unwrap().free_capacity);
        result
    }

    fn shrink_memory(&self, _pools: &[Arc<MemoryPool>], _target_bytes: u64) -> Result<u64> {
        Err(ArborError::Unsupported(
            "shrink_memory is not supported by the SHARED arbitrator".to_string(),
        ))
    }

    fn stats(&self) -> ArbitratorStats {
        let free_capacity = self.state.lock().unwrap().free_capacity;
        self.stats_locked(free_capacity)
    }

    fn describe(&self) -> String {
        format!(
            "ARBITRATOR[{} CAPACITY[{}] {}]",
            self.kind(),
            succinct_bytes(self.capacity),
            self.stats(),
        )
    }
}

impl Drop for SharedArbitrator {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        if state.free_capacity != self.capacity {
            error!(
                free = %succinct_bytes(state.free_capacity),
                capacity = %succinct_bytes(self.capacity),
                "shared arbitrator dropped with outstanding capacity grants",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_sorts_are_stable_and_descending() {
        let pools: Vec<Arc<MemoryPool>> = (0..3)
            .map(|i| MemoryPool::new_root(&format!("q{i}"), 1 << 30, None))
            .collect();
        let mut candidates: Vec<Candidate> = pools
            .iter()
            .map(|pool| Candidate {
                reclaimable: false,
                reclaimable_bytes: 0,
                free_bytes: 0,
                pool: pool.clone(),
            })
            .collect();
        candidates[0].free_bytes = 10;
        candidates[1].free_bytes = 20;
        candidates[2].free_bytes = 10;

        candidates.sort_by(|lhs, rhs| rhs.free_bytes.cmp(&lhs.free_bytes));
        let names: Vec<&str> = candidates.iter().map(|c| c.pool.name()).collect();
        // q1 leads; the tie between q0 and q2 keeps their original order.
        assert_eq!(names, vec!["q1", "q0", "q2"]);
    }

    #[test]
    fn free_capacity_accounting_is_clamped() {
        let arbitrator = SharedArbitrator::new(&ArbitratorConfig {
            kind: SHARED_ARBITRATOR_KIND.to_string(),
            capacity: 100,
            pool_initial_capacity: 64,
            pool_transfer_capacity: 8,
            state_check: None,
        });
        assert_eq!(arbitrator.decrement_free_capacity(30), 30);
        assert_eq!(arbitrator.decrement_free_capacity(200), 70);
        assert_eq!(arbitrator.decrement_free_capacity(1), 0);
        arbitrator.increment_free_capacity(100);
        assert_eq!(arbitrator.stats().free_capacity_bytes, 100);
    }
}
