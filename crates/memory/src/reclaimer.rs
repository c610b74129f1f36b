//! The reclaim protocol: per-pool policy objects that report how many bytes a
//! subtree can give back, perform the reclaim (typically by spilling), and
//! deliver aborts to the owning operators.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arbor_common::{ArborError, Result};

use crate::pool::{MemoryPool, PoolKind};

/// Accumulated statistics for reclaim operations on one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimerStats {
    /// Reclaim attempts that arrived while the operator could not be reclaimed.
    pub num_non_reclaimable_attempts: u64,
    /// Bytes actually reclaimed.
    pub reclaimed_bytes: u64,
    /// Time spent executing reclaims, in microseconds.
    pub reclaim_exec_time_us: u64,
    /// Time spent waiting for the operator to quiesce, in microseconds.
    pub reclaim_wait_time_us: u64,
}

impl ReclaimerStats {
    /// Reset all counters to zero.
    pub fn reset(&mut self) {
        *self = ReclaimerStats::default();
    }
}

impl AddAssign for ReclaimerStats {
    fn add_assign(&mut self, other: Self) {
        self.num_non_reclaimable_attempts += other.num_non_reclaimable_attempts;
        self.reclaimed_bytes += other.reclaimed_bytes;
        self.reclaim_exec_time_us += other.reclaim_exec_time_us;
        self.reclaim_wait_time_us += other.reclaim_wait_time_us;
    }
}

/// Per-subtree reclaim capability set.
///
/// An implementation answers three questions for the pool it is attached to:
/// can this subtree be reclaimed right now (and for how many bytes), reclaim
/// up to a target, and deliver an abort to the owning operators.
pub trait MemoryReclaimer: Send + Sync {
    /// Reclaimable bytes of `pool`, or `None` when the subtree cannot be
    /// reclaimed at the moment. Implementations must never report `None`
    /// alongside a nonzero byte count.
    fn reclaimable_bytes(&self, pool: &MemoryPool) -> Option<u64>;

    /// Reclaim up to `target_bytes` from `pool` (0 means as much as
    /// possible). Returns the number of bytes freed.
    fn reclaim(
        &self,
        pool: &MemoryPool,
        target_bytes: u64,
        stats: &mut ReclaimerStats,
    ) -> Result<u64>;

    /// Deliver an abort to the operators below `pool`.
    fn abort(&self, pool: &MemoryPool, error: &Arc<ArborError>) -> Result<()>;
}

/// Timing wrapper for one reclaim execution: accumulates execution time and
/// reclaimed bytes into `stats`.
pub fn run_reclaim<F>(f: F, stats: &mut ReclaimerStats) -> Result<u64>
where
    F: FnOnce() -> Result<u64>,
{
    let started = Instant::now();
    let result = f();
    stats.reclaim_exec_time_us += started.elapsed().as_micros() as u64;
    if let Ok(bytes) = &result {
        stats.reclaimed_bytes += bytes;
    }
    result
}

/// Default reclaimer for aggregate pools: aggregates over children and
/// reclaims from the child with the largest reservation first.
#[derive(Debug, Default)]
pub struct TreeReclaimer;

impl TreeReclaimer {
    /// Create a boxed default reclaimer.
    pub fn create() -> Arc<dyn MemoryReclaimer> {
        Arc::new(TreeReclaimer)
    }
}

impl MemoryReclaimer for TreeReclaimer {
    fn reclaimable_bytes(&self, pool: &MemoryPool) -> Option<u64> {
        if pool.kind() == PoolKind::Leaf {
            return None;
        }
        let mut reclaimable = false;
        let mut total = 0;
        pool.visit_children(|child| {
            if let Some(bytes) = child.reclaimable_bytes() {
                reclaimable = true;
                total += bytes;
            }
        });
        debug_assert!(reclaimable || total == 0);
        reclaimable.then_some(total)
    }

    fn reclaim(
        &self,
        pool: &MemoryPool,
        target_bytes: u64,
        stats: &mut ReclaimerStats,
    ) -> Result<u64> {
        if pool.kind() == PoolKind::Leaf {
            return Ok(0);
        }

        // Reclaim from the child with the most reservation first; the sort is
        // stable so equally reserved children keep their iteration order.
        let mut candidates: Vec<(Arc<MemoryPool>, u64)> = Vec::new();
        pool.visit_children(|child| {
            candidates.push((child.clone(), child.reserved_bytes()));
        });
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let mut remaining = target_bytes;
        let mut reclaimed = 0;
        for (child, _) in candidates {
            let bytes = child.reclaim(remaining, stats)?;
            reclaimed += bytes;
            if target_bytes != 0 {
                if bytes >= remaining {
                    break;
                }
                remaining -= bytes;
            }
        }
        Ok(reclaimed)
    }

    fn abort(&self, pool: &MemoryPool, error: &Arc<ArborError>) -> Result<()> {
        if pool.kind() == PoolKind::Leaf {
            return Err(ArborError::Unsupported(format!(
                "cannot abort leaf memory pool '{}'",
                pool.name()
            )));
        }
        let mut first_failure = None;
        pool.visit_children(|child| {
            // Abort through the child's reclaimer directly: going through the
            // child pool would re-route the abort back to the root.
            if let Some(reclaimer) = child.reclaimer() {
                if let Err(e) = reclaimer.abort(child, error) {
                    first_failure.get_or_insert(e);
                }
            }
        });
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Marks the reclaimable window of an operator: while alive, the operator's
/// shared non-reclaimable flag is cleared, inviting the arbitrator to reclaim
/// it. The previous value is restored on drop.
pub struct ReclaimableSectionGuard<'a> {
    flag: &'a AtomicBool,
    saved: bool,
}

impl<'a> ReclaimableSectionGuard<'a> {
    /// Clear `flag` for the duration of the guard.
    pub fn new(flag: &'a AtomicBool) -> Self {
        let saved = flag.swap(false, Ordering::AcqRel);
        Self { flag, saved }
    }
}

impl Drop for ReclaimableSectionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.saved, Ordering::Release);
    }
}

/// Marks a critical section in which the operator's state is not in a
/// spillable form: while alive, the shared non-reclaimable flag is set and
/// reclaim attempts are refused. The previous value is restored on drop.
pub struct NonReclaimableSectionGuard<'a> {
    flag: &'a AtomicBool,
    saved: bool,
}

impl<'a> NonReclaimableSectionGuard<'a> {
    /// Set `flag` for the duration of the guard.
    pub fn new(flag: &'a AtomicBool) -> Self {
        let saved = flag.swap(true, Ordering::AcqRel);
        Self { flag, saved }
    }
}

impl Drop for NonReclaimableSectionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.saved, Ordering::Release);
    }
}
