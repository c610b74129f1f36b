//! Hierarchical memory pools with reservation accounting.
//!
//! A query owns a tree of pools: one root per query, aggregate nodes per plan
//! node, and leaves accounting the bytes of individual operators. Reservations
//! propagate from leaves to the root; the root admits them against its granted
//! `capacity`, which only the arbitrator (through the root's arbitration
//! participant) may change.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use arbor_common::{succinct_bytes, ArborError, Result};
use tracing::warn;

use crate::reclaimer::{MemoryReclaimer, ReclaimerStats};

const MB: u64 = 1 << 20;

/// Reservations are granted in coarse units so that pool byte counts stay
/// stable and arbitration is not triggered by every small allocation.
pub(crate) fn quantized_size(bytes: u64) -> u64 {
    if bytes == 0 {
        return 0;
    }
    if bytes < 16 * MB {
        return bytes.div_ceil(MB) * MB;
    }
    if bytes < 64 * MB {
        return bytes.div_ceil(4 * MB) * (4 * MB);
    }
    bytes.div_ceil(8 * MB) * (8 * MB)
}

/// Pool kind: leaves account operator allocations, aggregates only own children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Accounts allocations for one operator.
    Leaf,
    /// Owns child pools; carries no allocations of its own.
    Aggregate,
}

/// Capacity authority installed on root pools.
///
/// Implemented by the memory manager: a root pool that runs out of granted
/// capacity asks its participant to arbitrate growth, and notifies it when the
/// root is dropped so the grant returns to the node-wide free pool.
pub trait ArbitrationParticipant: Send + Sync {
    /// Try to grow `pool`'s capacity by at least `bytes` through arbitration.
    fn grow_pool(&self, pool: &Arc<MemoryPool>, bytes: u64) -> Result<bool>;

    /// Called when a root pool is dropped.
    fn drop_pool(&self, pool: &MemoryPool);
}

/// One node in a query's memory pool tree.
pub struct MemoryPool {
    name: String,
    kind: PoolKind,
    parent: Option<Weak<MemoryPool>>,
    self_weak: Weak<MemoryPool>,
    max_capacity: u64,

    // Root-level grant; non-root pools delegate to their root.
    capacity: AtomicU64,
    reserved: AtomicU64,
    used: AtomicU64,
    peak: AtomicU64,

    children: RwLock<HashMap<String, Weak<MemoryPool>>>,
    reclaimer: RwLock<Option<Arc<dyn MemoryReclaimer>>>,

    aborted: AtomicBool,
    abort_error: Mutex<Option<Arc<ArborError>>>,

    // Root-only handle back to the arbitrating manager.
    participant: Option<Weak<dyn ArbitrationParticipant>>,
}

impl MemoryPool {
    /// Create a root pool. Capacity starts at zero; the arbitrator grants the
    /// initial capacity through `reserve_memory` right after registration.
    pub(crate) fn new_root(
        name: &str,
        max_capacity: u64,
        participant: Option<Weak<dyn ArbitrationParticipant>>,
    ) -> Arc<MemoryPool> {
        Arc::new_cyclic(|self_weak| MemoryPool {
            name: name.to_string(),
            kind: PoolKind::Aggregate,
            parent: None,
            self_weak: self_weak.clone(),
            max_capacity,
            capacity: AtomicU64::new(0),
            reserved: AtomicU64::new(0),
            used: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            children: RwLock::new(HashMap::new()),
            reclaimer: RwLock::new(None),
            aborted: AtomicBool::new(false),
            abort_error: Mutex::new(None),
            participant,
        })
    }

    fn new_child(&self, name: &str, kind: PoolKind) -> Result<Arc<MemoryPool>> {
        if self.kind == PoolKind::Leaf {
            return Err(ArborError::Unsupported(format!(
                "leaf memory pool '{}' cannot have children",
                self.name
            )));
        }
        self.check_aborted()?;
        let mut children = self.children.write().unwrap();
        children.retain(|_, weak| weak.strong_count() > 0);
        if children.contains_key(name) {
            return Err(ArborError::InvalidConfig(format!(
                "memory pool '{}' already has a child named '{name}'",
                self.name
            )));
        }
        let child = Arc::new_cyclic(|self_weak| MemoryPool {
            name: name.to_string(),
            kind,
            parent: Some(self.self_weak.clone()),
            self_weak: self_weak.clone(),
            max_capacity: self.max_capacity,
            capacity: AtomicU64::new(0),
            reserved: AtomicU64::new(0),
            used: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            children: RwLock::new(HashMap::new()),
            reclaimer: RwLock::new(None),
            aborted: AtomicBool::new(self.aborted.load(Ordering::Acquire)),
            abort_error: Mutex::new(self.abort_error.lock().unwrap().clone()),
            participant: None,
        });
        children.insert(name.to_string(), Arc::downgrade(&child));
        Ok(child)
    }

    /// Create an aggregate child pool.
    pub fn add_aggregate_child(&self, name: &str) -> Result<Arc<MemoryPool>> {
        self.new_child(name, PoolKind::Aggregate)
    }

    /// Create a leaf child pool.
    pub fn add_leaf_child(&self, name: &str) -> Result<Arc<MemoryPool>> {
        self.new_child(name, PoolKind::Leaf)
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pool kind.
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Whether this pool is the root of its tree.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    fn parent_pool(&self) -> Option<Arc<MemoryPool>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    fn self_arc(&self) -> Arc<MemoryPool> {
        self.self_weak.upgrade().expect("pool alive")
    }

    /// The root of this pool's tree.
    pub fn root(&self) -> Arc<MemoryPool> {
        let mut current = self.self_arc();
        while let Some(parent) = current.parent_pool() {
            current = parent;
        }
        current
    }

    /// Hard ceiling on this tree's capacity.
    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    /// Granted capacity of this pool's tree.
    pub fn capacity(&self) -> u64 {
        if self.is_root() {
            self.capacity.load(Ordering::Acquire)
        } else {
            self.root().capacity()
        }
    }

    /// Bytes reserved by this pool (for aggregates, the sum over children).
    pub fn reserved_bytes(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    /// Bytes in use: the leaf's allocation count, or the recursive sum for
    /// aggregates.
    pub fn current_bytes(&self) -> u64 {
        match self.kind {
            PoolKind::Leaf => self.used.load(Ordering::Acquire),
            PoolKind::Aggregate => {
                let mut total = 0;
                self.visit_children(|child| total += child.current_bytes());
                total
            }
        }
    }

    /// High-water mark of used bytes on this leaf.
    pub fn peak_bytes(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }

    /// Granted capacity not yet reserved, at the root.
    pub fn free_bytes(&self) -> u64 {
        let root = if self.is_root() { self.self_arc() } else { self.root() };
        root.capacity
            .load(Ordering::Acquire)
            .saturating_sub(root.reserved.load(Ordering::Acquire))
    }

    /// Reserved headroom not yet used on this leaf.
    pub fn available_reservation(&self) -> u64 {
        self.reserved
            .load(Ordering::Acquire)
            .saturating_sub(self.used.load(Ordering::Acquire))
    }

    /// Iterate live children, pruning dead weak links.
    pub fn visit_children<F: FnMut(&Arc<MemoryPool>)>(&self, mut f: F) {
        let live: Vec<Arc<MemoryPool>> = {
            let children = self.children.read().unwrap();
            children.values().filter_map(Weak::upgrade).collect()
        };
        for child in &live {
            f(child);
        }
    }

    /// Install this pool's reclaimer. May be set at most once.
    pub fn set_reclaimer(&self, reclaimer: Arc<dyn MemoryReclaimer>) {
        let mut slot = self.reclaimer.write().unwrap();
        assert!(
            slot.is_none(),
            "reclaimer already set on memory pool '{}'",
            self.name
        );
        *slot = Some(reclaimer);
    }

    /// This pool's reclaimer, if any.
    pub fn reclaimer(&self) -> Option<Arc<dyn MemoryReclaimer>> {
        self.reclaimer.read().unwrap().clone()
    }

    /// Request `bytes` more reservation within the currently granted capacity.
    ///
    /// Pure bookkeeping: fails with `CapacityExceeded` when the root's grant is
    /// insufficient, without invoking the arbitrator.
    pub fn try_reserve(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.check_aborted()?;
        self.increment_reservation(bytes)
    }

    fn increment_reservation(&self, bytes: u64) -> Result<()> {
        if let Some(parent) = self.parent_pool() {
            parent.increment_reservation(bytes)?;
            self.reserved.fetch_add(bytes, Ordering::AcqRel);
            return Ok(());
        }
        // Root admits against the granted capacity. The read lock keeps the
        // admission check coherent with capacity shrink/grow, which take the
        // writer side; concurrent admissions resolve through the CAS loop.
        let _guard = self.children.read().unwrap();
        let mut reserved = self.reserved.load(Ordering::Acquire);
        loop {
            let capacity = self.capacity.load(Ordering::Acquire);
            let next = reserved.checked_add(bytes).ok_or_else(|| {
                ArborError::CapacityExceeded(format!(
                    "reservation overflow on memory pool '{}'",
                    self.name
                ))
            })?;
            if next > capacity {
                return Err(ArborError::CapacityExceeded(format!(
                    "cannot reserve {} on memory pool '{}': {} reserved of {} capacity (max {})",
                    succinct_bytes(bytes),
                    self.name,
                    succinct_bytes(reserved),
                    succinct_bytes(capacity),
                    succinct_bytes(self.max_capacity),
                )));
            }
            match self
                .reserved
                .compare_exchange(reserved, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => reserved = actual,
            }
        }
    }

    fn decrement_reservation(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        if let Some(parent) = self.parent_pool() {
            parent.decrement_reservation(bytes);
        }
        let previous = self.reserved.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "reservation underflow on '{}'", self.name);
    }

    fn reserve_or_arbitrate(&self, bytes: u64) -> Result<()> {
        let capacity_error = match self.try_reserve(bytes) {
            Err(e @ ArborError::CapacityExceeded(_)) => e,
            other => return other,
        };
        // A reclaim callback runs on the arbitration thread and must not
        // re-enter arbitration there: the serialized slot is held by the very
        // request it would wait on. Such reservations fail locally instead.
        if crate::context::under_memory_arbitration() {
            return Err(capacity_error);
        }
        let root = self.root();
        let grown = match &root.participant {
            Some(participant) => match participant.upgrade() {
                Some(participant) => participant.grow_pool(&root, bytes)?,
                None => false,
            },
            None => false,
        };
        // The arbitrator may have aborted this pool while reclaiming.
        self.check_aborted()?;
        if grown {
            return self.try_reserve(bytes);
        }
        if root.capacity() >= root.max_capacity() {
            Err(ArborError::CapacityExceeded(format!(
                "memory pool '{}' exceeded its max capacity of {} reserving {}",
                root.name,
                succinct_bytes(root.max_capacity),
                succinct_bytes(bytes),
            )))
        } else {
            Err(ArborError::ArbitrationFailed(format!(
                "arbitration could not grow memory pool '{}' by {}",
                root.name,
                succinct_bytes(bytes),
            )))
        }
    }

    /// Best-effort reservation: try within the current grant, then fall back to
    /// an arbitrated capacity growth. Returns whether the (quantized)
    /// reservation was obtained. Abort of this pool surfaces as an error.
    pub fn maybe_reserve(&self, bytes: u64) -> Result<bool> {
        let target = quantized_size(bytes);
        match self.reserve_or_arbitrate(target) {
            Ok(()) => Ok(true),
            Err(ArborError::CapacityExceeded(_)) | Err(ArborError::ArbitrationFailed(_)) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Account `bytes` of operator memory on this leaf, growing the quantized
    /// reservation (arbitrating if needed) when the current one is too small.
    pub fn allocate(&self, bytes: u64) -> Result<()> {
        debug_assert_eq!(self.kind, PoolKind::Leaf, "allocate on aggregate pool");
        self.check_aborted()?;
        let needed = self.used.load(Ordering::Acquire).saturating_add(bytes);
        let reserved = self.reserved.load(Ordering::Acquire);
        let target = quantized_size(needed);
        if target > reserved {
            self.reserve_or_arbitrate(target - reserved)?;
        }
        let used = self.used.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak.fetch_max(used, Ordering::AcqRel);
        Ok(())
    }

    /// Return `bytes` of operator memory on this leaf. The reservation is kept
    /// until [`MemoryPool::release`].
    pub fn free(&self, bytes: u64) {
        debug_assert_eq!(self.kind, PoolKind::Leaf, "free on aggregate pool");
        let previous = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "free underflow on '{}'", self.name);
    }

    /// Return unused reservation above the quantized current usage.
    pub fn release(&self) {
        if self.kind != PoolKind::Leaf {
            return;
        }
        let used = self.used.load(Ordering::Acquire);
        let reserved = self.reserved.load(Ordering::Acquire);
        let floor = quantized_size(used);
        if reserved > floor {
            self.decrement_reservation(reserved - floor);
        }
    }

    /// Grow the root grant by `bytes`. Invoked only by the arbitrator.
    pub fn grow(&self, bytes: u64) {
        assert!(self.is_root(), "grow on non-root pool '{}'", self.name);
        let _guard = self.children.write().unwrap();
        let capacity = self.capacity.load(Ordering::Acquire);
        let next = capacity.saturating_add(bytes);
        assert!(
            next <= self.max_capacity,
            "growing memory pool '{}' to {} exceeds its max capacity {}",
            self.name,
            succinct_bytes(next),
            succinct_bytes(self.max_capacity),
        );
        self.capacity.store(next, Ordering::Release);
    }

    /// Shrink the root grant by up to `bytes` of unreserved capacity
    /// (0 means all of it), returning the freed amount.
    pub fn shrink(&self, bytes: u64) -> u64 {
        if !self.is_root() {
            return self.root().shrink(bytes);
        }
        let _guard = self.children.write().unwrap();
        let capacity = self.capacity.load(Ordering::Acquire);
        let free = capacity.saturating_sub(self.reserved.load(Ordering::Acquire));
        let take = if bytes == 0 { free } else { free.min(bytes) };
        self.capacity.store(capacity - take, Ordering::Release);
        take
    }

    /// Reclaimable bytes reported by this pool's reclaimer; `None` when the
    /// pool cannot be reclaimed.
    pub fn reclaimable_bytes(&self) -> Option<u64> {
        let reclaimer = self.reclaimer()?;
        reclaimer.reclaimable_bytes(self)
    }

    /// Reclaim up to `target_bytes` (0 means as much as possible) through this
    /// pool's reclaimer, returning the reclaimed amount.
    pub fn reclaim(&self, target_bytes: u64, stats: &mut ReclaimerStats) -> Result<u64> {
        match self.reclaimer() {
            Some(reclaimer) => reclaimer.reclaim(self, target_bytes, stats),
            None => Ok(0),
        }
    }

    /// Abort this pool's tree: records the cause, marks every node aborted so
    /// subsequent reservations fail with `Aborted`, and notifies operators
    /// through the root's reclaimer.
    pub fn abort(&self, error: &Arc<ArborError>) {
        let root = if self.is_root() { self.self_arc() } else { self.root() };
        root.mark_aborted(error);
        if let Some(reclaimer) = root.reclaimer() {
            if let Err(e) = reclaimer.abort(&root, error) {
                warn!(
                    pool = %root.name,
                    error = %e,
                    "failed to deliver abort to memory pool reclaimer",
                );
            }
        }
        debug_assert!(root.aborted());
    }

    fn mark_aborted(&self, error: &Arc<ArborError>) {
        self.aborted.store(true, Ordering::Release);
        *self.abort_error.lock().unwrap() = Some(error.clone());
        self.visit_children(|child| child.mark_aborted(error));
    }

    /// Whether this pool has been aborted.
    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// The abort cause, if this pool was aborted with one.
    pub fn abort_error(&self) -> Option<Arc<ArborError>> {
        self.abort_error.lock().unwrap().clone()
    }

    pub(crate) fn check_aborted(&self) -> Result<()> {
        if !self.aborted.load(Ordering::Acquire) {
            return Ok(());
        }
        let cause = self
            .abort_error
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "memory pool aborted".to_string());
        Err(ArborError::Aborted(format!(
            "memory pool '{}': {cause}",
            self.name
        )))
    }
}

impl fmt::Display for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            PoolKind::Leaf => "LEAF",
            PoolKind::Aggregate => "AGGREGATE",
        };
        write!(
            f,
            "{}[{kind}] used {} reserved {} capacity {} max {}",
            self.name,
            succinct_bytes(self.current_bytes()),
            succinct_bytes(self.reserved_bytes()),
            succinct_bytes(self.capacity()),
            succinct_bytes(self.max_capacity),
        )
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("capacity", &self.capacity.load(Ordering::Relaxed))
            .field("reserved", &self.reserved.load(Ordering::Relaxed))
            .field("used", &self.used.load(Ordering::Relaxed))
            .field("aborted", &self.aborted.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        if let Some(parent) = self.parent_pool() {
            parent.children.write().unwrap().remove(&self.name);
        } else if let Some(participant) = self.participant.as_ref().and_then(Weak::upgrade) {
            participant.drop_pool(self);
        }
        debug_assert_eq!(
            self.used.load(Ordering::Acquire),
            0,
            "memory pool '{}' dropped with used bytes",
            self.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_with_capacity(max: u64, capacity: u64) -> Arc<MemoryPool> {
        let root = MemoryPool::new_root("q0", max, None);
        root.grow(capacity);
        root
    }

    #[test]
    fn quantization_rounds_up_in_bands() {
        assert_eq!(quantized_size(0), 0);
        assert_eq!(quantized_size(1), MB);
        assert_eq!(quantized_size(MB), MB);
        assert_eq!(quantized_size(MB + 1), 2 * MB);
        assert_eq!(quantized_size(17 * MB), 20 * MB);
        assert_eq!(quantized_size(65 * MB), 72 * MB);
    }

    #[test]
    fn reservation_propagates_to_root_and_back() {
        let root = root_with_capacity(64 * MB, 64 * MB);
        let node = root.add_aggregate_child("node").expect("node");
        let op = node.add_leaf_child("op").expect("op");

        op.allocate(MB + 1).expect("allocate");
        assert_eq!(op.current_bytes(), MB + 1);
        // Quantized to the next MB band.
        assert_eq!(op.reserved_bytes(), 2 * MB);
        assert_eq!(node.reserved_bytes(), 2 * MB);
        assert_eq!(root.reserved_bytes(), 2 * MB);
        assert!(op.current_bytes() <= op.reserved_bytes());
        assert!(node.reserved_bytes() <= root.reserved_bytes());

        op.free(MB + 1);
        op.release();
        assert_eq!(op.current_bytes(), 0);
        assert_eq!(root.reserved_bytes(), 0);
        assert_eq!(root.free_bytes(), 64 * MB);
    }

    #[test]
    fn reserve_beyond_capacity_fails_without_arbitrator() {
        let root = root_with_capacity(4 * MB, 2 * MB);
        let op = root.add_leaf_child("op").expect("op");
        let err = op.allocate(3 * MB).expect_err("must fail");
        assert!(matches!(err, ArborError::CapacityExceeded(_)));
        // Nothing sticks after the failed reservation.
        assert_eq!(root.reserved_bytes(), 0);
        assert_eq!(op.current_bytes(), 0);
    }

    #[test]
    fn shrink_returns_only_unreserved_capacity() {
        let root = root_with_capacity(64 * MB, 16 * MB);
        let op = root.add_leaf_child("op").expect("op");
        op.allocate(3 * MB).expect("allocate");
        assert_eq!(root.shrink(0), 16 * MB - op.reserved_bytes());
        assert_eq!(root.capacity(), op.reserved_bytes());
        op.free(3 * MB);
        op.release();
    }

    #[test]
    fn abort_marks_subtree_and_fails_reservations() {
        let root = root_with_capacity(64 * MB, 16 * MB);
        let node = root.add_aggregate_child("node").expect("node");
        let op = node.add_leaf_child("op").expect("op");

        let cause = Arc::new(ArborError::Aborted("victim of arbitration".to_string()));
        node.abort(&cause);

        assert!(root.aborted());
        assert!(op.aborted());
        let err = op.allocate(MB).expect_err("aborted pool");
        assert!(matches!(err, ArborError::Aborted(_)));
        assert!(err.to_string().contains("victim of arbitration"));
        let err = op.try_reserve(MB).expect_err("aborted pool");
        assert!(matches!(err, ArborError::Aborted(_)));
    }

    #[test]
    fn dropped_children_disappear_from_parent() {
        let root = root_with_capacity(64 * MB, 16 * MB);
        {
            let op = root.add_leaf_child("op").expect("op");
            let mut seen = 0;
            root.visit_children(|_| seen += 1);
            assert_eq!(seen, 1);
            drop(op);
        }
        let mut seen = 0;
        root.visit_children(|_| seen += 1);
        assert_eq!(seen, 0);
        // The name is free for reuse after the drop.
        root.add_leaf_child("op").expect("op again");
    }

    #[test]
    fn duplicate_child_names_are_rejected() {
        let root = root_with_capacity(64 * MB, 16 * MB);
        let _a = root.add_leaf_child("op").expect("op");
        let err = root.add_leaf_child("op").expect_err("duplicate");
        assert!(matches!(err, ArborError::InvalidConfig(_)));
    }
}
