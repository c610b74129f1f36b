//! Node-level owner of the arbitrator and the set of alive query root pools.
//!
//! Root pools cannot arbitrate on their own: a growth request needs the
//! candidate set of peer queries. The manager tracks alive roots, snapshots
//! them for each arbitration, and returns capacity grants to the arbitrator
//! when a root is dropped.

use std::sync::{Arc, Mutex, Weak};

use arbor_common::{ArborError, MemoryConfig, Result};
use tracing::info;

use crate::arbitrator::{create_arbitrator, ArbitratorConfig, MemoryArbitrator};
use crate::pool::{ArbitrationParticipant, MemoryPool};
use crate::reclaimer::MemoryReclaimer;

/// Creates query root pools and routes their capacity traffic to the
/// configured arbitrator.
pub struct MemoryManager {
    arbitrator: Arc<dyn MemoryArbitrator>,
    pools: Mutex<Vec<(String, Weak<MemoryPool>)>>,
    self_weak: Weak<MemoryManager>,
}

impl MemoryManager {
    /// Create a manager with the arbitrator selected by `config`.
    pub fn new(config: &MemoryConfig) -> Result<Arc<MemoryManager>> {
        Self::with_arbitrator_config(ArbitratorConfig::from(config))
    }

    /// Create a manager from a fully built arbitrator config (used by tests
    /// to install a state-check hook).
    pub fn with_arbitrator_config(config: ArbitratorConfig) -> Result<Arc<MemoryManager>> {
        let arbitrator = create_arbitrator(&config)?;
        info!(arbitrator = %arbitrator.describe(), "memory manager created");
        Ok(Arc::new_cyclic(|self_weak| MemoryManager {
            arbitrator,
            pools: Mutex::new(Vec::new()),
            self_weak: self_weak.clone(),
        }))
    }

    /// The arbitrator serving this manager.
    pub fn arbitrator(&self) -> &Arc<dyn MemoryArbitrator> {
        &self.arbitrator
    }

    /// Create and register a query root pool with the given hard capacity
    /// ceiling, granting it an initial capacity through the arbitrator. The
    /// returned `Arc` is the owning reference: dropping it releases the
    /// pool's capacity grant.
    pub fn add_root_pool(
        &self,
        name: &str,
        max_capacity: u64,
        reclaimer: Option<Arc<dyn MemoryReclaimer>>,
    ) -> Result<Arc<MemoryPool>> {
        let pool = {
            let mut pools = self.pools.lock().unwrap();
            pools.retain(|(_, weak)| weak.strong_count() > 0);
            if pools.iter().any(|(existing, _)| existing == name) {
                return Err(ArborError::InvalidConfig(format!(
                    "root memory pool '{name}' already exists"
                )));
            }
            let participant: Weak<dyn ArbitrationParticipant> = self.self_weak.clone();
            let pool = MemoryPool::new_root(name, max_capacity, Some(participant));
            pools.push((name.to_string(), Arc::downgrade(&pool)));
            pool
        };
        if let Some(reclaimer) = reclaimer {
            pool.set_reclaimer(reclaimer);
        }
        self.arbitrator.reserve_memory(&pool, max_capacity);
        Ok(pool)
    }

    /// Snapshot the alive root pools in registration order.
    pub fn alive_pools(&self) -> Vec<Arc<MemoryPool>> {
        let pools = self.pools.lock().unwrap();
        pools
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    /// Voluntarily return up to `target_bytes` of unused capacity from all
    /// alive pools to the arbitrator.
    pub fn shrink_pools(&self, target_bytes: u64) -> Result<u64> {
        self.arbitrator
            .shrink_memory(&self.alive_pools(), target_bytes)
    }
}

impl ArbitrationParticipant for MemoryManager {
    fn grow_pool(&self, pool: &Arc<MemoryPool>, bytes: u64) -> Result<bool> {
        let candidates = self.alive_pools();
        self.arbitrator.grow_memory(pool, &candidates, bytes)
    }

    fn drop_pool(&self, pool: &MemoryPool) {
        self.arbitrator.release_memory(pool);
        let mut pools = self.pools.lock().unwrap();
        pools.retain(|(name, weak)| name != pool.name() && weak.strong_count() > 0);
    }
}
