//! Memory pools, the reclaim protocol, and capacity arbitration.
//!
//! Concurrent queries share a bounded pool of process memory. Each query owns
//! a tree of [`MemoryPool`]s whose leaves account operator bytes. When an
//! operator outgrows its reservation, the root's [`MemoryArbitrator`]
//! redistributes the node capacity: growing the requestor from free capacity,
//! shrinking idle reservations of peers, asking reclaimable peers to spill
//! through their [`MemoryReclaimer`], or aborting a victim query on OOM.

pub mod arbitrator;
pub mod context;
pub mod manager;
pub mod pool;
pub mod reclaimer;
pub mod shared;

pub use arbitrator::{
    create_arbitrator, register_arbitrator_factory, unregister_arbitrator_factory,
    ArbitrationStateCheck, ArbitratorConfig, ArbitratorFactory, ArbitratorStats, MemoryArbitrator,
    NoopArbitrator, NOOP_ARBITRATOR_KIND,
};
pub use context::{
    arbitration_context, under_memory_arbitration, ArbitrationContext, ScopedArbitrationContext,
};
pub use manager::MemoryManager;
pub use pool::{ArbitrationParticipant, MemoryPool, PoolKind};
pub use reclaimer::{
    run_reclaim, MemoryReclaimer, NonReclaimableSectionGuard, ReclaimableSectionGuard,
    ReclaimerStats, TreeReclaimer,
};
pub use shared::{SharedArbitrator, SHARED_ARBITRATOR_KIND};
