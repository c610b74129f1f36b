use serde::{Deserialize, Serialize};

/// Sentinel for "no capacity limit".
pub const MAX_MEMORY: u64 = u64::MAX;

/// Node-level memory arbitration configuration shared across runtime layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Arbitrator selector. Empty string picks the noop arbitrator (fixed
    /// per-query isolation); `"SHARED"` picks dynamic redistribution; any
    /// other value must be registered through the factory registry.
    #[serde(default)]
    pub arbitrator_kind: String,

    /// Total node capacity in bytes distributable across queries.
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,

    /// Initial capacity granted to a newly created root pool.
    #[serde(default = "default_pool_initial_capacity")]
    pub pool_initial_capacity: u64,

    /// Minimum capacity unit moved by one arbitration step.
    #[serde(default = "default_pool_transfer_capacity")]
    pub pool_transfer_capacity: u64,
}

fn default_capacity_bytes() -> u64 {
    MAX_MEMORY
}

fn default_pool_initial_capacity() -> u64 {
    256 * 1024 * 1024
}

fn default_pool_transfer_capacity() -> u64 {
    32 * 1024 * 1024
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            arbitrator_kind: String::new(),
            capacity_bytes: default_capacity_bytes(),
            pool_initial_capacity: default_pool_initial_capacity(),
            pool_transfer_capacity: default_pool_transfer_capacity(),
        }
    }
}

/// Operator spill configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpillConfig {
    /// Master gate for spilling.
    pub spill_enabled: bool,

    /// Gate for order-by (sort) spilling; effective only with `spill_enabled`.
    #[serde(default = "default_true")]
    pub order_by_spill_enabled: bool,

    /// Directory used for spill files.
    pub spill_dir: String,

    /// Per-operator hard spill threshold in bytes; 0 disables the threshold
    /// trigger and leaves spilling to reservation pressure.
    #[serde(default)]
    pub order_by_spill_memory_threshold: u64,

    /// Percentage of current usage requested as extra headroom when an
    /// operator tries to grow its reservation instead of spilling.
    #[serde(default = "default_spillable_reservation_growth_pct")]
    pub spillable_reservation_growth_pct: u32,

    /// Deterministic spill injection for tests, 0-100. A nonzero value spills
    /// input batches whose hashed sequence number falls under the percentage.
    #[serde(default)]
    pub test_spill_pct: u32,
}

fn default_true() -> bool {
    true
}

fn default_spillable_reservation_growth_pct() -> u32 {
    25
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            spill_enabled: false,
            order_by_spill_enabled: true,
            spill_dir: "./arbor_spill".to_string(),
            order_by_spill_memory_threshold: 0,
            spillable_reservation_growth_pct: default_spillable_reservation_growth_pct(),
            test_spill_pct: 0,
        }
    }
}

impl SpillConfig {
    /// Returns whether order-by operators may spill under this config.
    pub fn order_by_spill(&self) -> bool {
        self.spill_enabled && self.order_by_spill_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_config_defaults_to_noop_unlimited() {
        let cfg = MemoryConfig::default();
        assert!(cfg.arbitrator_kind.is_empty());
        assert_eq!(cfg.capacity_bytes, MAX_MEMORY);
        assert!(cfg.pool_transfer_capacity <= cfg.pool_initial_capacity);
    }

    #[test]
    fn spill_config_round_trips_and_gates_compose() {
        let mut cfg = SpillConfig::default();
        assert!(!cfg.order_by_spill());
        cfg.spill_enabled = true;
        assert!(cfg.order_by_spill());
        cfg.order_by_spill_enabled = false;
        assert!(!cfg.order_by_spill());

        let json = serde_json::to_string(&cfg).expect("encode");
        let back: SpillConfig = serde_json::from_str(&json).expect("decode");
        assert_eq!(back.spillable_reservation_growth_pct, 25);
        assert!(!back.order_by_spill_enabled);
    }
}
