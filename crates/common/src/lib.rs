#![deny(missing_docs)]

//! Shared configuration, error types, and observability primitives for Arbor crates.
//!
//! Architecture role:
//! - defines memory/spill configuration passed across layers
//! - provides common [`ArborError`] / [`Result`] contracts
//! - hosts the metrics registry and byte/duration formatting helpers
//!
//! Key modules:
//! - [`bytes`]
//! - [`config`]
//! - [`error`]
//! - [`metrics`]

/// Byte and duration formatting helpers.
pub mod bytes;
/// Shared memory/spill configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use bytes::{succinct_bytes, succinct_micros};
pub use config::{MemoryConfig, SpillConfig, MAX_MEMORY};
pub use error::{ArborError, Result};
pub use metrics::MetricsRegistry;
