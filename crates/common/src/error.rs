use thiserror::Error;

/// Canonical Arbor error taxonomy used across crates.
///
/// Classification guidance:
/// - [`ArborError::CapacityExceeded`]: a reservation would push a memory pool past its
///   capacity or hard max; surfaced to the operator, which decides whether to fail the query
/// - [`ArborError::ArbitrationFailed`]: the arbitrator ran but could not free enough
///   capacity (no candidates left, or the requestor was chosen as victim)
/// - [`ArborError::Aborted`]: the pool was forcibly aborted by the arbitrator; fatal to
///   that query, observed on the next checked pool call
/// - [`ArborError::NonReclaimable`]: reclaim requested while the operator cannot spill
/// - [`ArborError::Unsupported`]: valid request for intentionally unimplemented behavior
///   (for example aborting a leaf pool)
/// - [`ArborError::InvalidConfig`]: config/registry contract violations
/// - [`ArborError::Execution`]: runtime operator failures (sort, spill encode/decode)
/// - [`ArborError::Io`]: raw filesystem IO failures from std APIs
#[derive(Debug, Error)]
pub enum ArborError {
    /// Reservation or growth would exceed a pool's capacity limits.
    ///
    /// Examples:
    /// - leaf reservation beyond the root's granted capacity with no arbitrator help
    /// - growth request beyond the pool's hard `max_capacity`
    #[error("memory capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The arbitrator could not satisfy a growth request.
    ///
    /// Examples:
    /// - all candidates shrunk and reclaimed, still short of the target
    /// - the requestor itself was selected as the OOM victim
    #[error("memory arbitration failed: {0}")]
    ArbitrationFailed(String),

    /// The pool was aborted to free memory for other queries.
    ///
    /// Carries the abort cause recorded when the arbitrator picked the victim.
    #[error("memory pool aborted: {0}")]
    Aborted(String),

    /// Reclaim was requested while the target operator is not in a reclaimable phase.
    #[error("non-reclaimable: {0}")]
    NonReclaimable(String),

    /// Valid request for behavior that is intentionally not supported.
    ///
    /// Examples:
    /// - `abort` on a leaf memory pool
    /// - `shrink_memory` on an arbitrator variant without voluntary shrink
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Invalid or inconsistent configuration/registry state.
    ///
    /// Examples:
    /// - unknown arbitrator kind requested from the factory registry
    /// - spill enabled without a spill directory
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Runtime execution failures after setup succeeded.
    ///
    /// Examples:
    /// - sort/merge evaluation failures
    /// - spill file encode/decode failures
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard Arbor result alias.
pub type Result<T> = std::result::Result<T, ArborError>;
