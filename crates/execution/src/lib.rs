//! Spill-capable execution operators built on the Arbor memory core.
//!
//! The sort buffer and sorting writer demonstrate the full reclaim contract:
//! reclaimability reporting, suspension-safe reclaim, graceful reservation
//! growth, spill-under-pressure, and idempotent termination.

pub mod sort_buffer;
pub mod sorting_writer;
pub mod spill;

pub use sort_buffer::{InputFits, SortBuffer};
pub use sorting_writer::{BatchWriter, CollectingWriter, SortingWriter, WriterState};
pub use spill::{SortField, SpillMerger, Spiller};
