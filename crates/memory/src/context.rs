//! Thread-local marker for "this thread is executing a memory arbitration".
//!
//! Pools consult [`under_memory_arbitration`] to detect re-entrant allocation
//! from inside a reclaim callback; such allocations must happen inside a
//! reclaimable-section guard or fail as non-reclaimable.

use std::cell::RefCell;
use std::sync::Arc;

use crate::pool::MemoryPool;

thread_local! {
    static ARBITRATION_CTX: RefCell<Option<ArbitrationContext>> = const { RefCell::new(None) };
}

/// The arbitration running on the current thread.
#[derive(Clone)]
pub struct ArbitrationContext {
    requestor: Arc<MemoryPool>,
}

impl ArbitrationContext {
    /// The root pool whose growth request started this arbitration.
    pub fn requestor(&self) -> &Arc<MemoryPool> {
        &self.requestor
    }
}

/// Installs an [`ArbitrationContext`] on the current thread for its lifetime
/// and restores the previous value on drop (including during unwinding).
pub struct ScopedArbitrationContext {
    saved: Option<ArbitrationContext>,
}

impl ScopedArbitrationContext {
    /// Mark the current thread as arbitrating on behalf of `requestor`.
    pub fn new(requestor: Arc<MemoryPool>) -> Self {
        let saved =
            ARBITRATION_CTX.with(|ctx| ctx.replace(Some(ArbitrationContext { requestor })));
        Self { saved }
    }
}

impl Drop for ScopedArbitrationContext {
    fn drop(&mut self) {
        let saved = self.saved.take();
        ARBITRATION_CTX.with(|ctx| ctx.replace(saved));
    }
}

/// The arbitration context installed on the current thread, if any.
pub fn arbitration_context() -> Option<ArbitrationContext> {
    ARBITRATION_CTX.with(|ctx| ctx.borrow().clone())
}

/// Whether the current thread is executing a memory arbitration.
pub fn under_memory_arbitration() -> bool {
    ARBITRATION_CTX.with(|ctx| ctx.borrow().is_some())
}
