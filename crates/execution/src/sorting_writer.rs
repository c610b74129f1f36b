//! A writer that sorts everything it receives before handing it to its output
//! sink, spilling under memory pressure. This is the canonical reclaim
//! client: it reports reclaimable bytes while running, spills when the
//! arbitrator asks, and tears down idempotently on close and abort.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arbor_common::{ArborError, Result, SpillConfig};
use arbor_memory::{
    run_reclaim, MemoryPool, MemoryReclaimer, NonReclaimableSectionGuard, ReclaimableSectionGuard,
    ReclaimerStats,
};
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use tracing::warn;

use crate::sort_buffer::{InputFits, SortBuffer};
use crate::spill::SortField;

/// Output sink for sorted batches.
pub trait BatchWriter: Send {
    /// Write one batch.
    fn write(&mut self, batch: &RecordBatch) -> Result<()>;
    /// Flush buffered output.
    fn flush(&mut self) -> Result<()>;
    /// Flush and close the sink.
    fn close(&mut self) -> Result<()>;
    /// Drop pending output without flushing.
    fn abort(&mut self) -> Result<()>;
}

/// In-memory [`BatchWriter`] collecting everything it receives; the sink
/// handle stays readable after the writer is consumed.
#[derive(Default)]
pub struct CollectingWriter {
    sink: Arc<Mutex<Vec<RecordBatch>>>,
}

impl CollectingWriter {
    /// Create an empty collecting writer.
    pub fn new() -> CollectingWriter {
        CollectingWriter::default()
    }

    /// Shared handle to the collected batches.
    pub fn sink(&self) -> Arc<Mutex<Vec<RecordBatch>>> {
        self.sink.clone()
    }
}

impl BatchWriter for CollectingWriter {
    fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        self.sink.lock().unwrap().push(batch.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.sink.lock().unwrap().clear();
        Ok(())
    }
}

/// Sorting writer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Accepting input; the only state in which reclaim is allowed.
    Running,
    /// Output drained and flushed.
    Closed,
    /// Torn down without flushing.
    Aborted,
}

impl WriterState {
    fn from_u8(value: u8) -> WriterState {
        match value {
            0 => WriterState::Running,
            1 => WriterState::Closed,
            _ => WriterState::Aborted,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WriterState::Running => 0,
            WriterState::Closed => 1,
            WriterState::Aborted => 2,
        }
    }
}

/// State shared between the operator thread and the reclaimer.
struct SortWriterShared {
    sort_pool: Arc<MemoryPool>,
    can_reclaim: bool,
    non_reclaimable_section: Arc<AtomicBool>,
    state: AtomicU8,
    buffer: Mutex<SortBuffer>,
}

impl SortWriterShared {
    fn state(&self) -> WriterState {
        WriterState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WriterState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

/// Writer that buffers and sorts its input, spilling under pressure, and
/// streams the fully sorted rows into an output sink on close.
pub struct SortingWriter {
    shared: Arc<SortWriterShared>,
    output: Box<dyn BatchWriter>,
}

impl SortingWriter {
    /// Create a sorting writer. A leaf pool named `name` is created under
    /// `parent_pool` for the sort state; when the parent carries a reclaimer,
    /// the sort pool gets one too so the arbitrator can spill this writer.
    /// `spill_config` is ignored unless its order-by gates are enabled.
    pub fn new(
        output: Box<dyn BatchWriter>,
        name: &str,
        schema: SchemaRef,
        sort_fields: Vec<SortField>,
        output_batch_size: usize,
        parent_pool: &Arc<MemoryPool>,
        spill_config: Option<SpillConfig>,
    ) -> Result<SortingWriter> {
        let sort_pool = parent_pool.add_leaf_child(name)?;
        let spill_config = spill_config.filter(|config| config.order_by_spill());
        let non_reclaimable_section = Arc::new(AtomicBool::new(false));
        let buffer = SortBuffer::new(
            schema,
            sort_fields,
            output_batch_size,
            sort_pool.clone(),
            non_reclaimable_section.clone(),
            spill_config,
        )?;
        let shared = Arc::new(SortWriterShared {
            sort_pool: sort_pool.clone(),
            can_reclaim: buffer.can_spill(),
            non_reclaimable_section,
            state: AtomicU8::new(WriterState::Running.as_u8()),
            buffer: Mutex::new(buffer),
        });
        if parent_pool.reclaimer().is_some() {
            sort_pool.set_reclaimer(Arc::new(SortWriterReclaimer {
                writer: Arc::downgrade(&shared),
            }));
        }
        Ok(SortingWriter { shared, output })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WriterState {
        self.shared.state()
    }

    /// Whether the arbitrator may reclaim this writer by spilling.
    pub fn can_reclaim(&self) -> bool {
        self.shared.can_reclaim
    }

    /// Spill runs written so far.
    pub fn num_spill_runs(&self) -> u64 {
        self.shared.buffer.lock().unwrap().num_spill_runs()
    }

    /// The sort pool accounting this writer's buffered rows.
    pub fn pool(&self) -> Arc<MemoryPool> {
        self.shared.sort_pool.clone()
    }

    fn check_running(&self) -> Result<()> {
        match self.shared.state() {
            WriterState::Running => Ok(()),
            WriterState::Closed => Err(ArborError::Execution(
                "sorting writer is already closed".to_string(),
            )),
            WriterState::Aborted => Err(match self.shared.sort_pool.abort_error() {
                Some(cause) => ArborError::Aborted(cause.to_string()),
                None => ArborError::Aborted("sorting writer has been aborted".to_string()),
            }),
        }
    }

    /// Buffer one input batch for sorting.
    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        self.check_running()?;
        let _section = NonReclaimableSectionGuard::new(&self.shared.non_reclaimable_section);
        let decision = self
            .shared
            .buffer
            .lock()
            .unwrap()
            .ensure_input_fits(batch)?;
        if let InputFits::ReserveThenRetry(target) = decision {
            let granted = {
                // The buffer lock must not be held here: this window is the
                // one place the arbitrator may reclaim this writer, possibly
                // on this very thread.
                let _window =
                    ReclaimableSectionGuard::new(&self.shared.non_reclaimable_section);
                self.shared.sort_pool.maybe_reserve(target)?
            };
            if !granted {
                self.shared.buffer.lock().unwrap().spill()?;
            }
        }
        self.shared.buffer.lock().unwrap().append(batch)
    }

    /// Flush the output sink.
    pub fn flush(&mut self) -> Result<()> {
        self.check_running()?;
        self.output.flush()
    }

    /// Finish the sort, stream every sorted batch into the output sink, and
    /// close it. No-op when already closed or aborted.
    pub fn close(&mut self) -> Result<()> {
        if self.shared.state() != WriterState::Running {
            return Ok(());
        }
        // Leaving the running state first: reclaim attempts from here on are
        // refused, since spilling is not supported while producing output.
        self.shared.set_state(WriterState::Closed);
        let _section = NonReclaimableSectionGuard::new(&self.shared.non_reclaimable_section);
        {
            let mut buffer = self.shared.buffer.lock().unwrap();
            buffer.no_more_input()?;
            while let Some(batch) = buffer.get_output()? {
                self.output.write(&batch)?;
            }
            buffer.clear();
        }
        self.shared.sort_pool.release();
        self.output.close()
    }

    /// Tear down without flushing. No-op when already closed or aborted.
    pub fn abort(&mut self) -> Result<()> {
        if self.shared.state() != WriterState::Running {
            return Ok(());
        }
        self.shared.set_state(WriterState::Aborted);
        self.shared.buffer.lock().unwrap().clear();
        self.shared.sort_pool.release();
        self.output.abort()
    }
}

/// Reclaimer installed on the sort pool: spills the writer's buffered rows
/// and returns the freed capacity to the arbitrator.
struct SortWriterReclaimer {
    writer: Weak<SortWriterShared>,
}

impl MemoryReclaimer for SortWriterReclaimer {
    fn reclaimable_bytes(&self, pool: &MemoryPool) -> Option<u64> {
        let shared = self.writer.upgrade()?;
        if !shared.can_reclaim || shared.state() != WriterState::Running {
            return None;
        }
        let bytes = pool.current_bytes();
        (bytes > 0).then_some(bytes)
    }

    fn reclaim(
        &self,
        pool: &MemoryPool,
        target_bytes: u64,
        stats: &mut ReclaimerStats,
    ) -> Result<u64> {
        let Some(shared) = self.writer.upgrade() else {
            return Ok(0);
        };
        if !shared.can_reclaim {
            return Ok(0);
        }
        if shared.state() != WriterState::Running
            || shared.non_reclaimable_section.load(Ordering::Acquire)
        {
            warn!(
                pool = pool.name(),
                state = ?shared.state(),
                used = pool.current_bytes(),
                reserved = pool.reserved_bytes(),
                "cannot reclaim from sort writer outside its reclaimable window",
            );
            stats.num_non_reclaimable_attempts += 1;
            return Ok(0);
        }
        run_reclaim(
            || {
                let mut buffer = shared.buffer.lock().unwrap();
                buffer.spill()?;
                drop(buffer);
                shared.sort_pool.release();
                Ok(shared.sort_pool.shrink(target_bytes))
            },
            stats,
        )
    }

    fn abort(&self, _pool: &MemoryPool, _error: &Arc<ArborError>) -> Result<()> {
        let Some(shared) = self.writer.upgrade() else {
            return Ok(());
        };
        shared.set_state(WriterState::Aborted);
        shared.buffer.lock().unwrap().clear();
        shared.sort_pool.release();
        // The output sink is owned by the operator thread; it observes the
        // abort through the writer state on its next checked call.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_common::MemoryConfig;
    use arbor_memory::{MemoryManager, TreeReclaimer};
    use arrow::array::{Array, Int64Array};
    use arrow_schema::{DataType, Field, Schema};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    fn int_batch(schema: &SchemaRef, values: Vec<i64>) -> RecordBatch {
        RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(values))])
            .expect("batch")
    }

    fn collected_values(sink: &Arc<Mutex<Vec<RecordBatch>>>) -> Vec<i64> {
        let batches = sink.lock().unwrap();
        batches
            .iter()
            .flat_map(|batch| {
                let array = batch
                    .column(0)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .expect("int64");
                (0..array.len()).map(|i| array.value(i)).collect::<Vec<_>>()
            })
            .collect()
    }

    fn spill_config(tag: &str) -> SpillConfig {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        SpillConfig {
            spill_enabled: true,
            spill_dir: std::env::temp_dir()
                .join(format!("arbor_writer_test_{tag}_{nanos}"))
                .to_string_lossy()
                .into_owned(),
            ..SpillConfig::default()
        }
    }

    #[test]
    fn close_streams_sorted_output() {
        let manager = MemoryManager::new(&MemoryConfig::default()).expect("manager");
        let root = manager
            .add_root_pool("writer-close", 1 << 30, Some(TreeReclaimer::create()))
            .expect("root");
        let sink_writer = CollectingWriter::new();
        let sink = sink_writer.sink();
        let mut writer = SortingWriter::new(
            Box::new(sink_writer),
            "sort",
            test_schema(),
            vec![SortField::ascending(0)],
            4,
            &root,
            None,
        )
        .expect("writer");

        assert_eq!(writer.state(), WriterState::Running);
        assert!(!writer.can_reclaim());
        writer
            .write(&int_batch(&test_schema(), vec![9, 3, 7]))
            .expect("write");
        writer
            .write(&int_batch(&test_schema(), vec![1, 8]))
            .expect("write");
        writer.close().expect("close");
        assert_eq!(writer.state(), WriterState::Closed);
        assert_eq!(collected_values(&sink), vec![1, 3, 7, 8, 9]);
        // Idempotent: closing again changes nothing.
        writer.close().expect("close again");
        assert_eq!(writer.pool().current_bytes(), 0);
        let err = writer
            .write(&int_batch(&test_schema(), vec![2]))
            .expect_err("closed");
        assert!(matches!(err, ArborError::Execution(_)));
    }

    #[test]
    fn reclaim_spills_and_frees_the_sort_pool() {
        let manager = MemoryManager::new(&MemoryConfig::default()).expect("manager");
        let root = manager
            .add_root_pool("writer-reclaim", 1 << 30, Some(TreeReclaimer::create()))
            .expect("root");
        let config = spill_config("reclaim");
        let sink_writer = CollectingWriter::new();
        let sink = sink_writer.sink();
        let mut writer = SortingWriter::new(
            Box::new(sink_writer),
            "sort",
            test_schema(),
            vec![SortField::ascending(0)],
            4,
            &root,
            Some(config.clone()),
        )
        .expect("writer");

        assert!(writer.can_reclaim());
        writer
            .write(&int_batch(&test_schema(), vec![6, 2, 4]))
            .expect("write");
        let pool = writer.pool();
        let reclaimable = pool.reclaimable_bytes().expect("reclaimable");
        assert_eq!(reclaimable, pool.current_bytes());

        let mut stats = ReclaimerStats::default();
        let freed = pool.reclaim(reclaimable, &mut stats).expect("reclaim");
        assert!(freed > 0);
        assert_eq!(pool.current_bytes(), 0);
        assert_eq!(writer.num_spill_runs(), 1);
        assert!(stats.reclaimed_bytes > 0);
        // The spilled rows still come out sorted.
        writer
            .write(&int_batch(&test_schema(), vec![1, 5]))
            .expect("write after reclaim");
        writer.close().expect("close");
        assert_eq!(collected_values(&sink), vec![1, 2, 4, 5, 6]);
        let _ = std::fs::remove_dir_all(&config.spill_dir);
    }

    #[test]
    fn reclaim_outside_running_counts_non_reclaimable_attempt() {
        let manager = MemoryManager::new(&MemoryConfig::default()).expect("manager");
        let root = manager
            .add_root_pool("writer-closed-reclaim", 1 << 30, Some(TreeReclaimer::create()))
            .expect("root");
        let config = spill_config("closed");
        let mut writer = SortingWriter::new(
            Box::new(CollectingWriter::new()),
            "sort",
            test_schema(),
            vec![SortField::ascending(0)],
            4,
            &root,
            Some(config.clone()),
        )
        .expect("writer");

        writer
            .write(&int_batch(&test_schema(), vec![3, 1]))
            .expect("write");
        let pool = writer.pool();
        writer.close().expect("close");

        assert_eq!(pool.reclaimable_bytes(), None);
        let mut stats = ReclaimerStats::default();
        let reclaimer = pool.reclaimer().expect("reclaimer");
        let freed = reclaimer.reclaim(&pool, 0, &mut stats).expect("reclaim");
        assert_eq!(freed, 0);
        assert_eq!(stats.num_non_reclaimable_attempts, 1);
        let _ = std::fs::remove_dir_all(&config.spill_dir);
    }

    #[test]
    fn abort_discards_output_and_later_calls_fail() {
        let manager = MemoryManager::new(&MemoryConfig::default()).expect("manager");
        let root = manager
            .add_root_pool("writer-abort", 1 << 30, Some(TreeReclaimer::create()))
            .expect("root");
        let sink_writer = CollectingWriter::new();
        let sink = sink_writer.sink();
        let mut writer = SortingWriter::new(
            Box::new(sink_writer),
            "sort",
            test_schema(),
            vec![SortField::ascending(0)],
            4,
            &root,
            None,
        )
        .expect("writer");

        writer
            .write(&int_batch(&test_schema(), vec![5, 2]))
            .expect("write");
        writer.abort().expect("abort");
        assert_eq!(writer.state(), WriterState::Aborted);
        assert!(sink.lock().unwrap().is_empty());
        assert_eq!(writer.pool().current_bytes(), 0);
        let err = writer
            .write(&int_batch(&test_schema(), vec![1]))
            .expect_err("aborted");
        assert!(matches!(err, ArborError::Aborted(_)));
        // Idempotent: aborting again changes nothing.
        writer.abort().expect("abort again");
    }
}
