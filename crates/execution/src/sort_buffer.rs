//! In-memory sort buffer with spill-under-pressure.
//!
//! Accumulates record batches inside a leaf memory pool, deciding per input
//! whether to grow the reservation or spill the buffered rows to disk. At end
//! of input it either sorts in memory or merges the spill runs; output is
//! produced in batches of a configured size.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arbor_common::{ArborError, Result, SpillConfig};
use arbor_memory::{MemoryPool, ReclaimableSectionGuard};
use arrow::compute::{concat_batches, lexsort_to_indices, take, SortColumn};
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use tracing::debug;

use crate::spill::{SortField, SpillMerger, Spiller};

static NEXT_SPILL_ID: AtomicU64 = AtomicU64::new(0);

/// Outcome of the per-input spill decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFits {
    /// The input fits: either spilling is off, the buffer already spilled, or
    /// the reservation has enough headroom.
    Fits,
    /// The buffer wants this many more reserved bytes before accepting the
    /// input; the caller must attempt the reservation inside a
    /// reclaimable-section window and spill if it is refused.
    ReserveThenRetry(u64),
}

/// Spillable sort accumulator for one operator.
pub struct SortBuffer {
    schema: SchemaRef,
    sort_fields: Vec<SortField>,
    output_batch_size: usize,
    pool: Arc<MemoryPool>,
    non_reclaimable_section: Arc<AtomicBool>,
    spill_config: Option<SpillConfig>,

    batches: Vec<RecordBatch>,
    batches_bytes: u64,
    num_input_rows: usize,
    num_output_rows: usize,
    no_more_input: bool,

    sorted: Option<RecordBatch>,
    sorted_bytes: u64,
    spiller: Option<Spiller>,
    merger: Option<SpillMerger>,

    spill_test_counter: u64,
    num_spill_runs: u64,
}

impl SortBuffer {
    /// Create a sort buffer accounting into `pool` (a leaf). `spill_config`
    /// of `None` disables spilling entirely.
    pub fn new(
        schema: SchemaRef,
        sort_fields: Vec<SortField>,
        output_batch_size: usize,
        pool: Arc<MemoryPool>,
        non_reclaimable_section: Arc<AtomicBool>,
        spill_config: Option<SpillConfig>,
    ) -> Result<SortBuffer> {
        if sort_fields.is_empty() {
            return Err(ArborError::InvalidConfig(
                "sort buffer requires at least one sort field".to_string(),
            ));
        }
        for field in &sort_fields {
            if field.column >= schema.fields().len() {
                return Err(ArborError::InvalidConfig(format!(
                    "sort column {} out of range for schema with {} fields",
                    field.column,
                    schema.fields().len()
                )));
            }
        }
        if output_batch_size == 0 {
            return Err(ArborError::InvalidConfig(
                "sort buffer output batch size must be positive".to_string(),
            ));
        }
        if let Some(config) = &spill_config {
            if config.spill_dir.is_empty() {
                return Err(ArborError::InvalidConfig(
                    "spilling requires a spill directory".to_string(),
                ));
            }
        }
        Ok(SortBuffer {
            schema,
            sort_fields,
            output_batch_size,
            pool,
            non_reclaimable_section,
            spill_config,
            batches: Vec::new(),
            batches_bytes: 0,
            num_input_rows: 0,
            num_output_rows: 0,
            no_more_input: false,
            sorted: None,
            sorted_bytes: 0,
            spiller: None,
            merger: None,
            spill_test_counter: 0,
            num_spill_runs: 0,
        })
    }

    /// Whether spilling is configured.
    pub fn can_spill(&self) -> bool {
        self.spill_config.is_some()
    }

    /// The leaf pool this buffer accounts into.
    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    /// Rows accepted so far.
    pub fn num_input_rows(&self) -> usize {
        self.num_input_rows
    }

    /// Spill runs written so far.
    pub fn num_spill_runs(&self) -> u64 {
        self.num_spill_runs
    }

    /// Decide whether `input` fits the current reservation, spilling
    /// internally when a spill trigger fires. A `ReserveThenRetry` result asks
    /// the caller to grow the reservation inside a reclaimable window (the
    /// arbitrator may reclaim this very operator to satisfy it) and to spill
    /// on refusal.
    pub fn ensure_input_fits(&mut self, input: &RecordBatch) -> Result<InputFits> {
        let (test_spill_pct, spill_threshold, growth_pct) = match &self.spill_config {
            None => return Ok(InputFits::Fits),
            Some(config) => (
                config.test_spill_pct,
                config.order_by_spill_memory_threshold,
                config.spillable_reservation_growth_pct,
            ),
        };
        // Nothing buffered: nothing to spill, let the reservation grow.
        if self.batches.is_empty() {
            return Ok(InputFits::Fits);
        }

        // Test-only deterministic spill injection.
        if test_spill_pct > 0 {
            self.spill_test_counter += 1;
            let mut hasher = DefaultHasher::new();
            self.spill_test_counter.hash(&mut hasher);
            if hasher.finish() % 100 < u64::from(test_spill_pct) {
                self.spill()?;
                return Ok(InputFits::Fits);
            }
        }

        // Hard memory threshold.
        let current_bytes = self.pool.current_bytes();
        if spill_threshold != 0 && current_bytes > spill_threshold {
            self.spill()?;
            return Ok(InputFits::Fits);
        }

        let estimated_incremental_bytes = input.get_array_memory_size() as u64;
        if self.pool.available_reservation() >= 2 * estimated_incremental_bytes {
            return Ok(InputFits::Fits);
        }
        let target = (2 * estimated_incremental_bytes)
            .max(current_bytes * u64::from(growth_pct) / 100);
        Ok(InputFits::ReserveThenRetry(target))
    }

    /// Append `input` to the buffer, accounting its bytes in the pool.
    pub fn append(&mut self, input: &RecordBatch) -> Result<()> {
        if self.no_more_input {
            return Err(ArborError::Execution(
                "sort buffer received input after no_more_input".to_string(),
            ));
        }
        if input.num_rows() == 0 {
            return Ok(());
        }
        let bytes = input.get_array_memory_size() as u64;
        self.pool.allocate(bytes)?;
        self.batches_bytes += bytes;
        self.batches.push(input.clone());
        self.num_input_rows += input.num_rows();
        Ok(())
    }

    /// Accept one input batch: run the spill decision, reserve inside a
    /// reclaimable window when asked to, spill on refusal, then append.
    pub fn add_input(&mut self, input: &RecordBatch) -> Result<()> {
        if let InputFits::ReserveThenRetry(target) = self.ensure_input_fits(input)? {
            let granted = {
                let _window = ReclaimableSectionGuard::new(&self.non_reclaimable_section);
                self.pool.maybe_reserve(target)?
            };
            if !granted {
                self.spill()?;
            }
        }
        self.append(input)
    }

    /// Spill all buffered rows as one sorted run and drop them from memory.
    pub fn spill(&mut self) -> Result<()> {
        if self.spill_config.is_none() {
            return Err(ArborError::Unsupported(
                "spill called on a sort buffer without spill configured".to_string(),
            ));
        }
        if self.batches.is_empty() {
            return Ok(());
        }
        if self.spiller.is_none() {
            let config = self.spill_config.as_ref().expect("spill config");
            let id = NEXT_SPILL_ID.fetch_add(1, Ordering::AcqRel);
            let dir = PathBuf::from(&config.spill_dir)
                .join(format!("sort_{}_{}_{id}", std::process::id(), self.pool.name()));
            self.spiller = Some(Spiller::new(
                dir,
                self.schema.clone(),
                self.sort_fields.clone(),
            )?);
        }
        let sorted = self.sort_buffered()?;
        self.num_spill_runs += 1;
        self.spiller
            .as_mut()
            .expect("spiller")
            .spill(&sorted)?;
        debug!(
            rows = sorted.num_rows(),
            runs = self.num_spill_runs,
            pool = self.pool.name(),
            "sort buffer spilled",
        );
        self.drop_buffered();
        self.pool.release();
        Ok(())
    }

    /// Finalize input: sort in memory, or spill the remainder and open the
    /// merge stream if any spilling happened.
    pub fn no_more_input(&mut self) -> Result<()> {
        if self.no_more_input {
            return Err(ArborError::Execution(
                "sort buffer already finished its input".to_string(),
            ));
        }
        self.no_more_input = true;
        if self.num_input_rows == 0 {
            return Ok(());
        }
        if self.spiller.is_none() {
            let sorted = self.sort_buffered()?;
            self.drop_buffered();
            let sorted_bytes = sorted.get_array_memory_size() as u64;
            self.pool.allocate(sorted_bytes)?;
            self.sorted = Some(sorted);
            self.sorted_bytes = sorted_bytes;
        } else {
            // Spill the remaining in-memory rows: spilling is not supported
            // while output is being produced, so everything must be on disk
            // before the merge starts.
            self.spill()?;
            let mut spiller = self.spiller.take().expect("spiller");
            spiller.finalize()?;
            self.merger = Some(spiller.start_merge()?);
        }
        Ok(())
    }

    /// Produce the next sorted output batch, or `None` once all rows are out.
    /// Stays `None` on further calls.
    pub fn get_output(&mut self) -> Result<Option<RecordBatch>> {
        if !self.no_more_input {
            return Err(ArborError::Execution(
                "sort buffer output requested before no_more_input".to_string(),
            ));
        }
        if self.num_output_rows >= self.num_input_rows {
            return Ok(None);
        }
        let remaining = self.num_input_rows - self.num_output_rows;
        let batch_rows = remaining.min(self.output_batch_size);
        let batch = match &mut self.merger {
            Some(merger) => merger.next_batch(batch_rows)?.ok_or_else(|| {
                ArborError::Execution("spill merge ended before all rows were produced".to_string())
            })?,
            None => {
                let sorted = self.sorted.as_ref().ok_or_else(|| {
                    ArborError::Execution("sorted rows missing from sort buffer".to_string())
                })?;
                sorted.slice(self.num_output_rows, batch_rows)
            }
        };
        self.num_output_rows += batch.num_rows();
        Ok(Some(batch))
    }

    /// Drop all state and return the accounted bytes to the pool. Idempotent.
    pub fn clear(&mut self) {
        self.drop_buffered();
        if self.sorted.take().is_some() {
            self.pool.free(self.sorted_bytes);
            self.sorted_bytes = 0;
        }
        self.merger = None;
        self.spiller = None;
        self.pool.release();
    }

    fn drop_buffered(&mut self) {
        if !self.batches.is_empty() {
            self.batches.clear();
        }
        if self.batches_bytes > 0 {
            self.pool.free(self.batches_bytes);
            self.batches_bytes = 0;
        }
    }

    fn sort_buffered(&self) -> Result<RecordBatch> {
        let merged = concat_batches(&self.schema, self.batches.iter())
            .map_err(|e| ArborError::Execution(format!("sort concat failed: {e}")))?;
        let columns: Vec<SortColumn> = self
            .sort_fields
            .iter()
            .map(|field| SortColumn {
                values: merged.column(field.column).clone(),
                options: Some(field.options),
            })
            .collect();
        let indices = lexsort_to_indices(&columns, None)
            .map_err(|e| ArborError::Execution(format!("sort failed: {e}")))?;
        let arrays = merged
            .columns()
            .iter()
            .map(|column| {
                take(column.as_ref(), &indices, None)
                    .map_err(|e| ArborError::Execution(format!("sort take failed: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        RecordBatch::try_new(self.schema.clone(), arrays)
            .map_err(|e| ArborError::Execution(format!("sorted batch build failed: {e}")))
    }
}

impl Drop for SortBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_common::MemoryConfig;
    use arbor_memory::MemoryManager;
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

    fn column_values(batch: &RecordBatch) -> Vec<i64> {
        let array = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64");
        (0..array.len()).map(|i| array.value(i)).collect()
    }

    fn test_spill_config(tag: &str) -> SpillConfig {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        SpillConfig {
            spill_enabled: true,
            spill_dir: std::env::temp_dir()
                .join(format!("arbor_sort_test_{tag}_{nanos}"))
                .to_string_lossy()
                .into_owned(),
            ..SpillConfig::default()
        }
    }

    struct TestPool {
        leaf: Arc<MemoryPool>,
        _root: Arc<MemoryPool>,
        _manager: Arc<MemoryManager>,
    }

    fn leaf_pool(name: &str) -> TestPool {
        let manager = MemoryManager::new(&MemoryConfig::default()).expect("manager");
        let root = manager
            .add_root_pool(&format!("{name}-root"), 1 << 30, None)
            .expect("root");
        let leaf = root.add_leaf_child(name).expect("leaf");
        TestPool {
            leaf,
            _root: root,
            _manager: manager,
        }
    }

    fn drain(buffer: &mut SortBuffer) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(batch) = buffer.get_output().expect("output") {
            assert!(batch.num_rows() <= 3);
            out.extend(column_values(&batch));
        }
        out
    }

    #[test]
    fn sorts_in_memory_and_output_is_idempotent_after_exhaustion() {
        let pool = leaf_pool("mem-sort");
        let mut buffer = SortBuffer::new(
            test_schema(),
            vec![SortField::ascending(0)],
            3,
            pool.leaf.clone(),
            Arc::new(AtomicBool::new(false)),
            None,
        )
        .expect("buffer");

        buffer
            .add_input(&int_batch(&test_schema(), vec![5, 1, 9]))
            .expect("input");
        buffer
            .add_input(&int_batch(&test_schema(), vec![4, 2]))
            .expect("input");
        buffer.no_more_input().expect("finish");

        assert_eq!(drain(&mut buffer), vec![1, 2, 4, 5, 9]);
        assert!(buffer.get_output().expect("exhausted").is_none());
        assert!(buffer.get_output().expect("still exhausted").is_none());
        buffer.clear();
    }

    #[test]
    fn forced_spill_produces_identical_output() {
        let schema = test_schema();
        let values: Vec<i64> = (0..200).map(|i| (i * 37) % 101).collect();
        let mut expected = values.clone();
        expected.sort();

        // Deterministic injection spills every batch.
        let mut config = test_spill_config("forced");
        config.test_spill_pct = 100;
        let pool = leaf_pool("spill-sort");
        let mut buffer = SortBuffer::new(
            schema.clone(),
            vec![SortField::ascending(0)],
            3,
            pool.leaf.clone(),
            Arc::new(AtomicBool::new(false)),
            Some(config.clone()),
        )
        .expect("buffer");

        for chunk in values.chunks(10) {
            buffer
                .add_input(&int_batch(&schema, chunk.to_vec()))
                .expect("input");
        }
        buffer.no_more_input().expect("finish");
        assert!(buffer.num_spill_runs() > 1);

        assert_eq!(drain(&mut buffer), expected);
        assert!(buffer.get_output().expect("exhausted").is_none());
        buffer.clear();
        let _ = std::fs::remove_dir_all(&config.spill_dir);
    }

    #[test]
    fn threshold_triggers_spill() {
        let schema = test_schema();
        let mut config = test_spill_config("threshold");
        config.order_by_spill_memory_threshold = 1;
        let pool = leaf_pool("threshold-sort");
        let mut buffer = SortBuffer::new(
            schema.clone(),
            vec![SortField::ascending(0)],
            3,
            pool.leaf.clone(),
            Arc::new(AtomicBool::new(false)),
            Some(config.clone()),
        )
        .expect("buffer");

        buffer
            .add_input(&int_batch(&schema, vec![3, 1]))
            .expect("first input");
        // The second input sees current bytes above the threshold and spills.
        buffer
            .add_input(&int_batch(&schema, vec![2]))
            .expect("second input");
        assert_eq!(buffer.num_spill_runs(), 1);
        buffer.no_more_input().expect("finish");
        assert_eq!(drain(&mut buffer), vec![1, 2, 3]);
        buffer.clear();
        let _ = std::fs::remove_dir_all(&config.spill_dir);
    }

    #[test]
    fn empty_input_produces_no_output() {
        let pool = leaf_pool("empty-sort");
        let mut buffer = SortBuffer::new(
            test_schema(),
            vec![SortField::ascending(0)],
            3,
            pool.leaf.clone(),
            Arc::new(AtomicBool::new(false)),
            None,
        )
        .expect("buffer");
        buffer.no_more_input().expect("finish");
        assert!(buffer.get_output().expect("no rows").is_none());
        buffer.clear();
    }
}
