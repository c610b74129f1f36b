//! Spill runs and their k-way merge.
//!
//! A [`Spiller`] writes already-sorted record batches as arrow IPC stream
//! files ("runs") under a per-operator directory. Once finalized, a
//! [`SpillMerger`] merges the runs back into one ordered stream of batches.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use arbor_common::metrics::global_metrics;
use arbor_common::{ArborError, Result};
use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::compute::{concat_batches, SortOptions};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use tracing::info;

/// One sort key: a column index plus its sort direction and null placement.
#[derive(Debug, Clone, Copy)]
pub struct SortField {
    /// Index of the key column in the operator schema.
    pub column: usize,
    /// Direction and null placement, matching the in-memory sort.
    pub options: SortOptions,
}

impl SortField {
    /// Ascending sort with arrow's default null placement.
    pub fn ascending(column: usize) -> Self {
        Self {
            column,
            options: SortOptions::default(),
        }
    }
}

/// A sort key value extracted from one row, used to order merge streams.
#[derive(Debug, Clone)]
enum KeyValue {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

fn key_value(array: &ArrayRef, row: usize) -> Result<KeyValue> {
    if array.is_null(row) {
        return Ok(KeyValue::Null);
    }
    let value = match array.data_type() {
        DataType::Boolean => KeyValue::Boolean(
            array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .expect("boolean array")
                .value(row),
        ),
        DataType::Int64 => KeyValue::Int64(
            array
                .as_any()
                .downcast_ref::<Int64Array>()
                .expect("int64 array")
                .value(row),
        ),
        DataType::Float64 => KeyValue::Float64(
            array
                .as_any()
                .downcast_ref::<Float64Array>()
                .expect("float64 array")
                .value(row),
        ),
        DataType::Utf8 => KeyValue::Utf8(
            array
                .as_any()
                .downcast_ref::<StringArray>()
                .expect("utf8 array")
                .value(row)
                .to_string(),
        ),
        other => {
            return Err(ArborError::Unsupported(format!(
                "sort key type {other:?} is not supported by the spill merge"
            )))
        }
    };
    Ok(value)
}

/// Compare two key values under one sort field's options, consistently with
/// the arrow lexicographic sort: null placement follows `nulls_first` and is
/// not flipped by `descending`.
fn compare_values(lhs: &KeyValue, rhs: &KeyValue, options: SortOptions) -> Ordering {
    use KeyValue::*;
    let ordering = match (lhs, rhs) {
        (Null, Null) => return Ordering::Equal,
        (Null, _) => {
            return if options.nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (_, Null) => {
            return if options.nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (Boolean(l), Boolean(r)) => l.cmp(r),
        (Int64(l), Int64(r)) => l.cmp(r),
        (Float64(l), Float64(r)) => l.total_cmp(r),
        (Utf8(l), Utf8(r)) => l.cmp(r),
        _ => Ordering::Equal,
    };
    if options.descending {
        ordering.reverse()
    } else {
        ordering
    }
}

fn compare_keys(lhs: &[KeyValue], rhs: &[KeyValue], fields: &[SortField]) -> Ordering {
    for ((l, r), field) in lhs.iter().zip(rhs.iter()).zip(fields.iter()) {
        let ordering = compare_values(l, r, field.options);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Writes sorted spill runs for one operator.
pub struct Spiller {
    dir: PathBuf,
    schema: SchemaRef,
    sort_fields: Arc<Vec<SortField>>,
    files: Vec<PathBuf>,
    spilled_rows: usize,
    finalized: bool,
}

impl Spiller {
    /// Create a spiller writing runs under `dir` (created if missing).
    pub fn new(
        dir: impl Into<PathBuf>,
        schema: SchemaRef,
        sort_fields: Vec<SortField>,
    ) -> Result<Spiller> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Spiller {
            dir,
            schema,
            sort_fields: Arc::new(sort_fields),
            files: Vec::new(),
            spilled_rows: 0,
            finalized: false,
        })
    }

    /// Number of runs written so far.
    pub fn num_runs(&self) -> usize {
        self.files.len()
    }

    /// Total rows spilled so far.
    pub fn spilled_rows(&self) -> usize {
        self.spilled_rows
    }

    /// Write one sorted batch as the next spill run.
    pub fn spill(&mut self, sorted: &RecordBatch) -> Result<()> {
        if self.finalized {
            return Err(ArborError::Execution(
                "cannot spill after the spiller was finalized".to_string(),
            ));
        }
        if sorted.num_rows() == 0 {
            return Ok(());
        }
        let started = Instant::now();
        let path = self.dir.join(format!("run_{}.arrow", self.files.len()));
        let file = File::create(&path)?;
        let mut writer = StreamWriter::try_new(BufWriter::new(file), self.schema.as_ref())
            .map_err(|e| ArborError::Execution(format!("spill writer init failed: {e}")))?;
        writer
            .write(sorted)
            .map_err(|e| ArborError::Execution(format!("spill write failed: {e}")))?;
        writer
            .finish()
            .map_err(|e| ArborError::Execution(format!("spill finish failed: {e}")))?;
        let mut inner = writer
            .into_inner()
            .map_err(|e| ArborError::Execution(format!("spill writer teardown failed: {e}")))?;
        inner.flush()?;

        let bytes = fs::metadata(&path)?.len();
        global_metrics().record_spill("order_by", bytes, started.elapsed().as_secs_f64());
        info!(
            run = self.files.len(),
            rows = sorted.num_rows(),
            bytes,
            path = %path.display(),
            "spilled sort run",
        );
        self.spilled_rows += sorted.num_rows();
        self.files.push(path);
        Ok(())
    }

    /// Seal the run set; no further spills are accepted.
    pub fn finalize(&mut self) -> Result<()> {
        self.finalized = true;
        Ok(())
    }

    /// Open a k-way merge over the finalized runs.
    pub fn start_merge(self) -> Result<SpillMerger> {
        if !self.finalized {
            return Err(ArborError::Execution(
                "spiller must be finalized before merging".to_string(),
            ));
        }
        SpillMerger::new(self.files, self.schema, self.sort_fields)
    }
}

struct RunStream {
    reader: StreamReader<BufReader<File>>,
    batch: Option<RecordBatch>,
    row: usize,
}

impl RunStream {
    fn open(path: &PathBuf) -> Result<RunStream> {
        let file = File::open(path)?;
        let reader = StreamReader::try_new(BufReader::new(file), None)
            .map_err(|e| ArborError::Execution(format!("spill reader init failed: {e}")))?;
        let mut stream = RunStream {
            reader,
            batch: None,
            row: 0,
        };
        stream.fetch()?;
        Ok(stream)
    }

    fn fetch(&mut self) -> Result<()> {
        self.batch = self
            .reader
            .next()
            .transpose()
            .map_err(|e| ArborError::Execution(format!("spill read failed: {e}")))?;
        self.row = 0;
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        self.row += 1;
        let exhausted = self
            .batch
            .as_ref()
            .is_some_and(|batch| self.row >= batch.num_rows());
        if exhausted {
            self.fetch()?;
        }
        Ok(())
    }

    fn current_key(&self, fields: &[SortField]) -> Result<Option<Vec<KeyValue>>> {
        let Some(batch) = &self.batch else {
            return Ok(None);
        };
        let mut key = Vec::with_capacity(fields.len());
        for field in fields {
            key.push(key_value(batch.column(field.column), self.row)?);
        }
        Ok(Some(key))
    }
}

struct MergeEntry {
    key: Vec<KeyValue>,
    run: usize,
    sort_fields: Arc<Vec<SortField>>,
}

impl MergeEntry {
    fn compare(&self, other: &Self) -> Ordering {
        // Ties break on the run index, keeping the merge stable in spill order.
        compare_keys(&self.key, &other.key, &self.sort_fields)
            .then_with(|| self.run.cmp(&other.run))
    }
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

/// Merges finalized spill runs into one ordered stream of record batches.
pub struct SpillMerger {
    schema: SchemaRef,
    sort_fields: Arc<Vec<SortField>>,
    runs: Vec<RunStream>,
    heap: BinaryHeap<Reverse<MergeEntry>>,
}

impl SpillMerger {
    fn new(
        files: Vec<PathBuf>,
        schema: SchemaRef,
        sort_fields: Arc<Vec<SortField>>,
    ) -> Result<SpillMerger> {
        let mut runs = Vec::with_capacity(files.len());
        let mut heap = BinaryHeap::with_capacity(files.len());
        for (index, path) in files.iter().enumerate() {
            let stream = RunStream::open(path)?;
            if let Some(key) = stream.current_key(&sort_fields)? {
                heap.push(Reverse(MergeEntry {
                    key,
                    run: index,
                    sort_fields: sort_fields.clone(),
                }));
            }
            runs.push(stream);
        }
        Ok(SpillMerger {
            schema,
            sort_fields,
            runs,
            heap,
        })
    }

    /// Produce the next merged batch of at most `max_rows` rows, or `None`
    /// once all runs are exhausted.
    pub fn next_batch(&mut self, max_rows: usize) -> Result<Option<RecordBatch>> {
        if self.heap.is_empty() {
            return Ok(None);
        }
        let mut rows: Vec<RecordBatch> = Vec::with_capacity(max_rows.min(1024));
        while rows.len() < max_rows {
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            let run = &mut self.runs[entry.run];
            let batch = run
                .batch
                .as_ref()
                .ok_or_else(|| ArborError::Execution("merge stream out of rows".to_string()))?;
            rows.push(batch.slice(run.row, 1));
            run.advance()?;
            if let Some(key) = run.current_key(&self.sort_fields)? {
                self.heap.push(Reverse(MergeEntry {
                    key,
                    run: entry.run,
                    sort_fields: self.sort_fields.clone(),
                }));
            }
        }
        let batch = concat_batches(&self.schema, rows.iter())
            .map_err(|e| ArborError::Execution(format!("merge concat failed: {e}")))?;
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::{Field, Schema};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_spill_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("arbor_spill_test_{tag}_{nanos}"))
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

    #[test]
    fn merges_runs_in_key_order() {
        let dir = temp_spill_dir("merge");
        let schema: SchemaRef = Arc::new(Schema::new(vec![Field::new(
            "v",
            DataType::Int64,
            false,
        )]));
        let mut spiller =
            Spiller::new(&dir, schema.clone(), vec![SortField::ascending(0)]).expect("spiller");
        spiller
            .spill(&int_batch(&schema, vec![1, 4, 7]))
            .expect("run 0");
        spiller
            .spill(&int_batch(&schema, vec![2, 3, 9]))
            .expect("run 1");
        spiller
            .spill(&int_batch(&schema, vec![0, 5]))
            .expect("run 2");
        assert_eq!(spiller.num_runs(), 3);
        assert_eq!(spiller.spilled_rows(), 8);
        spiller.finalize().expect("finalize");

        let mut merger = spiller.start_merge().expect("merge");
        let mut merged = Vec::new();
        while let Some(batch) = merger.next_batch(3).expect("next") {
            assert!(batch.num_rows() <= 3);
            merged.extend(column_values(&batch));
        }
        assert_eq!(merged, vec![0, 1, 2, 3, 4, 5, 7, 9]);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn descending_keys_follow_sort_options() {
        let dir = temp_spill_dir("desc");
        let schema: SchemaRef = Arc::new(Schema::new(vec![Field::new(
            "v",
            DataType::Int64,
            false,
        )]));
        let field = SortField {
            column: 0,
            options: SortOptions {
                descending: true,
                nulls_first: true,
            },
        };
        let mut spiller = Spiller::new(&dir, schema.clone(), vec![field]).expect("spiller");
        spiller
            .spill(&int_batch(&schema, vec![9, 5, 1]))
            .expect("run 0");
        spiller
            .spill(&int_batch(&schema, vec![8, 2]))
            .expect("run 1");
        spiller.finalize().expect("finalize");

        let mut merger = spiller.start_merge().expect("merge");
        let mut merged = Vec::new();
        while let Some(batch) = merger.next_batch(10).expect("next") {
            merged.extend(column_values(&batch));
        }
        assert_eq!(merged, vec![9, 8, 5, 2, 1]);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn spill_after_finalize_is_rejected() {
        let dir = temp_spill_dir("sealed");
        let schema: SchemaRef = Arc::new(Schema::new(vec![Field::new(
            "v",
            DataType::Int64,
            false,
        )]));
        let mut spiller =
            Spiller::new(&dir, schema.clone(), vec![SortField::ascending(0)]).expect("spiller");
        spiller.finalize().expect("finalize");
        let err = spiller
            .spill(&int_batch(&schema, vec![1]))
            .expect_err("sealed");
        assert!(matches!(err, ArborError::Execution(_)));

        let _ = fs::remove_dir_all(dir);
    }
}
