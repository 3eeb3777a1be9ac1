//! Scan configuration and execution.
//!
//! A [`ScannerBuilder`] validates projection, filter and batch size against
//! the source schema; [`ScannerBuilder::finish`] freezes them into an
//! immutable [`ScanOptions`] shared by every task of the resulting
//! [`Scanner`].

use std::{collections::HashSet, sync::Arc};

use arrow::compute::concat_batches;
use arrow_array::RecordBatch;
use arrow_schema::{Schema, SchemaRef};

use crate::{
    QuarryError, Result,
    expr::{Expression, TriState},
    format::{BatchIterator, ScanTaskIterator},
    fragment::DataFragment,
    memory::{MemoryPool, default_memory_pool},
    source::DataSource,
};

/// Rows per batch when the builder is not told otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 32768;

/// Shared resources of a scan.
#[derive(Clone, Debug)]
pub struct ScanContext {
    pool: Arc<dyn MemoryPool>,
}

impl Default for ScanContext {
    fn default() -> Self {
        Self::new(default_memory_pool())
    }
}

impl ScanContext {
    pub fn new(pool: Arc<dyn MemoryPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<dyn MemoryPool> {
        &self.pool
    }
}

/// Immutable configuration threaded through fragments, formats and tasks.
#[derive(Debug)]
pub struct ScanOptions {
    filter: Expression,
    projection: Option<Vec<String>>,
    dataset_schema: SchemaRef,
    projected_schema: SchemaRef,
    batch_size: usize,
    context: ScanContext,
}

impl ScanOptions {
    /// Options reading every column of `dataset_schema` without filtering.
    pub fn new(dataset_schema: SchemaRef) -> Self {
        Self {
            filter: Expression::literal_true(),
            projection: None,
            projected_schema: Arc::clone(&dataset_schema),
            dataset_schema,
            batch_size: DEFAULT_BATCH_SIZE,
            context: ScanContext::default(),
        }
    }

    /// Filter bound to the dataset schema
    pub fn filter(&self) -> &Expression {
        &self.filter
    }

    pub fn projection(&self) -> Option<&[String]> {
        self.projection.as_deref()
    }

    pub fn dataset_schema(&self) -> &SchemaRef {
        &self.dataset_schema
    }

    /// Schema of every batch the scan yields
    pub fn projected_schema(&self) -> &SchemaRef {
        &self.projected_schema
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn context(&self) -> &ScanContext {
        &self.context
    }

    pub fn pool(&self) -> &Arc<dyn MemoryPool> {
        self.context.pool()
    }

    /// Dataset fields a task has to produce: the projection plus every field
    /// the filter reads, in dataset order.
    pub fn materialized_fields(&self) -> Vec<&str> {
        let filter_fields = self.filter.field_names();
        let projected: Option<HashSet<&str>> = self
            .projection
            .as_ref()
            .map(|cols| cols.iter().map(String::as_str).collect());
        self.dataset_schema
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .filter(|name| {
                projected.as_ref().is_none_or(|p| p.contains(name)) || filter_fields.contains(name)
            })
            .collect()
    }
}

/// Configures a scan over a [`DataSource`].
///
/// # Example
/// ```
/// use std::sync::Arc;
///
/// use arrow_array::{Int32Array, RecordBatch};
/// use arrow_schema::{DataType, Field, Schema};
/// use quarry::{DataFragment, InMemoryFragment, ScannerBuilder, SimpleDataSource, col, lit};
///
/// let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int32, false)]));
/// let batch = RecordBatch::try_new(
///     schema.clone(),
///     vec![Arc::new(Int32Array::from(vec![1, 2, 3]))],
/// )
/// .unwrap();
/// let fragment: Arc<dyn DataFragment> = Arc::new(InMemoryFragment::new(vec![batch]));
/// let source = SimpleDataSource::new(schema, vec![fragment]);
///
/// let scanner = ScannerBuilder::new(Arc::new(source))
///     .filter(col("x").gt(lit(1)))
///     .unwrap()
///     .finish()
///     .unwrap();
/// assert_eq!(scanner.count_rows().unwrap(), 2);
/// ```
#[derive(Debug)]
pub struct ScannerBuilder {
    source: Arc<dyn DataSource>,
    schema: SchemaRef,
    projection: Option<Vec<String>>,
    filter: Expression,
    batch_size: usize,
    context: ScanContext,
}

impl ScannerBuilder {
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        let schema = source.schema();
        Self {
            source,
            schema,
            projection: None,
            filter: Expression::literal_true(),
            batch_size: DEFAULT_BATCH_SIZE,
            context: ScanContext::default(),
        }
    }

    /// Restrict the output to `columns`, in the given order.
    ///
    /// Fails with [`QuarryError::FieldNotFound`] for a column missing from the
    /// source schema and [`QuarryError::InvalidOption`] for duplicates.
    pub fn project<I, S>(mut self, columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let mut seen = HashSet::new();
        for column in &columns {
            if self.schema.field_with_name(column).is_err() {
                return Err(QuarryError::FieldNotFound {
                    name: column.clone(),
                });
            }
            if !seen.insert(column.as_str()) {
                return Err(QuarryError::InvalidOption {
                    reason: format!("column '{column}' is projected twice"),
                });
            }
        }
        self.projection = Some(columns);
        Ok(self)
    }

    /// Set the filter, validated and bound to the source schema.
    pub fn filter(mut self, filter: Expression) -> Result<Self> {
        self.filter = filter.bind(&self.schema)?;
        Ok(self)
    }

    pub fn batch_size(mut self, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(QuarryError::InvalidOption {
                reason: "batch size must be positive".to_string(),
            });
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    pub fn context(mut self, context: ScanContext) -> Self {
        self.context = context;
        self
    }

    pub fn finish(self) -> Result<Scanner> {
        let projected_schema = match &self.projection {
            None => Arc::clone(&self.schema),
            Some(columns) => {
                let fields = columns
                    .iter()
                    .map(|c| self.schema.field_with_name(c).cloned())
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Arc::new(Schema::new_with_metadata(
                    fields,
                    self.schema.metadata().clone(),
                ))
            }
        };
        let options = ScanOptions {
            filter: self.filter,
            projection: self.projection,
            dataset_schema: self.schema,
            projected_schema,
            batch_size: self.batch_size,
            context: self.context,
        };
        Ok(Scanner {
            source: self.source,
            options: Arc::new(options),
        })
    }
}

/// A finalized scan. Cheap to share; every call to [`Scanner::scan`] starts
/// a fresh pass over the source.
#[derive(Clone, Debug)]
pub struct Scanner {
    source: Arc<dyn DataSource>,
    options: Arc<ScanOptions>,
}

/// `true` when the fragment's partition values make the filter definitely false.
pub(crate) fn is_pruned(filter: &Expression, fragment: &dyn DataFragment) -> bool {
    let partition = fragment.partition_expression();
    if partition.is_literal_false() {
        return true;
    }
    filter.evaluate(&partition.known_field_values()) == TriState::False
}

impl Scanner {
    pub fn options(&self) -> &Arc<ScanOptions> {
        &self.options
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    /// Schema of the batches this scanner yields.
    pub fn schema(&self) -> &SchemaRef {
        self.options.projected_schema()
    }

    /// Lazily enumerate the scan tasks of all fragments that survive
    /// partition pruning, in fragment order.
    ///
    /// A fragment that fails to produce tasks contributes a single error item.
    pub fn scan(&self) -> ScanTaskIterator {
        let options = Arc::clone(&self.options);
        let tasks = self
            .source
            .fragments()
            .filter(move |fragment| {
                let pruned = is_pruned(options.filter(), fragment.as_ref());
                if pruned {
                    log::debug!(
                        "pruned fragment {} with partition {}",
                        fragment.identity().as_deref().unwrap_or("<anonymous>"),
                        fragment.partition_expression()
                    );
                }
                !pruned
            })
            .flat_map({
                let options = Arc::clone(&self.options);
                move |fragment| -> ScanTaskIterator {
                    match fragment.scan(&options) {
                        Ok(tasks) => tasks,
                        Err(err) => Box::new(std::iter::once(Err(err))),
                    }
                }
            });
        Box::new(tasks)
    }

    /// All batches of all tasks, in task order.
    ///
    /// An error while driving a task is yielded once and ends that task; the
    /// remaining tasks are still executed.
    pub fn batches(&self) -> BatchIterator {
        Box::new(TaskBatches {
            tasks: self.scan(),
            current: None,
        })
    }

    /// Collect every batch, failing on the first error.
    pub fn to_batches(&self) -> Result<Vec<RecordBatch>> {
        self.batches().collect()
    }

    /// Concatenate the whole scan into a single batch.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let batches = self.to_batches()?;
        Ok(concat_batches(self.schema(), &batches)?)
    }

    pub fn count_rows(&self) -> Result<usize> {
        self.batches()
            .try_fold(0, |rows, batch| Ok(rows + batch?.num_rows()))
    }

    /// Execute tasks on tokio's blocking pool, yielding batches in task order.
    ///
    /// Up to `concurrency` tasks run ahead of the one being consumed (zero
    /// behaves as one). Each task hands its batches over a channel holding a
    /// single batch, so a slow consumer pauses decoding instead of letting
    /// output pile up, and the memory a task reserved stays charged until its
    /// batches are taken. Dropping the stream stops every running task.
    #[cfg(feature = "tokio")]
    pub fn scan_stream(
        &self,
        concurrency: usize,
    ) -> impl futures_util::Stream<Item = Result<RecordBatch>> + Send + 'static {
        use futures_util::{StreamExt, stream};
        use tokio::sync::mpsc;

        stream::iter(self.scan())
            .map(|task| async move {
                let (tx, rx) = mpsc::channel(1);
                let handle = tokio::task::spawn_blocking(move || {
                    let batches = match task.and_then(|task| task.execute()) {
                        Ok(batches) => batches,
                        Err(err) => {
                            let _ = tx.blocking_send(Err(err));
                            return;
                        }
                    };
                    for batch in batches {
                        let failed = batch.is_err();
                        // A closed channel means the stream was dropped.
                        if tx.blocking_send(batch).is_err() || failed {
                            break;
                        }
                    }
                });
                stream::unfold((rx, Some(handle)), |(mut rx, handle)| async move {
                    if let Some(batch) = rx.recv().await {
                        return Some((batch, (rx, handle)));
                    }
                    match handle?.await {
                        Ok(()) => None,
                        Err(err) => {
                            log::warn!("scan task did not complete: {err}");
                            let failed = Err(QuarryError::TaskFailed {
                                reason: err.to_string(),
                            });
                            Some((failed, (rx, None)))
                        }
                    }
                })
            })
            .buffered(concurrency.max(1))
            .flatten()
    }
}

struct TaskBatches {
    tasks: ScanTaskIterator,
    current: Option<BatchIterator>,
}

impl Iterator for TaskBatches {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(Ok(batch)) => return Some(Ok(batch)),
                    Some(Err(err)) => {
                        self.current = None;
                        return Some(Err(err));
                    }
                    None => self.current = None,
                }
            }
            match self.tasks.next()? {
                Ok(task) => match task.execute() {
                    Ok(batches) => self.current = Some(batches),
                    Err(err) => return Some(Err(err)),
                },
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
