//! Data fragments: independently scannable units of physical data.

use std::{fmt::Debug, sync::Arc};

use arrow_array::RecordBatch;

use crate::{
    Result,
    expr::Expression,
    format::{BatchIterator, BatchProjector, FileFormat, ScanTask, ScanTaskIterator},
    fs::FileSource,
    scan::ScanOptions,
};

/// One unit of physical data plus the partition expression that selects it.
///
/// Fragments are immutable and may be scanned any number of times,
/// concurrently.
pub trait DataFragment: Send + Sync + Debug {
    /// Tasks reading this fragment under `options`.
    fn scan(&self, options: &Arc<ScanOptions>) -> Result<ScanTaskIterator>;

    /// Predicate known to hold for every row of the fragment; `true` when
    /// nothing is known.
    fn partition_expression(&self) -> &Expression;

    /// Stable name of the physical data, when there is one. Fragments with
    /// equal identities read the same bytes.
    fn identity(&self) -> Option<String> {
        None
    }
}

/// A file (or byte range of a file) read through a [`FileFormat`].
#[derive(Debug, Clone)]
pub struct FileFragment {
    source: FileSource,
    format: Arc<dyn FileFormat>,
    partition_expression: Expression,
}

impl FileFragment {
    pub fn new(
        source: FileSource,
        format: Arc<dyn FileFormat>,
        partition_expression: Expression,
    ) -> Self {
        Self {
            source,
            format,
            partition_expression,
        }
    }

    pub fn source(&self) -> &FileSource {
        &self.source
    }

    pub fn format(&self) -> &Arc<dyn FileFormat> {
        &self.format
    }
}

impl DataFragment for FileFragment {
    fn scan(&self, options: &Arc<ScanOptions>) -> Result<ScanTaskIterator> {
        self.format
            .scan_file(&self.source, &self.partition_expression, options)
    }

    fn partition_expression(&self) -> &Expression {
        &self.partition_expression
    }

    fn identity(&self) -> Option<String> {
        let format = self.format.type_name();
        Some(match self.source.range() {
            Some(range) => format!(
                "{format}:{}[{}..{}]",
                self.source.path(),
                range.start,
                range.end
            ),
            None => format!("{format}:{}", self.source.path()),
        })
    }
}

/// Record batches already in memory; one task per batch.
#[derive(Debug, Clone)]
pub struct InMemoryFragment {
    batches: Arc<[RecordBatch]>,
    partition_expression: Expression,
}

impl InMemoryFragment {
    /// A fragment over `batches`, with nothing known about its partition.
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self {
            batches: batches.into(),
            partition_expression: Expression::literal_true(),
        }
    }

    /// Attach the predicate every row of the fragment satisfies.
    pub fn with_partition_expression(mut self, partition_expression: Expression) -> Self {
        self.partition_expression = partition_expression;
        self
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }
}

impl DataFragment for InMemoryFragment {
    fn scan(&self, options: &Arc<ScanOptions>) -> Result<ScanTaskIterator> {
        let batches = Arc::clone(&self.batches);
        let partition_expression = self.partition_expression.clone();
        let options = Arc::clone(options);
        Ok(Box::new((0..batches.len()).map(move |index| {
            Ok(Arc::new(InMemoryScanTask {
                batch: batches[index].clone(),
                partition_expression: partition_expression.clone(),
                options: Arc::clone(&options),
            }) as Arc<dyn ScanTask>)
        })))
    }

    fn partition_expression(&self) -> &Expression {
        &self.partition_expression
    }
}

#[derive(Debug)]
struct InMemoryScanTask {
    batch: RecordBatch,
    partition_expression: Expression,
    options: Arc<ScanOptions>,
}

impl ScanTask for InMemoryScanTask {
    fn execute(&self) -> Result<BatchIterator> {
        let batch = self.batch.clone();
        let batch_size = self.options.batch_size();
        let rows = batch.num_rows();
        let slices = (0..rows)
            .step_by(batch_size)
            .map(move |offset| -> Result<RecordBatch> {
                Ok(batch.slice(offset, batch_size.min(rows - offset)))
            });
        let projector = BatchProjector::new(Arc::clone(&self.options), &self.partition_expression)?;
        Ok(projector.project_all(Box::new(slices)))
    }
}
