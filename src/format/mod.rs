//! File formats and the scan tasks they produce.
//!
//! A [`FileFormat`] is the only component that decodes bytes. Everything it
//! yields passes through a [`BatchProjector`], which adapts the physical
//! batches of one file to the dataset schema of the scan.

use std::{fmt::Debug, sync::Arc};

use arrow::compute::cast;
use arrow_array::{ArrayRef, RecordBatch, RecordBatchOptions, new_null_array};
use arrow_schema::{Field, Schema, SchemaRef};

use crate::{
    Result,
    expr::{Expression, PartitionBinding},
    fragment::DataFragment,
    fs::FileSource,
    memory::MemoryReservation,
    row_filter::RowFilter,
    scan::ScanOptions,
};

mod parquet;

pub use self::parquet::{ParquetFileFormat, ParquetReaderOptions};

/// Lazy sequence of batches produced by one task.
pub type BatchIterator = Box<dyn Iterator<Item = Result<RecordBatch>> + Send>;

/// Lazy sequence of tasks.
pub type ScanTaskIterator = Box<dyn Iterator<Item = Result<Arc<dyn ScanTask>>> + Send>;

/// Independently executable unit of decode work.
pub trait ScanTask: Send + Sync + Debug {
    /// Start decoding. Stopping early and dropping the iterator releases every
    /// resource the task acquired.
    fn execute(&self) -> Result<BatchIterator>;
}

/// Capability to read one file format.
pub trait FileFormat: Send + Sync + Debug {
    fn type_name(&self) -> &'static str;

    /// Physical schema of the file.
    fn inspect(&self, source: &FileSource) -> Result<SchemaRef>;

    /// Wrap a source into a fragment scanned by this format.
    fn make_fragment(
        self: Arc<Self>,
        source: FileSource,
        partition_expression: Expression,
    ) -> Result<Arc<dyn DataFragment>>;

    /// Tasks that decode `source`, yielding batches of the scan's projected
    /// schema with the residual filter applied.
    fn scan_file(
        &self,
        source: &FileSource,
        partition_expression: &Expression,
        options: &Arc<ScanOptions>,
    ) -> Result<ScanTaskIterator>;
}

/// Adapts physical batches of one fragment to a scan.
///
/// For each field the scan needs, in order of preference: the file's column
/// (cast to the dataset type if needed), the fragment's partition value, or
/// nulls. Then the part of the filter not already decided by the partition
/// is applied and the batch is narrowed to the projection. The memory of the
/// last batch handed out stays reserved until the next one replaces it or
/// the projector is dropped.
#[derive(Debug)]
pub struct BatchProjector {
    options: Arc<ScanOptions>,
    partition: PartitionBinding,
    residual: RowFilter,
    materialized: SchemaRef,
    reservation: MemoryReservation,
}

impl BatchProjector {
    /// Projector for one fragment of the scan described by `options`.
    pub fn new(options: Arc<ScanOptions>, partition_expression: &Expression) -> Result<Self> {
        let partition = partition_expression.known_field_values();
        let residual = RowFilter::new(options.filter().simplify_with_guarantee(partition_expression));
        let fields = options
            .materialized_fields()
            .into_iter()
            .map(|name| {
                let field = options.dataset_schema().field_with_name(name)?;
                Ok(Field::new(name, field.data_type().clone(), true))
            })
            .collect::<Result<Vec<_>>>()?;
        let reservation = MemoryReservation::new(Arc::clone(options.pool()));
        Ok(Self {
            options,
            partition,
            residual,
            materialized: Arc::new(Schema::new(fields)),
            reservation,
        })
    }

    /// The part of the scan filter left undecided by the partition.
    pub fn residual(&self) -> &RowFilter {
        &self.residual
    }

    /// Skip the residual filter because the decoder already applied it.
    pub fn with_filter_pushed_down(mut self) -> Self {
        self.residual = RowFilter::new(Expression::literal_true());
        self
    }

    /// Adapt, filter and narrow one physical batch. Fails if the pool cannot
    /// hold the result.
    pub fn project(&mut self, batch: RecordBatch) -> Result<RecordBatch> {
        let rows = batch.num_rows();
        let columns = self
            .materialized
            .fields()
            .iter()
            .map(|field| self.column_for(&batch, field, rows))
            .collect::<Result<Vec<_>>>()?;
        let full = RecordBatch::try_new_with_options(
            Arc::clone(&self.materialized),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(rows)),
        )?;
        let filtered = self.residual.apply(full)?;

        let projected = self.options.projected_schema();
        let columns = projected
            .fields()
            .iter()
            .map(|field| {
                let index = filtered.schema().index_of(field.name())?;
                Ok(Arc::clone(filtered.column(index)))
            })
            .collect::<Result<Vec<_>>>()?;
        let out = RecordBatch::try_new_with_options(
            Arc::clone(projected),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(filtered.num_rows())),
        )?;
        self.reservation.try_resize(out.get_array_memory_size())?;
        Ok(out)
    }

    /// Map every batch of `batches` through the projector.
    pub fn project_all(mut self, batches: BatchIterator) -> BatchIterator {
        Box::new(batches.map(move |batch| self.project(batch?)))
    }

    fn column_for(&self, batch: &RecordBatch, field: &Field, rows: usize) -> Result<ArrayRef> {
        let data_type = field.data_type();
        if let Some(column) = batch.column_by_name(field.name()) {
            if column.data_type() == data_type {
                return Ok(Arc::clone(column));
            }
            return Ok(cast(column, data_type)?);
        }
        if let Some(value) = self.partition.get(field.name()) {
            let array = value.to_array_of_size(rows)?;
            if array.data_type() == data_type {
                return Ok(array);
            }
            return Ok(cast(&array, data_type)?);
        }
        Ok(new_null_array(data_type, rows))
    }
}
