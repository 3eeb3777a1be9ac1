use std::{
    fmt,
    io::{self, Read},
    sync::Arc,
};

use arrow_schema::{Schema, SchemaRef};
use bytes::{Buf, Bytes};
use parquet::{
    arrow::{
        ProjectionMask,
        arrow_reader::{
            ArrowPredicateFn, ArrowReaderMetadata, ArrowReaderOptions,
            ParquetRecordBatchReaderBuilder, RowFilter as ParquetRowFilter,
        },
    },
    errors::ParquetError,
    file::reader::{ChunkReader, Length},
};

use super::{BatchIterator, BatchProjector, FileFormat, ScanTask, ScanTaskIterator};
use crate::{
    QuarryError, Result,
    expr::Expression,
    fragment::{DataFragment, FileFragment},
    fs::{FileSource, RandomAccessFile},
    row_filter::RowFilter,
    scan::ScanOptions,
};

/// Parquet files, decoded with the `parquet` crate's Arrow reader.
///
/// Each row group becomes one [`ScanTask`]; only the root columns the scan
/// materializes are decoded.
#[derive(Debug, Default, Clone)]
pub struct ParquetFileFormat {
    reader_options: ParquetReaderOptions,
}

/// Knobs forwarded to the Arrow reader.
#[derive(Debug, Default, Clone)]
pub struct ParquetReaderOptions {
    /// Load the page index along with the footer
    pub enable_page_index: bool,
}

impl ParquetFileFormat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reader_options(mut self, reader_options: ParquetReaderOptions) -> Self {
        self.reader_options = reader_options;
        self
    }

    fn load_metadata(&self, source: &FileSource) -> Result<(SourceReader, ArrowReaderMetadata)> {
        let reader = SourceReader::new(source.open()?);
        let options =
            ArrowReaderOptions::new().with_page_index(self.reader_options.enable_page_index);
        let metadata = ArrowReaderMetadata::load(&reader, options)?;
        Ok((reader, metadata))
    }
}

impl FileFormat for ParquetFileFormat {
    fn type_name(&self) -> &'static str {
        "parquet"
    }

    fn inspect(&self, source: &FileSource) -> Result<SchemaRef> {
        let (_, metadata) = self.load_metadata(source)?;
        Ok(Arc::clone(metadata.schema()))
    }

    fn make_fragment(
        self: Arc<Self>,
        source: FileSource,
        partition_expression: Expression,
    ) -> Result<Arc<dyn DataFragment>> {
        Ok(Arc::new(FileFragment::new(source, self, partition_expression)))
    }

    fn scan_file(
        &self,
        source: &FileSource,
        partition_expression: &Expression,
        options: &Arc<ScanOptions>,
    ) -> Result<ScanTaskIterator> {
        let (reader, metadata) = self.load_metadata(source)?;
        let row_groups = metadata.metadata().num_row_groups();
        log::debug!(
            "scanning '{}': {row_groups} row groups",
            source.path()
        );
        let path: Arc<str> = Arc::from(source.path());
        let partition_expression = partition_expression.clone();
        let options = Arc::clone(options);
        Ok(Box::new((0..row_groups).map(move |row_group| {
            Ok(Arc::new(ParquetScanTask {
                path: Arc::clone(&path),
                reader: reader.clone(),
                metadata: metadata.clone(),
                row_group,
                partition_expression: partition_expression.clone(),
                options: Arc::clone(&options),
            }) as Arc<dyn ScanTask>)
        })))
    }
}

/// Decodes a single row group.
struct ParquetScanTask {
    path: Arc<str>,
    reader: SourceReader,
    metadata: ArrowReaderMetadata,
    row_group: usize,
    partition_expression: Expression,
    options: Arc<ScanOptions>,
}

impl fmt::Debug for ParquetScanTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParquetScanTask")
            .field("path", &self.path)
            .field("row_group", &self.row_group)
            .field("partition_expression", &self.partition_expression)
            .finish()
    }
}

impl ScanTask for ParquetScanTask {
    fn execute(&self) -> Result<BatchIterator> {
        let builder = ParquetRecordBatchReaderBuilder::new_with_metadata(
            self.reader.clone(),
            self.metadata.clone(),
        );
        let file_schema = Arc::clone(builder.schema());
        let roots: Vec<usize> = self
            .options
            .materialized_fields()
            .into_iter()
            .filter_map(|name| file_schema.index_of(name).ok())
            .collect();
        let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
        let mut projector =
            BatchProjector::new(Arc::clone(&self.options), &self.partition_expression)?;

        let mut builder = builder
            .with_projection(mask)
            .with_row_groups(vec![self.row_group])
            .with_batch_size(self.options.batch_size());
        if let Some(columns) =
            pushdown_columns(projector.residual(), &file_schema, self.options.dataset_schema())
        {
            log::debug!(
                "pushing {} into the decoder of '{}'",
                projector.residual().expr(),
                self.path
            );
            let filter = projector.residual().clone();
            let predicate = ArrowPredicateFn::new(
                ProjectionMask::roots(builder.parquet_schema(), columns),
                move |batch| Ok(filter.evaluate(&batch)?),
            );
            builder = builder.with_row_filter(ParquetRowFilter::new(vec![Box::new(predicate)]));
            projector = projector.with_filter_pushed_down();
        }
        let reader = builder.build()?;

        let batches: BatchIterator = Box::new(reader.map(|batch| batch.map_err(QuarryError::from)));
        Ok(projector.project_all(batches))
    }
}

/// Root column indices the decoder needs to evaluate `residual` itself.
///
/// `None` when there is nothing to filter, or when a referenced field is
/// absent from the file or stored with a type other than the dataset's: those
/// rows must first be adapted by the [`BatchProjector`].
fn pushdown_columns(
    residual: &RowFilter,
    file_schema: &Schema,
    dataset_schema: &Schema,
) -> Option<Vec<usize>> {
    if residual.is_pass_through() {
        return None;
    }
    residual
        .expr()
        .field_names()
        .into_iter()
        .map(|name| {
            let index = file_schema.index_of(name).ok()?;
            let expected = dataset_schema.field_with_name(name).ok()?;
            (file_schema.field(index).data_type() == expected.data_type()).then_some(index)
        })
        .collect()
}

/// Adapts a [`RandomAccessFile`] to the parquet reader.
#[derive(Clone, Debug)]
pub(crate) struct SourceReader {
    file: Arc<dyn RandomAccessFile>,
}

impl SourceReader {
    pub(crate) fn new(file: Arc<dyn RandomAccessFile>) -> Self {
        Self { file }
    }
}

impl Length for SourceReader {
    fn len(&self) -> u64 {
        self.file.size()
    }
}

impl ChunkReader for SourceReader {
    type T = SourceRead;

    fn get_read(&self, start: u64) -> Result<Self::T, ParquetError> {
        Ok(SourceRead {
            file: Arc::clone(&self.file),
            position: start,
            buffered: Bytes::new(),
        })
    }

    fn get_bytes(&self, start: u64, length: usize) -> Result<Bytes, ParquetError> {
        Ok(self.file.read_at(start, length)?)
    }
}

/// Smallest `read_at` issued by [`SourceRead`].
const READ_AHEAD: usize = 256;

/// Sequential reader from an offset to the end of a file.
///
/// Bytes are fetched with `read_at` only as they are consumed. Reads smaller
/// than [`READ_AHEAD`] (page headers are decoded a few bytes at a time) are
/// served from one chunk of that size; larger ones go straight to the file.
pub(crate) struct SourceRead {
    file: Arc<dyn RandomAccessFile>,
    position: u64,
    buffered: Bytes,
}

impl Read for SourceRead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.buffered.is_empty() {
            let remaining = self.file.size().saturating_sub(self.position);
            if remaining == 0 {
                return Ok(0);
            }
            let wanted = buf.len().max(READ_AHEAD);
            let len = usize::try_from(remaining).map_or(wanted, |remaining| remaining.min(wanted));
            self.buffered = self
                .file
                .read_at(self.position, len)
                .map_err(io::Error::other)?;
            self.position += len as u64;
        }
        let len = buf.len().min(self.buffered.len());
        buf[..len].copy_from_slice(&self.buffered[..len]);
        self.buffered.advance(len);
        Ok(len)
    }
}
