//! Partitioned dataset scanning over Arrow.
//!
//! A [`FileSystemDataSourceDiscovery`] walks a directory tree, infers
//! partition keys from paths and unifies file schemas into a
//! [`FileSystemDataSource`]. A [`Scanner`] built over any [`DataSource`]
//! prunes fragments whose partition expression contradicts the filter and
//! hands the rest to their [`FileFormat`] as independent [`ScanTask`]s.
//!
//! The [`ffi`] module moves single arrays across runtimes through the C
//! data interface descriptor.

mod discovery;
mod error;
mod expr;
pub mod ffi;
mod format;
mod fragment;
mod fs;
mod memory;
mod partition;
mod row_filter;
mod scan;
mod source;

pub use discovery::{
    DiscoveryOptions, DiscoveryOptionsBuilder, DiscoveryReport, FileSystemDataSourceDiscovery,
    Partitioning, unify_schemas,
};
pub use error::{QuarryError, Result};
pub use expr::{
    Binding, CmpOp, ExprArena, ExprId, ExprNode, Expression, PartitionBinding, TriState, col, lit,
};
pub use format::{
    BatchIterator, BatchProjector, FileFormat, ParquetFileFormat, ParquetReaderOptions, ScanTask,
    ScanTaskIterator,
};
pub use fragment::{DataFragment, FileFragment, InMemoryFragment};
pub use fs::{FileInfo, FileSource, FileSystem, LocalFileSystem, MemoryFileSystem, RandomAccessFile};
pub use memory::{MemoryPool, MemoryReservation, TrackingMemoryPool, default_memory_pool};
pub use partition::{
    HIVE_DEFAULT_PARTITION, HivePartitionScheme, PartitionKeys, PartitionScheme,
    SchemaPartitionScheme,
};
pub use row_filter::RowFilter;
pub use scan::{DEFAULT_BATCH_SIZE, ScanContext, ScanOptions, Scanner, ScannerBuilder};
pub use source::{
    DataSource, FileSystemDataSource, FragmentIterator, SimpleDataSource, TreeDataSource,
};
