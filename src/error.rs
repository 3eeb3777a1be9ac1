use arrow_schema::{ArrowError, DataType};
use datafusion_common::DataFusionError;
use parquet::errors::ParquetError;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = QuarryError> = std::result::Result<T, E>;

/// Errors raised while discovering, planning or scanning a dataset, and while
/// moving arrays across the interchange boundary.
///
/// Some variants are never returned as `Err` from discovery: unresolved
/// partition segments and excluded files are accumulated in
/// [`PartitionKeys`](crate::PartitionKeys) and
/// [`DiscoveryReport`](crate::DiscoveryReport) so callers can inspect them
/// without aborting the walk.
#[derive(Debug, Error)]
pub enum QuarryError {
    /// A root path or file source does not exist.
    #[error("Path '{path}' not found")]
    NotFound {
        /// Path that was looked up
        path: String,
    },

    /// Filesystem failure other than a missing path (permissions, short reads).
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// Path being accessed
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A field appears with incompatible types across fragments.
    #[error(
        "Field '{field}' has type {incoming:?} in '{path}' which conflicts with {existing:?}"
    )]
    SchemaConflict {
        /// Name of the conflicting field
        field: String,
        /// Type already present in the unified schema
        existing: DataType,
        /// Type found in the offending fragment
        incoming: DataType,
        /// Location of the offending fragment
        path: String,
    },

    /// A partition segment could not be coerced to the declared key type.
    #[error("Partition segment '{segment}' of '{path}' is not a valid {data_type:?} for '{field}': {reason}")]
    PartitionUnresolved {
        /// Partition path being parsed
        path: String,
        /// Partition key
        field: String,
        /// Raw segment value
        segment: String,
        /// Declared type of the key
        data_type: DataType,
        /// Reason reported by the coercion
        reason: String,
    },

    /// A filter expression is malformed for the schema it is bound to.
    #[error("Invalid expression: {reason}")]
    InvalidExpression {
        /// Why the expression was rejected
        reason: String,
    },

    /// A projection or filter names a field the schema does not have.
    #[error("Field '{name}' not found in schema")]
    FieldNotFound {
        /// Name of the missing field
        name: String,
    },

    /// A scan or discovery option is out of range.
    #[error("Invalid option: {reason}")]
    InvalidOption {
        /// Why the option was rejected
        reason: String,
    },

    /// An interchange descriptor was used after (or instead of) its release.
    #[error("Release protocol violated: {reason}")]
    ReleaseViolation {
        /// What went wrong
        reason: String,
    },

    /// An interchange descriptor's layout does not match its format string.
    #[error("Malformed interchange descriptor: {reason}")]
    MalformedDescriptor {
        /// What was inconsistent
        reason: String,
    },

    /// The type format string (or the exported data type) has no interchange mapping.
    #[error("Unsupported interchange format '{format}'")]
    UnsupportedInterchangeFormat {
        /// Format string or data type description
        format: String,
    },

    /// A memory pool refused a reservation.
    #[error("Cannot reserve {requested} bytes: {reserved} of {limit} bytes already reserved")]
    ResourcesExhausted {
        /// Bytes asked for
        requested: usize,
        /// Bytes already reserved in the pool
        reserved: usize,
        /// Pool limit
        limit: usize,
    },

    /// A scan task could not be driven to completion (e.g. its worker panicked).
    #[error("Scan task failed: {reason}")]
    TaskFailed {
        /// What went wrong
        reason: String,
    },

    #[error(transparent)]
    Arrow(#[from] ArrowError),

    #[error(transparent)]
    Parquet(#[from] ParquetError),

    #[error(transparent)]
    DataFusion(#[from] DataFusionError),
}

impl QuarryError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            QuarryError::NotFound { path }
        } else {
            QuarryError::Io { path, source }
        }
    }

    pub(crate) fn invalid_expression(reason: impl Into<String>) -> Self {
        QuarryError::InvalidExpression {
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        QuarryError::MalformedDescriptor {
            reason: reason.into(),
        }
    }
}

impl From<QuarryError> for ParquetError {
    fn from(err: QuarryError) -> Self {
        match err {
            QuarryError::Parquet(err) => err,
            other => ParquetError::External(Box::new(other)),
        }
    }
}

impl From<QuarryError> for ArrowError {
    fn from(err: QuarryError) -> Self {
        match err {
            QuarryError::Arrow(err) => err,
            other => ArrowError::ExternalError(Box::new(other)),
        }
    }
}
