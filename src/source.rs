//! Data sources: schema-unified collections of fragments.

use std::{collections::HashSet, fmt::Debug, sync::Arc};

use arrow_schema::SchemaRef;

use crate::{
    discovery::DiscoveryReport, format::FileFormat, fragment::DataFragment,
    fs::FileSystem, partition::PartitionScheme,
};

/// Fragments of a source, produced on demand.
pub type FragmentIterator = Box<dyn Iterator<Item = Arc<dyn DataFragment>> + Send>;

/// A named collection of fragments sharing one schema.
///
/// Sources are read-only once built, so any number of scanners may use one
/// concurrently.
pub trait DataSource: Send + Sync + Debug {
    fn type_name(&self) -> &'static str;

    fn schema(&self) -> SchemaRef;

    /// Fragments in a deterministic order.
    fn fragments(&self) -> FragmentIterator;
}

/// Fragments supplied directly by the caller.
#[derive(Debug, Clone)]
pub struct SimpleDataSource {
    schema: SchemaRef,
    fragments: Arc<[Arc<dyn DataFragment>]>,
}

impl SimpleDataSource {
    pub fn new(schema: SchemaRef, fragments: Vec<Arc<dyn DataFragment>>) -> Self {
        Self {
            schema,
            fragments: fragments.into(),
        }
    }
}

fn iterate(fragments: &Arc<[Arc<dyn DataFragment>]>) -> FragmentIterator {
    let fragments = Arc::clone(fragments);
    Box::new((0..fragments.len()).map(move |i| Arc::clone(&fragments[i])))
}

impl DataSource for SimpleDataSource {
    fn type_name(&self) -> &'static str {
        "simple"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn fragments(&self) -> FragmentIterator {
        iterate(&self.fragments)
    }
}

/// Files found by [`FileSystemDataSourceDiscovery`](crate::FileSystemDataSourceDiscovery),
/// in path order.
#[derive(Debug)]
pub struct FileSystemDataSource {
    schema: SchemaRef,
    filesystem: Arc<dyn FileSystem>,
    format: Arc<dyn FileFormat>,
    partition_scheme: Option<Arc<dyn PartitionScheme>>,
    fragments: Arc<[Arc<dyn DataFragment>]>,
    report: DiscoveryReport,
}

impl FileSystemDataSource {
    pub(crate) fn new(
        schema: SchemaRef,
        filesystem: Arc<dyn FileSystem>,
        format: Arc<dyn FileFormat>,
        partition_scheme: Option<Arc<dyn PartitionScheme>>,
        fragments: Vec<Arc<dyn DataFragment>>,
        report: DiscoveryReport,
    ) -> Self {
        Self {
            schema,
            filesystem,
            format,
            partition_scheme,
            fragments: fragments.into(),
            report,
        }
    }

    pub fn filesystem(&self) -> &Arc<dyn FileSystem> {
        &self.filesystem
    }

    pub fn format(&self) -> &Arc<dyn FileFormat> {
        &self.format
    }

    pub fn partition_scheme(&self) -> Option<&Arc<dyn PartitionScheme>> {
        self.partition_scheme.as_ref()
    }

    /// Unresolved partition segments and excluded files seen by discovery.
    pub fn report(&self) -> &DiscoveryReport {
        &self.report
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

impl DataSource for FileSystemDataSource {
    fn type_name(&self) -> &'static str {
        "filesystem"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn fragments(&self) -> FragmentIterator {
        iterate(&self.fragments)
    }
}

/// A source made of child sources, flattened in order.
///
/// Children may reach the same physical data (e.g. overlapping directory
/// trees). By default such fragments are scanned once per occurrence; with
/// [`TreeDataSource::with_deduplication`] only the first fragment of each
/// [`identity`](DataFragment::identity) is kept. Fragments without an
/// identity are never deduplicated.
#[derive(Debug, Clone)]
pub struct TreeDataSource {
    schema: SchemaRef,
    children: Arc<[Arc<dyn DataSource>]>,
    deduplicate: bool,
}

impl TreeDataSource {
    pub fn new(schema: SchemaRef, children: Vec<Arc<dyn DataSource>>) -> Self {
        Self {
            schema,
            children: children.into(),
            deduplicate: false,
        }
    }

    pub fn with_deduplication(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    pub fn children(&self) -> &[Arc<dyn DataSource>] {
        &self.children
    }
}

impl DataSource for TreeDataSource {
    fn type_name(&self) -> &'static str {
        "tree"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn fragments(&self) -> FragmentIterator {
        let children = Arc::clone(&self.children);
        let flattened = (0..children.len()).flat_map(move |i| children[i].fragments());
        if !self.deduplicate {
            return Box::new(flattened);
        }
        let mut seen = HashSet::new();
        Box::new(flattened.filter(move |fragment| match fragment.identity() {
            Some(identity) => seen.insert(identity),
            None => true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::{DataType, Field, Schema};

    use super::*;
    use crate::{
        InMemoryFragment,
        expr::Expression,
        format::ParquetFileFormat,
        fragment::FileFragment,
        fs::{FileSource, MemoryFileSystem},
    };

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("x", DataType::Int32, true)]))
    }

    fn file(path: &str) -> Arc<dyn DataFragment> {
        let fs: Arc<dyn FileSystem> = Arc::new(MemoryFileSystem::new());
        Arc::new(FileFragment::new(
            FileSource::new(path, fs),
            Arc::new(ParquetFileFormat::new()),
            Expression::literal_true(),
        ))
    }

    #[test]
    fn tree_flattens_children_in_order() {
        let left: Arc<dyn DataSource> = Arc::new(SimpleDataSource::new(
            schema(),
            vec![file("a"), file("b")],
        ));
        let anonymous: Arc<dyn DataFragment> = Arc::new(InMemoryFragment::new(vec![]));
        let right: Arc<dyn DataSource> = Arc::new(SimpleDataSource::new(
            schema(),
            vec![file("b"), anonymous, file("c")],
        ));
        let tree = TreeDataSource::new(schema(), vec![left, right]);
        let ids: Vec<_> = tree.fragments().map(|f| f.identity()).collect();
        assert_eq!(ids.len(), 5);

        let deduped = tree.with_deduplication(true);
        let ids: Vec<_> = deduped
            .fragments()
            .map(|f| f.identity().unwrap_or_default())
            .collect();
        assert_eq!(ids, vec!["parquet:a", "parquet:b", "", "parquet:c"]);
    }

    #[test]
    fn fragments_can_be_enumerated_repeatedly() {
        let source = SimpleDataSource::new(schema(), vec![file("a")]);
        assert_eq!(source.fragments().count(), 1);
        assert_eq!(source.fragments().count(), 1);
    }
}
