//! Building a [`FileSystemDataSource`] from a directory tree.

use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
    sync::Arc,
};

use arrow_schema::{DataType, Field, Schema, SchemaRef};

use crate::{
    QuarryError, Result,
    expr::Expression,
    format::FileFormat,
    fragment::DataFragment,
    fs::{FileInfo, FileSource, FileSystem},
    partition::{HivePartitionScheme, PartitionScheme},
    source::FileSystemDataSource,
};

/// How fragments get their partition expressions.
#[derive(Clone, Default)]
pub enum Partitioning {
    /// Every fragment is unconstrained
    #[default]
    None,
    /// Use the given scheme
    Scheme(Arc<dyn PartitionScheme>),
    /// Infer a [`HivePartitionScheme`] from the discovered paths
    InferHive,
}

impl fmt::Debug for Partitioning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partitioning::None => f.write_str("None"),
            Partitioning::Scheme(scheme) => write!(f, "Scheme({})", scheme.type_name()),
            Partitioning::InferHive => f.write_str("InferHive"),
        }
    }
}

/// Options for [`FileSystemDataSourceDiscovery`].
#[derive(Clone, Debug)]
pub struct DiscoveryOptions {
    partition_base_dir: Option<String>,
    exclude_invalid_files: bool,
    ignore_prefixes: Vec<String>,
    partitioning: Partitioning,
}

impl DiscoveryOptions {
    /// Create a new builder for DiscoveryOptions
    ///
    /// # Example
    /// ```
    /// use quarry::{DiscoveryOptions, Partitioning};
    ///
    /// let options = DiscoveryOptions::builder()
    ///     .partitioning(Partitioning::InferHive)
    ///     .exclude_invalid_files(true)
    ///     .build();
    /// assert_eq!(options.ignore_prefixes(), [".", "_"]);
    /// ```
    pub fn builder() -> DiscoveryOptionsBuilder {
        DiscoveryOptionsBuilder::default()
    }

    /// Directory that partition paths are relative to; the discovery root if unset
    pub fn partition_base_dir(&self) -> Option<&str> {
        self.partition_base_dir.as_deref()
    }

    pub fn exclude_invalid_files(&self) -> bool {
        self.exclude_invalid_files
    }

    pub fn ignore_prefixes(&self) -> &[String] {
        &self.ignore_prefixes
    }

    pub fn partitioning(&self) -> &Partitioning {
        &self.partitioning
    }

    fn is_ignored(&self, path: &str) -> bool {
        let base_name = path.rsplit('/').next().unwrap_or(path);
        self.ignore_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && base_name.starts_with(prefix.as_str()))
    }
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptionsBuilder::default().build()
    }
}

/// Builder for DiscoveryOptions
#[derive(Clone, Debug, Default)]
pub struct DiscoveryOptionsBuilder {
    partition_base_dir: Option<String>,
    exclude_invalid_files: Option<bool>,
    ignore_prefixes: Option<Vec<String>>,
    partitioning: Option<Partitioning>,
}

impl DiscoveryOptionsBuilder {
    /// Directory partition paths are relative to (default: the discovery root)
    ///
    /// Files outside of it get no partition expression.
    pub fn partition_base_dir(mut self, dir: impl Into<String>) -> Self {
        self.partition_base_dir = Some(dir.into());
        self
    }

    /// Skip files whose schema cannot be read or unified instead of failing
    /// (default: false)
    pub fn exclude_invalid_files(mut self, value: bool) -> Self {
        self.exclude_invalid_files = Some(value);
        self
    }

    /// Base-name prefixes of files and directories to skip (default: `.` and `_`)
    pub fn ignore_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_prefixes = Some(prefixes.into_iter().map(Into::into).collect());
        self
    }

    /// Partitioning of the tree (default: none)
    pub fn partitioning(mut self, partitioning: Partitioning) -> Self {
        self.partitioning = Some(partitioning);
        self
    }

    /// Build the DiscoveryOptions
    pub fn build(self) -> DiscoveryOptions {
        DiscoveryOptions {
            partition_base_dir: self.partition_base_dir,
            exclude_invalid_files: self.exclude_invalid_files.unwrap_or(false),
            ignore_prefixes: self
                .ignore_prefixes
                .unwrap_or_else(|| vec![".".to_string(), "_".to_string()]),
            partitioning: self.partitioning.unwrap_or_default(),
        }
    }
}

/// Non-fatal findings of a discovery.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    unresolved: Vec<QuarryError>,
    excluded: Vec<(String, QuarryError)>,
}

impl DiscoveryReport {
    /// [`QuarryError::PartitionUnresolved`] for every partition segment that
    /// was left unconstrained
    pub fn unresolved(&self) -> &[QuarryError] {
        &self.unresolved
    }

    /// Files dropped because of `exclude_invalid_files`, with the reason
    pub fn excluded(&self) -> &[(String, QuarryError)] {
        &self.excluded
    }

    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty() && self.excluded.is_empty()
    }
}

/// Merge file schemas into one.
///
/// Inputs are visited in path order, so the result does not depend on the
/// order they are given in. Fields keep the position of their first
/// occurrence. A field seen with equal types is nullable if any occurrence
/// is; a `Null` typed occurrence yields to any other type. Any other type
/// difference is a [`QuarryError::SchemaConflict`].
pub fn unify_schemas(
    schemas: impl IntoIterator<Item = (String, SchemaRef)>,
) -> Result<SchemaRef> {
    let mut schemas: Vec<_> = schemas.into_iter().collect();
    schemas.sort_by(|a, b| a.0.cmp(&b.0));
    let mut unifier = SchemaUnifier::default();
    for (path, schema) in &schemas {
        unifier.merge(path, schema)?;
    }
    Ok(unifier.finish())
}

#[derive(Default)]
struct SchemaUnifier {
    fields: Vec<Field>,
    index: HashMap<String, usize>,
}

impl SchemaUnifier {
    fn merged(existing: &Field, incoming: &Field, path: &str) -> Result<Option<Field>> {
        let nullable = existing.is_nullable() || incoming.is_nullable();
        let data_type = match (existing.data_type(), incoming.data_type()) {
            (a, b) if a == b => a.clone(),
            (DataType::Null, other) | (other, DataType::Null) => other.clone(),
            (a, b) => {
                return Err(QuarryError::SchemaConflict {
                    field: existing.name().clone(),
                    existing: a.clone(),
                    incoming: b.clone(),
                    path: path.to_string(),
                });
            }
        };
        let nullable = nullable || *existing.data_type() == DataType::Null
            || *incoming.data_type() == DataType::Null;
        if data_type == *existing.data_type() && nullable == existing.is_nullable() {
            return Ok(None);
        }
        Ok(Some(existing.clone().with_data_type(data_type).with_nullable(nullable)))
    }

    /// Merge `schema` or leave the unifier untouched on conflict.
    fn merge(&mut self, path: &str, schema: &Schema) -> Result<()> {
        let mut updates = Vec::new();
        let mut additions: Vec<Field> = Vec::new();
        for field in schema.fields() {
            match self.index.get(field.name()) {
                Some(&i) => {
                    if let Some(updated) = Self::merged(&self.fields[i], field, path)? {
                        updates.push((i, updated));
                    }
                }
                None => match additions.iter_mut().find(|f| f.name() == field.name()) {
                    Some(added) => {
                        if let Some(updated) = Self::merged(added, field, path)? {
                            *added = updated;
                        }
                    }
                    None => additions.push(field.as_ref().clone()),
                },
            }
        }
        for (i, field) in updates {
            self.fields[i] = field;
        }
        for field in additions {
            self.index.insert(field.name().clone(), self.fields.len());
            self.fields.push(field);
        }
        Ok(())
    }

    fn finish(self) -> SchemaRef {
        Arc::new(Schema::new(self.fields))
    }
}

/// Walks a directory tree and builds a [`FileSystemDataSource`] from it.
///
/// The walk happens in [`new`](Self::new) and fails fast on filesystem
/// errors. Schemas are read by [`inspect`](Self::inspect), which
/// [`finish`](Self::finish) calls if it has not run yet.
#[derive(Debug)]
pub struct FileSystemDataSourceDiscovery {
    filesystem: Arc<dyn FileSystem>,
    root: String,
    format: Arc<dyn FileFormat>,
    options: DiscoveryOptions,
    files: Vec<FileInfo>,
    scheme: Option<Arc<dyn PartitionScheme>>,
    inspected: Option<Inspection>,
}

#[derive(Debug)]
struct Inspection {
    schema: SchemaRef,
    excluded: Vec<(String, QuarryError)>,
}

fn trim_path(path: &str) -> &str {
    path.trim_end_matches('/')
}

impl FileSystemDataSourceDiscovery {
    pub fn new(
        filesystem: Arc<dyn FileSystem>,
        root: impl Into<String>,
        format: Arc<dyn FileFormat>,
        options: DiscoveryOptions,
    ) -> Result<Self> {
        let root = trim_path(&root.into()).to_string();
        let files = Self::walk(filesystem.as_ref(), &root, &options)?;
        log::debug!("discovered {} files under '{root}'", files.len());

        let mut discovery = Self {
            filesystem,
            root,
            format,
            options,
            files,
            scheme: None,
            inspected: None,
        };
        discovery.scheme = match discovery.options.partitioning() {
            Partitioning::None => None,
            Partitioning::Scheme(scheme) => Some(Arc::clone(scheme)),
            Partitioning::InferHive => {
                let dirs: Vec<&str> = discovery
                    .files
                    .iter()
                    .map(|f| discovery.partition_path(&f.path))
                    .collect();
                let scheme = HivePartitionScheme::infer(dirs);
                log::debug!("inferred hive partitioning {:?}", scheme.schema());
                Some(Arc::new(scheme) as Arc<dyn PartitionScheme>)
            }
        };
        Ok(discovery)
    }

    fn walk(fs: &dyn FileSystem, root: &str, options: &DiscoveryOptions) -> Result<Vec<FileInfo>> {
        let mut files = Vec::new();
        let mut pending = vec![root.to_string()];
        while let Some(dir) = pending.pop() {
            for entry in fs.list(&dir)? {
                if options.is_ignored(&entry.path) {
                    log::debug!("ignoring '{}'", entry.path);
                    continue;
                }
                if entry.is_dir {
                    pending.push(entry.path);
                } else {
                    files.push(entry);
                }
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Directory of `path` relative to the partition base directory, or ""
    /// when the file lies outside of it.
    fn partition_path<'a>(&self, path: &'a str) -> &'a str {
        let base = self
            .options
            .partition_base_dir()
            .map(trim_path)
            .unwrap_or(self.root.as_str());
        let relative = if base.is_empty() {
            Some(path)
        } else {
            path.strip_prefix(base).and_then(|rest| rest.strip_prefix('/'))
        };
        match relative {
            Some(relative) => relative.rsplit_once('/').map_or("", |(dir, _)| dir),
            None => "",
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Discovered files, in path order.
    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub fn partition_scheme(&self) -> Option<&Arc<dyn PartitionScheme>> {
        self.scheme.as_ref()
    }

    /// Unified schema of all files followed by the partition fields.
    pub fn inspect(&mut self) -> Result<SchemaRef> {
        if let Some(inspected) = &self.inspected {
            return Ok(Arc::clone(&inspected.schema));
        }

        let mut unifier = SchemaUnifier::default();
        let mut excluded = Vec::new();
        for file in &self.files {
            let source = FileSource::new(file.path.clone(), Arc::clone(&self.filesystem));
            let merged = self
                .format
                .inspect(&source)
                .and_then(|schema| unifier.merge(&file.path, &schema));
            match merged {
                Ok(()) => {}
                Err(err) if self.options.exclude_invalid_files() => {
                    log::warn!("excluding '{}': {err}", file.path);
                    excluded.push((file.path.clone(), err));
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(scheme) = &self.scheme {
            for field in scheme.schema().fields() {
                match unifier.index.entry(field.name().clone()) {
                    Entry::Occupied(entry) => {
                        let existing = &unifier.fields[*entry.get()];
                        if existing.data_type() != field.data_type() {
                            return Err(QuarryError::SchemaConflict {
                                field: field.name().clone(),
                                existing: existing.data_type().clone(),
                                incoming: field.data_type().clone(),
                                path: self.root.clone(),
                            });
                        }
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(unifier.fields.len());
                        unifier.fields.push(field.as_ref().clone());
                    }
                }
            }
        }

        let schema = unifier.finish();
        self.inspected = Some(Inspection {
            schema: Arc::clone(&schema),
            excluded,
        });
        Ok(schema)
    }

    /// Build the data source.
    pub fn finish(mut self) -> Result<FileSystemDataSource> {
        let schema = self.inspect()?;
        let excluded = self
            .inspected
            .take()
            .map(|inspected| inspected.excluded)
            .unwrap_or_default();

        let mut report = DiscoveryReport::default();
        let mut fragments: Vec<Arc<dyn DataFragment>> = Vec::with_capacity(self.files.len());
        for file in &self.files {
            if excluded.iter().any(|(path, _)| *path == file.path) {
                continue;
            }
            let partition_expression = match &self.scheme {
                Some(scheme) => {
                    let keys = scheme.parse(self.partition_path(&file.path));
                    report.unresolved.extend(keys.unresolved);
                    keys.expression
                }
                None => Expression::literal_true(),
            };
            let source = FileSource::new(file.path.clone(), Arc::clone(&self.filesystem));
            fragments.push(Arc::clone(&self.format).make_fragment(source, partition_expression)?);
        }
        report.excluded = excluded;

        Ok(FileSystemDataSource::new(
            schema,
            self.filesystem,
            self.format,
            self.scheme,
            fragments,
            report,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(fields: Vec<Field>) -> SchemaRef {
        Arc::new(Schema::new(fields))
    }

    #[test]
    fn unification_is_order_independent() {
        let a = schema(vec![
            Field::new("x", DataType::Int32, false),
            Field::new("y", DataType::Null, true),
        ]);
        let b = schema(vec![
            Field::new("y", DataType::Utf8, false),
            Field::new("x", DataType::Int32, true),
            Field::new("z", DataType::Float64, false),
        ]);
        let forward =
            unify_schemas([("a".to_string(), a.clone()), ("b".to_string(), b.clone())]).unwrap();
        let backward = unify_schemas([("b".to_string(), b), ("a".to_string(), a)]).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(
            forward.fields().iter().map(|f| (f.name().as_str(), f.data_type().clone(), f.is_nullable())).collect::<Vec<_>>(),
            vec![
                ("x", DataType::Int32, true),
                ("y", DataType::Utf8, true),
                ("z", DataType::Float64, false),
            ]
        );
    }

    #[test]
    fn conflicting_types_are_reported_with_path() {
        let a = schema(vec![Field::new("x", DataType::Int32, false)]);
        let b = schema(vec![Field::new("x", DataType::Utf8, false)]);
        let err = unify_schemas([("b".to_string(), b), ("a".to_string(), a)]).unwrap_err();
        assert!(matches!(
            err,
            QuarryError::SchemaConflict { field, existing: DataType::Int32, incoming: DataType::Utf8, path }
                if field == "x" && path == "b"
        ));
    }

    #[test]
    fn rejected_schema_leaves_unifier_untouched() {
        let mut unifier = SchemaUnifier::default();
        unifier
            .merge("a", &Schema::new(vec![Field::new("x", DataType::Int32, false)]))
            .unwrap();
        let bad = Schema::new(vec![
            Field::new("new", DataType::Int8, false),
            Field::new("x", DataType::Utf8, false),
        ]);
        assert!(unifier.merge("b", &bad).is_err());
        assert_eq!(unifier.finish().fields().len(), 1);
    }

    #[test]
    fn ignore_prefixes_match_base_names() {
        let options = DiscoveryOptions::default();
        assert!(options.is_ignored("root/_SUCCESS"));
        assert!(options.is_ignored("root/.hidden"));
        assert!(!options.is_ignored("root/_staging/a.parquet"));
        assert!(!options.is_ignored("data.parquet"));
    }
}
