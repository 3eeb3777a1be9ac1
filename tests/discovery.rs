use std::sync::Arc;

use arrow_array::{Array, Int32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use parquet::arrow::ArrowWriter;
use quarry::{
    DataSource, DiscoveryOptions, FileSystem, FileSystemDataSourceDiscovery, LocalFileSystem,
    MemoryFileSystem, ParquetFileFormat, Partitioning, QuarryError, ScannerBuilder,
    TreeDataSource, col, lit, unify_schemas,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ids_batch(ids: &[i64]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(ids.to_vec()))]).unwrap()
}

fn write_parquet(batch: &RecordBatch) -> Vec<u8> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None).unwrap();
    writer.write(batch).unwrap();
    writer.close().unwrap();
    buffer
}

fn parquet_fs(files: &[(&str, &[i64])]) -> MemoryFileSystem {
    let fs = MemoryFileSystem::new();
    for (path, ids) in files {
        fs.insert(path, write_parquet(&ids_batch(ids)));
    }
    fs
}

fn discover(
    fs: MemoryFileSystem,
    root: &str,
    options: DiscoveryOptions,
) -> quarry::Result<FileSystemDataSourceDiscovery> {
    FileSystemDataSourceDiscovery::new(
        Arc::new(fs),
        root,
        Arc::new(ParquetFileFormat::new()),
        options,
    )
}

fn ids(batch: &RecordBatch) -> Vec<i64> {
    let index = batch.schema().index_of("id").unwrap();
    let column = batch.column(index).as_any().downcast_ref::<Int64Array>().unwrap();
    column.values().to_vec()
}

#[test]
fn infers_hive_keys_and_prunes_on_them() {
    init_logger();
    let fs = parquet_fs(&[
        ("t/year=2020/month=1/a.parquet", &[1, 2]),
        ("t/year=2021/month=12/b.parquet", &[3]),
        ("t/year=2021/month=3/c.parquet", &[4, 5]),
    ]);
    let options = DiscoveryOptions::builder()
        .partitioning(Partitioning::InferHive)
        .build();
    let mut discovery = discover(fs, "t", options).unwrap();
    let schema = discovery.inspect().unwrap();
    let names: Vec<_> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    assert_eq!(names, vec!["id", "year", "month"]);
    assert_eq!(schema.field(1).data_type(), &DataType::Int32);

    let source = Arc::new(discovery.finish().unwrap());
    let scanner = ScannerBuilder::new(source)
        .filter(col("year").eq(lit(2021i32)).and(col("month").lt(lit(10i32))))
        .unwrap()
        .finish()
        .unwrap();
    let batch = scanner.to_record_batch().unwrap();
    assert_eq!(ids(&batch), vec![4, 5]);
    let months = batch.column(2).as_any().downcast_ref::<Int32Array>().unwrap();
    assert_eq!(months.values().to_vec(), vec![3, 3]);
}

#[test]
fn ignored_entries_are_skipped() {
    let fs = parquet_fs(&[
        ("d/a.parquet", &[1]),
        ("d/.hidden/b.parquet", &[2]),
        ("d/_tmp/c.parquet", &[3]),
        ("d/sub/_d.parquet", &[4]),
        ("d/sub/e.parquet", &[5]),
    ]);
    fs.insert("d/_SUCCESS", Vec::new());
    let discovery = discover(fs, "d", DiscoveryOptions::default()).unwrap();
    let paths: Vec<_> = discovery.files().iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["d/a.parquet", "d/sub/e.parquet"]);
}

#[test]
fn invalid_files_fail_or_are_excluded() {
    let files: &[(&str, &[i64])] = &[("d/a.parquet", &[1]), ("d/c.parquet", &[2])];
    let fs = parquet_fs(files);
    fs.insert("d/b.parquet", &b"definitely not parquet"[..]);
    assert!(discover(fs.clone(), "d", DiscoveryOptions::default())
        .unwrap()
        .finish()
        .is_err());

    let options = DiscoveryOptions::builder().exclude_invalid_files(true).build();
    let source = discover(fs, "d", options).unwrap().finish().unwrap();
    assert_eq!(source.len(), 2);
    let excluded = source.report().excluded();
    assert_eq!(excluded.len(), 1);
    assert_eq!(excluded[0].0, "d/b.parquet");

    let scanner = ScannerBuilder::new(Arc::new(source)).finish().unwrap();
    assert_eq!(ids(&scanner.to_record_batch().unwrap()), vec![1, 2]);
}

#[test]
fn conflicting_file_schema_is_excluded_when_asked() {
    let fs = parquet_fs(&[("d/a.parquet", &[1])]);
    let names = RecordBatch::try_new(
        Arc::new(Schema::new(vec![Field::new("id", DataType::Utf8, true)])),
        vec![Arc::new(StringArray::from(vec!["x"]))],
    )
    .unwrap();
    fs.insert("d/b.parquet", write_parquet(&names));

    let err = discover(fs.clone(), "d", DiscoveryOptions::default())
        .unwrap()
        .finish()
        .unwrap_err();
    assert!(matches!(err, QuarryError::SchemaConflict { ref path, .. } if path == "d/b.parquet"));

    let options = DiscoveryOptions::builder().exclude_invalid_files(true).build();
    let source = discover(fs, "d", options).unwrap().finish().unwrap();
    assert_eq!(source.schema().field(0).data_type(), &DataType::Int64);
    assert_eq!(source.report().excluded()[0].0, "d/b.parquet");
}

#[test]
fn unification_does_not_depend_on_input_order() {
    let schema = |fields: Vec<Field>| -> SchemaRef { Arc::new(Schema::new(fields)) };
    let inputs = vec![
        ("a".to_string(), schema(vec![Field::new("x", DataType::Int64, false)])),
        (
            "b".to_string(),
            schema(vec![
                Field::new("y", DataType::Null, true),
                Field::new("x", DataType::Int64, true),
            ]),
        ),
        ("c".to_string(), schema(vec![Field::new("y", DataType::Utf8, false)])),
    ];
    let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    let unified: Vec<SchemaRef> = orders
        .iter()
        .map(|order| unify_schemas(order.iter().map(|&i| inputs[i].clone())).unwrap())
        .collect();
    for schema in &unified[1..] {
        assert_eq!(schema, &unified[0]);
    }
    assert_eq!(
        unified[0].as_ref(),
        &Schema::new(vec![
            Field::new("x", DataType::Int64, true),
            Field::new("y", DataType::Utf8, true),
        ])
    );

    let conflicting = ("d".to_string(), schema(vec![Field::new("x", DataType::Utf8, true)]));
    let mut first_error = None;
    for order in orders {
        let mut set: Vec<_> = order.iter().map(|&i| inputs[i].clone()).collect();
        set.insert(order[0], conflicting.clone());
        let err = unify_schemas(set).unwrap_err().to_string();
        let first = first_error.get_or_insert_with(|| err.clone());
        assert_eq!(*first, err);
    }
}

#[test]
fn missing_root_is_not_found() {
    let err = discover(MemoryFileSystem::new(), "nowhere", DiscoveryOptions::default()).unwrap_err();
    assert!(matches!(err, QuarryError::NotFound { .. }));
}

#[test]
fn overlapping_sources_can_be_deduplicated() {
    let fs = parquet_fs(&[
        ("d/year=2020/a.parquet", &[1]),
        ("d/year=2021/b.parquet", &[2]),
    ]);
    let hive = || {
        DiscoveryOptions::builder()
            .partitioning(Partitioning::InferHive)
            .partition_base_dir("d")
            .build()
    };
    let whole = discover(fs.clone(), "d", hive()).unwrap().finish().unwrap();
    let nested = discover(fs, "d/year=2020", hive()).unwrap().finish().unwrap();
    let schema = whole.schema();
    let children: Vec<Arc<dyn DataSource>> = vec![Arc::new(whole), Arc::new(nested)];

    let tree = TreeDataSource::new(schema, children);
    assert_eq!(tree.fragments().count(), 3);
    let tree = Arc::new(tree.with_deduplication(true));
    let scanner = ScannerBuilder::new(tree).finish().unwrap();
    let mut found = ids(&scanner.to_record_batch().unwrap());
    found.sort();
    assert_eq!(found, vec![1, 2]);
}

#[test]
fn local_directory_tree() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    for (year, ids) in [(2020, vec![1i64, 2]), (2021, vec![3])] {
        let partition = dir.path().join(format!("year={year}"));
        std::fs::create_dir_all(&partition).unwrap();
        std::fs::write(partition.join("part-0.parquet"), write_parquet(&ids_batch(&ids))).unwrap();
    }
    std::fs::write(dir.path().join("_SUCCESS"), b"").unwrap();

    let root = dir.path().to_string_lossy().into_owned();
    let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
    let options = DiscoveryOptions::builder()
        .partitioning(Partitioning::InferHive)
        .build();
    let discovery =
        FileSystemDataSourceDiscovery::new(fs, root, Arc::new(ParquetFileFormat::new()), options)
            .unwrap();
    assert_eq!(discovery.files().len(), 2);

    let scanner = ScannerBuilder::new(Arc::new(discovery.finish().unwrap()))
        .project(["id"])
        .unwrap()
        .filter(col("year").gt(lit(2020i32)))
        .unwrap()
        .finish()
        .unwrap();
    assert_eq!(ids(&scanner.to_record_batch().unwrap()), vec![3]);
}
