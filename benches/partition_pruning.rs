use std::sync::Arc;

use arrow_array::{Int64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use quarry::{
    DataFragment, DataSource, DiscoveryOptions, Expression, FileSystemDataSourceDiscovery,
    HivePartitionScheme, InMemoryFragment, MemoryFileSystem, ParquetFileFormat, PartitionScheme,
    Partitioning, ScannerBuilder, SimpleDataSource, TriState, col, lit,
};

// ============================================================================
// Helper Functions
// ============================================================================

fn partition_scheme() -> HivePartitionScheme {
    HivePartitionScheme::new(Arc::new(Schema::new(vec![
        Field::new("year", DataType::Int32, true),
        Field::new("region", DataType::Utf8, true),
    ])))
}

fn partition_paths(fragments: usize) -> Vec<String> {
    (0..fragments)
        .map(|i| format!("year={}/region=r{}", 2000 + (i % 25), i % 40))
        .collect()
}

fn value_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("value", DataType::Int64, false)]))
}

/// In-memory fragments with hive partition expressions, one small batch each.
fn create_source(fragments: usize) -> SimpleDataSource {
    let scheme = partition_scheme();
    let batch = RecordBatch::try_new(
        value_schema(),
        vec![Arc::new(Int64Array::from((0..64).collect::<Vec<i64>>()))],
    )
    .unwrap();
    let fragments = partition_paths(fragments)
        .iter()
        .map(|path| {
            let keys = scheme.parse(path);
            Arc::new(
                InMemoryFragment::new(vec![batch.clone()])
                    .with_partition_expression(keys.expression),
            ) as Arc<dyn DataFragment>
        })
        .collect();
    let mut fields: Vec<Field> = vec![value_schema().field(0).clone()];
    fields.extend(scheme.schema().fields().iter().map(|f| f.as_ref().clone()));
    SimpleDataSource::new(Arc::new(Schema::new(fields)), fragments)
}

fn selective_filter() -> Expression {
    col("year")
        .eq(lit(2010i32))
        .and(col("region").eq(lit("r7")))
        .and(col("value").gt(lit(10i64)))
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_evaluate(c: &mut Criterion) {
    let scheme = partition_scheme();
    let expressions: Vec<Expression> = partition_paths(1_000)
        .iter()
        .map(|path| scheme.parse(path).expression)
        .collect();
    let filter = selective_filter();

    let mut group = c.benchmark_group("evaluate");
    group.throughput(Throughput::Elements(expressions.len() as u64));
    group.bench_function("known_field_values", |b| {
        b.iter(|| {
            expressions
                .iter()
                .filter(|e| filter.evaluate(&e.known_field_values()) == TriState::False)
                .count()
        })
    });
    group.finish();
}

fn bench_scan_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_planning");
    for fragments in [100, 1_000, 10_000] {
        let source = Arc::new(create_source(fragments));
        let scanner = ScannerBuilder::new(source)
            .filter(selective_filter())
            .unwrap()
            .finish()
            .unwrap();
        group.throughput(Throughput::Elements(fragments as u64));
        group.bench_with_input(BenchmarkId::new("tasks", fragments), &scanner, |b, scanner| {
            b.iter(|| black_box(scanner.scan().count()))
        });
    }
    group.finish();
}

fn bench_hive_discovery(c: &mut Criterion) {
    let fs = MemoryFileSystem::new();
    let mut buffer = Vec::new();
    let mut writer =
        parquet::arrow::ArrowWriter::try_new(&mut buffer, value_schema(), None).unwrap();
    writer
        .write(
            &RecordBatch::try_new(value_schema(), vec![Arc::new(Int64Array::from(vec![1, 2]))])
                .unwrap(),
        )
        .unwrap();
    writer.close().unwrap();
    for (i, path) in partition_paths(500).iter().enumerate() {
        fs.insert(&format!("root/{path}/part-{i}.parquet"), buffer.clone());
    }

    c.bench_function("discover_infer_hive_500", |b| {
        b.iter(|| {
            let options = DiscoveryOptions::builder()
                .partitioning(Partitioning::InferHive)
                .build();
            let discovery = FileSystemDataSourceDiscovery::new(
                Arc::new(fs.clone()),
                "root",
                Arc::new(ParquetFileFormat::new()),
                options,
            )
            .unwrap();
            black_box(discovery.finish().unwrap().fragments().count())
        })
    });
}

criterion_group!(benches, bench_evaluate, bench_scan_planning, bench_hive_discovery);
criterion_main!(benches);
