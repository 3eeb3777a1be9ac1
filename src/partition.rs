//! Partition schemes: deriving a fragment's partition expression from its
//! location.
//!
//! Schemes receive the fragment's directory path relative to the partition
//! base directory, with the file name already removed, e.g.
//! `year=2020/month=01` for `root/year=2020/month=01/part-0.parquet`.

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use datafusion_common::ScalarValue;
use percent_encoding::percent_decode_str;

use crate::{QuarryError, expr::Expression};

/// Value Hive writers use for a null partition key.
pub const HIVE_DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// Maps a fragment's relative directory path to a partition expression.
pub trait PartitionScheme: Send + Sync + Debug {
    fn type_name(&self) -> &'static str;

    /// Partition fields, appended to the data source schema by discovery.
    fn schema(&self) -> &SchemaRef;

    /// Derive the partition expression for `path`.
    ///
    /// Never fails: segments that cannot be coerced are reported in
    /// [`PartitionKeys::unresolved`] and leave their key unconstrained.
    fn parse(&self, path: &str) -> PartitionKeys;
}

/// Result of parsing one path.
#[derive(Debug)]
pub struct PartitionKeys {
    /// Conjunction of `field == value` terms; `true` if nothing was bound.
    pub expression: Expression,
    /// One [`QuarryError::PartitionUnresolved`] per segment that was dropped.
    pub unresolved: Vec<QuarryError>,
}

impl PartitionKeys {
    pub fn is_resolved(&self) -> bool {
        self.unresolved.is_empty()
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

fn coerce(value: &str, data_type: &DataType) -> Result<ScalarValue, String> {
    if *data_type == DataType::Utf8 {
        return Ok(ScalarValue::Utf8(Some(value.to_string())));
    }
    match ScalarValue::try_from_string(value.to_string(), data_type) {
        Ok(scalar) if scalar.is_null() => Err("value does not parse".to_string()),
        Ok(scalar) => Ok(scalar),
        Err(err) => Err(err.to_string()),
    }
}

/// Accumulates the conjuncts and failures of one path.
struct KeyCollector<'a> {
    path: &'a str,
    conjuncts: Vec<Expression>,
    unresolved: Vec<QuarryError>,
}

impl<'a> KeyCollector<'a> {
    fn new(path: &'a str) -> Self {
        Self {
            path,
            conjuncts: Vec::new(),
            unresolved: Vec::new(),
        }
    }

    fn bind(&mut self, field: &Field, segment: &str) {
        match coerce(segment, field.data_type()) {
            Ok(value) => self
                .conjuncts
                .push(Expression::field(field.name().clone()).eq(Expression::scalar(value))),
            Err(reason) => {
                log::warn!(
                    "partition segment '{segment}' of '{}' is not a valid {} for '{}'",
                    self.path,
                    field.data_type(),
                    field.name()
                );
                self.unresolved.push(QuarryError::PartitionUnresolved {
                    path: self.path.to_string(),
                    field: field.name().clone(),
                    segment: segment.to_string(),
                    data_type: field.data_type().clone(),
                    reason,
                });
            }
        }
    }

    fn finish(self) -> PartitionKeys {
        PartitionKeys {
            expression: Expression::conjunction(self.conjuncts),
            unresolved: self.unresolved,
        }
    }
}

/// `key=value` directory segments, as written by Hive and Spark.
///
/// Values are percent-decoded before coercion. Segments without `=`, and keys
/// not present in the schema, are ignored.
#[derive(Debug, Clone)]
pub struct HivePartitionScheme {
    schema: SchemaRef,
}

impl HivePartitionScheme {
    pub fn new(schema: SchemaRef) -> Self {
        Self { schema }
    }

    /// Discover partition keys from a set of relative directory paths.
    ///
    /// Keys are ordered by first appearance. Each key is typed `Int32` if all
    /// of its values parse as one, else `Int64`, else `Utf8`.
    pub fn infer<'a>(paths: impl IntoIterator<Item = &'a str>) -> Self {
        let mut order: Vec<String> = Vec::new();
        let mut values: HashMap<String, Vec<String>> = HashMap::new();
        for path in paths {
            for (key, value) in segments(path).filter_map(split_segment) {
                let entry = values.entry(key.to_string()).or_insert_with(|| {
                    order.push(key.to_string());
                    Vec::new()
                });
                if value != HIVE_DEFAULT_PARTITION {
                    entry.push(value);
                }
            }
        }

        let fields: Vec<Field> = order
            .into_iter()
            .map(|key| {
                let observed = values.get(&key).map(Vec::as_slice).unwrap_or_default();
                let data_type = infer_type(observed);
                Field::new(key, data_type, true)
            })
            .collect();
        Self::new(Arc::new(Schema::new(fields)))
    }
}

fn split_segment(segment: &str) -> Option<(&str, String)> {
    let (key, value) = segment.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some((key, percent_decode_str(value).decode_utf8_lossy().into_owned()))
}

fn infer_type(values: &[String]) -> DataType {
    if values.iter().all(|v| v.parse::<i32>().is_ok()) && !values.is_empty() {
        DataType::Int32
    } else if values.iter().all(|v| v.parse::<i64>().is_ok()) && !values.is_empty() {
        DataType::Int64
    } else {
        DataType::Utf8
    }
}

impl PartitionScheme for HivePartitionScheme {
    fn type_name(&self) -> &'static str {
        "hive"
    }

    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn parse(&self, path: &str) -> PartitionKeys {
        let mut keys = KeyCollector::new(path);
        for (key, value) in segments(path).filter_map(split_segment) {
            let Ok(field) = self.schema.field_with_name(key) else {
                continue;
            };
            if value == HIVE_DEFAULT_PARTITION {
                continue;
            }
            keys.bind(field, &value);
        }
        keys.finish()
    }
}

/// Positional segments: the i-th directory binds to the i-th schema field.
///
/// `2020/01` under a schema `(year: Int32, month: Int32)` yields
/// `year == 2020 and month == 1`. Paths shorter than the schema leave the
/// remaining fields unconstrained; extra segments are ignored.
#[derive(Debug, Clone)]
pub struct SchemaPartitionScheme {
    schema: SchemaRef,
}

impl SchemaPartitionScheme {
    pub fn new(schema: SchemaRef) -> Self {
        Self { schema }
    }
}

impl PartitionScheme for SchemaPartitionScheme {
    fn type_name(&self) -> &'static str {
        "schema"
    }

    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn parse(&self, path: &str) -> PartitionKeys {
        let mut keys = KeyCollector::new(path);
        for (field, segment) in self.schema.fields().iter().zip(segments(path)) {
            let segment = percent_decode_str(segment).decode_utf8_lossy();
            keys.bind(field, &segment);
        }
        keys.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{TriState, col, lit};

    fn year_month() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("year", DataType::Int32, true),
            Field::new("month", DataType::Utf8, true),
        ]))
    }

    #[test]
    fn hive_segments_become_equalities() {
        let scheme = HivePartitionScheme::new(year_month());
        let keys = scheme.parse("year=2020/other/month=a%2Fb");
        assert!(keys.is_resolved());
        assert_eq!(
            keys.expression,
            col("year").eq(lit(2020i32)).and(col("month").eq(lit("a/b")))
        );
    }

    #[test]
    fn hive_ignores_unknown_keys_and_default_partition() {
        let scheme = HivePartitionScheme::new(year_month());
        let keys = scheme.parse("country=nz/year=__HIVE_DEFAULT_PARTITION__");
        assert!(keys.expression.is_literal_true());
        assert!(keys.is_resolved());
    }

    #[test]
    fn hive_coercion_failure_is_recorded_not_fatal() {
        let scheme = HivePartitionScheme::new(year_month());
        let keys = scheme.parse("year=twenty/month=05");
        assert_eq!(keys.expression, col("month").eq(lit("05")));
        assert_eq!(keys.unresolved.len(), 1);
        assert!(matches!(
            &keys.unresolved[0],
            QuarryError::PartitionUnresolved { field, segment, .. }
                if field == "year" && segment == "twenty"
        ));

        // The unconstrained key must never make the fragment prunable.
        let binding = keys.expression.known_field_values();
        assert_eq!(
            col("year").eq(lit(1999i32)).evaluate(&binding),
            TriState::Unknown
        );
    }

    #[test]
    fn hive_expression_holds_only_for_its_own_value() {
        let scheme = HivePartitionScheme::new(year_month());
        for year in [-1i32, 0, 2020, i32::MAX] {
            let keys = scheme.parse(&format!("year={year}"));
            let own = HashMap::from([("year".to_string(), ScalarValue::Int32(Some(year)))]);
            let other = HashMap::from([(
                "year".to_string(),
                ScalarValue::Int32(Some(year.wrapping_add(1))),
            )]);
            assert_eq!(keys.expression.evaluate(&own), TriState::True);
            assert_eq!(keys.expression.evaluate(&other), TriState::False);
        }
    }

    #[test]
    fn hive_infer_widens_types() {
        let scheme = HivePartitionScheme::infer([
            "year=2020/id=1/tag=x",
            "year=2021/id=9999999999/tag=7",
            "year=__HIVE_DEFAULT_PARTITION__/id=2",
        ]);
        let schema = scheme.schema();
        assert_eq!(schema.field(0).name(), "year");
        assert_eq!(schema.field(0).data_type(), &DataType::Int32);
        assert_eq!(schema.field(1).data_type(), &DataType::Int64);
        assert_eq!(schema.field(2).data_type(), &DataType::Utf8);
    }

    #[test]
    fn positional_scheme_leaves_short_tail_unconstrained() {
        let scheme = SchemaPartitionScheme::new(year_month());
        assert_eq!(
            scheme.parse("2020/jan/extra").expression,
            col("year").eq(lit(2020i32)).and(col("month").eq(lit("jan")))
        );
        assert_eq!(
            scheme.parse("2020").expression,
            col("year").eq(lit(2020i32))
        );
        assert!(scheme.parse("").expression.is_literal_true());
    }
}
