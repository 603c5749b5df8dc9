//! Per-row transform pipeline.
//!
//! Every row passes through the same fixed chain:
//!
//! 1. **Flatten** nested objects into dot-separated keys
//! 2. **PiiMask** sensitive fields down to a "has a value" boolean
//! 3. **FieldRemap** source paths onto destination columns
//! 4. **DateStamp** the run timestamp into the date column
//! 5. **Count** the row
//!
//! PiiMask reads by source path, so it must run before the remap.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::ExportError;
use crate::types::{ArrayKeyStyle, Row, TableSpec};

/// One step of the pipeline.
#[derive(Debug)]
pub enum Stage {
    Flatten(ArrayKeyStyle),
    /// Source paths of sensitive fields.
    PiiMask(Vec<String>),
    /// `(source path, destination)` pairs in config order.
    FieldRemap(Vec<(String, String)>),
    DateStamp { column: String, value: String },
    Count(Arc<AtomicU64>),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Flatten(_) => "flatten",
            Stage::PiiMask(_) => "pii_mask",
            Stage::FieldRemap(_) => "field_remap",
            Stage::DateStamp { .. } => "date_stamp",
            Stage::Count(_) => "count",
        }
    }

    pub fn apply(&self, row: Row) -> Result<Row, ExportError> {
        match self {
            Stage::Flatten(style) => flatten(row, *style),
            Stage::PiiMask(paths) => Ok(mask_sensitive(row, paths)),
            Stage::FieldRemap(mappings) => Ok(remap_fields(&row, mappings)),
            Stage::DateStamp { column, value } => {
                let mut row = row;
                row.insert(column.clone(), Value::String(value.clone()));
                Ok(row)
            }
            Stage::Count(counter) => {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(row)
            }
        }
    }
}

/// The ordered stage chain for one table.
#[derive(Debug)]
pub struct TransformPipeline {
    stages: Vec<Stage>,
}

impl TransformPipeline {
    /// Builds the chain for `table`, stamping `timestamp` and counting into `counter`.
    pub fn for_table(table: &TableSpec, timestamp: &str, counter: Arc<AtomicU64>) -> Self {
        let sensitive = table
            .fields
            .iter()
            .filter(|f| f.is_sensitive)
            .map(|f| f.source_path.clone())
            .collect();
        let mappings = table
            .fields
            .iter()
            .filter(|f| !f.dest_path.is_empty())
            .map(|f| (f.source_path.clone(), f.dest_path.clone()))
            .collect();

        Self {
            stages: vec![
                Stage::Flatten(table.metadata.array_keys),
                Stage::PiiMask(sensitive),
                Stage::FieldRemap(mappings),
                Stage::DateStamp {
                    column: table.metadata.date_column.clone(),
                    value: timestamp.to_string(),
                },
                Stage::Count(counter),
            ],
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Runs `row` through every stage. The first failure aborts the row.
    pub fn apply(&self, row: Row) -> Result<Row, ExportError> {
        self.stages.iter().try_fold(row, |row, stage| stage.apply(row))
    }
}

/// Flattens nested objects into `parent.child` keys.
///
/// Arrays are kept as their JSON text under the array's own key. Objects
/// inside an array are additionally flattened beneath it, named according to
/// `style`. Arrays of scalars only keep the JSON text.
pub fn flatten(row: Row, style: ArrayKeyStyle) -> Result<Row, ExportError> {
    let mut flat = Row::new();
    flatten_into(row, "", style, &mut flat)?;
    Ok(flat)
}

fn flatten_into(
    object: Row,
    prefix: &str,
    style: ArrayKeyStyle,
    flat: &mut Row,
) -> Result<(), ExportError> {
    for (name, value) in object {
        let key = format!("{}{}", prefix, name);
        match value {
            Value::Object(inner) => flatten_into(inner, &format!("{}.", key), style, flat)?,
            Value::Array(items) => {
                let encoded = serde_json::to_string(&items).map_err(|e| ExportError::Transform {
                    stage: "flatten",
                    reason: format!("cannot encode array at '{}': {}", key, e),
                })?;
                flat.insert(key.clone(), Value::String(encoded));
                for (position, item) in items.into_iter().enumerate() {
                    if let Value::Object(inner) = item {
                        let nested = match style {
                            ArrayKeyStyle::Indexed => format!("{}.{}.", key, position),
                            ArrayKeyStyle::Shared => format!("{}.", key),
                        };
                        flatten_into(inner, &nested, style, flat)?;
                    }
                }
            }
            scalar => {
                flat.insert(key, scalar);
            }
        }
    }
    Ok(())
}

/// Replaces every sensitive field with whether it holds a non-default value.
///
/// Absent fields become `false` rather than an error.
pub fn mask_sensitive(mut row: Row, paths: &[String]) -> Row {
    for path in paths {
        let present = row.get(path).is_some_and(|value| !is_default(value));
        row.insert(path.clone(), Value::Bool(present));
    }
    row
}

/// Whether `value` is the zero value of its kind.
fn is_default(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}

/// Builds a row holding only the mapped destination columns.
///
/// One source may feed several destinations. Sources missing from the row
/// produce no column.
pub fn remap_fields(row: &Row, mappings: &[(String, String)]) -> Row {
    let mut out = Row::new();
    for (source, dest) in mappings {
        if let Some(value) = row.get(source) {
            out.insert(dest.clone(), value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldSpec, TableMetadata};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {}", other),
        }
    }

    fn field(source: &str, dest: &str, pii: bool) -> FieldSpec {
        FieldSpec {
            source_path: source.to_string(),
            dest_path: dest.to_string(),
            is_sensitive: pii,
        }
    }

    fn table(fields: Vec<FieldSpec>) -> TableSpec {
        TableSpec {
            source_collection: "things".to_string(),
            dest_name: "things".to_string(),
            fields,
            metadata: TableMetadata::default(),
        }
    }

    #[test]
    fn full_chain_on_documented_example() {
        let counter = Arc::new(AtomicU64::new(0));
        let scores = table(vec![field("a.b", "x", false), field("a.c", "y", true)]);
        let pipeline = TransformPipeline::for_table(&scores, "2024-01-01T00:00:00Z", counter.clone());
        let input = row(json!({"a": {"b": 5, "c": 0}}));

        let flat = pipeline.stages()[0].apply(input.clone()).unwrap();
        assert_eq!(flat, row(json!({"a.b": 5, "a.c": 0})));
        let masked = pipeline.stages()[1].apply(flat).unwrap();
        assert_eq!(masked, row(json!({"a.b": 5, "a.c": false})));
        let remapped = pipeline.stages()[2].apply(masked).unwrap();
        assert_eq!(remapped, row(json!({"x": 5, "y": false})));

        let out = pipeline.apply(input).unwrap();
        assert_eq!(
            out,
            row(json!({"x": 5, "y": false, "_data_timestamp": "2024-01-01T00:00:00Z"}))
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stage_order_is_fixed() {
        let pipeline = TransformPipeline::for_table(&table(vec![]), "t", Arc::default());
        let names: Vec<_> = pipeline.stages().iter().map(Stage::name).collect();
        assert_eq!(names, ["flatten", "pii_mask", "field_remap", "date_stamp", "count"]);
    }

    #[test]
    fn flatten_is_idempotent() {
        let input = row(json!({
            "name": {"first": "Ada", "last": "Lovelace"},
            "tags": ["x", "y"],
            "schools": [{"id": 1}, {"id": 2, "meta": {"primary": true}}],
            "empty": {},
            "n": null
        }));
        for style in [ArrayKeyStyle::Indexed, ArrayKeyStyle::Shared] {
            let once = flatten(input.clone(), style).unwrap();
            let twice = flatten(once.clone(), style).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn flatten_arrays_indexed() {
        let input = row(json!({
            "tags": ["x", "y"],
            "schools": [{"id": 1}, {"id": 2}]
        }));
        let flat = flatten(input, ArrayKeyStyle::Indexed).unwrap();
        assert_eq!(
            flat,
            row(json!({
                "tags": "[\"x\",\"y\"]",
                "schools": "[{\"id\":1},{\"id\":2}]",
                "schools.0.id": 1,
                "schools.1.id": 2
            }))
        );
    }

    #[test]
    fn flatten_arrays_shared_prefix_keeps_last_element() {
        let input = row(json!({"schools": [{"id": 1}, {"id": 2}]}));
        let flat = flatten(input, ArrayKeyStyle::Shared).unwrap();
        assert_eq!(flat.get("schools.id"), Some(&json!(2)));
        assert_eq!(flat.get("schools"), Some(&json!("[{\"id\":1},{\"id\":2}]")));
    }

    #[test]
    fn pii_mask_default_and_absent_values_are_false() {
        let paths: Vec<String> = ["zero", "blank", "missing", "null", "off"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let masked = mask_sensitive(
            row(json!({"zero": 0, "blank": "", "null": null, "off": false})),
            &paths,
        );
        for path in &paths {
            assert_eq!(masked.get(path), Some(&json!(false)), "{}", path);
        }
    }

    #[test]
    fn pii_mask_present_values_are_true() {
        let paths: Vec<String> = ["n", "s", "f", "b"].iter().map(|s| s.to_string()).collect();
        let masked = mask_sensitive(
            row(json!({"n": 7, "s": "555-1234", "f": 0.5, "b": true, "other": 0})),
            &paths,
        );
        for path in &paths {
            assert_eq!(masked.get(path), Some(&json!(true)), "{}", path);
        }
        assert_eq!(masked.get("other"), Some(&json!(0)));
    }

    #[test]
    fn remap_keeps_exactly_the_destination_keys() {
        let scores = table(vec![
            field("a", "x", false),
            field("a", "x2", false),
            field("b", "", false),
            field("c", "z", false),
            field("gone", "w", false),
        ]);
        let pipeline = TransformPipeline::for_table(&scores, "t", Arc::default());
        let input = row(json!({"a": 1, "b": 2, "c": 3, "unmapped": 4}));
        let out = pipeline.stages()[2].apply(input).unwrap();

        let keys: BTreeSet<_> = out.keys().map(String::as_str).collect();
        assert_eq!(keys, BTreeSet::from(["x", "x2", "z"]));
        assert_eq!(out.get("x"), out.get("x2"));
    }

    #[test]
    fn date_stamp_overwrites_existing_column() {
        let mut scores = table(vec![field("when", "when", false)]);
        scores.metadata.date_column = "when".to_string();
        let pipeline = TransformPipeline::for_table(&scores, "2024-01-01T00:00:00Z", Arc::default());
        let out = pipeline.apply(row(json!({"when": "last week"}))).unwrap();
        assert_eq!(out, row(json!({"when": "2024-01-01T00:00:00Z"})));
    }
}
