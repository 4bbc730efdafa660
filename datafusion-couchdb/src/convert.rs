//! Conversion between JSON documents and Arrow record batches

use couchdb_store::Document;
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::{DataType as ArrowDataType, Fields, SchemaRef};
use datafusion::arrow::json::writer::ArrayWriter;
use datafusion::arrow::json::ReaderBuilder;
use datafusion::arrow::record_batch::RecordBatchOptions;
use serde_json::{Map, Value};

use crate::error::Result;

pub const BATCH_SIZE: usize = 8192;

/// Decode documents into batches of at most [`BATCH_SIZE`] rows.
///
/// Values that do not fit their column become null, except that any
/// value fits a string column as its JSON text. Keys outside the schema
/// are ignored.
pub fn documents_to_batches(documents: &[Document], schema: &SchemaRef) -> Result<Vec<RecordBatch>> {
    let mut batches = Vec::with_capacity(documents.len().div_ceil(BATCH_SIZE));

    for chunk in documents.chunks(BATCH_SIZE) {
        // Handle empty schema (e.g., sample size 0)
        if schema.fields().is_empty() {
            let options = RecordBatchOptions::new().with_row_count(Some(chunk.len()));
            batches.push(RecordBatch::try_new_with_options(
                schema.clone(),
                vec![],
                &options,
            )?);
            continue;
        }

        let rows: Vec<Value> = chunk
            .iter()
            .map(|doc| conform_object(doc, schema.fields()))
            .collect();

        let mut decoder = ReaderBuilder::new(schema.clone())
            .with_batch_size(BATCH_SIZE)
            .build_decoder()?;
        decoder.serialize(&rows)?;
        if let Some(batch) = decoder.flush()? {
            batches.push(batch);
        }
    }

    Ok(batches)
}

/// Encode batches as documents, one per row; null columns are omitted
pub fn batches_to_documents(batches: &[RecordBatch]) -> Result<Vec<Document>> {
    let mut writer = ArrayWriter::new(Vec::new());
    for batch in batches {
        writer.write(batch)?;
    }
    writer.finish()?;

    let buffer = writer.into_inner();
    if buffer.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(&buffer)?)
}

fn conform_object(document: &Map<String, Value>, fields: &Fields) -> Value {
    let mut row = Map::with_capacity(fields.len());
    for field in fields.iter() {
        if let Some(value) = document.get(field.name()) {
            let value = conform_value(value, field.data_type());
            if !value.is_null() {
                row.insert(field.name().clone(), value);
            }
        }
    }
    Value::Object(row)
}

fn conform_value(value: &Value, data_type: &ArrowDataType) -> Value {
    match (data_type, value) {
        (_, Value::Null) => Value::Null,
        (ArrowDataType::Utf8 | ArrowDataType::LargeUtf8 | ArrowDataType::Utf8View, Value::String(_)) => {
            value.clone()
        }
        (ArrowDataType::Utf8 | ArrowDataType::LargeUtf8 | ArrowDataType::Utf8View, other) => {
            Value::String(other.to_string())
        }
        (ArrowDataType::Boolean, Value::Bool(_)) => value.clone(),
        (ArrowDataType::Boolean, _) => Value::Null,
        (t, Value::Number(n)) if t.is_integer() => {
            if n.is_i64() || n.is_u64() {
                value.clone()
            } else {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| Value::from(f as i64))
                    .unwrap_or(Value::Null)
            }
        }
        // numbers stay numbers so server-side comparisons agree with SQL
        (t, _) if t.is_integer() => Value::Null,
        (t, Value::Number(_)) if t.is_floating() => value.clone(),
        (t, _) if t.is_floating() => Value::Null,
        (
            ArrowDataType::List(item) | ArrowDataType::LargeList(item),
            Value::Array(values),
        ) => Value::Array(
            values
                .iter()
                .map(|v| conform_value(v, item.data_type()))
                .collect(),
        ),
        (ArrowDataType::List(_) | ArrowDataType::LargeList(_), _) => Value::Null,
        (ArrowDataType::Struct(fields), Value::Object(map)) => conform_object(map, fields),
        (ArrowDataType::Struct(_), _) => Value::Null,
        // Temporal and other types are left to the JSON decoder
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::infer_schema;
    use datafusion::arrow::array::{Array, BooleanArray, Float64Array, Int64Array, ListArray, StringArray, StructArray};
    use datafusion::arrow::datatypes::{Field, Schema};
    use serde_json::json;
    use std::sync::Arc;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_documents_to_batches_with_inferred_schema() {
        let docs = vec![
            doc(json!({"_id": "m1", "title": "Alien", "year": 1979, "tags": ["scifi"]})),
            doc(json!({"_id": "m2", "title": "Heat", "rating": 8.3})),
        ];
        let schema = infer_schema(&docs);
        let batches = documents_to_batches(&docs, &schema).unwrap();

        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 2);

        let year = batch
            .column_by_name("year")
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(year.value(0), 1979);
        assert!(year.is_null(1));

        let rating = batch
            .column_by_name("rating")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert!(rating.is_null(0));
        assert_eq!(rating.value(1), 8.3);

        let tags = batch
            .column_by_name("tags")
            .unwrap()
            .as_any()
            .downcast_ref::<ListArray>()
            .unwrap();
        assert_eq!(tags.value(0).len(), 1);
        assert!(tags.is_null(1));
    }

    #[test]
    fn test_mismatched_values_are_conformed() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("label", ArrowDataType::Utf8, true),
            Field::new("count", ArrowDataType::Int64, true),
            Field::new("ok", ArrowDataType::Boolean, true),
            Field::new(
                "meta",
                ArrowDataType::Struct(vec![Field::new("k", ArrowDataType::Utf8, true)].into()),
                true,
            ),
        ]));
        let docs = vec![
            doc(json!({"label": 7, "count": "12", "ok": "yes", "meta": {"k": {"deep": 1}}})),
            doc(json!({"label": {"a": 1}, "count": 3.0, "ok": false, "meta": 5, "extra": 1})),
        ];
        let batches = documents_to_batches(&docs, &schema).unwrap();
        let batch = &batches[0];

        let label = batch.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(label.value(0), "7");
        assert_eq!(label.value(1), r#"{"a":1}"#);

        let count = batch.column(1).as_any().downcast_ref::<Int64Array>().unwrap();
        assert!(count.is_null(0));
        assert_eq!(count.value(1), 3);

        let ok = batch.column(2).as_any().downcast_ref::<BooleanArray>().unwrap();
        assert!(ok.is_null(0));
        assert!(!ok.value(1));

        let meta = batch.column(3).as_any().downcast_ref::<StructArray>().unwrap();
        let k = meta.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(k.value(0), r#"{"deep":1}"#);
        assert!(meta.is_null(1));
    }

    #[test]
    fn test_large_input_is_split_into_batches() {
        let docs: Vec<Document> = (0..BATCH_SIZE + 10).map(|i| doc(json!({"n": i}))).collect();
        let schema = infer_schema(&docs);
        let batches = documents_to_batches(&docs, &schema).unwrap();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].num_rows(), BATCH_SIZE);
        assert_eq!(batches[1].num_rows(), 10);
    }

    #[test]
    fn test_empty_schema_keeps_row_count() {
        let schema = Arc::new(Schema::empty());
        let docs = vec![doc(json!({"a": 1})), doc(json!({"b": 2}))];
        let batches = documents_to_batches(&docs, &schema).unwrap();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].num_rows(), 2);
        assert_eq!(batches[0].num_columns(), 0);
    }

    #[test]
    fn test_no_documents_no_batches() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", ArrowDataType::Int64, true)]));
        assert!(documents_to_batches(&[], &schema).unwrap().is_empty());
        assert!(batches_to_documents(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_batches_to_documents_omits_nulls() {
        let docs = vec![
            doc(json!({"_id": "a", "n": 1, "cast": {"lead": "Ripley"}})),
            doc(json!({"_id": "b"})),
        ];
        let schema = infer_schema(&docs);
        let batches = documents_to_batches(&docs, &schema).unwrap();

        let back = batches_to_documents(&batches).unwrap();
        assert_eq!(back, docs);
    }
}
