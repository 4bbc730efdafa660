use couchdb_store::Document;
use datafusion::arrow::datatypes::{DataType as ArrowDataType, Field, Fields, Schema, SchemaRef};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;

/// JSON value kind, widened as more samples are seen
#[derive(Debug, Clone, PartialEq)]
enum JsonKind {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Array(Box<JsonKind>),
    /// Fields in order of first sighting
    Object(Vec<(String, JsonKind)>),
}

impl JsonKind {
    fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonKind::Null,
            Value::Bool(_) => JsonKind::Boolean,
            Value::Number(n) if n.is_i64() => JsonKind::Integer,
            Value::Number(_) => JsonKind::Float,
            Value::String(_) => JsonKind::String,
            Value::Array(items) => JsonKind::Array(Box::new(
                items
                    .iter()
                    .map(JsonKind::of)
                    .fold(JsonKind::Null, JsonKind::merge),
            )),
            Value::Object(map) => {
                let mut fields = Vec::new();
                merge_fields(&mut fields, map);
                JsonKind::Object(fields)
            }
        }
    }

    fn merge(self, other: JsonKind) -> JsonKind {
        match (self, other) {
            (JsonKind::Null, other) | (other, JsonKind::Null) => other,
            (JsonKind::Integer, JsonKind::Float) | (JsonKind::Float, JsonKind::Integer) => {
                JsonKind::Float
            }
            (JsonKind::Array(a), JsonKind::Array(b)) => JsonKind::Array(Box::new(a.merge(*b))),
            (JsonKind::Object(mut a), JsonKind::Object(b)) => {
                for (name, kind) in b {
                    merge_field(&mut a, name, kind);
                }
                JsonKind::Object(a)
            }
            (a, b) if a == b => a,
            // Irreconcilable kinds keep the raw JSON text
            _ => JsonKind::String,
        }
    }

    fn to_arrow(&self) -> ArrowDataType {
        match self {
            JsonKind::Null | JsonKind::String => ArrowDataType::Utf8,
            JsonKind::Boolean => ArrowDataType::Boolean,
            JsonKind::Integer => ArrowDataType::Int64,
            JsonKind::Float => ArrowDataType::Float64,
            JsonKind::Array(item) => {
                ArrowDataType::List(Arc::new(Field::new("item", item.to_arrow(), true)))
            }
            JsonKind::Object(fields) if fields.is_empty() => ArrowDataType::Utf8,
            JsonKind::Object(fields) => ArrowDataType::Struct(to_arrow_fields(fields)),
        }
    }
}

fn merge_field(fields: &mut Vec<(String, JsonKind)>, name: String, kind: JsonKind) {
    match fields.iter_mut().find(|(existing, _)| *existing == name) {
        Some((_, existing)) => {
            let current = std::mem::replace(existing, JsonKind::Null);
            *existing = current.merge(kind);
        }
        None => fields.push((name, kind)),
    }
}

fn merge_fields(fields: &mut Vec<(String, JsonKind)>, document: &Document) {
    for (name, value) in document {
        merge_field(fields, name.clone(), JsonKind::of(value));
    }
}

fn to_arrow_fields(fields: &[(String, JsonKind)]) -> Fields {
    fields
        .iter()
        .map(|(name, kind)| Field::new(name.clone(), kind.to_arrow(), true))
        .collect()
}

/// Infer one Arrow schema covering every sampled document.
///
/// Columns appear in order of first sighting; every column is nullable
/// since any document may omit it. Integers widen to floats when both are
/// seen, and other conflicts fall back to `Utf8` holding the JSON text.
/// No documents yield a schema with zero fields.
pub fn infer_schema<'a, I>(documents: I) -> SchemaRef
where
    I: IntoIterator<Item = &'a Document>,
{
    let mut fields = Vec::new();
    for document in documents {
        merge_fields(&mut fields, document);
    }
    Arc::new(Schema::new(to_arrow_fields(&fields)))
}

/// Create projected Arrow schema from column indices
pub fn create_projected_schema(schema: &Schema, projection: &[usize]) -> Result<SchemaRef> {
    Ok(Arc::new(schema.project(projection)?))
}

/// Column names for the given projection, used as `_find` fields
pub fn projected_field_names(schema: &Schema, projection: &[usize]) -> Vec<String> {
    projection
        .iter()
        .filter_map(|&idx| schema.fields().get(idx))
        .map(|field| field.name().clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_infer_primitive_types() {
        let docs = vec![doc(json!({
            "_id": "m1",
            "title": "Alien",
            "year": 1979,
            "rating": 8.5,
            "seen": true
        }))];
        let schema = infer_schema(&docs);

        assert_eq!(schema.field_with_name("_id").unwrap().data_type(), &ArrowDataType::Utf8);
        assert_eq!(schema.field_with_name("year").unwrap().data_type(), &ArrowDataType::Int64);
        assert_eq!(
            schema.field_with_name("rating").unwrap().data_type(),
            &ArrowDataType::Float64
        );
        assert_eq!(
            schema.field_with_name("seen").unwrap().data_type(),
            &ArrowDataType::Boolean
        );
        assert!(schema.fields().iter().all(|f| f.is_nullable()));
    }

    #[test]
    fn test_infer_unions_fields_in_first_sighting_order() {
        let docs = vec![
            doc(json!({"b": 1, "d": "x"})),
            doc(json!({"a": true, "b": 2})),
            doc(json!({"c": null})),
        ];
        let schema = infer_schema(&docs);

        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["b", "d", "a", "c"]);
        // only nulls seen
        assert_eq!(schema.field_with_name("c").unwrap().data_type(), &ArrowDataType::Utf8);
    }

    #[test]
    fn test_infer_widens_conflicting_types() {
        let docs = vec![
            doc(json!({"n": 1, "mixed": 1})),
            doc(json!({"n": 2.5, "mixed": "one"})),
        ];
        let schema = infer_schema(&docs);

        assert_eq!(schema.field_with_name("n").unwrap().data_type(), &ArrowDataType::Float64);
        assert_eq!(schema.field_with_name("mixed").unwrap().data_type(), &ArrowDataType::Utf8);
    }

    #[test]
    fn test_infer_nested_types() {
        let docs = vec![
            doc(json!({"tags": ["a"], "cast": {"lead": "Ripley"}})),
            doc(json!({"tags": [], "cast": {"lead": "Ash", "age": 40}, "empty": {}})),
        ];
        let schema = infer_schema(&docs);

        assert_eq!(
            schema.field_with_name("tags").unwrap().data_type(),
            &ArrowDataType::List(Arc::new(Field::new("item", ArrowDataType::Utf8, true)))
        );
        let cast = schema.field_with_name("cast").unwrap();
        match cast.data_type() {
            ArrowDataType::Struct(fields) => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].name(), "lead");
                assert_eq!(fields[1].data_type(), &ArrowDataType::Int64);
            }
            other => panic!("expected struct, got {:?}", other),
        }
        assert_eq!(schema.field_with_name("empty").unwrap().data_type(), &ArrowDataType::Utf8);
    }

    #[test]
    fn test_infer_empty_sample_has_no_fields() {
        let schema = infer_schema(&Vec::<Document>::new());
        assert!(schema.fields().is_empty());
    }

    #[test]
    fn test_create_projected_schema() {
        let schema = Schema::new(vec![
            Field::new("col1", ArrowDataType::Int64, true),
            Field::new("col2", ArrowDataType::Utf8, true),
            Field::new("col3", ArrowDataType::Float64, true),
        ]);

        let projected = create_projected_schema(&schema, &[0, 2]).unwrap();
        assert_eq!(projected.fields().len(), 2);
        assert_eq!(projected.field(0).name(), "col1");
        assert_eq!(projected.field(1).name(), "col3");

        assert!(create_projected_schema(&schema, &[5]).is_err());
        assert_eq!(projected_field_names(&schema, &[1]), vec!["col2".to_string()]);
    }
}
