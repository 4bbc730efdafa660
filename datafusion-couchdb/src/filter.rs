//! Translation of DataFusion filter expressions into Mango selectors
//!
//! Pushdown is advisory: the provider reports every translated filter as
//! `Inexact`, so DataFusion re-applies it to whatever the server returns.
//! A selector may therefore match too much but never too little, which
//! limits translation to columns whose decoded values equal the stored JSON:
//! numeric and boolean columns. Text columns hold any JSON value rendered
//! as text, and a decoded `NULL` can stand for a value of the wrong type, so
//! neither is compared on the server.

use datafusion::arrow::datatypes::{DataType, Schema};
use datafusion::logical_expr::expr::InList;
use datafusion::logical_expr::{BinaryExpr, Expr, Operator};
use datafusion::scalar::ScalarValue;
use serde_json::{json, Value};

/// Combine every translatable filter into one selector.
///
/// Returns `None` when nothing can be pushed down.
pub fn to_selector(filters: &[Expr], schema: &Schema) -> Option<Value> {
    let mut clauses: Vec<Value> = filters
        .iter()
        .filter_map(|f| translate(f, schema))
        .collect();
    match clauses.len() {
        0 => None,
        1 => clauses.pop(),
        _ => Some(json!({ "$and": clauses })),
    }
}

pub fn is_translatable(expr: &Expr, schema: &Schema) -> bool {
    translate(expr, schema).is_some()
}

fn translate(expr: &Expr, schema: &Schema) -> Option<Value> {
    match expr {
        Expr::BinaryExpr(BinaryExpr { left, op, right }) => match op {
            Operator::And => {
                let l = translate(left, schema)?;
                let r = translate(right, schema)?;
                Some(json!({ "$and": [l, r] }))
            }
            _ => {
                if let (Some(column), Some(value)) = (column_name(left), literal(right)) {
                    comparable(schema, column, &value)?;
                    comparison(column, *op, value)
                } else if let (Some(value), Some(column)) = (literal(left), column_name(right)) {
                    comparable(schema, column, &value)?;
                    comparison(column, flip(*op)?, value)
                } else {
                    None
                }
            }
        },
        // Any non-null value exists on the server, whatever its type
        Expr::IsNotNull(inner) => {
            let column = column_name(inner)?;
            schema.field_with_name(column).ok()?;
            Some(json!({ column: { "$exists": true } }))
        }
        Expr::InList(InList {
            expr,
            list,
            negated,
        }) => {
            let column = column_name(expr)?;
            let values = list.iter().map(literal).collect::<Option<Vec<_>>>()?;
            for value in &values {
                comparable(schema, column, value)?;
            }
            let op = if *negated { "$nin" } else { "$in" };
            Some(json!({ column: { op: values } }))
        }
        _ => None,
    }
}

/// `Some` when `column` decodes stored values of the literal's JSON type
/// without conversion
fn comparable(schema: &Schema, column: &str, value: &Value) -> Option<()> {
    let field = schema.field_with_name(column).ok()?;
    let exact = match (field.data_type(), value) {
        (DataType::Boolean, Value::Bool(_)) => true,
        (t, Value::Number(_)) => t.is_integer() || t.is_floating(),
        _ => false,
    };
    exact.then_some(())
}

fn comparison(column: &str, op: Operator, value: Value) -> Option<Value> {
    let mango = match op {
        Operator::Eq => "$eq",
        Operator::NotEq => "$ne",
        Operator::Lt => "$lt",
        Operator::LtEq => "$lte",
        Operator::Gt => "$gt",
        Operator::GtEq => "$gte",
        _ => return None,
    };
    Some(json!({ column: { mango: value } }))
}

/// Operator with its operands swapped: `5 < x` is `x > 5`
fn flip(op: Operator) -> Option<Operator> {
    match op {
        Operator::Eq | Operator::NotEq => Some(op),
        Operator::Lt => Some(Operator::Gt),
        Operator::LtEq => Some(Operator::GtEq),
        Operator::Gt => Some(Operator::Lt),
        Operator::GtEq => Some(Operator::LtEq),
        _ => None,
    }
}

fn column_name(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Column(column) => Some(column.name.as_str()),
        _ => None,
    }
}

fn literal(expr: &Expr) -> Option<Value> {
    let Expr::Literal(scalar) = expr else {
        return None;
    };
    match scalar {
        ScalarValue::Boolean(Some(v)) => Some(json!(v)),
        ScalarValue::Int8(Some(v)) => Some(json!(v)),
        ScalarValue::Int16(Some(v)) => Some(json!(v)),
        ScalarValue::Int32(Some(v)) => Some(json!(v)),
        ScalarValue::Int64(Some(v)) => Some(json!(v)),
        ScalarValue::UInt8(Some(v)) => Some(json!(v)),
        ScalarValue::UInt16(Some(v)) => Some(json!(v)),
        ScalarValue::UInt32(Some(v)) => Some(json!(v)),
        ScalarValue::UInt64(Some(v)) => Some(json!(v)),
        ScalarValue::Float32(Some(v)) => serde_json::Number::from_f64(f64::from(*v)).map(Value::Number),
        ScalarValue::Float64(Some(v)) => serde_json::Number::from_f64(*v).map(Value::Number),
        ScalarValue::Utf8(Some(v)) | ScalarValue::LargeUtf8(Some(v)) | ScalarValue::Utf8View(Some(v)) => {
            Some(json!(v))
        }
        _ => None,
    }
}
