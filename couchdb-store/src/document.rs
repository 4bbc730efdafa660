use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A schemaless JSON object as stored in the database
pub type Document = Map<String, Value>;

/// Fields assigned by the store rather than by the writer
pub const METADATA_FIELDS: [&str; 2] = ["_id", "_rev"];

const DESIGN_PREFIX: &str = "_design/";

/// Design documents hold views and indexes; they are never data rows.
pub fn is_design_document(doc: &Document) -> bool {
    doc.get("_id")
        .and_then(Value::as_str)
        .map(|id| id.starts_with(DESIGN_PREFIX))
        .unwrap_or(false)
}

/// Position in a database's change feed.
///
/// CouchDB 2+ uses opaque string sequences, 1.x used integers; both are
/// kept in their textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedCursor(String);

impl FeedCursor {
    pub fn new(seq: impl Into<String>) -> Self {
        Self(seq.into())
    }

    /// Start of history
    pub fn beginning() -> Self {
        Self("0".to_string())
    }

    /// Only changes made after subscribing
    pub fn now() -> Self {
        Self("now".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build a cursor from a raw `seq`/`last_seq` JSON value
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl Default for FeedCursor {
    fn default() -> Self {
        Self::beginning()
    }
}

impl fmt::Display for FeedCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page pulled from a change feed
#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    pub documents: Vec<Document>,
    pub last_seq: FeedCursor,
    /// Changes the server still holds after this page, when it reports it
    pub pending: Option<u64>,
}

impl ChangePage {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Per-document result of a bulk save
///
/// Mirrors the `_bulk_docs` response items:
/// `{"ok": true, "id": "...", "rev": "..."}` or
/// `{"id": "...", "error": "conflict", "reason": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveOutcome {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl SaveOutcome {
    pub fn saved(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            rev: Some(rev.into()),
            error: None,
            reason: None,
        }
    }

    pub fn rejected(id: Option<String>, error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id,
            rev: None,
            error: Some(error.into()),
            reason: Some(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for SaveOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id.as_deref().unwrap_or("<unassigned>");
        match (&self.error, &self.reason) {
            (Some(error), Some(reason)) => write!(f, "{}: {} ({})", id, error, reason),
            (Some(error), None) => write!(f, "{}: {}", id, error),
            _ => write!(f, "{}: saved", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_design_document_detection() {
        assert!(is_design_document(&doc(json!({"_id": "_design/views"}))));
        assert!(!is_design_document(&doc(json!({"_id": "design"}))));
        assert!(!is_design_document(&doc(json!({"name": "no id"}))));
    }

    #[test]
    fn test_cursor_from_numeric_and_string_seq() {
        assert_eq!(FeedCursor::from_value(&json!(42)).unwrap().as_str(), "42");
        assert_eq!(
            FeedCursor::from_value(&json!("3-g1AAAA")).unwrap().as_str(),
            "3-g1AAAA"
        );
        assert!(FeedCursor::from_value(&json!(null)).is_none());
    }

    #[test]
    fn test_deserialize_bulk_save_items() {
        let json = r#"[
            {"ok": true, "id": "a", "rev": "1-x"},
            {"id": "b", "error": "conflict", "reason": "Document update conflict."}
        ]"#;
        let outcomes: Vec<SaveOutcome> = serde_json::from_str(json).unwrap();

        assert!(outcomes[0].is_ok());
        assert_eq!(outcomes[0].rev.as_deref(), Some("1-x"));
        assert!(!outcomes[1].is_ok());
        assert_eq!(
            outcomes[1].to_string(),
            "b: conflict (Document update conflict.)"
        );
    }
}
