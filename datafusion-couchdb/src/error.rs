use couchdb_store::SaveOutcome;
use datafusion::arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use thiserror::Error;

use crate::writer::WriteReport;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or contradictory settings, raised before any network call
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A store call failed; `scope` names the partition, batch or feed involved
    #[error("Store access error ({scope}): {source}")]
    StoreAccess {
        scope: String,
        source: couchdb_store::Error,
    },

    /// The store accepted the request but refused some documents
    #[error("Store rejected {} document(s) ({scope}), first: {}", rejected.len(), first_rejection(rejected))]
    Rejected {
        scope: String,
        rejected: Vec<SaveOutcome>,
    },

    #[error("Schema inference error for {source_url}: {message}")]
    SchemaInference { source_url: String, message: String },

    #[error("Partial write: {0}")]
    PartialWrite(WriteReport),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("DataFusion error: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn store_access(scope: impl Into<String>, source: couchdb_store::Error) -> Self {
        Error::StoreAccess {
            scope: scope.into(),
            source,
        }
    }
}

fn first_rejection(rejected: &[SaveOutcome]) -> String {
    rejected
        .first()
        .map(ToString::to_string)
        .unwrap_or_default()
}

impl From<Error> for DataFusionError {
    fn from(err: Error) -> Self {
        match err {
            Error::DataFusion(e) => e,
            other => DataFusionError::External(Box::new(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_access_names_scope() {
        let err = Error::store_access(
            "partition 1 [100, 200)",
            couchdb_store::Error::Http {
                status: 503,
                body: "unavailable".to_string(),
            },
        );
        let msg = err.to_string();
        assert!(msg.contains("partition 1 [100, 200)"));
        assert!(msg.contains("503"));
    }

    #[test]
    fn test_rejected_shows_first_outcome() {
        let err = Error::Rejected {
            scope: "partition 0".to_string(),
            rejected: vec![SaveOutcome::rejected(
                Some("a".to_string()),
                "conflict",
                "Document update conflict.",
            )],
        };
        assert_eq!(
            err.to_string(),
            "Store rejected 1 document(s) (partition 0), first: a: conflict (Document update conflict.)"
        );
    }

    #[test]
    fn test_datafusion_error_is_unwrapped() {
        let err: DataFusionError = Error::DataFusion(DataFusionError::Plan("bad".into())).into();
        assert!(matches!(err, DataFusionError::Plan(_)));

        let err: DataFusionError = Error::Configuration("nope".into()).into();
        assert!(matches!(err, DataFusionError::External(_)));
    }
}
