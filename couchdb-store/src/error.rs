use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// HTTP status carried by the error, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_carries_message_only() {
        let err = Error::Transport("connection refused".to_string());
        assert_eq!(err.to_string(), "transport error: connection refused");
        assert_eq!(err.status(), None);

        let err = Error::Http {
            status: 404,
            body: "missing".to_string(),
        };
        assert_eq!(err.status(), Some(404));
    }
}
