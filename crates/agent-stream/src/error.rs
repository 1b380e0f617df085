use agent_stream_proto::ProtoError;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("no connection to the client agent")]
    NoConnection,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("resource does not support this operation: {0}")]
    Unsupported(String),
}

impl StreamError {
    /// Failures that switching to the other network path might fix.
    ///
    /// Client errors (not found, permission denied) are terminal: the proxied
    /// path would answer the same way.
    pub fn is_transient(&self) -> bool {
        match self {
            StreamError::Timeout(_) | StreamError::Network(_) => true,
            StreamError::HttpStatus(status) => status.is_server_error(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return StreamError::HttpStatus(status);
        }
        StreamError::Network(err.to_string())
    }
}

impl From<ProtoError> for StreamError {
    fn from(err: ProtoError) -> Self {
        StreamError::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Decode(err.to_string())
    }
}

impl From<url::ParseError> for StreamError {
    fn from(err: url::ParseError) -> Self {
        StreamError::InvalidUrl(err.to_string())
    }
}

pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_failures() {
        assert!(StreamError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(StreamError::Network("connection refused".into()).is_transient());
        assert!(StreamError::HttpStatus(StatusCode::BAD_GATEWAY).is_transient());
    }

    #[test]
    fn client_errors_are_terminal() {
        assert!(!StreamError::HttpStatus(StatusCode::NOT_FOUND).is_transient());
        assert!(!StreamError::HttpStatus(StatusCode::FORBIDDEN).is_transient());
        assert!(!StreamError::Decode("bad frame".into()).is_transient());
        assert!(!StreamError::Cancelled.is_transient());
        assert!(!StreamError::NoConnection.is_transient());
    }
}
