//! Backend error taxonomy

use super::resilience::RetryableError;

/// Error returned by any backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Connection failure, timeout or other transport error
    Network(String),
    /// Non-success HTTP status other than conflict/not-found
    Status { code: u16, message: String },
    /// The resource already exists
    Conflict(String),
    /// The resource does not exist
    NotFound(String),
    /// The response body could not be decoded
    Decode(String),
}

impl BackendError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        BackendError::Status {
            code,
            message: message.into(),
        }
    }

    /// Build from an HTTP status code and response message
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            404 => BackendError::NotFound(message),
            409 => BackendError::Conflict(message),
            _ => BackendError::Status { code, message },
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, BackendError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            BackendError::Status { code, .. } => Some(*code),
            BackendError::Conflict(_) => Some(409),
            BackendError::NotFound(_) => Some(404),
            BackendError::Network(_) | BackendError::Decode(_) => None,
        }
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Network(msg) => write!(f, "network error: {}", msg),
            BackendError::Status { code, message } => write!(f, "HTTP {}: {}", code, message),
            BackendError::Conflict(msg) => write!(f, "already exists: {}", msg),
            BackendError::NotFound(msg) => write!(f, "not found: {}", msg),
            BackendError::Decode(msg) => write!(f, "invalid response: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

impl RetryableError for BackendError {
    fn is_retryable(&self) -> bool {
        match self {
            BackendError::Network(_) => true,
            BackendError::Status { code, .. } => matches!(code, 408 | 429 | 500..=599),
            BackendError::Conflict(_) | BackendError::NotFound(_) | BackendError::Decode(_) => {
                false
            }
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return BackendError::Decode(err.to_string());
        }
        match err.status() {
            Some(status) => BackendError::from_status(status.as_u16(), err.to_string()),
            None => BackendError::Network(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Decode(err.to_string())
    }
}
