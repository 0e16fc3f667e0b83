//! Error types for the Sluice client

use thiserror::Error;

/// Errors that can occur when talking to the orchestrator
#[derive(Error, Debug)]
pub enum ClientError {
    /// HTTP request failed
    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error response
    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    /// Failed to parse a response body
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

impl ClientError {
    /// Create an API error from a status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        ClientError::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is a not-found response
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::ApiError { status: 404, .. })
    }

    /// Check if this error is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        matches!(self, ClientError::ApiError { status, .. } if (400..500).contains(status))
    }

    /// Check if this error is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        matches!(self, ClientError::ApiError { status, .. } if (500..600).contains(status))
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_classification() {
        let err = ClientError::api_error(404, "Pipeline edges not found");
        assert!(err.is_not_found());
        assert!(err.is_client_error());
        assert!(!err.is_server_error());

        let err = ClientError::api_error(500, "Internal server error");
        assert!(err.is_server_error());
        assert!(!err.is_client_error());

        let err = ClientError::ParseError("bad line".to_string());
        assert!(!err.is_not_found());
    }
}
