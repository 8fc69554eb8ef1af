use thiserror::Error;

/// Errors that can occur while talking to the news backend.
///
/// Covers the transport (network, HTTP status, timeouts), payload decoding, and
/// server-reported failures inside an otherwise healthy event stream.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body or event payload could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),
    /// Response body or a single event exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Event stream ended before it reported completion
    #[error("Stream closed before completion")]
    StreamClosed,
    /// Backend reported an error inside the event stream
    #[error("Backend error: {0}")]
    Backend(String),
    /// Base URL or endpoint could not be built
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Returns true if this is a transport-level failure worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_)
            | ApiError::Timeout
            | ApiError::StreamClosed
            | ApiError::Backend(_) => true,
            ApiError::HttpStatus(status) => *status >= 500 || *status == 429,
            ApiError::Parse(_) | ApiError::ResponseTooLarge | ApiError::InvalidUrl(_) => false,
        }
    }

    /// Returns true if the backend reported that the target does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::HttpStatus(404))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Parse(err.to_string())
    }
}
