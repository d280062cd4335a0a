//! Error types and handling for the VPN REST control channel

use thiserror::Error;

/// Main error type for control channel operations
#[derive(Error, Debug)]
pub enum RestError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A request failed its own field checks; nothing was sent
    #[error("Validation error: {0}")]
    Validation(String),

    /// DNS failure with no previous address to fall back to
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// Network connectivity errors
    #[error("Network error: {0}")]
    Network(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    /// A CA certificate in the server chain is not in the pin table
    #[error("bad public key PIN: {0}")]
    BadPin(String),

    /// The server refuses to speak this API version (HTTP 403)
    #[error("application update required")]
    UpdateRequired,

    /// Any non-200, non-403 response
    #[error("bad HTTP status ({0})")]
    BadStatus(u16),

    /// HTTP framing errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Malformed JSON or token encoding
    #[error("Decode error: {0}")]
    Decode(String),

    /// The credential file could not be written
    #[error("Failed to persist access token: {0}")]
    Persistence(std::io::Error),

    /// The filter service answered `false`
    #[error("filter failed")]
    FilterFailed,
}

/// Result type alias for control channel operations
pub type Result<T> = std::result::Result<T, RestError>;

impl RestError {
    /// Whether a caller may retry the operation without user intervention.
    ///
    /// `UpdateRequired` means the application itself must be upgraded, and a
    /// pin mismatch must never be retried into acceptance.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            RestError::UpdateRequired
                | RestError::BadPin(_)
                | RestError::Validation(_)
                | RestError::Config(_)
        )
    }
}

// Implement From for common error types
impl From<toml::de::Error> for RestError {
    fn from(err: toml::de::Error) -> Self {
        RestError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<serde_json::Error> for RestError {
    fn from(err: serde_json::Error) -> Self {
        RestError::Decode(format!("JSON error: {err}"))
    }
}

impl From<base64::DecodeError> for RestError {
    fn from(err: base64::DecodeError) -> Self {
        RestError::Decode(format!("base64 error: {err}"))
    }
}

impl From<rustls::Error> for RestError {
    fn from(err: rustls::Error) -> Self {
        RestError::Tls(format!("TLS error: {err}"))
    }
}
