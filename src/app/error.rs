//! Error types for the qBittorrent Web API.

use thiserror::Error;

/// Errors from talking to qBittorrent.
#[derive(Debug, Error)]
pub enum AppError {
    /// The HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    /// The request could not be sent or timed out.
    #[error("Cannot reach qBittorrent at {endpoint}: {source}")]
    Unreachable {
        /// API endpoint path.
        endpoint: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The API answered with an error status.
    #[error("qBittorrent API error on {endpoint}: HTTP {status}")]
    Status {
        /// API endpoint path.
        endpoint: String,
        /// HTTP status code.
        status: u16,
    },

    /// Login was rejected.
    #[error("qBittorrent authentication failed: {0}")]
    AuthFailed(String),

    /// A response body could not be decoded.
    #[error("Invalid response from {endpoint}: {source}")]
    InvalidResponse {
        /// API endpoint path.
        endpoint: String,
        /// The decoding error.
        #[source]
        source: reqwest::Error,
    },

    /// A preference write was acknowledged but not applied.
    #[error(
        "qBittorrent reports port {observed_port} on '{observed_interface}' after writing port {expected_port} on '{expected_interface}'"
    )]
    ReadBackMismatch {
        /// Port written.
        expected_port: u16,
        /// Interface written.
        expected_interface: String,
        /// Port read back.
        observed_port: u16,
        /// Interface read back.
        observed_interface: String,
    },
}

impl AppError {
    /// The application behaved inconsistently rather than being unreachable.
    pub fn is_integrity(&self) -> bool {
        matches!(self, AppError::ReadBackMismatch { .. })
    }
}

/// Result type for qBittorrent calls.
pub type AppResult<T> = Result<T, AppError>;
