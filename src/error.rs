//! Error types for the token broker

use std::io;

use thiserror::Error;

/// Result type alias for the token broker
pub type Result<T> = std::result::Result<T, Error>;

/// Token broker errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller-supplied claims are missing, reserved, or malformed
    #[error("Invalid claims: {0}")]
    InvalidClaims(String),

    /// Requested signing algorithm is not supported
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Token cache read/write failure
    #[error("Token cache error: {0}")]
    Storage(String),

    /// No provider with the given name is configured
    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Generic message shown for storage failures when verbose errors are off.
///
/// Production deployments must not leak cache-layer details (file paths,
/// permission messages) to API clients.
pub const GENERIC_STORAGE_MESSAGE: &str = "token cache operation failed";

impl Error {
    /// Wrap a storage-layer failure, keeping the underlying detail only in
    /// verbose mode.
    #[must_use]
    pub fn storage(detail: impl Into<String>, verbose: bool) -> Self {
        if verbose {
            Self::Storage(detail.into())
        } else {
            Self::Storage(GENERIC_STORAGE_MESSAGE.to_string())
        }
    }
}
