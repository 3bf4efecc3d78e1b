//! Error types for the consult_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for consult_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key-value store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// A recovery strategy could not complete its remediation
    #[error("Recovery error: {0}")]
    Recovery(String),

    /// Network wait or other bounded operation ran out of time
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
