//! Error types for the auth broker service

use std::io;

use thiserror::Error;

/// Result type alias for the auth broker service
pub type Result<T> = std::result::Result<T, Error>;

/// Service-level errors (startup, configuration, I/O).
///
/// Per-request authorization failures live in [`crate::broker::AuthError`].
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Directory Store backend could not be opened or written
    #[error("Directory store error: {0}")]
    Directory(String),

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

impl Error {
    /// Process exit code for the CLI.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 78, // EX_CONFIG
            Self::Io(_) | Self::Directory(_) => 74, // EX_IOERR
            _ => 1,
        }
    }
}
