//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("commit must be a 40-character revhash")]
    InvalidCommit(String),

    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    #[error("invalid upload state: {0}")]
    InvalidUploadState(String),

    #[error("invalid upload ID: {0}")]
    InvalidUploadId(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
