//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The backend failed while writing or assembling `key` from parts.
    #[error("multipart upload of {key} failed: {source}")]
    MultipartUpload {
        key: String,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    pub(crate) fn multipart(key: &str, source: StorageError) -> Self {
        // Avoid nesting when an inner operation already classified the failure.
        match source {
            already @ StorageError::MultipartUpload { .. } => already,
            other => StorageError::MultipartUpload {
                key: key.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Whether the failure happened inside the backend's multipart machinery.
    pub fn is_multipart_upload(&self) -> bool {
        matches!(self, StorageError::MultipartUpload { .. })
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
