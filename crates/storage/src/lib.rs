//! Blob store for index payloads.
//!
//! A single-payload upload is written once under its upload key. A multipart
//! upload writes one object per part and is later composed, in index order,
//! into the upload key. Part objects are removed by the caller after the
//! composed upload has been recorded.

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectStore, StreamingUpload};

use indexgate_core::config::StorageConfig;
use std::sync::Arc;

/// Open the blob store described by `config`.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    let store: Arc<dyn ObjectStore> = match config {
        StorageConfig::Filesystem { path } => Arc::new(FilesystemBackend::new(path).await?),
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => Arc::new(
            S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?,
        ),
    };

    tracing::info!(backend = store.backend_name(), "Opened blob store");
    Ok(store)
}
