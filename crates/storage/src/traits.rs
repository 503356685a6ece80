//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads and uploads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Object storage backend trait.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get the entire object.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Put an object atomically.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Start a streaming upload. Nothing is visible under `key` until
    /// [`StreamingUpload::finish`] succeeds.
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Concatenate `sources`, in order, into a new object at `dest` and
    /// return its size.
    ///
    /// Sources are left in place. Callers delete them once the composed object
    /// has been recorded.
    async fn compose(&self, dest: &str, sources: &[String]) -> StorageResult<u64>;

    /// Get the backend name for logging/metrics.
    fn backend_name(&self) -> &'static str;

    /// Perform a health check on the storage backend.
    async fn health_check(&self) -> StorageResult<()> {
        self.exists("__health_check__").await?;
        Ok(())
    }

    /// Drain `body` into a new object at `key` and return the bytes written.
    ///
    /// Errors yielded by `body` are returned as-is. Errors raised by the
    /// backend while writing are reported as [`StorageError::MultipartUpload`].
    /// Either way the partial upload is aborted.
    async fn upload(&self, key: &str, mut body: ByteStream) -> StorageResult<u64> {
        let mut upload = self
            .put_stream(key)
            .await
            .map_err(|e| StorageError::multipart(key, e))?;

        while let Some(chunk) = body.next().await {
            let result = match chunk {
                Ok(bytes) => upload
                    .write(bytes)
                    .await
                    .map_err(|e| StorageError::multipart(key, e)),
                Err(e) => Err(e),
            };
            if let Err(err) = result {
                if let Err(abort_err) = upload.abort().await {
                    tracing::warn!(key = %key, error = %abort_err, "Failed to abort upload");
                }
                return Err(err);
            }
        }

        upload
            .finish()
            .await
            .map_err(|e| StorageError::multipart(key, e))
    }
}

/// Streaming upload handle.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload and return total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
