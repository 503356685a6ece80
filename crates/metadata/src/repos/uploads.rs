//! Upload record repository.

use crate::error::MetadataResult;
use crate::models::{NewUpload, UploadRow};
use async_trait::async_trait;

/// Repository for upload record operations.
///
/// Implemented by the stores themselves and by their transactions, so the
/// same calls can run inside or outside a transaction.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Insert an upload record, with its initial parts, and return the new id.
    async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<i64>;

    /// Get an upload by id, including its recorded parts in ascending order.
    ///
    /// Inside a transaction the row stays locked until the transaction ends.
    async fn get_upload_by_id(&self, id: i64) -> MetadataResult<Option<UploadRow>>;

    /// Record that a part has been stored. Recording the same index twice is
    /// a no-op.
    async fn add_upload_part(&self, id: i64, part_index: i32) -> MetadataResult<()>;

    /// Move an `uploading` upload to `queued` with its final byte size.
    ///
    /// Returns `NotFound` if the upload does not exist and `Conflict` if it
    /// has already left `uploading`.
    async fn mark_queued(
        &self,
        id: i64,
        upload_size: i64,
        uncompressed_size: Option<i64>,
    ) -> MetadataResult<()>;

    /// Move an upload to `failed`, recording the reason and bumping its
    /// failure count. Only an `uploading` upload can fail.
    ///
    /// Returns `NotFound` if the upload does not exist and `Conflict` if it
    /// has already left `uploading`.
    async fn mark_failed(&self, id: i64, reason: &str) -> MetadataResult<()>;
}
