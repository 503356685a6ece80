//! Failure annotation for uploads whose bytes could not be stored.

use crate::metrics::UPLOADS_FAILED;
use indexgate_core::UploadId;
use indexgate_metadata::repos::UploadRepo;
use indexgate_storage::StorageError;
use std::error::Error;

/// Build the failure reason recorded on an upload.
///
/// Failures inside the object store's multipart machinery name their root
/// cause. Everything else is reported as-is.
pub fn failure_reason(err: &(dyn Error + Send + Sync + 'static)) -> (&'static str, String) {
    let top: &(dyn Error + 'static) = err;
    let chain = || std::iter::successors(Some(top), |&e| e.source());

    let from_multipart = chain().any(|e| {
        e.downcast_ref::<StorageError>()
            .is_some_and(StorageError::is_multipart_upload)
    });

    if from_multipart {
        let root = chain().last().unwrap_or(top);
        ("object_store", format!("object store error:\n* {root}"))
    } else {
        ("unknown", format!("unknown error:\n* {err}"))
    }
}

/// Mark an upload failed with a reason derived from `err`.
///
/// Best effort: a failure to record the reason is logged and swallowed, so
/// the caller can return the original error.
pub async fn mark_failed<R>(
    store: &R,
    upload_id: UploadId,
    err: &(dyn Error + Send + Sync + 'static),
)
where
    R: UploadRepo + ?Sized,
{
    let (kind, reason) = failure_reason(err);
    match store.mark_failed(upload_id.get(), &reason).await {
        Ok(()) => {
            UPLOADS_FAILED.with_label_values(&[kind]).inc();
            tracing::info!(upload_id = %upload_id, reason = %reason, "Upload marked failed");
        }
        Err(e) => {
            tracing::warn!(
                upload_id = %upload_id,
                error = %e,
                "Failed to mark upload as failed"
            );
        }
    }
}
