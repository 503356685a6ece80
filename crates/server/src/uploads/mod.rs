//! Upload state machine.
//!
//! An upload is created in `uploading` and ends in `queued` once all of its
//! bytes are stored, or in `failed`. Single-payload uploads get there within
//! one request. Multipart uploads are created by a setup request, receive
//! their parts in any order, and are assembled by a finalize request.

pub mod failure;
pub mod params;
pub mod resolver;

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, ApiResult};
use crate::metrics::{
    BYTES_RECEIVED, COMPOSE_DURATION, PARTS_RECEIVED, UPLOADS_QUEUED, UPLOADS_STARTED,
};
use crate::state::AppState;
use axum::Json;
use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use http_body_util::LengthLimitError;
use indexgate_core::{UploadDraft, UploadId, UploadState};
use indexgate_metadata::done;
use indexgate_metadata::models::{NewUpload, UploadRow};
use indexgate_metadata::repos::UploadRepo;
use indexgate_storage::{ByteStream, StorageError};
use params::{UploadQuery, UploadRequest};
use serde::Serialize;
use std::error::Error;

/// Header carrying the client-declared uncompressed payload size.
pub const UNCOMPRESSED_SIZE_HEADER: &str = "x-uncompressed-size";

/// Where an upload request came from.
#[derive(Debug, Clone)]
pub enum Origin {
    /// The public API. Initial requests pass the code host check.
    External(AuthenticatedUser),
    /// The internal API. Trusted.
    Internal,
}

#[derive(Debug, Serialize)]
struct UploadCreated {
    id: String,
}

/// Successful outcome of an upload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadResponse {
    /// 202 with the upload id: a single payload was queued or a multipart
    /// upload was created.
    Created(UploadId),
    /// 204: a part was stored or a multipart upload was queued.
    Accepted,
}

impl IntoResponse for UploadResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Created(id) => (
                StatusCode::ACCEPTED,
                Json(UploadCreated { id: id.to_string() }),
            )
                .into_response(),
            Self::Accepted => StatusCode::NO_CONTENT.into_response(),
        }
    }
}

/// Read the declared uncompressed size. Anything unparsable is ignored.
fn uncompressed_size(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(UNCOMPRESSED_SIZE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|size| *size >= 0)
}

fn body_stream(body: Body) -> ByteStream {
    Box::pin(
        body.into_data_stream()
            .map_err(|e| StorageError::Io(std::io::Error::other(e))),
    )
}

/// Map a failed blob write to an API error. Bodies cut off by the request
/// size limit are the client's fault.
fn write_error(err: StorageError) -> ApiError {
    let top: &(dyn Error + 'static) = &err;
    let over_limit = std::iter::successors(Some(top), |&e| e.source())
        .any(|e| e.is::<LengthLimitError>());
    if over_limit {
        ApiError::PayloadTooLarge("request body exceeds the upload size limit".to_string())
    } else {
        err.into()
    }
}

fn byte_size(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

fn new_upload(
    draft: &UploadDraft,
    repository_id: i64,
    num_parts: i32,
    uploaded_parts: Vec<i32>,
) -> NewUpload {
    NewUpload {
        repository_id,
        commit: draft.commit.clone(),
        root: draft.root.clone(),
        indexer: draft.indexer.clone(),
        indexer_version: draft.indexer_version.clone(),
        associated_index_id: draft.associated_index_id,
        state: UploadState::Uploading,
        num_parts,
        uploaded_parts,
    }
}

/// Handle one request to an upload endpoint.
#[tracing::instrument(skip_all, fields(upload_id))]
pub async fn handle_upload(
    state: &AppState,
    origin: Origin,
    query: UploadQuery,
    headers: &HeaderMap,
    body: Body,
) -> ApiResult<UploadResponse> {
    // Continuations were authorized when their upload was created.
    if let Origin::External(user) = &origin
        && !query.is_continuation()
    {
        let repo = query.repository_name()?;
        state.auth_gate.check(user, &repo, &query).await?;
    }

    let request = query.classify()?;
    let uncompressed = uncompressed_size(headers);

    match request {
        UploadRequest::Single(draft) => {
            let repository_id = resolve(state, &draft).await?;
            let id = upload_single(state, &draft, repository_id, body, uncompressed).await?;
            Ok(UploadResponse::Created(id))
        }
        UploadRequest::Setup { draft, num_parts } => {
            let repository_id = resolve(state, &draft).await?;
            let id = setup_multipart(state, &draft, repository_id, num_parts).await?;
            Ok(UploadResponse::Created(id))
        }
        UploadRequest::Part { upload_id, index } => {
            tracing::Span::current().record("upload_id", upload_id.get());
            upload_part(state, upload_id, index, body).await?;
            Ok(UploadResponse::Accepted)
        }
        UploadRequest::Finalize { upload_id } => {
            tracing::Span::current().record("upload_id", upload_id.get());
            finalize(state, upload_id, uncompressed).await?;
            Ok(UploadResponse::Accepted)
        }
    }
}

async fn resolve(state: &AppState, draft: &UploadDraft) -> ApiResult<i64> {
    resolver::resolve(
        state.metadata.as_ref(),
        state.resolver.as_ref(),
        &draft.repository,
        &draft.commit,
    )
    .await
}

/// Store a complete payload and queue it.
///
/// The record is committed as `uploading` before the body is read, so no
/// metadata connection is held while bytes arrive. Every error after that
/// point marks the record failed.
async fn upload_single(
    state: &AppState,
    draft: &UploadDraft,
    repository_id: i64,
    body: Body,
    uncompressed: Option<i64>,
) -> ApiResult<UploadId> {
    let id = state
        .metadata
        .insert_upload(&new_upload(draft, repository_id, 1, vec![0]))
        .await?;
    let id = UploadId::new(id);
    tracing::Span::current().record("upload_id", id.get());
    UPLOADS_STARTED.with_label_values(&["single"]).inc();

    match store_payload(state, id, body, uncompressed).await {
        Ok(size) => {
            UPLOADS_QUEUED.inc();
            tracing::info!(upload_id = %id, size, "Upload queued");
            Ok(id)
        }
        Err(err) => {
            failure::mark_failed(state.metadata.as_ref(), id, &err).await;
            Err(err)
        }
    }
}

/// Write the payload blob and queue its record. The blob is removed again if
/// the record cannot be queued.
async fn store_payload(
    state: &AppState,
    id: UploadId,
    body: Body,
    uncompressed: Option<i64>,
) -> ApiResult<u64> {
    let key = id.object_key();
    let size = state
        .storage
        .upload(&key, body_stream(body))
        .await
        .map_err(write_error)?;
    BYTES_RECEIVED.inc_by(size);

    if let Err(e) = state
        .metadata
        .mark_queued(id.get(), byte_size(size), uncompressed)
        .await
    {
        if let Err(delete_err) = state.storage.delete(&key).await {
            tracing::warn!(key = %key, error = %delete_err, "Failed to delete unqueued payload");
        }
        return Err(e.into());
    }
    Ok(size)
}

/// Create a multipart upload that waits for `num_parts` parts.
async fn setup_multipart(
    state: &AppState,
    draft: &UploadDraft,
    repository_id: i64,
    num_parts: i32,
) -> ApiResult<UploadId> {
    let id = state
        .metadata
        .insert_upload(&new_upload(draft, repository_id, num_parts, Vec::new()))
        .await?;
    let id = UploadId::new(id);

    tracing::Span::current().record("upload_id", id.get());
    UPLOADS_STARTED.with_label_values(&["multipart"]).inc();
    tracing::info!(upload_id = %id, num_parts, "Multipart upload created");
    Ok(id)
}

/// Load an upload that is still receiving bytes.
async fn load_uploading<R>(store: &R, id: UploadId) -> ApiResult<UploadRow>
where
    R: UploadRepo + ?Sized,
{
    let upload = store
        .get_upload_by_id(id.get())
        .await?
        .ok_or_else(|| ApiError::NotFound("upload not found".to_string()))?;

    let upload_state = upload.upload_state()?;
    if !upload_state.accepts_parts() {
        return Err(ApiError::BadRequest(format!(
            "upload {id} is {upload_state}, not uploading"
        )));
    }
    Ok(upload)
}

/// Store one part of a multipart upload.
async fn upload_part(state: &AppState, id: UploadId, index: i64, body: Body) -> ApiResult<()> {
    let upload = load_uploading(state.metadata.as_ref(), id).await?;

    let index = u32::try_from(index)
        .ok()
        .filter(|i| i64::from(*i) < i64::from(upload.num_parts))
        .ok_or_else(|| ApiError::BadRequest("invalid index".to_string()))?;

    let size = state
        .storage
        .upload(&id.part_key(index), body_stream(body))
        .await
        .map_err(write_error)?;

    // The index is below num_parts, which is an i32.
    let part = i32::try_from(index).map_err(|_| ApiError::BadRequest("invalid index".to_string()))?;
    state.metadata.add_upload_part(id.get(), part).await?;

    PARTS_RECEIVED.inc();
    BYTES_RECEIVED.inc_by(size);
    tracing::debug!(upload_id = %id, index, size, "Part stored");
    Ok(())
}

/// Assemble the parts of a multipart upload and queue it.
///
/// The record is read inside the transaction, which serializes concurrent
/// finalizes of one upload: the loser sees `queued` and is rejected. If the
/// parts cannot be composed, the upload is marked failed in the same
/// transaction and the transaction is committed. Part blobs are deleted only
/// after the upload is committed as `queued`.
async fn finalize(state: &AppState, id: UploadId, uncompressed: Option<i64>) -> ApiResult<()> {
    let tx = state.metadata.transact().await?;

    let upload = match load_uploading(tx.as_ref(), id).await {
        Ok(upload) => upload,
        Err(e) => return done(tx, Err(e)).await,
    };

    let missing = upload.missing_parts();
    if missing > 0 {
        let err = ApiError::BadRequest(format!("upload is missing {missing} parts"));
        return done(tx, Err(err)).await;
    }

    let Ok(num_parts) = u32::try_from(upload.num_parts) else {
        let err = ApiError::Internal(format!("upload {id} has invalid num_parts"));
        return done(tx, Err(err)).await;
    };
    let sources = id.part_keys(num_parts);

    let timer = COMPOSE_DURATION.start_timer();
    let composed = state.storage.compose(&id.object_key(), &sources).await;
    timer.observe_duration();

    let size = match composed {
        Ok(size) => size,
        Err(e) => {
            let err = ApiError::from(e);
            failure::mark_failed(tx.as_ref(), id, &err).await;
            if let Err(commit_err) = tx.commit().await {
                tracing::warn!(
                    upload_id = %id,
                    error = %commit_err,
                    "Failed to commit failure state"
                );
            }
            return Err(err);
        }
    };

    let queued = tx
        .mark_queued(id.get(), byte_size(size), uncompressed)
        .await
        .map_err(ApiError::from);
    done(tx, queued).await?;

    UPLOADS_QUEUED.inc();
    tracing::info!(upload_id = %id, size, num_parts, "Multipart upload queued");

    for key in &sources {
        if let Err(e) = state.storage.delete(key).await {
            tracing::warn!(key = %key, error = %e, "Failed to delete composed part");
        }
    }
    Ok(())
}
