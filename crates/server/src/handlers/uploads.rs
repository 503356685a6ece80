//! Upload endpoint handlers.

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::uploads::params::UploadQuery;
use crate::uploads::{Origin, UploadResponse, handle_upload};
use axum::extract::{Query, Request, State};

fn parse_query(req: &Request) -> ApiResult<UploadQuery> {
    Query::<UploadQuery>::try_from_uri(req.uri())
        .map(|Query(query)| query)
        .map_err(|e| ApiError::BadRequest(format!("invalid query: {}", e.body_text())))
}

/// POST /.api/lsif/upload - upload from an authenticated client.
#[tracing::instrument(skip_all)]
pub async fn upload_external(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<UploadResponse> {
    let user = req
        .extensions()
        .get::<AuthenticatedUser>()
        .cloned()
        .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))?;
    let query = parse_query(&req)?;

    let (parts, body) = req.into_parts();
    handle_upload(&state, Origin::External(user), query, &parts.headers, body).await
}

/// POST /.internal/lsif/upload - upload from a trusted internal service.
#[tracing::instrument(skip_all)]
pub async fn upload_internal(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<UploadResponse> {
    let query = parse_query(&req)?;

    let (parts, body) = req.into_parts();
    handle_upload(&state, Origin::Internal, query, &parts.headers, body).await
}
