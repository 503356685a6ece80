//! Bearer token authentication and request tracing middleware.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use indexgate_core::token::{Token, TokenScope};
use indexgate_metadata::repos::TokenRepo;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use time::OffsetDateTime;
use tracing::Instrument;
use uuid::Uuid;

/// Longer client trace IDs are truncated.
const MAX_TRACE_ID_LEN: usize = 128;

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a trace ID from a client-provided value, keeping printable
    /// ASCII only.
    pub fn from_client(value: &str) -> Self {
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authenticated request extension.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub token: Token,
}

impl AuthenticatedUser {
    pub fn is_site_admin(&self) -> bool {
        self.token.is_site_admin()
    }
}

/// Extract the bearer token. The scheme is matched case-insensitively.
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(v[7..].trim())
            } else {
                None
            }
        })
        .filter(|t| !t.is_empty())
}

fn extract_or_generate_trace_id(req: &Request) -> TraceId {
    req.headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_default()
}

/// Lowercase sha256 hex of a secret, as stored in the tokens table.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Look up and validate a bearer token secret.
async fn authenticate(state: &AppState, secret: Option<String>) -> ApiResult<AuthenticatedUser> {
    let secret =
        secret.ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))?;

    let row = state
        .metadata
        .get_token_by_hash(&hash_token(&secret))
        .await?
        .ok_or_else(|| ApiError::Unauthorized("invalid token".to_string()))?;

    let token = row.to_token();
    if !token.is_valid() {
        return Err(ApiError::Unauthorized(
            "token expired or revoked".to_string(),
        ));
    }
    if !token.has_scope(TokenScope::Upload) {
        return Err(ApiError::Forbidden(format!(
            "missing required scope: {}",
            TokenScope::Upload
        )));
    }

    let metadata = state.metadata.clone();
    let token_id = row.token_id;
    tokio::spawn(async move {
        if let Err(e) = metadata
            .touch_token(token_id, OffsetDateTime::now_utc())
            .await
        {
            tracing::debug!(token_id = %token_id, error = %e, "Failed to record token use");
        }
    });

    Ok(AuthenticatedUser { token })
}

/// Middleware for the external API: requires a valid bearer token with the
/// `upload` scope and runs the request inside a traced span.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = extract_or_generate_trace_id(&req);
    let span = tracing::info_span!("request", trace_id = %trace_id);
    req.extensions_mut().insert(trace_id);

    // Body is not Sync, so the request must not be borrowed across the lookup.
    let secret = extract_bearer_token(&req).map(str::to_owned);
    let user = authenticate(&state, secret).instrument(span.clone()).await?;
    req.extensions_mut().insert(user);

    Ok(next.run(req).instrument(span).await)
}

/// Middleware for the internal API: tracing only.
pub async fn trace_middleware(mut req: Request, next: Next) -> Response {
    let trace_id = extract_or_generate_trace_id(&req);
    let span = tracing::info_span!("request", trace_id = %trace_id, internal = true);
    req.extensions_mut().insert(trace_id);

    next.run(req).instrument(span).await
}
