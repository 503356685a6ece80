//! Database models mapping to the metadata schema.

use indexgate_core::{Token, TokenId, TokenScope, UploadId, UploadState};
use sqlx::FromRow;
use std::collections::HashSet;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Uploads
// =============================================================================

/// Upload record.
///
/// `uploaded_parts` lives in its own table and is filled in by the store
/// after the row itself is read.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    pub id: i64,
    pub repository_id: i64,
    #[sqlx(rename = "commit_hash")]
    pub commit: String,
    pub root: String,
    pub indexer: String,
    pub indexer_version: String,
    pub state: String,
    pub failure_message: Option<String>,
    pub num_parts: i32,
    pub upload_size: Option<i64>,
    pub uncompressed_size: Option<i64>,
    pub associated_index_id: Option<i64>,
    pub num_failures: i32,
    pub uploaded_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    #[sqlx(skip)]
    pub uploaded_parts: Vec<i32>,
}

impl UploadRow {
    pub fn upload_id(&self) -> UploadId {
        UploadId::new(self.id)
    }

    pub fn upload_state(&self) -> indexgate_core::Result<UploadState> {
        UploadState::parse(&self.state)
    }

    /// Number of parts not yet recorded. Zero once every index in
    /// `[0, num_parts)` is present.
    pub fn missing_parts(&self) -> usize {
        let wanted = usize::try_from(self.num_parts).unwrap_or(0);
        let have = self
            .uploaded_parts
            .iter()
            .filter(|&&i| i >= 0 && i < self.num_parts)
            .count();
        wanted.saturating_sub(have)
    }
}

/// Fields needed to insert a new upload. The store assigns the id and the
/// upload time.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub repository_id: i64,
    pub commit: String,
    pub root: String,
    pub indexer: String,
    pub indexer_version: String,
    pub associated_index_id: Option<i64>,
    pub state: UploadState,
    pub num_parts: i32,
    pub uploaded_parts: Vec<i32>,
}

// =============================================================================
// Repositories
// =============================================================================

/// Repository record.
#[derive(Debug, Clone, FromRow)]
pub struct RepositoryRow {
    pub id: i64,
    pub name: String,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Tokens
// =============================================================================

/// Token record.
#[derive(Debug, Clone, FromRow)]
pub struct TokenRow {
    pub token_id: Uuid,
    pub token_hash: String,
    pub scopes: String, // JSON array
    pub expires_at: Option<OffsetDateTime>,
    pub revoked_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub description: Option<String>,
}

impl TokenRow {
    /// Convert into the domain token. Unknown scope strings are dropped.
    pub fn to_token(&self) -> Token {
        let raw: Vec<String> = serde_json::from_str(&self.scopes).unwrap_or_default();
        let scopes: HashSet<TokenScope> = raw
            .iter()
            .filter_map(|s| TokenScope::parse(s).ok())
            .collect();

        Token {
            id: TokenId::from(self.token_id),
            scopes,
            expires_at: self.expires_at,
            revoked_at: self.revoked_at,
            created_at: self.created_at,
            description: self.description.clone(),
        }
    }
}
