//! Startup provisioning: the admin token and configured repositories.

use anyhow::{Result, bail};
use indexgate_core::RepoName;
use indexgate_core::config::AdminConfig;
use indexgate_core::token::TokenScope;
use indexgate_metadata::MetadataStore;
use indexgate_metadata::models::TokenRow;
use indexgate_metadata::repos::{BootstrapRepo, RepositoryRepo, TokenRepo};
use time::OffsetDateTime;
use uuid::Uuid;

/// Ensure the configured admin token exists, rotating the previous one if needed.
///
/// The admin token carries the `site-admin` scope. If the token hash changes
/// between restarts, the previous admin token is revoked and a new one is
/// created with the new hash.
pub async fn ensure_admin_token(metadata: &dyn MetadataStore, config: &AdminConfig) -> Result<()> {
    // hash_token() produces lowercase hex.
    let hash = config
        .token_hash
        .strip_prefix("sha256:")
        .unwrap_or(&config.token_hash)
        .to_lowercase();
    let hash = hash.as_str();
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("invalid admin token_hash: expected 64 hex chars");
    }

    if let Some(existing) = metadata.get_token_by_hash(hash).await? {
        if existing.revoked_at.is_some() {
            bail!(
                "admin token hash matches a revoked token (id={}); \
                 use a new token hash",
                existing.token_id
            );
        }
        let now = OffsetDateTime::now_utc();
        if let Some(expires_at) = existing.expires_at
            && expires_at <= now
        {
            bail!(
                "admin token hash matches an expired token (id={}, expired={}); \
                 use a new token hash",
                existing.token_id,
                expires_at
            );
        }
        metadata.set_bootstrap_token_id(existing.token_id).await?;
        tracing::debug!("Admin token already exists");
        return Ok(());
    }

    let now = OffsetDateTime::now_utc();
    if let Some(prev_id) = metadata.get_bootstrap_token_id().await? {
        metadata.revoke_token(prev_id, now).await?;
        tracing::info!(token_id = %prev_id, "Previous admin token revoked");
    }

    let token = TokenRow {
        token_id: Uuid::new_v4(),
        token_hash: hash.to_string(),
        scopes: serde_json::to_string(&[TokenScope::SiteAdmin.as_str()])?,
        expires_at: None,
        revoked_at: None,
        created_at: now,
        last_used_at: None,
        description: config.token_description.clone(),
    };

    metadata.create_token(&token).await?;
    metadata.set_bootstrap_token_id(token.token_id).await?;
    tracing::info!(token_id = %token.token_id, "Admin token created");

    Ok(())
}

/// Register the configured repositories. Names already known are left as-is.
pub async fn register_repositories(metadata: &dyn MetadataStore, names: &[String]) -> Result<()> {
    for name in names {
        let repo = RepoName::parse_hosted(name)?;
        let row = metadata.upsert_repository(repo.as_str()).await?;
        tracing::debug!(repository = %row.name, id = row.id, "Repository registered");
    }
    if !names.is_empty() {
        tracing::info!(count = names.len(), "Configured repositories registered");
    }
    Ok(())
}
