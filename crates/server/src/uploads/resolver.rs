//! Repository and commit resolution for new uploads.

use crate::error::{ApiError, ApiResult};
use crate::git::CommitResolver;
use indexgate_core::RepoName;
use indexgate_metadata::MetadataStore;
use indexgate_metadata::repos::RepositoryRepo;

/// Resolve the repository of a new upload to its id and check the commit
/// against its history.
///
/// Runs with internal privilege: no per-caller filtering is applied to the
/// repository lookup. A commit that cannot be found yet, or a repository that
/// is still being cloned, does not block the upload.
#[tracing::instrument(skip(metadata, resolver), fields(resolver = resolver.name()))]
pub async fn resolve(
    metadata: &dyn MetadataStore,
    resolver: &dyn CommitResolver,
    repo: &RepoName,
    commit: &str,
) -> ApiResult<i64> {
    let repository = metadata
        .get_repository_by_name(repo.as_str())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown repository {repo}")))?;

    match resolver.resolve_revision(repo, commit).await {
        Ok(()) => {}
        Err(e) if e.is_tolerated() => {
            tracing::warn!(error = %e, "Accepting upload for unresolved commit");
        }
        Err(e) => return Err(ApiError::Internal(e.to_string())),
    }

    Ok(repository.id)
}
