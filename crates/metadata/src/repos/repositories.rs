//! Repository (source code repository) records.

use crate::error::MetadataResult;
use crate::models::RepositoryRow;
use async_trait::async_trait;

#[async_trait]
pub trait RepositoryRepo: Send + Sync {
    /// Look up a repository by its full name, e.g. `github.com/owner/name`.
    async fn get_repository_by_name(&self, name: &str) -> MetadataResult<Option<RepositoryRow>>;

    /// Register a repository, returning the existing row if the name is
    /// already known.
    async fn upsert_repository(&self, name: &str) -> MetadataResult<RepositoryRow>;
}
