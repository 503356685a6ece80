//! Commit resolution against repository history.

use async_trait::async_trait;
use indexgate_core::RepoName;
use indexgate_core::config::{CommitResolverKind, GitConfig};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

/// Why a commit could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("revision not found: {0}")]
    RevisionNotFound(String),

    #[error("repository {0} is still being cloned")]
    CloneInProgress(String),

    #[error("git: {0}")]
    Other(String),
}

impl ResolveError {
    /// Failures the upload path tolerates: the commit may show up once the
    /// mirror catches up.
    pub fn is_tolerated(&self) -> bool {
        matches!(self, Self::RevisionNotFound(_) | Self::CloneInProgress(_))
    }
}

/// Looks commits up in a repository's history.
#[async_trait]
pub trait CommitResolver: Send + Sync {
    async fn resolve_revision(&self, repo: &RepoName, commit: &str) -> Result<(), ResolveError>;

    fn name(&self) -> &'static str;
}

/// Build the resolver selected by `git.resolver`.
pub fn from_config(config: &GitConfig) -> Result<Arc<dyn CommitResolver>, String> {
    config.validate()?;
    match config.resolver {
        CommitResolverKind::None => Ok(Arc::new(AcceptAllResolver)),
        CommitResolverKind::Local => {
            let dir = config
                .repos_dir
                .clone()
                .ok_or_else(|| "git.repos_dir is required".to_string())?;
            Ok(Arc::new(LocalGitResolver::new(dir)))
        }
    }
}

/// Resolves every commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllResolver;

#[async_trait]
impl CommitResolver for AcceptAllResolver {
    async fn resolve_revision(&self, _repo: &RepoName, _commit: &str) -> Result<(), ResolveError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Resolves commits in local mirrors laid out as `<repos_dir>/<repository name>`.
#[derive(Debug, Clone)]
pub struct LocalGitResolver {
    repos_dir: PathBuf,
}

impl LocalGitResolver {
    pub fn new(repos_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
        }
    }

    fn repo_dir(&self, repo: &RepoName) -> Result<PathBuf, ResolveError> {
        let relative = Path::new(repo.as_str());
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(ResolveError::Other(format!(
                "repository name {repo} does not map to a mirror path"
            )));
        }
        Ok(self.repos_dir.join(relative))
    }
}

#[async_trait]
impl CommitResolver for LocalGitResolver {
    async fn resolve_revision(&self, repo: &RepoName, commit: &str) -> Result<(), ResolveError> {
        let dir = self.repo_dir(repo)?;
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(ResolveError::Other(format!(
                    "{} is not a directory",
                    dir.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResolveError::CloneInProgress(repo.to_string()));
            }
            Err(e) => return Err(ResolveError::Other(e.to_string())),
        }

        let output = Command::new("git")
            .arg("-C")
            .arg(&dir)
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("{commit}^{{commit}}"))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ResolveError::Other(format!("failed to run git: {e}")))?;

        match output.status.code() {
            Some(0) => Ok(()),
            Some(1) => Err(ResolveError::RevisionNotFound(commit.to_string())),
            _ => Err(ResolveError::Other(format!(
                "git rev-parse exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
