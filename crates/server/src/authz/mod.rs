//! Code host authorization for external uploads.
//!
//! Before an externally submitted upload creates a record, the caller must
//! show write access to the repository on its code host. Validators are
//! registered per code host; the host is the first segment of the repository
//! name.

pub mod github;

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, ApiResult};
use crate::metrics::AUTH_GATE_DENIALS;
use crate::uploads::params::UploadQuery;
use async_trait::async_trait;
use indexgate_core::RepoName;
use indexgate_core::config::AuthConfig;
use std::collections::HashMap;
use std::sync::Arc;

pub use github::GitHubValidator;

/// Checks that the caller may upload to a repository on one code host.
#[async_trait]
pub trait AuthValidator: Send + Sync {
    /// `Ok(())` to authorize; `Unauthorized` or another client error to deny.
    async fn authorize(&self, repo: &RepoName, query: &UploadQuery) -> ApiResult<()>;
}

/// Registry of validators keyed by code host.
pub struct AuthGate {
    enforce: bool,
    validators: HashMap<String, Arc<dyn AuthValidator>>,
}

impl AuthGate {
    pub fn new(enforce: bool) -> Self {
        Self {
            enforce,
            validators: HashMap::new(),
        }
    }

    /// A gate that lets every request through.
    pub fn disabled() -> Self {
        Self::new(false)
    }

    /// Build the gate from configuration with the built-in validators.
    pub fn from_config(config: &AuthConfig) -> reqwest::Result<Self> {
        let mut gate = Self::new(config.enforce);
        gate.register("github.com", Arc::new(GitHubValidator::from_config(config)?));
        Ok(gate)
    }

    pub fn register(&mut self, code_host: impl Into<String>, validator: Arc<dyn AuthValidator>) {
        self.validators.insert(code_host.into(), validator);
    }

    pub fn is_enforced(&self) -> bool {
        self.enforce
    }

    /// Authorize an initial upload request.
    ///
    /// Site administrators are let through without asking the code host.
    /// Continuations of an existing upload never reach this check.
    #[tracing::instrument(skip(self, user, repo, query), fields(repository = %repo))]
    pub async fn check(
        &self,
        user: &AuthenticatedUser,
        repo: &RepoName,
        query: &UploadQuery,
    ) -> ApiResult<()> {
        if !self.enforce || user.is_site_admin() {
            return Ok(());
        }

        let Some(validator) = self.validators.get(repo.code_host()) else {
            AUTH_GATE_DENIALS.with_label_values(&["unsupported"]).inc();
            return Err(ApiError::UnprocessableEntity(
                "verification not supported for code host".to_string(),
            ));
        };

        let result = validator.authorize(repo, query).await;
        if let Err(err) = &result {
            AUTH_GATE_DENIALS.with_label_values(&[err.code()]).inc();
            tracing::info!(error = %err, "Upload denied by code host check");
        }
        result
    }
}
