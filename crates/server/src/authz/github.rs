//! GitHub write-access validator.

use super::AuthValidator;
use crate::auth::hash_token;
use crate::error::{ApiError, ApiResult};
use crate::uploads::params::UploadQuery;
use async_trait::async_trait;
use indexgate_core::RepoName;
use indexgate_core::config::AuthConfig;
use moka::future::Cache;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;

const PER_PAGE: usize = 100;

/// Upper bound on cached (token, repository) decisions.
const MAX_CACHED_DECISIONS: u64 = 10_000;

/// Error message for a token that cannot write to the repository.
pub const DENIED: &str = "you do not have write permission to this GitHub repository";

const VIEWER_PERMISSION_QUERY: &str = "query ViewerPermission($owner: String!, $name: String!) \
     { repository(owner: $owner, name: $name) { viewerPermission } }";

#[derive(Debug, thiserror::Error)]
enum GitHubError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GitHub returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("GraphQL error: {0}")]
    GraphQl(String),
}

impl GitHubError {
    /// Errors that say nothing about the token: the request never got an
    /// answer, or GitHub could not give one.
    fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            Self::GraphQl(_) => false,
        }
    }
}

/// Outcome of asking GitHub about one token and repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Decision {
    allowed: bool,
    /// A denial reached only because a check failed transiently. Not cached.
    transient: bool,
}

#[derive(Deserialize)]
struct InstallationRepositories {
    total_count: usize,
    repositories: Vec<InstallationRepository>,
}

#[derive(Deserialize)]
struct InstallationRepository {
    full_name: String,
}

#[derive(Deserialize)]
struct GraphQlResponse {
    data: Option<ViewerPermissionData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct ViewerPermissionData {
    repository: Option<RepositoryPermission>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryPermission {
    viewer_permission: Option<String>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

/// Authorizes a `github_token` that is either an app installation token with
/// the repository in its installation, or a user token with at least write
/// permission on it.
pub struct GitHubValidator {
    http: reqwest::Client,
    api_url: String,
    /// (token hash, repository) -> allowed. `None` when caching is off.
    cache: Option<Cache<(String, String), bool>>,
}

impl GitHubValidator {
    pub fn new(
        api_url: &str,
        request_timeout: Duration,
        cache_ttl: Duration,
    ) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("indexgate/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let cache = (!cache_ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(MAX_CACHED_DECISIONS)
                .time_to_live(cache_ttl)
                .build()
        });
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            cache,
        })
    }

    pub fn from_config(config: &AuthConfig) -> reqwest::Result<Self> {
        Self::new(
            &config.github.api_url,
            config.request_timeout(),
            config.cache_ttl(),
        )
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        token: &str,
    ) -> Result<T, GitHubError> {
        let response = req
            .bearer_auth(token)
            .header("accept", "application/vnd.github+json")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GitHubError::Status { status, body });
        }
        Ok(response.json().await?)
    }

    /// Treat the token as an installation token and look for the repository
    /// among the installation's repositories.
    async fn installation_has_repo(
        &self,
        token: &str,
        owner: &str,
        name: &str,
    ) -> Result<bool, GitHubError> {
        let wanted = format!("{owner}/{name}");
        let url = format!("{}/installation/repositories", self.api_url);
        let mut seen = 0;

        for page in 1.. {
            let req = self.http.get(&url).query(&[
                ("per_page", PER_PAGE.to_string()),
                ("page", page.to_string()),
            ]);
            let body: InstallationRepositories = self.send_json(req, token).await?;

            if body
                .repositories
                .iter()
                .any(|r| r.full_name.eq_ignore_ascii_case(&wanted))
            {
                return Ok(true);
            }

            seen += body.repositories.len();
            if body.repositories.len() < PER_PAGE || seen >= body.total_count {
                break;
            }
        }
        Ok(false)
    }

    /// Treat the token as a user token and ask for the viewer's permission.
    async fn viewer_can_write(
        &self,
        token: &str,
        owner: &str,
        name: &str,
    ) -> Result<bool, GitHubError> {
        let url = format!("{}/graphql", self.api_url);
        let req = self.http.post(url).json(&json!({
            "query": VIEWER_PERMISSION_QUERY,
            "variables": { "owner": owner, "name": name },
        }));
        let body: GraphQlResponse = self.send_json(req, token).await?;

        let permission = body
            .data
            .and_then(|d| d.repository)
            .and_then(|r| r.viewer_permission);

        match permission {
            Some(p) => Ok(matches!(p.as_str(), "ADMIN" | "MAINTAIN" | "WRITE")),
            None if !body.errors.is_empty() => Err(GitHubError::GraphQl(
                body.errors
                    .into_iter()
                    .map(|e| e.message)
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
            None => Ok(false),
        }
    }

    async fn decide(&self, token: &str, owner: &str, name: &str) -> Decision {
        let mut transient = false;

        match self.installation_has_repo(token, owner, name).await {
            Ok(true) => {
                return Decision {
                    allowed: true,
                    transient: false,
                };
            }
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Installation token check failed");
                transient |= e.is_transient();
            }
        }

        match self.viewer_can_write(token, owner, name).await {
            Ok(true) => Decision {
                allowed: true,
                transient: false,
            },
            Ok(false) => Decision {
                allowed: false,
                transient,
            },
            Err(e) => {
                tracing::debug!(error = %e, "Repository permission check failed");
                Decision {
                    allowed: false,
                    transient: transient || e.is_transient(),
                }
            }
        }
    }
}

#[async_trait]
impl AuthValidator for GitHubValidator {
    async fn authorize(&self, repo: &RepoName, query: &UploadQuery) -> ApiResult<()> {
        let token = query
            .github_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("must provide github_token".to_string()))?;

        let Some((owner, name)) = repo.owner_and_name() else {
            return Err(ApiError::Unauthorized(DENIED.to_string()));
        };

        let key = (hash_token(token), repo.as_str().to_string());
        let cached = match &self.cache {
            Some(cache) => cache.get(&key).await,
            None => None,
        };
        let allowed = match cached {
            Some(allowed) => allowed,
            None => {
                let decision = self.decide(token, owner, name).await;
                if let Some(cache) = &self.cache
                    && !decision.transient
                {
                    cache.insert(key, decision.allowed).await;
                }
                decision.allowed
            }
        };

        if allowed {
            Ok(())
        } else {
            Err(ApiError::Unauthorized(DENIED.to_string()))
        }
    }
}
