//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// HTTP listener configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address of the external API (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Optional bind address of the internal API. Requests arriving here skip
    /// bearer authentication and the code host check, so keep it off public
    /// networks.
    #[serde(default)]
    pub internal_bind: Option<String>,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Largest request body accepted for a single payload or part, in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_max_upload_bytes() -> u64 {
    2 * 1024 * 1024 * 1024 // 2 GiB
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            internal_bind: None,
            metrics_enabled: default_metrics_enabled(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Admin token configuration.
///
/// The admin token is bootstrapped as a site administrator. If the hash
/// changes between restarts the previous admin token is revoked.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminConfig {
    /// SHA256 hex of the admin token, optionally prefixed with `sha256:`.
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    pub token_hash: String,
    /// Description for the admin token.
    pub token_description: Option<String>,
}

impl AdminConfig {
    /// **For testing only.** The hash is deterministic but not a real secret.
    pub fn for_testing() -> Self {
        Self {
            // SHA256 of "test-admin-token"
            token_hash: "17d6bfe05d1b1fb7bc499f8e3f639c7b3eda4c40f321eef8887a0c04c89a99c5"
                .to_string(),
            token_description: Some("Test admin token".to_string()),
        }
    }
}

/// Blob store backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for upload blobs.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        bucket: String,
        /// Endpoint URL for MinIO and other S3-compatible services.
        endpoint: Option<String>,
        region: Option<String>,
        /// Key prefix applied to every object.
        prefix: Option<String>,
        /// Falls back to the ambient AWS credential chain when unset.
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        /// Path-style addressing (`endpoint/bucket/key`), needed by MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/uploads"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 config requires a bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database, for development and single-node deployments.
    Sqlite {
        path: PathBuf,
        /// Advisory query timeout in seconds. Slow queries are logged, not
        /// cancelled.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over the individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer INDEXGATE_METADATA__PASSWORD over storing this in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Server-side statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(60_000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(60)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) | (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => Err(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ),
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// Code host authorization for externally originated uploads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Require non-admin uploaders to prove write access on the code host.
    #[serde(default)]
    pub enforce: bool,
    /// How long an authorization decision is reused for the same token and
    /// repository.
    #[serde(default = "default_auth_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Timeout for each outbound code host request.
    #[serde(default = "default_auth_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub github: GitHubConfig,
}

fn default_auth_cache_ttl_secs() -> u64 {
    60
}

fn default_auth_request_timeout_secs() -> u64 {
    10
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enforce: false,
            cache_ttl_secs: default_auth_cache_ttl_secs(),
            request_timeout_secs: default_auth_request_timeout_secs(),
            github: GitHubConfig::default(),
        }
    }
}

impl AuthConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout_secs == 0 {
            return Err("auth.request_timeout_secs cannot be 0".to_string());
        }
        let url = self.github.api_url.to_ascii_lowercase();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!(
                "auth.github.api_url must be an http(s) URL, got {}",
                self.github.api_url
            ));
        }
        Ok(())
    }
}

/// GitHub API endpoint used by the code host check.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GitHubConfig {
    /// Base URL of the REST API. The GraphQL endpoint is `<api_url>/graphql`.
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_github_api_url(),
        }
    }
}

/// How commits are checked against repository history.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommitResolverKind {
    /// Accept every commit without looking at history.
    #[default]
    None,
    /// Look commits up in local git mirrors under `git.repos_dir`.
    Local,
}

/// Git history access configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default)]
    pub resolver: CommitResolverKind,
    /// Directory holding one mirror per repository, at `<repos_dir>/<name>`.
    #[serde(default)]
    pub repos_dir: Option<PathBuf>,
}

impl GitConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.resolver == CommitResolverKind::Local && self.repos_dir.is_none() {
            return Err("git.resolver = \"local\" requires git.repos_dir".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Admin token configuration (required).
    pub admin: AdminConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub git: GitConfig,
    /// Repository names registered at startup.
    #[serde(default)]
    pub repositories: Vec<String>,
}

impl AppConfig {
    /// **For testing only.** Filesystem storage, SQLite metadata and a dummy
    /// admin token.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            metadata: MetadataConfig::default(),
            admin: AdminConfig::for_testing(),
            auth: AuthConfig::default(),
            git: GitConfig::default(),
            repositories: Vec::new(),
        }
    }

    /// Validate every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.metadata.validate()?;
        self.auth.validate()?;
        self.git.validate()?;
        for name in &self.repositories {
            crate::RepoName::parse_hosted(name).map_err(|e| format!("repositories: {e}"))?;
        }
        Ok(())
    }
}
