//! Server test utilities.

use super::fixtures::{REPO, sha256_hash};
use super::metadata::{FaultyMetadata, MetadataFaults};
use super::storage::RecordingStore;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use indexgate_core::config::{AppConfig, MetadataConfig, StorageConfig};
use indexgate_metadata::models::{TokenRow, UploadRow};
use indexgate_metadata::repos::{RepositoryRepo, TokenRepo, UploadRepo};
use indexgate_metadata::{MetadataStore, SqliteStore};
use indexgate_server::authz::AuthGate;
use indexgate_server::git::{AcceptAllResolver, CommitResolver};
use indexgate_server::{AppState, create_internal_router, create_router};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;
use tower::ServiceExt;
use uuid::Uuid;

/// Response of a request sent through [`TestServer`].
#[allow(dead_code)]
pub struct TestResponse {
    pub status: StatusCode,
    pub json: Value,
}

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub internal_router: axum::Router,
    pub state: AppState,
    pub storage: Arc<RecordingStore>,
    pub metadata_faults: Arc<MetadataFaults>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server with the code host check disabled.
    pub async fn new() -> Self {
        Self::with_options(|_| {}, AuthGate::disabled(), Arc::new(AcceptAllResolver)).await
    }

    /// Create a test server with custom config, gate and resolver.
    pub async fn with_options<F>(
        modifier: F,
        auth_gate: AuthGate,
        resolver: Arc<dyn CommitResolver>,
    ) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage_path = temp_dir.path().join("storage");
        let storage = Arc::new(
            RecordingStore::new(&storage_path)
                .await
                .expect("Failed to create storage backend"),
        );

        let db_path = temp_dir.path().join("metadata.db");
        let sqlite: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );
        let metadata_faults = Arc::new(MetadataFaults::default());
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(FaultyMetadata::new(sqlite, metadata_faults.clone()));
        metadata
            .upsert_repository(REPO)
            .await
            .expect("Failed to register repository");

        let mut config = AppConfig::for_testing();
        config.storage = StorageConfig::Filesystem { path: storage_path };
        config.metadata = MetadataConfig::Sqlite {
            path: db_path,
            query_timeout_secs: None,
        };
        config.repositories = vec![REPO.to_string()];
        modifier(&mut config);

        indexgate_server::metrics::register_metrics();
        let state = AppState::new(config, storage.clone(), metadata, auth_gate, resolver);

        Self {
            router: create_router(state.clone()),
            internal_router: create_internal_router(state.clone()),
            state,
            storage,
            metadata_faults,
            _temp_dir: temp_dir,
        }
    }

    /// Get access to the underlying metadata.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    /// Create a token with the given scopes and return the raw secret.
    pub async fn create_token(&self, scopes: &[&str]) -> String {
        let raw_token = format!("test-token-{}", Uuid::new_v4());
        let token = TokenRow {
            token_id: Uuid::new_v4(),
            token_hash: sha256_hash(raw_token.as_bytes()),
            scopes: serde_json::to_string(scopes).unwrap(),
            expires_at: None,
            revoked_at: None,
            created_at: OffsetDateTime::now_utc(),
            last_used_at: None,
            description: Some("Test Token".to_string()),
        };
        self.metadata()
            .create_token(&token)
            .await
            .expect("Failed to create token");
        raw_token
    }

    pub async fn upload_row(&self, id: i64) -> Option<UploadRow> {
        self.metadata().get_upload_by_id(id).await.unwrap()
    }

    async fn send(router: &axum::Router, request: Request<Body>) -> TestResponse {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };
        TestResponse { status, json }
    }

    /// POST to the external upload endpoint.
    pub async fn upload(&self, token: Option<&str>, query: &str, body: Vec<u8>) -> TestResponse {
        self.upload_with_headers(token, query, body, &[]).await
    }

    pub async fn upload_with_headers(
        &self,
        token: Option<&str>,
        query: &str,
        body: Vec<u8>,
        headers: &[(&str, &str)],
    ) -> TestResponse {
        let request = Self::upload_request(token, query, headers, Body::from(body));
        Self::send(&self.router, request).await
    }

    /// POST a streamed body, sent without a Content-Length header.
    pub async fn upload_body(&self, token: Option<&str>, query: &str, body: Body) -> TestResponse {
        let request = Self::upload_request(token, query, &[], body);
        Self::send(&self.router, request).await
    }

    fn upload_request(
        token: Option<&str>,
        query: &str,
        headers: &[(&str, &str)],
        body: Body,
    ) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/.api/lsif/upload?{query}"));
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(body).unwrap()
    }

    /// POST to the internal upload endpoint.
    pub async fn internal_upload(&self, query: &str, body: Vec<u8>) -> TestResponse {
        let request = Request::builder()
            .method("POST")
            .uri(format!("/.internal/lsif/upload?{query}"))
            .body(Body::from(body))
            .unwrap();
        Self::send(&self.internal_router, request).await
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        Self::send(&self.router, request).await
    }
}

/// Numeric id from a `{"id": "<id>"}` response body.
#[allow(dead_code)]
pub fn created_id(response: &TestResponse) -> i64 {
    assert_eq!(
        response.status,
        StatusCode::ACCEPTED,
        "unexpected response: {}",
        response.json
    );
    response.json["id"]
        .as_str()
        .expect("id should be a string")
        .parse()
        .expect("id should be numeric")
}
