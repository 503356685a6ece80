//! Application state shared across handlers.

use crate::authz::AuthGate;
use crate::git::CommitResolver;
use indexgate_core::config::AppConfig;
use indexgate_metadata::MetadataStore;
use indexgate_storage::ObjectStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Blob store for payloads and their parts.
    pub storage: Arc<dyn ObjectStore>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Code host check for external uploads.
    pub auth_gate: Arc<AuthGate>,
    /// Commit lookup for new uploads.
    pub resolver: Arc<dyn CommitResolver>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        auth_gate: AuthGate,
        resolver: Arc<dyn CommitResolver>,
    ) -> Self {
        if !auth_gate.is_enforced() {
            tracing::info!("Code host authorization is not enforced for external uploads");
        }
        Self {
            config: Arc::new(config),
            storage,
            metadata,
            auth_gate: Arc::new(auth_gate),
            resolver,
        }
    }
}
