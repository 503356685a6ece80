//! Metadata test utilities.

use async_trait::async_trait;
use indexgate_metadata::models::{NewUpload, RepositoryRow, TokenRow, UploadRow};
use indexgate_metadata::repos::{BootstrapRepo, RepositoryRepo, TokenRepo, UploadRepo};
use indexgate_metadata::{MetadataError, MetadataResult, MetadataStore, MetadataTx};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use uuid::Uuid;

/// Switches for failures injected by [`FaultyMetadata`].
#[allow(dead_code)]
#[derive(Default)]
pub struct MetadataFaults {
    fail_mark_queued: AtomicBool,
    fail_commit: AtomicBool,
}

#[allow(dead_code)]
impl MetadataFaults {
    /// Make every `mark_queued` fail, inside or outside a transaction.
    pub fn fail_mark_queued(&self, fail: bool) {
        self.fail_mark_queued.store(fail, Ordering::SeqCst);
    }

    /// Make every transaction commit fail. The transaction is rolled back.
    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> MetadataResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(MetadataError::Internal("database is locked".to_string()));
        }
        Ok(())
    }
}

/// Metadata store that delegates to a real store and fails on demand.
pub struct FaultyMetadata {
    inner: Arc<dyn MetadataStore>,
    faults: Arc<MetadataFaults>,
}

impl FaultyMetadata {
    pub fn new(inner: Arc<dyn MetadataStore>, faults: Arc<MetadataFaults>) -> Self {
        Self { inner, faults }
    }
}

#[async_trait]
impl UploadRepo for FaultyMetadata {
    async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<i64> {
        self.inner.insert_upload(upload).await
    }

    async fn get_upload_by_id(&self, id: i64) -> MetadataResult<Option<UploadRow>> {
        self.inner.get_upload_by_id(id).await
    }

    async fn add_upload_part(&self, id: i64, part_index: i32) -> MetadataResult<()> {
        self.inner.add_upload_part(id, part_index).await
    }

    async fn mark_queued(
        &self,
        id: i64,
        upload_size: i64,
        uncompressed_size: Option<i64>,
    ) -> MetadataResult<()> {
        MetadataFaults::check(&self.faults.fail_mark_queued)?;
        self.inner
            .mark_queued(id, upload_size, uncompressed_size)
            .await
    }

    async fn mark_failed(&self, id: i64, reason: &str) -> MetadataResult<()> {
        self.inner.mark_failed(id, reason).await
    }
}

#[async_trait]
impl RepositoryRepo for FaultyMetadata {
    async fn get_repository_by_name(&self, name: &str) -> MetadataResult<Option<RepositoryRow>> {
        self.inner.get_repository_by_name(name).await
    }

    async fn upsert_repository(&self, name: &str) -> MetadataResult<RepositoryRow> {
        self.inner.upsert_repository(name).await
    }
}

#[async_trait]
impl TokenRepo for FaultyMetadata {
    async fn create_token(&self, token: &TokenRow) -> MetadataResult<()> {
        self.inner.create_token(token).await
    }

    async fn get_token_by_hash(&self, token_hash: &str) -> MetadataResult<Option<TokenRow>> {
        self.inner.get_token_by_hash(token_hash).await
    }

    async fn get_token(&self, token_id: Uuid) -> MetadataResult<Option<TokenRow>> {
        self.inner.get_token(token_id).await
    }

    async fn touch_token(&self, token_id: Uuid, used_at: OffsetDateTime) -> MetadataResult<()> {
        self.inner.touch_token(token_id, used_at).await
    }

    async fn revoke_token(&self, token_id: Uuid, revoked_at: OffsetDateTime) -> MetadataResult<()> {
        self.inner.revoke_token(token_id, revoked_at).await
    }
}

#[async_trait]
impl BootstrapRepo for FaultyMetadata {
    async fn get_bootstrap_token_id(&self) -> MetadataResult<Option<Uuid>> {
        self.inner.get_bootstrap_token_id().await
    }

    async fn set_bootstrap_token_id(&self, token_id: Uuid) -> MetadataResult<()> {
        self.inner.set_bootstrap_token_id(token_id).await
    }

    async fn clear_bootstrap_token_id(&self) -> MetadataResult<()> {
        self.inner.clear_bootstrap_token_id().await
    }
}

#[async_trait]
impl MetadataStore for FaultyMetadata {
    async fn migrate(&self) -> MetadataResult<()> {
        self.inner.migrate().await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.inner.health_check().await
    }

    async fn transact(&self) -> MetadataResult<Box<dyn MetadataTx>> {
        let inner = self.inner.transact().await?;
        Ok(Box::new(FaultyTx {
            inner,
            faults: self.faults.clone(),
        }))
    }
}

struct FaultyTx {
    inner: Box<dyn MetadataTx>,
    faults: Arc<MetadataFaults>,
}

#[async_trait]
impl UploadRepo for FaultyTx {
    async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<i64> {
        self.inner.insert_upload(upload).await
    }

    async fn get_upload_by_id(&self, id: i64) -> MetadataResult<Option<UploadRow>> {
        self.inner.get_upload_by_id(id).await
    }

    async fn add_upload_part(&self, id: i64, part_index: i32) -> MetadataResult<()> {
        self.inner.add_upload_part(id, part_index).await
    }

    async fn mark_queued(
        &self,
        id: i64,
        upload_size: i64,
        uncompressed_size: Option<i64>,
    ) -> MetadataResult<()> {
        MetadataFaults::check(&self.faults.fail_mark_queued)?;
        self.inner
            .mark_queued(id, upload_size, uncompressed_size)
            .await
    }

    async fn mark_failed(&self, id: i64, reason: &str) -> MetadataResult<()> {
        self.inner.mark_failed(id, reason).await
    }
}

#[async_trait]
impl MetadataTx for FaultyTx {
    async fn commit(self: Box<Self>) -> MetadataResult<()> {
        if let Err(e) = MetadataFaults::check(&self.faults.fail_commit) {
            self.inner.rollback().await?;
            return Err(e);
        }
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> MetadataResult<()> {
        self.inner.rollback().await
    }
}
