//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{NewUpload, RepositoryRow, TokenRow, UploadRow};
use crate::repos::{BootstrapRepo, RepositoryRepo, TokenRepo, UploadRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    UploadRepo + RepositoryRepo + TokenRepo + BootstrapRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Open a transaction. Upload operations on the returned handle are not
    /// visible to other callers until it is committed. Dropping the handle
    /// without committing rolls it back.
    async fn transact(&self) -> MetadataResult<Box<dyn MetadataTx>>;
}

/// An open metadata transaction.
#[async_trait]
pub trait MetadataTx: UploadRepo {
    async fn commit(self: Box<Self>) -> MetadataResult<()>;

    async fn rollback(self: Box<Self>) -> MetadataResult<()>;
}

/// Finish a transaction according to the outcome of the work done in it:
/// commit on `Ok`, roll back on `Err`.
///
/// A commit failure replaces the result. A rollback failure is logged and the
/// original error is returned.
pub async fn done<T, E>(tx: Box<dyn MetadataTx>, result: Result<T, E>) -> Result<T, E>
where
    E: From<MetadataError>,
{
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "Failed to roll back metadata transaction");
            }
            Err(err)
        }
    }
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store.
    ///
    /// `query_timeout_secs` bounds how long a caller waits for the single
    /// pooled connection.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(60);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection: an open transaction holds it, so other callers
        // queue on the pool instead of failing with "database is locked".
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(query_timeout_secs))
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "SQLite metadata store ready");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn transact(&self) -> MetadataResult<Box<dyn MetadataTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTx {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

/// Transaction handle for [`SqliteStore`].
pub struct SqliteTx {
    tx: Mutex<Option<Transaction<'static, Sqlite>>>,
}

impl SqliteTx {
    async fn take(&self) -> MetadataResult<Transaction<'static, Sqlite>> {
        self.tx
            .lock()
            .await
            .take()
            .ok_or(MetadataError::TransactionFinished)
    }
}

#[async_trait]
impl MetadataTx for SqliteTx {
    async fn commit(self: Box<Self>) -> MetadataResult<()> {
        self.take().await?.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> MetadataResult<()> {
        self.take().await?.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl UploadRepo for SqliteTx {
    async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<i64> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(MetadataError::TransactionFinished)?;
        sqlite_impl::insert_upload(&mut **tx, upload).await
    }

    async fn get_upload_by_id(&self, id: i64) -> MetadataResult<Option<UploadRow>> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(MetadataError::TransactionFinished)?;
        sqlite_impl::get_upload_by_id(&mut **tx, id).await
    }

    async fn add_upload_part(&self, id: i64, part_index: i32) -> MetadataResult<()> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(MetadataError::TransactionFinished)?;
        sqlite_impl::add_upload_part(&mut **tx, id, part_index).await
    }

    async fn mark_queued(
        &self,
        id: i64,
        upload_size: i64,
        uncompressed_size: Option<i64>,
    ) -> MetadataResult<()> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(MetadataError::TransactionFinished)?;
        sqlite_impl::mark_queued(&mut **tx, id, upload_size, uncompressed_size).await
    }

    async fn mark_failed(&self, id: i64, reason: &str) -> MetadataResult<()> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(MetadataError::TransactionFinished)?;
        sqlite_impl::mark_failed(&mut **tx, id, reason).await
    }
}

#[async_trait]
impl UploadRepo for SqliteStore {
    async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<i64> {
        // Row and parts land together.
        let mut tx = self.pool.begin().await?;
        let id = sqlite_impl::insert_upload(&mut *tx, upload).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn get_upload_by_id(&self, id: i64) -> MetadataResult<Option<UploadRow>> {
        let mut conn = self.pool.acquire().await?;
        sqlite_impl::get_upload_by_id(&mut *conn, id).await
    }

    async fn add_upload_part(&self, id: i64, part_index: i32) -> MetadataResult<()> {
        let mut conn = self.pool.acquire().await?;
        sqlite_impl::add_upload_part(&mut *conn, id, part_index).await
    }

    async fn mark_queued(
        &self,
        id: i64,
        upload_size: i64,
        uncompressed_size: Option<i64>,
    ) -> MetadataResult<()> {
        let mut conn = self.pool.acquire().await?;
        sqlite_impl::mark_queued(&mut *conn, id, upload_size, uncompressed_size).await
    }

    async fn mark_failed(&self, id: i64, reason: &str) -> MetadataResult<()> {
        let mut conn = self.pool.acquire().await?;
        sqlite_impl::mark_failed(&mut *conn, id, reason).await
    }
}

mod sqlite_impl {
    use super::*;
    use sqlx::SqliteConnection;

    pub(super) async fn insert_upload(
        conn: &mut SqliteConnection,
        upload: &NewUpload,
    ) -> MetadataResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO lsif_uploads (
                repository_id, commit_hash, root, indexer, indexer_version,
                associated_index_id, state, num_parts, uploaded_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(upload.repository_id)
        .bind(&upload.commit)
        .bind(&upload.root)
        .bind(&upload.indexer)
        .bind(&upload.indexer_version)
        .bind(upload.associated_index_id)
        .bind(upload.state.as_str())
        .bind(upload.num_parts)
        .bind(OffsetDateTime::now_utc())
        .fetch_one(&mut *conn)
        .await?;

        for &part_index in &upload.uploaded_parts {
            add_upload_part(conn, id, part_index).await?;
        }

        Ok(id)
    }

    pub(super) async fn get_upload_by_id(
        conn: &mut SqliteConnection,
        id: i64,
    ) -> MetadataResult<Option<UploadRow>> {
        let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM lsif_uploads WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        let Some(mut row) = row else {
            return Ok(None);
        };

        row.uploaded_parts = sqlx::query_scalar(
            "SELECT part_index FROM lsif_upload_parts WHERE upload_id = ? ORDER BY part_index",
        )
        .bind(id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(Some(row))
    }

    pub(super) async fn add_upload_part(
        conn: &mut SqliteConnection,
        id: i64,
        part_index: i32,
    ) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO lsif_upload_parts (upload_id, part_index) VALUES (?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(id)
        .bind(part_index)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub(super) async fn mark_queued(
        conn: &mut SqliteConnection,
        id: i64,
        upload_size: i64,
        uncompressed_size: Option<i64>,
    ) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE lsif_uploads
            SET state = 'queued', upload_size = ?, uncompressed_size = ?
            WHERE id = ? AND state = 'uploading'
            "#,
        )
        .bind(upload_size)
        .bind(uncompressed_size)
        .bind(id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_uploading(conn, id).await);
        }
        Ok(())
    }

    pub(super) async fn mark_failed(
        conn: &mut SqliteConnection,
        id: i64,
        reason: &str,
    ) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE lsif_uploads
            SET state = 'failed',
                failure_message = ?,
                finished_at = ?,
                num_failures = num_failures + 1
            WHERE id = ? AND state = 'uploading'
            "#,
        )
        .bind(reason)
        .bind(OffsetDateTime::now_utc())
        .bind(id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_uploading(conn, id).await);
        }
        Ok(())
    }

    /// Error for a guarded transition that matched no row.
    async fn not_uploading(conn: &mut SqliteConnection, id: i64) -> MetadataError {
        let state: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT state FROM lsif_uploads WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await;
        match state {
            Ok(Some(state)) => {
                MetadataError::Conflict(format!("upload {id} is {state}, not uploading"))
            }
            Ok(None) => MetadataError::NotFound(format!("upload {id}")),
            Err(e) => e.into(),
        }
    }
}

#[async_trait]
impl RepositoryRepo for SqliteStore {
    async fn get_repository_by_name(&self, name: &str) -> MetadataResult<Option<RepositoryRow>> {
        let row = sqlx::query_as::<_, RepositoryRow>("SELECT * FROM repositories WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn upsert_repository(&self, name: &str) -> MetadataResult<RepositoryRow> {
        sqlx::query(
            "INSERT INTO repositories (name, created_at) VALUES (?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;

        self.get_repository_by_name(name)
            .await?
            .ok_or_else(|| MetadataError::Internal(format!("repository {name} vanished")))
    }
}

#[async_trait]
impl TokenRepo for SqliteStore {
    async fn create_token(&self, token: &TokenRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tokens (token_id, token_hash, scopes, expires_at, revoked_at,
                                created_at, last_used_at, description)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(token.token_id)
        .bind(&token.token_hash)
        .bind(&token.scopes)
        .bind(token.expires_at)
        .bind(token.revoked_at)
        .bind(token.created_at)
        .bind(token.last_used_at)
        .bind(&token.description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_token_by_hash(&self, token_hash: &str) -> MetadataResult<Option<TokenRow>> {
        let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_token(&self, token_id: Uuid) -> MetadataResult<Option<TokenRow>> {
        let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_id = ?")
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn touch_token(&self, token_id: Uuid, used_at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query("UPDATE tokens SET last_used_at = ? WHERE token_id = ?")
            .bind(used_at)
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn revoke_token(&self, token_id: Uuid, revoked_at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query("UPDATE tokens SET revoked_at = ? WHERE token_id = ?")
            .bind(revoked_at)
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BootstrapRepo for SqliteStore {
    async fn get_bootstrap_token_id(&self) -> MetadataResult<Option<Uuid>> {
        let value: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT bootstrap_token_id FROM bootstrap_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.flatten())
    }

    async fn set_bootstrap_token_id(&self, token_id: Uuid) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bootstrap_state (id, bootstrap_token_id)
            VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET bootstrap_token_id = excluded.bootstrap_token_id
            "#,
        )
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_bootstrap_token_id(&self) -> MetadataResult<()> {
        sqlx::query("UPDATE bootstrap_state SET bootstrap_token_id = NULL WHERE id = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lsif_uploads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository_id INTEGER NOT NULL REFERENCES repositories(id),
    commit_hash TEXT NOT NULL,
    root TEXT NOT NULL DEFAULT '',
    indexer TEXT NOT NULL,
    indexer_version TEXT NOT NULL DEFAULT '',
    state TEXT NOT NULL DEFAULT 'uploading'
        CHECK (state IN ('uploading', 'queued', 'failed', 'processing', 'completed')),
    failure_message TEXT,
    num_parts INTEGER NOT NULL CHECK (num_parts >= 1),
    upload_size INTEGER,
    uncompressed_size INTEGER,
    associated_index_id INTEGER,
    num_failures INTEGER NOT NULL DEFAULT 0,
    uploaded_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_lsif_uploads_state ON lsif_uploads(state);
CREATE INDEX IF NOT EXISTS idx_lsif_uploads_repository_commit
    ON lsif_uploads(repository_id, commit_hash);

CREATE TABLE IF NOT EXISTS lsif_upload_parts (
    upload_id INTEGER NOT NULL REFERENCES lsif_uploads(id) ON DELETE CASCADE,
    part_index INTEGER NOT NULL CHECK (part_index >= 0),
    PRIMARY KEY (upload_id, part_index)
);

CREATE TABLE IF NOT EXISTS tokens (
    token_id BLOB PRIMARY KEY,
    token_hash TEXT NOT NULL UNIQUE,
    scopes TEXT NOT NULL,
    expires_at TEXT,
    revoked_at TEXT,
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    description TEXT
);

CREATE TABLE IF NOT EXISTS bootstrap_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    bootstrap_token_id BLOB
);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use indexgate_core::UploadState;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn test_store() -> (SqliteStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("metadata.db"), None)
            .await
            .unwrap();
        (store, dir)
    }

    fn new_upload(repository_id: i64, num_parts: i32, uploaded_parts: Vec<i32>) -> NewUpload {
        NewUpload {
            repository_id,
            commit: "deadbeef01deadbeef02deadbeef03deadbeef04".to_string(),
            root: "proj/".to_string(),
            indexer: "lsif-go".to_string(),
            indexer_version: "1.2.0".to_string(),
            associated_index_id: None,
            state: UploadState::Uploading,
            num_parts,
            uploaded_parts,
        }
    }

    async fn repo_id(store: &SqliteStore) -> i64 {
        store
            .upsert_repository("github.com/test/repo")
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_insert_and_get_upload() {
        let (store, _dir) = test_store().await;
        let repository_id = repo_id(&store).await;

        let id = store
            .insert_upload(&new_upload(repository_id, 1, vec![0]))
            .await
            .unwrap();
        assert!(id > 0);

        let row = store.get_upload_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.commit, "deadbeef01deadbeef02deadbeef03deadbeef04");
        assert_eq!(row.root, "proj/");
        assert_eq!(row.upload_state().unwrap(), UploadState::Uploading);
        assert_eq!(row.num_parts, 1);
        assert_eq!(row.uploaded_parts, vec![0]);
        assert_eq!(row.associated_index_id, None);
        assert_eq!(row.upload_size, None);

        assert!(store.get_upload_by_id(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_upload_part_is_idempotent() {
        let (store, _dir) = test_store().await;
        let repository_id = repo_id(&store).await;
        let id = store
            .insert_upload(&new_upload(repository_id, 3, vec![]))
            .await
            .unwrap();

        store.add_upload_part(id, 2).await.unwrap();
        store.add_upload_part(id, 0).await.unwrap();
        store.add_upload_part(id, 2).await.unwrap();

        let row = store.get_upload_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.uploaded_parts, vec![0, 2]);
        assert_eq!(row.missing_parts(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_part_appends() {
        let (store, _dir) = test_store().await;
        let store = Arc::new(store);
        let repository_id = repo_id(&store).await;
        let id = store
            .insert_upload(&new_upload(repository_id, 8, vec![]))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in (0..8).rev() {
            let store = store.clone();
            handles.push(tokio::spawn(
                async move { store.add_upload_part(id, i).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let row = store.get_upload_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.uploaded_parts, (0..8).collect::<Vec<_>>());
        assert_eq!(row.missing_parts(), 0);
    }

    #[tokio::test]
    async fn test_mark_queued_and_failed() {
        let (store, _dir) = test_store().await;
        let repository_id = repo_id(&store).await;
        let id = store
            .insert_upload(&new_upload(repository_id, 1, vec![0]))
            .await
            .unwrap();

        store.mark_queued(id, 1024, Some(4096)).await.unwrap();
        let row = store.get_upload_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.upload_state().unwrap(), UploadState::Queued);
        assert_eq!(row.upload_size, Some(1024));
        assert_eq!(row.uncompressed_size, Some(4096));
        assert!(row.finished_at.is_none());

        let failed = store
            .insert_upload(&new_upload(repository_id, 1, vec![0]))
            .await
            .unwrap();
        store.mark_failed(failed, "unknown error:\n* boom").await.unwrap();
        let row = store.get_upload_by_id(failed).await.unwrap().unwrap();
        assert_eq!(row.upload_state().unwrap(), UploadState::Failed);
        assert_eq!(row.failure_message.as_deref(), Some("unknown error:\n* boom"));
        assert_eq!(row.num_failures, 1);
        assert!(row.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_transitions_only_leave_uploading() {
        let (store, _dir) = test_store().await;
        let repository_id = repo_id(&store).await;
        let id = store
            .insert_upload(&new_upload(repository_id, 1, vec![0]))
            .await
            .unwrap();
        store.mark_queued(id, 10, None).await.unwrap();

        assert!(matches!(
            store.mark_failed(id, "unknown error:\n* late").await,
            Err(MetadataError::Conflict(_))
        ));
        assert!(matches!(
            store.mark_queued(id, 20, None).await,
            Err(MetadataError::Conflict(_))
        ));

        let row = store.get_upload_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.upload_state().unwrap(), UploadState::Queued);
        assert_eq!(row.upload_size, Some(10));
        assert!(row.failure_message.is_none());
        assert_eq!(row.num_failures, 0);
    }

    #[tokio::test]
    async fn test_mark_missing_upload_is_not_found() {
        let (store, _dir) = test_store().await;
        assert!(matches!(
            store.mark_queued(99, 1, None).await,
            Err(MetadataError::NotFound(_))
        ));
        assert!(matches!(
            store.mark_failed(99, "x").await,
            Err(MetadataError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_worker_states_round_trip() {
        let (store, _dir) = test_store().await;
        let repository_id = repo_id(&store).await;
        let id = store
            .insert_upload(&new_upload(repository_id, 1, vec![0]))
            .await
            .unwrap();

        sqlx::query("UPDATE lsif_uploads SET state = 'completed' WHERE id = ?")
            .bind(id)
            .execute(store.pool())
            .await
            .unwrap();

        let row = store.get_upload_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.upload_state().unwrap(), UploadState::Completed);
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let (store, _dir) = test_store().await;
        let repository_id = repo_id(&store).await;

        let tx = store.transact().await.unwrap();
        let kept = tx
            .insert_upload(&new_upload(repository_id, 1, vec![0]))
            .await
            .unwrap();
        tx.mark_queued(kept, 10, None).await.unwrap();
        // Reads inside the transaction see its own writes.
        let row = tx.get_upload_by_id(kept).await.unwrap().unwrap();
        assert_eq!(row.upload_state().unwrap(), UploadState::Queued);
        tx.commit().await.unwrap();

        let tx = store.transact().await.unwrap();
        let dropped = tx
            .insert_upload(&new_upload(repository_id, 1, vec![0]))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let row = store.get_upload_by_id(kept).await.unwrap().unwrap();
        assert_eq!(row.upload_state().unwrap(), UploadState::Queued);
        assert_eq!(row.upload_size, Some(10));
        assert!(store.get_upload_by_id(dropped).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let (store, _dir) = test_store().await;
        let repository_id = repo_id(&store).await;

        let id = {
            let tx = store.transact().await.unwrap();
            tx.insert_upload(&new_upload(repository_id, 1, vec![0]))
                .await
                .unwrap()
        };

        assert!(store.get_upload_by_id(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_done_commits_on_ok_and_rolls_back_on_err() {
        let (store, _dir) = test_store().await;
        let repository_id = repo_id(&store).await;

        let tx = store.transact().await.unwrap();
        let result = tx
            .insert_upload(&new_upload(repository_id, 2, vec![]))
            .await;
        let committed = done(tx, result).await.unwrap();

        let tx = store.transact().await.unwrap();
        let inserted = tx
            .insert_upload(&new_upload(repository_id, 2, vec![]))
            .await
            .unwrap();
        let failed: Result<i64, MetadataError> =
            Err(MetadataError::Internal("blob write failed".to_string()));
        let err = done(tx, failed).await.unwrap_err();
        assert!(err.to_string().contains("blob write failed"));

        assert!(store.get_upload_by_id(committed).await.unwrap().is_some());
        assert!(store.get_upload_by_id(inserted).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_repository() {
        let (store, _dir) = test_store().await;

        let first = store.upsert_repository("github.com/a/b").await.unwrap();
        let again = store.upsert_repository("github.com/a/b").await.unwrap();
        assert_eq!(first.id, again.id);

        let other = store.upsert_repository("gitlab.com/a/b").await.unwrap();
        assert_ne!(first.id, other.id);

        assert!(
            store
                .get_repository_by_name("github.com/missing/repo")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_token_lifecycle() {
        let (store, _dir) = test_store().await;
        let now = OffsetDateTime::now_utc();
        let token = TokenRow {
            token_id: Uuid::new_v4(),
            token_hash: "ab".repeat(32),
            scopes: r#"["upload"]"#.to_string(),
            expires_at: None,
            revoked_at: None,
            created_at: now,
            last_used_at: None,
            description: Some("ci".to_string()),
        };
        store.create_token(&token).await.unwrap();

        let fetched = store.get_token_by_hash(&token.token_hash).await.unwrap().unwrap();
        assert_eq!(fetched.token_id, token.token_id);
        assert!(fetched.to_token().can_upload());

        store.touch_token(token.token_id, now).await.unwrap();
        store.revoke_token(token.token_id, now).await.unwrap();
        let fetched = store.get_token(token.token_id).await.unwrap().unwrap();
        assert!(fetched.last_used_at.is_some());
        assert!(fetched.revoked_at.is_some());
    }

    #[tokio::test]
    async fn test_bootstrap_marker() {
        let (store, _dir) = test_store().await;
        assert!(store.get_bootstrap_token_id().await.unwrap().is_none());

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        store.set_bootstrap_token_id(first).await.unwrap();
        store.set_bootstrap_token_id(second).await.unwrap();
        assert_eq!(store.get_bootstrap_token_id().await.unwrap(), Some(second));

        store.clear_bootstrap_token_id().await.unwrap();
        assert!(store.get_bootstrap_token_id().await.unwrap().is_none());
    }
}
