//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{NewUpload, RepositoryRow, TokenRow, UploadRow};
use crate::repos::{BootstrapRepo, RepositoryRepo, TokenRepo, UploadRepo};
use crate::store::{MetadataStore, MetadataTx};
use async_trait::async_trait;
use indexgate_core::config::PgSslMode;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres, Transaction};
use std::str::FromStr;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect using a full connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Connect using individual parameters, so the password can come from
    /// its own environment variable.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }
        if let Some(pass) = password {
            opts = opts.password(pass);
        }
        if let Some(mode) = ssl_mode {
            opts = opts.ssl_mode(match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            });
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
            tracing::debug!(timeout_ms, "PostgreSQL statement_timeout set");
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements cannot hold more than one command.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn transact(&self) -> MetadataResult<Box<dyn MetadataTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTx {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

/// Transaction handle for [`PostgresStore`].
pub struct PostgresTx {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

#[async_trait]
impl MetadataTx for PostgresTx {
    async fn commit(self: Box<Self>) -> MetadataResult<()> {
        let tx = self
            .tx
            .lock()
            .await
            .take()
            .ok_or(MetadataError::TransactionFinished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> MetadataResult<()> {
        let tx = self
            .tx
            .lock()
            .await
            .take()
            .ok_or(MetadataError::TransactionFinished)?;
        tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl UploadRepo for PostgresTx {
    async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<i64> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(MetadataError::TransactionFinished)?;
        pg_impl::insert_upload(&mut **tx, upload).await
    }

    async fn get_upload_by_id(&self, id: i64) -> MetadataResult<Option<UploadRow>> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(MetadataError::TransactionFinished)?;
        // Held until commit so a concurrent finalize waits for this one.
        pg_impl::get_upload_by_id(&mut **tx, id, true).await
    }

    async fn add_upload_part(&self, id: i64, part_index: i32) -> MetadataResult<()> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(MetadataError::TransactionFinished)?;
        pg_impl::add_upload_part(&mut **tx, id, part_index).await
    }

    async fn mark_queued(
        &self,
        id: i64,
        upload_size: i64,
        uncompressed_size: Option<i64>,
    ) -> MetadataResult<()> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(MetadataError::TransactionFinished)?;
        pg_impl::mark_queued(&mut **tx, id, upload_size, uncompressed_size).await
    }

    async fn mark_failed(&self, id: i64, reason: &str) -> MetadataResult<()> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(MetadataError::TransactionFinished)?;
        pg_impl::mark_failed(&mut **tx, id, reason).await
    }
}

#[async_trait]
impl UploadRepo for PostgresStore {
    async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<i64> {
        let mut tx = self.pool.begin().await?;
        let id = pg_impl::insert_upload(&mut *tx, upload).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn get_upload_by_id(&self, id: i64) -> MetadataResult<Option<UploadRow>> {
        let mut conn = self.pool.acquire().await?;
        pg_impl::get_upload_by_id(&mut *conn, id, false).await
    }

    async fn add_upload_part(&self, id: i64, part_index: i32) -> MetadataResult<()> {
        let mut conn = self.pool.acquire().await?;
        pg_impl::add_upload_part(&mut *conn, id, part_index).await
    }

    async fn mark_queued(
        &self,
        id: i64,
        upload_size: i64,
        uncompressed_size: Option<i64>,
    ) -> MetadataResult<()> {
        let mut conn = self.pool.acquire().await?;
        pg_impl::mark_queued(&mut *conn, id, upload_size, uncompressed_size).await
    }

    async fn mark_failed(&self, id: i64, reason: &str) -> MetadataResult<()> {
        let mut conn = self.pool.acquire().await?;
        pg_impl::mark_failed(&mut *conn, id, reason).await
    }
}

mod pg_impl {
    use super::*;
    use sqlx::PgConnection;

    pub(super) async fn insert_upload(
        conn: &mut PgConnection,
        upload: &NewUpload,
    ) -> MetadataResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO lsif_uploads (
                repository_id, commit_hash, root, indexer, indexer_version,
                associated_index_id, state, num_parts, uploaded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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

        if !upload.uploaded_parts.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO lsif_upload_parts (upload_id, part_index)
                SELECT $1, UNNEST($2::INTEGER[])
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(id)
            .bind(&upload.uploaded_parts)
            .execute(&mut *conn)
            .await?;
        }

        Ok(id)
    }

    pub(super) async fn get_upload_by_id(
        conn: &mut PgConnection,
        id: i64,
        lock: bool,
    ) -> MetadataResult<Option<UploadRow>> {
        let sql = if lock {
            "SELECT * FROM lsif_uploads WHERE id = $1 FOR UPDATE"
        } else {
            "SELECT * FROM lsif_uploads WHERE id = $1"
        };
        let row = sqlx::query_as::<_, UploadRow>(sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        let Some(mut row) = row else {
            return Ok(None);
        };

        row.uploaded_parts = sqlx::query_scalar(
            "SELECT part_index FROM lsif_upload_parts WHERE upload_id = $1 ORDER BY part_index",
        )
        .bind(id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(Some(row))
    }

    pub(super) async fn add_upload_part(
        conn: &mut PgConnection,
        id: i64,
        part_index: i32,
    ) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO lsif_upload_parts (upload_id, part_index) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(id)
        .bind(part_index)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub(super) async fn mark_queued(
        conn: &mut PgConnection,
        id: i64,
        upload_size: i64,
        uncompressed_size: Option<i64>,
    ) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE lsif_uploads
            SET state = 'queued', upload_size = $1, uncompressed_size = $2
            WHERE id = $3 AND state = 'uploading'
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
        conn: &mut PgConnection,
        id: i64,
        reason: &str,
    ) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE lsif_uploads
            SET state = 'failed',
                failure_message = $1,
                finished_at = $2,
                num_failures = num_failures + 1
            WHERE id = $3 AND state = 'uploading'
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

    async fn not_uploading(conn: &mut PgConnection, id: i64) -> MetadataError {
        let state: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT state FROM lsif_uploads WHERE id = $1")
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
impl RepositoryRepo for PostgresStore {
    async fn get_repository_by_name(&self, name: &str) -> MetadataResult<Option<RepositoryRow>> {
        let row = sqlx::query_as::<_, RepositoryRow>("SELECT * FROM repositories WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn upsert_repository(&self, name: &str) -> MetadataResult<RepositoryRow> {
        sqlx::query(
            "INSERT INTO repositories (name, created_at) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
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
impl TokenRepo for PostgresStore {
    async fn create_token(&self, token: &TokenRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tokens (token_id, token_hash, scopes, expires_at, revoked_at,
                                created_at, last_used_at, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
        let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_token(&self, token_id: Uuid) -> MetadataResult<Option<TokenRow>> {
        let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_id = $1")
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn touch_token(&self, token_id: Uuid, used_at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query("UPDATE tokens SET last_used_at = $1 WHERE token_id = $2")
            .bind(used_at)
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn revoke_token(&self, token_id: Uuid, revoked_at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query("UPDATE tokens SET revoked_at = $1 WHERE token_id = $2")
            .bind(revoked_at)
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BootstrapRepo for PostgresStore {
    async fn get_bootstrap_token_id(&self) -> MetadataResult<Option<Uuid>> {
        // Outer None: no row. Inner None: row with a NULL marker.
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
            VALUES (1, $1)
            ON CONFLICT(id) DO UPDATE
            SET bootstrap_token_id = EXCLUDED.bootstrap_token_id
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

#[cfg(test)]
mod tests {
    use super::{POSTGRES_SCHEMA, postgres_schema_statements};

    #[test]
    fn test_schema_statements_skip_comment_only_chunks() {
        let schema = r#"
            -- comment only

            CREATE TABLE foo (id int);
            ;
            -- another comment
            CREATE TABLE bar (id int);
        "#;

        let statements = postgres_schema_statements(schema);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CREATE TABLE foo"));
        assert!(statements[1].contains("CREATE TABLE bar"));
    }

    #[test]
    fn test_embedded_schema_creates_upload_tables() {
        let statements = postgres_schema_statements(POSTGRES_SCHEMA);
        assert!(
            statements
                .iter()
                .any(|s| s.contains("CREATE TABLE IF NOT EXISTS lsif_uploads"))
        );
        assert!(
            statements
                .iter()
                .any(|s| s.contains("CREATE TABLE IF NOT EXISTS lsif_upload_parts"))
        );
    }
}
