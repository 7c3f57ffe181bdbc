//! SQLite storage backend
//!
//! Dataset rows and snapshots live in the database. Text exports still go
//! to a session directory on disk so the live results file can be tailed.

use super::file::SessionFiles;
use super::{safe_session_id, PersistenceStore, Session, StorageResult};
use crate::proxy::models::Proxy;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;

/// SQLite-backed [`PersistenceStore`]
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    session: Session,
    files: SessionFiles,
}

impl SqliteStore {
    /// Connect to `database_url`, create the schema and the session text directory
    pub async fn connect(
        database_url: &str,
        text_dir: impl Into<PathBuf>,
        session: Session,
    ) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every in-memory connection is a separate database; pin to one.
        let in_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::migrate(&pool).await?;

        let files = SessionFiles::new(text_dir.into().join(session.id()));
        Ok(Self {
            pool,
            session,
            files,
        })
    }

    async fn migrate(pool: &SqlitePool) -> StorageResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS dataset(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session TEXT NOT NULL,
            record TEXT NOT NULL,
            created_at TEXT NOT NULL
        )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dataset_session ON dataset(session)")
            .execute(pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS snapshots(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )"#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> StorageResult<Vec<Proxy>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT record FROM dataset WHERE session = ?1 ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| serde_json::from_str(row).map_err(Into::into))
            .collect()
    }
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn append_dataset(&self, records: &[Proxy]) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query("INSERT INTO dataset(session, record, created_at) VALUES(?1, ?2, ?3)")
                .bind(self.session.id())
                .bind(serde_json::to_string(record)?)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_dataset(&self) -> StorageResult<Vec<Proxy>> {
        self.load_session(self.session.id()).await
    }

    async fn set_snapshot(&self, key: &str, value: Value) -> StorageResult<()> {
        sqlx::query(
            r#"INSERT INTO snapshots(key, value, updated_at) VALUES(?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value=excluded.value,
                updated_at=excluded.updated_at
        "#,
        )
        .bind(key)
        .bind(serde_json::to_string(&value)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_snapshot(&self, key: &str) -> StorageResult<Option<Value>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM snapshots WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match value {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn append_text_file(&self, name: &str, text: &str) -> StorageResult<()> {
        self.files.append(name, text).await
    }

    async fn write_text_file(&self, name: &str, text: &str, ext: &str) -> StorageResult<()> {
        self.files.write(name, text, ext).await
    }

    async fn list_sessions(&self) -> StorageResult<Vec<String>> {
        let sessions = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT session FROM dataset ORDER BY session DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn session_results(&self, session_id: &str) -> StorageResult<Vec<Proxy>> {
        match safe_session_id(session_id) {
            Some(session_id) => self.load_session(session_id).await,
            None => Ok(Vec::new()),
        }
    }
}
