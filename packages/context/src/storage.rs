// ABOUTME: SQLite storage for context cache entries and conversation tracking
// ABOUTME: Provides CRUD plus scoped bulk deletes used by cache invalidation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// One cached resolved value, keyed by conversation, configuration and
/// variable key. The request hash records the inputs that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub conversation_id: String,
    pub config_id: String,
    pub variable_key: String,
    pub value: Value,
    pub request_hash: String,
    pub fetched_at: DateTime<Utc>,
}

pub struct ContextStorage {
    pool: SqlitePool,
}

impl ContextStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Idempotent schema bootstrap.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS context_cache_entries (
                conversation_id TEXT NOT NULL,
                config_id TEXT NOT NULL,
                variable_key TEXT NOT NULL,
                value TEXT NOT NULL,
                request_hash TEXT NOT NULL,
                fetched_at TIMESTAMP NOT NULL,
                PRIMARY KEY (conversation_id, config_id, variable_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                last_context_resolution TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_entry(
        &self,
        conversation_id: &str,
        config_id: &str,
        variable_key: &str,
    ) -> Result<Option<CacheEntry>> {
        debug!(
            "fetching cache entry {}/{}/{}",
            conversation_id, config_id, variable_key
        );

        let row = sqlx::query(
            r#"
            SELECT conversation_id, config_id, variable_key, value, request_hash, fetched_at
            FROM context_cache_entries
            WHERE conversation_id = ? AND config_id = ? AND variable_key = ?
            "#,
        )
        .bind(conversation_id)
        .bind(config_id)
        .bind(variable_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| self.row_to_entry(&row)).transpose()
    }

    pub async fn upsert_entry(&self, entry: &CacheEntry) -> Result<()> {
        let value_json = serde_json::to_string(&entry.value)?;

        sqlx::query(
            r#"
            INSERT INTO context_cache_entries (
                conversation_id, config_id, variable_key, value, request_hash, fetched_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (conversation_id, config_id, variable_key) DO UPDATE SET
                value = excluded.value,
                request_hash = excluded.request_hash,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(&entry.conversation_id)
        .bind(&entry.config_id)
        .bind(&entry.variable_key)
        .bind(value_json)
        .bind(&entry.request_hash)
        .bind(entry.fetched_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_by_conversation(&self, conversation_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM context_cache_entries WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_by_config(&self, config_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM context_cache_entries WHERE config_id = ?")
            .bind(config_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_keys(
        &self,
        conversation_id: &str,
        config_id: &str,
        variable_keys: &[String],
    ) -> Result<u64> {
        let mut deleted = 0;
        for key in variable_keys {
            let result = sqlx::query(
                r#"
                DELETE FROM context_cache_entries
                WHERE conversation_id = ? AND config_id = ? AND variable_key = ?
                "#,
            )
            .bind(conversation_id)
            .bind(config_id)
            .bind(key)
            .execute(&self.pool)
            .await?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    /// Record that a context resolution pass just completed for the
    /// conversation.
    pub async fn touch_resolution(&self, conversation_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, last_context_resolution) VALUES (?, ?)
            ON CONFLICT (id) DO UPDATE SET
                last_context_resolution = excluded.last_context_resolution
            "#,
        )
        .bind(conversation_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_resolution(
        &self,
        conversation_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let row =
            sqlx::query("SELECT last_context_resolution FROM conversations WHERE id = ?")
                .bind(conversation_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|row| row.get("last_context_resolution")))
    }

    fn row_to_entry(&self, row: &sqlx::sqlite::SqliteRow) -> Result<CacheEntry> {
        let value_json: String = row.get("value");
        Ok(CacheEntry {
            conversation_id: row.get("conversation_id"),
            config_id: row.get("config_id"),
            variable_key: row.get("variable_key"),
            value: serde_json::from_str(&value_json)?,
            request_hash: row.get("request_hash"),
            fetched_at: row.get("fetched_at"),
        })
    }
}
