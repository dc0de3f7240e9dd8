// ABOUTME: Request-hash aware context cache over the SQLite storage layer
// ABOUTME: Reads and writes degrade safely, explicit invalidation propagates failures

use crate::storage::{CacheEntry, ContextStorage, StorageError};
use crate::types::{ContextConfig, Trigger};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Persistence-backed cache of resolved context values.
///
/// `get` and `set` never fail the surrounding resolution: any storage error
/// degrades to a miss or a dropped write. The explicit invalidation
/// operations propagate errors instead, since a silently failed invalidation
/// would leave stale data undetected.
pub struct ContextCache {
    storage: ContextStorage,
}

impl ContextCache {
    pub fn new(storage: ContextStorage) -> Self {
        Self { storage }
    }

    /// Cached value for the variable, provided it was fetched with the same
    /// request hash. Storage errors are logged and reported as a miss.
    pub async fn get(
        &self,
        conversation_id: &str,
        config_id: &str,
        variable_key: &str,
        request_hash: &str,
    ) -> Option<CacheEntry> {
        match self
            .storage
            .get_entry(conversation_id, config_id, variable_key)
            .await
        {
            Ok(Some(entry)) if entry.request_hash == request_hash => Some(entry),
            Ok(_) => None,
            Err(e) => {
                warn!(
                    "context cache read failed for {}/{}/{}: {}",
                    conversation_id, config_id, variable_key, e
                );
                None
            }
        }
    }

    /// Best-effort write; errors are logged and swallowed.
    pub async fn set(&self, entry: CacheEntry) {
        if let Err(e) = self.storage.upsert_entry(&entry).await {
            warn!(
                "context cache write failed for {}/{}/{}: {}",
                entry.conversation_id, entry.config_id, entry.variable_key, e
            );
        }
    }

    /// Drop every cached value for a conversation.
    pub async fn clear_conversation(&self, conversation_id: &str) -> Result<u64> {
        let deleted = self.storage.delete_by_conversation(conversation_id).await?;
        debug!(
            "cleared {} cached context values for conversation {}",
            deleted, conversation_id
        );
        Ok(deleted)
    }

    /// Drop every cached value produced by a configuration, across
    /// conversations.
    pub async fn clear_config(&self, config_id: &str) -> Result<u64> {
        let deleted = self.storage.delete_by_config(config_id).await?;
        debug!(
            "cleared {} cached context values for config {}",
            deleted, config_id
        );
        Ok(deleted)
    }

    /// Drop the cached values for an explicit set of variable keys.
    pub async fn invalidate_definitions(
        &self,
        conversation_id: &str,
        config_id: &str,
        variable_keys: &[String],
    ) -> Result<u64> {
        Ok(self
            .storage
            .delete_keys(conversation_id, config_id, variable_keys)
            .await?)
    }

    /// Drop the cached values of every per-invocation definition of the
    /// config for this conversation. Used when an upstream configuration
    /// change is detected for an existing conversation.
    pub async fn invalidate_invocation_definitions(
        &self,
        conversation_id: &str,
        config: &ContextConfig,
    ) -> Result<u64> {
        let keys: Vec<String> = config
            .context_variables
            .iter()
            .filter(|(_, def)| def.trigger == Trigger::Invocation)
            .map(|(key, _)| key.clone())
            .collect();
        self.invalidate_definitions(conversation_id, &config.id, &keys)
            .await
    }

    /// Drop the cached values of every definition whose fetch recipe
    /// references inbound headers, so a header-schema change cannot serve
    /// stale values.
    pub async fn invalidate_header_definitions(
        &self,
        conversation_id: &str,
        config: &ContextConfig,
    ) -> Result<u64> {
        let keys: Vec<String> = config
            .context_variables
            .iter()
            .filter(|(_, def)| def.references_headers())
            .map(|(key, _)| key.clone())
            .collect();
        self.invalidate_definitions(conversation_id, &config.id, &keys)
            .await
    }

    /// Best-effort stamp of the conversation's last resolution pass.
    pub async fn mark_resolved(&self, conversation_id: &str) {
        if let Err(e) = self.storage.touch_resolution(conversation_id).await {
            warn!(
                "failed to record context resolution for conversation {}: {}",
                conversation_id, e
            );
        }
    }

    /// Timestamp of the conversation's last resolution pass, if any.
    /// Fail-safe: storage errors read as "never resolved".
    pub async fn last_resolution(&self, conversation_id: &str) -> Option<DateTime<Utc>> {
        match self.storage.last_resolution(conversation_id).await {
            Ok(stamp) => stamp,
            Err(e) => {
                warn!(
                    "failed to read last resolution for conversation {}: {}",
                    conversation_id, e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::SqlitePool;

    async fn memory_pool() -> SqlitePool {
        sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn cache() -> ContextCache {
        let storage = ContextStorage::new(memory_pool().await);
        storage.migrate().await.unwrap();
        ContextCache::new(storage)
    }

    /// Cache whose underlying pool is closed, so every storage call errors.
    async fn broken_cache() -> ContextCache {
        let pool = memory_pool().await;
        let storage = ContextStorage::new(pool.clone());
        storage.migrate().await.unwrap();
        pool.close().await;
        ContextCache::new(storage)
    }

    fn entry(key: &str, hash: &str) -> CacheEntry {
        CacheEntry {
            conversation_id: "conv-1".to_string(),
            config_id: "cfg-1".to_string(),
            variable_key: key.to_string(),
            value: json!("cached"),
            request_hash: hash.to_string(),
            fetched_at: Utc::now(),
        }
    }

    fn config_with_variables() -> ContextConfig {
        serde_json::from_value(json!({
            "id": "cfg-1",
            "context_variables": {
                "account": {
                    "id": "def-account",
                    "name": "Account",
                    "trigger": "initialization",
                    "fetch": {
                        "url": "https://api.example/me",
                        "headers": {"Authorization": "{{headers.authorization}}"}
                    }
                },
                "status": {
                    "id": "def-status",
                    "name": "Status",
                    "trigger": "invocation",
                    "fetch": {"url": "https://api.example/status"}
                }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_requires_matching_request_hash() {
        let cache = cache().await;
        cache.set(entry("account", "hash-a")).await;

        assert!(cache
            .get("conv-1", "cfg-1", "account", "hash-a")
            .await
            .is_some());
        // A changed request hash means the cached value no longer applies.
        assert!(cache
            .get("conv-1", "cfg-1", "account", "hash-b")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_get_degrades_to_miss_on_storage_failure() {
        let cache = broken_cache().await;
        assert!(cache
            .get("conv-1", "cfg-1", "account", "hash-a")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_set_swallows_storage_failure() {
        let cache = broken_cache().await;
        // Must not panic or propagate.
        cache.set(entry("account", "hash-a")).await;
    }

    #[tokio::test]
    async fn test_explicit_invalidation_propagates_failure() {
        let cache = broken_cache().await;
        assert!(cache.clear_conversation("conv-1").await.is_err());
        assert!(cache.clear_config("cfg-1").await.is_err());
    }

    #[tokio::test]
    async fn test_clear_conversation_scopes() {
        let cache = cache().await;
        cache.set(entry("account", "h")).await;
        let mut other = entry("account", "h");
        other.conversation_id = "conv-2".to_string();
        cache.set(other).await;

        assert_eq!(cache.clear_conversation("conv-1").await.unwrap(), 1);
        assert!(cache.get("conv-2", "cfg-1", "account", "h").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_invocation_definitions_only() {
        let cache = cache().await;
        cache.set(entry("account", "h")).await;
        cache.set(entry("status", "h")).await;

        let deleted = cache
            .invalidate_invocation_definitions("conv-1", &config_with_variables())
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(cache.get("conv-1", "cfg-1", "account", "h").await.is_some());
        assert!(cache.get("conv-1", "cfg-1", "status", "h").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_header_definitions_only() {
        let cache = cache().await;
        cache.set(entry("account", "h")).await;
        cache.set(entry("status", "h")).await;

        let deleted = cache
            .invalidate_header_definitions("conv-1", &config_with_variables())
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(cache.get("conv-1", "cfg-1", "account", "h").await.is_none());
        assert!(cache.get("conv-1", "cfg-1", "status", "h").await.is_some());
    }

    #[tokio::test]
    async fn test_mark_resolved_round_trip() {
        let cache = cache().await;
        assert!(cache.last_resolution("conv-1").await.is_none());
        cache.mark_resolved("conv-1").await;
        assert!(cache.last_resolution("conv-1").await.is_some());
    }
}
