//! TTL key/value cache backed by the `cache_entries` table.
//!
//! Two typed views sit on top of [`KvCache`]:
//!
//! - [`EmbeddingCache`]: vectors keyed by tenant, model, and a hash of the
//!   lowercased text, so identical text is embedded once per tenant.
//! - [`ResponseCache`]: serialized RAG responses keyed by tenant and a hash
//!   of the query text only.
//!
//! Conversation history lives in a third namespace, owned by
//! [`crate::conversation::ConversationStore`].
//!
//! Expired entries read as absent and are removed lazily. Concurrent writers
//! of the same key race benignly; the last write wins.

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::time::Duration;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::RagResult;
use crate::queue::now_ms;

const EMBEDDING_NAMESPACE: &str = "embedding";
const RESPONSE_NAMESPACE: &str = "rag";

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub namespace: String,
    pub live: i64,
    pub expired: i64,
    pub bytes: i64,
}

/// One namespace of the shared `cache_entries` table.
#[derive(Clone)]
pub struct KvCache {
    pool: SqlitePool,
    namespace: &'static str,
    ttl: Duration,
}

impl KvCache {
    /// Entries written through this handle live for `ttl`.
    pub fn new(pool: SqlitePool, namespace: &'static str, ttl: Duration) -> Self {
        Self {
            pool,
            namespace,
            ttl,
        }
    }

    /// Read `key`. An expired entry reads as `None` and is deleted.
    pub async fn get(&self, key: &str) -> RagResult<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>, i64)> = sqlx::query_as(
            "SELECT value, expires_at FROM cache_entries WHERE namespace = ? AND key = ?",
        )
        .bind(self.namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((value, expires_at)) if expires_at > now_ms() => Ok(Some(value)),
            Some(_) => {
                sqlx::query(
                    "DELETE FROM cache_entries WHERE namespace = ? AND key = ? AND expires_at <= ?",
                )
                .bind(self.namespace)
                .bind(key)
                .bind(now_ms())
                .execute(&self.pool)
                .await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Write `key`, replacing any previous value and restarting its TTL.
    pub async fn put(&self, key: &str, value: &[u8]) -> RagResult<()> {
        let now = now_ms();
        let expires_at = now + self.ttl.as_millis() as i64;
        sqlx::query(
            r#"
            INSERT INTO cache_entries (namespace, key, value, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                created_at = excluded.created_at
            "#,
        )
        .bind(self.namespace)
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove one key. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> RagResult<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE namespace = ? AND key = ?")
            .bind(self.namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove every key in this namespace starting with `prefix`.
    pub async fn delete_prefix(&self, prefix: &str) -> RagResult<u64> {
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE namespace = ? AND substr(key, 1, length(?)) = ?",
        )
        .bind(self.namespace)
        .bind(prefix)
        .bind(prefix)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Live and expired entry counts plus stored bytes for this namespace.
    pub async fn stats(&self) -> RagResult<CacheStats> {
        let (live, expired, bytes): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN expires_at > ? THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN expires_at <= ? THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(length(value)), 0)
            FROM cache_entries WHERE namespace = ?
            "#,
        )
        .bind(now_ms())
        .bind(now_ms())
        .bind(self.namespace)
        .fetch_one(&self.pool)
        .await?;

        Ok(CacheStats {
            namespace: self.namespace.to_string(),
            live,
            expired,
            bytes,
        })
    }
}

/// Delete expired entries in every namespace.
pub async fn purge_expired(pool: &SqlitePool) -> RagResult<u64> {
    let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
        .bind(now_ms())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[derive(Clone)]
pub struct EmbeddingCache {
    inner: KvCache,
}

impl EmbeddingCache {
    pub fn new(pool: SqlitePool, ttl: Duration) -> Self {
        Self {
            inner: KvCache::new(pool, EMBEDDING_NAMESPACE, ttl),
        }
    }

    /// Case-insensitive on the text; scoped by tenant and model.
    pub fn cache_key(tenant_id: &str, model: &str, text: &str) -> String {
        format!(
            "{}:{}:{}",
            tenant_id,
            model,
            sha256_hex(&text.to_lowercase())
        )
    }

    /// The cached vector for `text`, if another chunk already paid for it.
    pub async fn get(&self, tenant_id: &str, model: &str, text: &str) -> RagResult<Option<Vec<f32>>> {
        let key = Self::cache_key(tenant_id, model, text);
        Ok(self.inner.get(&key).await?.map(|blob| blob_to_vec(&blob)))
    }

    pub async fn put(&self, tenant_id: &str, model: &str, text: &str, vector: &[f32]) -> RagResult<()> {
        let key = Self::cache_key(tenant_id, model, text);
        self.inner.put(&key, &vec_to_blob(vector)).await
    }

    pub async fn invalidate_tenant(&self, tenant_id: &str) -> RagResult<u64> {
        self.inner.delete_prefix(&format!("{}:", tenant_id)).await
    }

    /// Drop one tenant's vectors for `model`, e.g. after switching models.
    pub async fn invalidate_model(&self, tenant_id: &str, model: &str) -> RagResult<u64> {
        self.inner
            .delete_prefix(&format!("{}:{}:", tenant_id, model))
            .await
    }

    pub async fn stats(&self) -> RagResult<CacheStats> {
        self.inner.stats().await
    }
}

#[derive(Clone)]
pub struct ResponseCache {
    inner: KvCache,
}

impl ResponseCache {
    pub fn new(pool: SqlitePool, ttl: Duration) -> Self {
        Self {
            inner: KvCache::new(pool, RESPONSE_NAMESPACE, ttl),
        }
    }

    /// `rag:{tenant}:{first 16 hex chars of sha256(query)}`.
    ///
    /// Only the query text participates; retrieval options do not.
    pub fn cache_key(tenant_id: &str, query: &str) -> String {
        let digest = sha256_hex(query);
        format!("rag:{}:{}", tenant_id, &digest[..16])
    }

    /// Serialized response bytes exactly as stored.
    pub async fn get_raw(&self, tenant_id: &str, query: &str) -> RagResult<Option<Vec<u8>>> {
        self.inner.get(&Self::cache_key(tenant_id, query)).await
    }

    pub async fn put_raw(&self, tenant_id: &str, query: &str, bytes: &[u8]) -> RagResult<()> {
        self.inner.put(&Self::cache_key(tenant_id, query), bytes).await
    }

    pub async fn clear_tenant(&self, tenant_id: &str) -> RagResult<u64> {
        self.inner.delete_prefix(&format!("rag:{}:", tenant_id)).await
    }

    pub async fn stats(&self) -> RagResult<CacheStats> {
        self.inner.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        (tmp, pool)
    }

    #[test]
    fn test_response_key_depends_only_on_tenant_and_query() {
        let a = ResponseCache::cache_key("t1", "what is the refund policy?");
        let b = ResponseCache::cache_key("t1", "what is the refund policy?");
        let c = ResponseCache::cache_key("t2", "what is the refund policy?");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("rag:t1:"));
        assert_eq!(a.len(), "rag:t1:".len() + 16);
    }

    #[test]
    fn test_embedding_key_is_case_insensitive() {
        assert_eq!(
            EmbeddingCache::cache_key("t", "m", "Hello World"),
            EmbeddingCache::cache_key("t", "m", "hello world")
        );
        assert_ne!(
            EmbeddingCache::cache_key("t", "m", "hello"),
            EmbeddingCache::cache_key("t", "other-model", "hello")
        );
    }

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let (_tmp, pool) = setup().await;
        let cache = KvCache::new(pool, "test", Duration::from_secs(60));
        assert!(cache.get("k").await.unwrap().is_none());
        cache.put("k", b"one").await.unwrap();
        cache.put("k", b"two").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let (_tmp, pool) = setup().await;
        let cache = KvCache::new(pool.clone(), "test", Duration::from_millis(0));
        cache.put("k", b"v").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_embedding_cache_scoped_by_tenant() {
        let (_tmp, pool) = setup().await;
        let cache = EmbeddingCache::new(pool, Duration::from_secs(60));
        cache.put("t1", "m", "text", &[0.5, 0.25]).await.unwrap();

        assert_eq!(cache.get("t1", "m", "TEXT").await.unwrap(), Some(vec![0.5, 0.25]));
        assert!(cache.get("t2", "m", "text").await.unwrap().is_none());

        cache.put("t1", "m2", "text", &[1.0]).await.unwrap();
        assert_eq!(cache.invalidate_model("t1", "m2").await.unwrap(), 1);
        assert!(cache.get("t1", "m", "text").await.unwrap().is_some());

        assert_eq!(cache.invalidate_tenant("t1").await.unwrap(), 1);
        assert!(cache.get("t1", "m", "text").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_tenant_leaves_other_tenants() {
        let (_tmp, pool) = setup().await;
        let cache = ResponseCache::new(pool, Duration::from_secs(60));
        cache.put_raw("t1", "q", b"{}").await.unwrap();
        cache.put_raw("t2", "q", b"{}").await.unwrap();

        assert_eq!(cache.clear_tenant("t1").await.unwrap(), 1);
        assert!(cache.get_raw("t1", "q").await.unwrap().is_none());
        assert!(cache.get_raw("t2", "q").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (_tmp, pool) = setup().await;
        KvCache::new(pool.clone(), "a", Duration::from_millis(0))
            .put("old", b"x")
            .await
            .unwrap();
        KvCache::new(pool.clone(), "a", Duration::from_secs(60))
            .put("new", b"y")
            .await
            .unwrap();
        assert_eq!(purge_expired(&pool).await.unwrap(), 1);
    }
}
