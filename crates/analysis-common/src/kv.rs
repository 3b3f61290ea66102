/// Key-value persistence contract for session state.
///
/// The analysis pipeline only needs get/set/delete of string values keyed by
/// session-scoped keys. Two backends are provided:
/// - [`MemoryStore`]: process-local map with a per-key TTL, used by tests and when
///   Redis is absent.
/// - [`RedisStore`]: Redis with a per-key TTL.
///
/// Unlike a cache, a session store must not read a failed lookup as a missing key:
/// every operation returns `Result` and backend errors reach the caller.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::warn;

use crate::error::CommonError;

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[async_trait]
pub trait KvStore: Send + Sync {
    /// `Ok(None)` only when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>, CommonError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), CommonError>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), CommonError>;

    /// Backend name for logs.
    fn backend(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process store. Each `set` (re)starts the key's TTL, like Redis SETEX. Expired
/// keys read as absent and are swept on every write.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    ttl: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl MemoryStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of live (unexpired) keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CommonError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CommonError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + self.ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CommonError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[derive(Clone)]
pub struct RedisStore {
    client: Option<redis::Client>,
    ttl: Duration,
}

impl RedisStore {
    /// Build a store for `url`. A `None` URL or an unparsable one yields a store that
    /// reports itself unavailable.
    pub fn new(url: Option<&str>, ttl: Duration) -> Self {
        let client = url.and_then(|u| {
            redis::Client::open(u)
                .inspect_err(|e| warn!(error = %e, url = u, "failed to create redis client, redis disabled"))
                .ok()
        });
        Self { client, ttl }
    }

    /// Send a PING. Returns `true` if Redis is reachable.
    pub async fn is_available(&self) -> bool {
        let Ok(mut conn) = self.connection().await else {
            return false;
        };
        let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        result.is_ok()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CommonError> {
        let client = self.client.as_ref().ok_or(CommonError::RedisUnavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .inspect_err(|e| warn!(error = %e, "redis connection failed"))?;
        Ok(conn)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CommonError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn
            .get(key)
            .await
            .inspect_err(|e| warn!(error = %e, key, "redis GET failed"))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CommonError> {
        let mut conn = self.connection().await?;
        let ttl_secs = self.ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .inspect_err(|e| warn!(error = %e, key, "redis SETEX failed"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CommonError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key)
            .await
            .inspect_err(|e| warn!(error = %e, key, "redis DEL failed"))?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_set_get_delete() {
        let store = MemoryStore::default();
        assert!(store.get("a").await.unwrap().is_none());
        store.set("a", "1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        store.set("a", "2").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));
        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn memory_store_clones_share_state() {
        let store = MemoryStore::default();
        let other = store.clone();
        store.set("k", "v").await.unwrap();
        assert_eq!(other.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test(start_paused = true)]
    async fn memory_store_entries_expire_after_ttl() {
        let store = MemoryStore::new(Duration::from_secs(60));
        store.set("old", "1").await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        store.set("young", "2").await.unwrap();
        assert_eq!(store.len().await, 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.get("old").await.unwrap().is_none());
        assert_eq!(store.get("young").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.len().await, 1);

        // rewriting restarts the TTL
        store.set("young", "3").await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(store.get("young").await.unwrap().as_deref(), Some("3"));
        assert_eq!(store.entries.read().await.len(), 1);
    }

    #[tokio::test]
    async fn redis_store_without_url_reports_errors() {
        let store = RedisStore::new(None, Duration::from_secs(60));
        assert!(!store.is_available().await);
        assert!(matches!(store.get("k").await, Err(CommonError::RedisUnavailable)));
        assert!(matches!(store.set("k", "v").await, Err(CommonError::RedisUnavailable)));
        assert!(matches!(store.delete("k").await, Err(CommonError::RedisUnavailable)));
    }
}
