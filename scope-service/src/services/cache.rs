//! Cache tiers shared by the org-unit hierarchy and the grant store.
//!
//! A [`TieredCache`] layers a process-local map over an optional distributed
//! [`SharedCache`]. Neither tier is ever a source of errors for callers:
//! distributed failures are logged and treated as misses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client};
use serde::{de::DeserializeOwned, Serialize};

/// Default lifetime of a cached entry in either tier.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Distributed key-value cache.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;
    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error>;
    async fn delete(&self, key: &str) -> Result<(), anyhow::Error>;
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisCache {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn new(url: &str) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(url)?;

        // ConnectionManager reconnects on its own after a dropped connection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get cache: {}", e))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to set cache: {}", e))
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete cache key: {}", e))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

/// In-memory [`SharedCache`] for tests. TTLs are ignored. While marked
/// unavailable every call fails, simulating an outage.
#[derive(Default)]
pub struct MockCache {
    entries: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), anyhow::Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Mock cache unavailable"));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, anyhow::Error> {
        self.entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock cache mutex poisoned: {}", e))
    }
}

#[async_trait]
impl SharedCache for MockCache {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        self.check_available()?;
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        _ttl_seconds: u64,
    ) -> Result<(), anyhow::Error> {
        self.check_available()?;
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        self.check_available()?;
        self.lock()?.remove(key);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        self.check_available()
    }
}

struct LocalEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Process-local map in front of an optional distributed cache.
///
/// Keys are namespaced in the distributed tier so that several caches can
/// share one backend.
pub struct TieredCache<V> {
    namespace: String,
    local: DashMap<String, LocalEntry<V>>,
    local_ttl: Duration,
    shared: Option<Arc<dyn SharedCache>>,
    shared_ttl: Duration,
}

impl<V> TieredCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local: DashMap::new(),
            local_ttl: DEFAULT_CACHE_TTL,
            shared: None,
            shared_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_shared(mut self, shared: Arc<dyn SharedCache>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn with_local_ttl(mut self, ttl: Duration) -> Self {
        self.local_ttl = ttl;
        self
    }

    pub fn with_shared_ttl(mut self, ttl: Duration) -> Self {
        self.shared_ttl = ttl;
        self
    }

    /// Key as stored in the distributed tier.
    pub fn shared_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        if let Some(value) = self.get_local(key) {
            tracing::debug!(cache = %self.namespace, key, "Local cache hit");
            return Some(value);
        }

        let shared = self.shared.as_ref()?;
        let raw = match shared.get(&self.shared_key(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(cache = %self.namespace, key, error = %e, "Distributed cache read failed");
                return None;
            }
        };

        match serde_json::from_str::<V>(&raw) {
            Ok(value) => {
                tracing::debug!(cache = %self.namespace, key, "Distributed cache hit");
                self.put_local(key, value.clone());
                Some(value)
            }
            Err(e) => {
                tracing::warn!(cache = %self.namespace, key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    pub async fn insert(&self, key: &str, value: &V) {
        self.put_local(key, value.clone());

        let Some(shared) = self.shared.as_ref() else {
            return;
        };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(cache = %self.namespace, key, error = %e, "Failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = shared
            .set_with_ttl(&self.shared_key(key), &raw, self.shared_ttl.as_secs().max(1))
            .await
        {
            tracing::warn!(cache = %self.namespace, key, error = %e, "Distributed cache write failed");
        }
    }

    /// Remove `key` from both tiers.
    pub async fn invalidate(&self, key: &str) {
        self.local.remove(key);
        if let Some(shared) = self.shared.as_ref() {
            if let Err(e) = shared.delete(&self.shared_key(key)).await {
                tracing::warn!(cache = %self.namespace, key, error = %e, "Distributed cache delete failed");
            }
        }
    }

    /// Drop every process-local entry. The distributed tier is left alone.
    pub fn clear_local(&self) {
        self.local.clear();
    }

    pub fn contains_local(&self, key: &str) -> bool {
        self.get_local(key).is_some()
    }

    fn get_local(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let hit = self
            .local
            .get(key)
            .map(|entry| (entry.expires_at > now, entry.value.clone()));
        match hit {
            Some((true, value)) => Some(value),
            Some((false, _)) => {
                self.local.remove_if(key, |_, entry| entry.expires_at <= now);
                None
            }
            None => None,
        }
    }

    fn put_local(&self, key: &str, value: V) {
        self.local.insert(
            key.to_string(),
            LocalEntry {
                value,
                expires_at: Instant::now() + self.local_ttl,
            },
        );
    }
}
