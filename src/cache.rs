use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time source for cache expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Lets tests cross a TTL boundary
/// without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

/// Entry stored in the local DashMap with an expiry timestamp.
#[derive(Clone)]
pub(crate) struct CacheEntry {
    value: String,
    pub(crate) expires_at: Instant,
}

/// Two-tier cache: in-memory DashMap (tier 1) optionally backed by Redis (tier 2).
/// The store is the source of truth and is handled by callers.
///
/// The local tier honours TTLs against the injected clock: entries are checked
/// on read and evicted lazily, and `evict_expired()` sweeps the rest. Redis
/// failures are logged and treated as misses; they never fail a caller.
///
/// Every key has a generation that `invalidate` bumps. A value computed from
/// state read before an invalidation is written with `set_if_current` and is
/// dropped instead of outliving the invalidation. Generations are never
/// evicted: one counter per key ever invalidated or conditionally written.
#[derive(Clone)]
pub struct TieredCache {
    pub(crate) local: Arc<DashMap<String, CacheEntry>>,
    generations: Arc<DashMap<String, u64>>,
    redis: Option<ConnectionManager>,
    clock: Arc<dyn Clock>,
}

impl TieredCache {
    pub fn new(redis: Option<ConnectionManager>, clock: Arc<dyn Clock>) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            generations: Arc::new(DashMap::new()),
            redis,
            clock,
        }
    }

    /// Local-only cache on the system clock.
    pub fn in_memory() -> Self {
        Self::new(None, Arc::new(SystemClock))
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        // tier 1: in-memory (with TTL check)
        if let Some(entry) = self.local.get(key) {
            if self.clock.now() < entry.expires_at {
                return serde_json::from_str(&entry.value).ok();
            }
            // expired: drop the ref before removing
            drop(entry);
            self.local.remove(key);
        }

        // tier 2: redis
        let mut conn = self.redis.clone()?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(v)) => {
                // Re-use the Redis TTL for the local entry.
                let ttl_secs: i64 = conn.ttl(key).await.unwrap_or(0);
                if ttl_secs > 0 {
                    self.local.insert(
                        key.to_string(),
                        CacheEntry {
                            value: v.clone(),
                            expires_at: self.clock.now() + Duration::from_secs(ttl_secs as u64),
                        },
                    );
                }
                serde_json::from_str(&v).ok()
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "redis cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> anyhow::Result<()> {
        let json = serde_json::to_string(value)?;
        self.local.insert(key.to_string(), self.entry(json.clone(), ttl));
        self.write_redis(key, json, ttl).await;
        Ok(())
    }

    /// Current generation of `key`. Capture it before reading the state a
    /// cached value is derived from.
    pub fn generation(&self, key: &str) -> u64 {
        self.generations.get(key).map(|g| *g).unwrap_or(0)
    }

    /// Write `value` only if `key` has not been invalidated since `generation`
    /// was captured. Returns false when the write was dropped as stale.
    pub async fn set_if_current<T: Serialize>(
        &self,
        key: &str,
        generation: u64,
        value: &T,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let json = serde_json::to_string(value)?;
        {
            // Holding the generation entry orders this insert against `invalidate`.
            let current = self.generations.entry(key.to_string()).or_insert(0);
            if *current != generation {
                return Ok(false);
            }
            self.local.insert(key.to_string(), self.entry(json.clone(), ttl));
        }

        if self.redis.is_some() {
            self.write_redis(key, json, ttl).await;
            // An invalidation that ran between the local insert and the Redis
            // write may have deleted before we wrote.
            if self.generation(key) != generation {
                self.delete_redis(key).await;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Drop `key` from both tiers and bump its generation.
    pub async fn invalidate(&self, key: &str) {
        {
            let mut current = self.generations.entry(key.to_string()).or_insert(0);
            *current += 1;
            self.local.remove(key);
        }
        self.delete_redis(key).await;
    }

    fn entry(&self, value: String, ttl: Duration) -> CacheEntry {
        CacheEntry {
            value,
            expires_at: self.clock.now() + ttl,
        }
    }

    async fn write_redis(&self, key: &str, json: String, ttl: Duration) {
        if let Some(mut conn) = self.redis.clone() {
            let ttl_secs = ttl.as_secs().max(1);
            if let Err(e) = conn.set_ex::<_, _, ()>(key, json, ttl_secs).await {
                tracing::warn!(key = %key, error = %e, "redis cache write failed");
            }
        }
    }

    async fn delete_redis(&self, key: &str) {
        if let Some(mut conn) = self.redis.clone() {
            if let Err(e) = conn.del::<_, ()>(key).await {
                tracing::warn!(key = %key, error = %e, "redis cache invalidation failed");
            }
        }
    }

    /// Remove all locally-expired entries. Called periodically by the sweep job
    /// to bound memory usage.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.local.len();
        self.local.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.local.len())
    }

    /// Current number of entries in the local cache (for metrics / debugging).
    pub fn local_len(&self) -> usize {
        self.local.len()
    }
}

// ── Tests ───────────────────────────────────────────────────────
