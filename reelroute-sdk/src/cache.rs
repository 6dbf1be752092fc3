//! # Multi-Tier Response Cache
//!
//! Content-addressed caching of routed responses. Identical generation
//! requests are expensive and deterministic enough to reuse, so the router
//! consults this cache before every provider attempt.
//!
//! ## Key derivation
//!
//! Keys are deterministic across processes:
//!
//! ```text
//! {provider}:{model}:{H16(prompt)}:{H16(canonical_json(parameters))}
//! ```
//!
//! where `H16` is the first 16 hex characters of SHA-256 and
//! `canonical_json` sorts keys and omits the configured non-cacheable
//! fields (`metadata`, `callback_url`, `request_id`, `created_at` by
//! default). Two requests that differ only in those fields share a key.
//!
//! ## Tiers
//!
//! - **L1 (hot)** is in-process and bounded by entry count, with a
//!   selectable eviction policy (LRU, LFU or TTL-ordered).
//! - **L2 (warm)** is optional and reached through the [`CacheStore`]
//!   key-value trait; a Redis-backed implementation ships behind the
//!   `redis-cache` feature. L1 is refilled from L2 on hit.
//!
//! Cache trouble is never fatal: any tier error is logged and the caller
//! proceeds as if the lookup missed.
//!
//! Only successful responses are written. The single exception is the
//! negative `{provider}:throttled` entry, which remembers a
//! `rate_limit_exceeded` for five minutes when enabled.

use crate::config::{CacheSettings, EvictionPolicy};
use crate::error::ErrorDetails;
use crate::models::{UnifiedRequest, UnifiedResponse};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// How long a provider stays negatively cached after a rate-limit response.
const THROTTLE_TTL: Duration = Duration::from_secs(300);

/// First 16 hex characters of the SHA-256 digest.
pub fn h16(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Deterministic cache key for `request` routed to `provider`.
pub fn response_key(request: &UnifiedRequest, provider: &str, non_cacheable: &[String]) -> String {
    let mut canonical: BTreeMap<&str, &serde_json::Value> = BTreeMap::new();
    for (k, v) in request.parameters.iter().chain(&request.generation_config) {
        if !non_cacheable.iter().any(|skip| skip == k) {
            canonical.insert(k.as_str(), v);
        }
    }
    let params_json = serde_json::to_string(&canonical).unwrap_or_default();
    format!(
        "{provider}:{}:{}:{}",
        request.model,
        h16(&request.prompt),
        h16(&params_json)
    )
}

/// Negative-cache key for a throttled provider.
pub fn throttle_key(provider: &str) -> String {
    format!("{provider}:throttled")
}

/// A cached response plus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    pub response: UnifiedResponse,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
}

impl CachedEntry {
    pub fn new(response: UnifiedResponse, ttl: Duration) -> Self {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            response,
            created_at: now,
            expires_at,
            access_count: 0,
            last_accessed: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Utc::now();
    }
}

/// Abstract warm-tier key-value store.
///
/// Implementations are expected to be shared between processes; the cache
/// layer works identically when no store is attached.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError>;
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheStoreError>;
    async fn delete(&self, key: &str) -> Result<(), CacheStoreError>;
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CacheStoreError>;
}

#[derive(Debug, Error)]
#[error("cache store error: {message}")]
pub struct CacheStoreError {
    pub message: String,
}

impl CacheStoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Counters exposed for observability. Updated lock-free on the hot path.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    coalesced_waiters: AtomicU64,
}

/// Point-in-time view of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub coalesced_waiters: u64,
}

impl CacheStats {
    pub fn record_coalesced_waiter(&self) {
        self.coalesced_waiters.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            coalesced_waiters: self.coalesced_waiters.load(Ordering::Relaxed),
        }
    }
}

/// Hot tier storage, one variant per eviction policy.
enum HotTier {
    Lru(Mutex<LruCache<String, CachedEntry>>),
    /// Evicts the least-frequently-used entry (ties broken by staleness).
    Lfu(Mutex<HashMap<String, CachedEntry>>),
    /// Evicts the entry closest to expiry.
    Ttl(Mutex<HashMap<String, CachedEntry>>),
}

/// Two-tier cache front used by the router.
pub struct TieredCache {
    settings: CacheSettings,
    hot: HotTier,
    warm: Option<std::sync::Arc<dyn CacheStore>>,
    throttled: DashMap<String, (ErrorDetails, DateTime<Utc>)>,
    stats: CacheStats,
}

impl TieredCache {
    pub fn new(settings: CacheSettings, warm: Option<std::sync::Arc<dyn CacheStore>>) -> Self {
        let capacity = NonZeroUsize::new(settings.l1_max_entries.max(1))
            .unwrap_or(NonZeroUsize::new(1).unwrap());
        let hot = match settings.l1_policy {
            EvictionPolicy::Lru => HotTier::Lru(Mutex::new(LruCache::new(capacity))),
            EvictionPolicy::Lfu => HotTier::Lfu(Mutex::new(HashMap::new())),
            EvictionPolicy::Ttl => HotTier::Ttl(Mutex::new(HashMap::new())),
        };
        Self {
            settings,
            hot,
            warm,
            throttled: DashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Key for `request` routed to `provider`, honoring the configured
    /// non-cacheable fields.
    pub fn key_for(&self, request: &UnifiedRequest, provider: &str) -> String {
        response_key(request, provider, &self.settings.non_cacheable_params)
    }

    /// Look a key up across both tiers. L2 hits refill L1. Any tier failure
    /// degrades to a miss.
    pub async fn get(&self, key: &str) -> Option<UnifiedResponse> {
        if let Some(response) = self.hot_get(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(response);
        }

        if self.settings.l2_enabled {
            if let Some(store) = &self.warm {
                match store.get(key).await {
                    Ok(Some(bytes)) => match serde_json::from_slice::<CachedEntry>(&bytes) {
                        Ok(entry) if !entry.is_expired() => {
                            self.hot_put(key, entry.clone());
                            self.stats.hits.fetch_add(1, Ordering::Relaxed);
                            return Some(entry.response);
                        }
                        Ok(_) => {
                            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                            let _ = store.delete(key).await;
                        }
                        Err(e) => {
                            tracing::warn!(key, error = %e, "undecodable warm-tier entry, treating as miss");
                        }
                    },
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(key, error = %e, "warm-tier read failed, treating as miss");
                    }
                }
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write a response under `key`. Non-success responses are silently
    /// dropped: failures and in-progress acknowledgements are never cached.
    pub async fn put(&self, key: &str, response: &UnifiedResponse, ttl: Option<Duration>) {
        if !response.is_success() {
            return;
        }
        let entry = CachedEntry::new(response.clone(), ttl.unwrap_or(self.settings.default_ttl));
        self.hot_put(key, entry.clone());

        if self.settings.l2_enabled {
            if let Some(store) = &self.warm {
                match serde_json::to_vec(&entry) {
                    Ok(bytes) => {
                        if let Err(e) = store.set(key, &bytes, self.settings.l2_ttl).await {
                            tracing::warn!(key, error = %e, "warm-tier write failed");
                        }
                    }
                    Err(e) => tracing::warn!(key, error = %e, "failed to encode cache entry"),
                }
            }
        }
    }

    /// Drop every entry whose key starts with `prefix`, across both tiers.
    pub async fn invalidate(&self, prefix: &str) {
        match &self.hot {
            HotTier::Lru(lock) => {
                let mut cache = lock.lock().unwrap();
                let doomed: Vec<String> = cache
                    .iter()
                    .filter(|(k, _)| k.starts_with(prefix))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in doomed {
                    cache.pop(&key);
                }
            }
            HotTier::Lfu(lock) | HotTier::Ttl(lock) => {
                let mut map = lock.lock().unwrap();
                map.retain(|k, _| !k.starts_with(prefix));
            }
        }

        if self.settings.l2_enabled {
            if let Some(store) = &self.warm {
                match store.scan(prefix).await {
                    Ok(keys) => {
                        for key in keys {
                            if let Err(e) = store.delete(&key).await {
                                tracing::warn!(key, error = %e, "warm-tier delete failed");
                            }
                        }
                    }
                    Err(e) => tracing::warn!(prefix, error = %e, "warm-tier scan failed"),
                }
            }
        }
    }

    /// Remember a rate-limit rejection so the router can skip the provider
    /// for a while. No-op unless negative caching is enabled.
    pub fn note_throttled(&self, provider: &str, error: &ErrorDetails) {
        if !self.settings.negative_throttle {
            return;
        }
        let expires = Utc::now() + chrono::Duration::from_std(THROTTLE_TTL).unwrap();
        self.throttled
            .insert(throttle_key(provider), (error.clone(), expires));
    }

    /// Active negative entry for `provider`, if any.
    pub fn throttled(&self, provider: &str) -> Option<ErrorDetails> {
        let key = throttle_key(provider);
        if let Some(entry) = self.throttled.get(&key) {
            if Utc::now() < entry.1 {
                return Some(entry.0.clone());
            }
        }
        self.throttled.remove_if(&key, |_, (_, exp)| Utc::now() >= *exp);
        None
    }

    fn hot_get(&self, key: &str) -> Option<UnifiedResponse> {
        match &self.hot {
            HotTier::Lru(lock) => {
                let mut cache = lock.lock().unwrap();
                match cache.get_mut(key) {
                    Some(entry) if !entry.is_expired() => {
                        entry.touch();
                        Some(entry.response.clone())
                    }
                    Some(_) => {
                        cache.pop(key);
                        self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                    None => None,
                }
            }
            HotTier::Lfu(lock) | HotTier::Ttl(lock) => {
                let mut map = lock.lock().unwrap();
                match map.get_mut(key) {
                    Some(entry) if !entry.is_expired() => {
                        entry.touch();
                        Some(entry.response.clone())
                    }
                    Some(_) => {
                        map.remove(key);
                        self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                    None => None,
                }
            }
        }
    }

    fn hot_put(&self, key: &str, entry: CachedEntry) {
        let capacity = self.settings.l1_max_entries.max(1);
        match &self.hot {
            HotTier::Lru(lock) => {
                let mut cache = lock.lock().unwrap();
                if let Some((evicted_key, _)) = cache.push(key.to_string(), entry) {
                    if evicted_key != key {
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            HotTier::Lfu(lock) => {
                let mut map = lock.lock().unwrap();
                if !map.contains_key(key) && map.len() >= capacity {
                    if let Some(victim) = map
                        .iter()
                        .min_by_key(|(_, e)| (e.access_count, e.last_accessed))
                        .map(|(k, _)| k.clone())
                    {
                        map.remove(&victim);
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                map.insert(key.to_string(), entry);
            }
            HotTier::Ttl(lock) => {
                let mut map = lock.lock().unwrap();
                if !map.contains_key(key) && map.len() >= capacity {
                    if let Some(victim) = map
                        .iter()
                        .min_by_key(|(_, e)| e.expires_at)
                        .map(|(k, _)| k.clone())
                    {
                        map.remove(&victim);
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                map.insert(key.to_string(), entry);
            }
        }
    }
}

/// Redis-backed warm tier.
#[cfg(feature = "redis-cache")]
pub struct RedisStore {
    client: redis::Client,
}

#[cfg(feature = "redis-cache")]
impl RedisStore {
    pub fn new(url: &str) -> Result<Self, CacheStoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheStoreError::new(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CacheStoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheStoreError::new(format!("redis connect failed: {e}")))
    }
}

#[cfg(feature = "redis-cache")]
#[async_trait::async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheStoreError::new(format!("redis GET failed: {e}")))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheStoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheStoreError::new(format!("redis SETEX failed: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheStoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheStoreError::new(format!("redis DEL failed: {e}")))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CacheStoreError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheStoreError::new(format!("redis SCAN failed: {e}")))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}
