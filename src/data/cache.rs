//! In-memory caches
//!
//! These caches are volatile, process-local and cleared on restart.
//! Losing them only costs extra upstream calls.

use moka::Expiry;
use moka::future::Cache;
use sha2::{Digest, Sha256};
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL, CACHE_SIZE};

// =============================================================================
// TTL cache
// =============================================================================

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_live(&self) -> bool {
        self.inserted_at.elapsed() < self.ttl
    }
}

/// Expire each entry after the TTL it was inserted with.
struct PerEntryTtl;

impl<K, V> Expiry<K, CacheEntry<V>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &K,
        value: &CacheEntry<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &CacheEntry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Capacity-bounded cache where every entry carries its own TTL
///
/// Backed by Moka; expiry and eviction happen inside the cache.
pub struct TtlCache<K, V> {
    name: &'static str,
    entries: Cache<K, CacheEntry<V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, max_entries: usize) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries.max(1) as u64)
            .expire_after(PerEntryTtl)
            .build();

        Self { name, entries }
    }

    /// Get a live entry; expired entries count as misses.
    pub async fn get(&self, key: &K) -> Option<V> {
        let value = self.entries.get(key).await.map(|entry| entry.value);

        if value.is_some() {
            CACHE_HITS_TOTAL.with_label_values(&[self.name]).inc();
        } else {
            CACHE_MISSES_TOTAL.with_label_values(&[self.name]).inc();
        }
        value
    }

    pub async fn insert(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            ttl,
        };
        self.entries.insert(key, entry).await;

        CACHE_SIZE
            .with_label_values(&[self.name])
            .set(self.entries.entry_count() as i64);
    }

    /// Remove and return a live entry. Concurrent callers get it at most once.
    pub async fn take(&self, key: &K) -> Option<V> {
        self.entries
            .remove(key)
            .await
            .filter(CacheEntry::is_live)
            .map(|entry| entry.value)
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.invalidate(key).await;
    }

    /// Number of live entries once pending evictions have run.
    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}

// =============================================================================
// Token validation cache
// =============================================================================

/// Short fingerprint of an access token, so rotated tokens do not grow keys
/// unboundedly and raw tokens never sit in cache keys.
pub fn token_fingerprint(access_token: &str) -> String {
    let digest = Sha256::digest(access_token.as_bytes());
    hex::encode(&digest[..8])
}

/// Cache of "is this token currently valid" results
///
/// Successes are kept longer than failures so a token that failed
/// transiently is re-checked sooner than a healthy one is re-verified.
pub struct TokenValidationCache {
    cache: TtlCache<(String, String), bool>,
    valid_ttl: Duration,
    invalid_ttl: Duration,
}

impl TokenValidationCache {
    pub fn new(valid_ttl: Duration, invalid_ttl: Duration, max_entries: usize) -> Self {
        Self {
            cache: TtlCache::new("token_validation", max_entries),
            valid_ttl,
            invalid_ttl,
        }
    }

    /// Return the cached verdict or run `check` and cache its result.
    pub async fn is_valid<F, Fut>(&self, account_id: &str, access_token: &str, check: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let key = (account_id.to_string(), token_fingerprint(access_token));
        if let Some(valid) = self.cache.get(&key).await {
            return valid;
        }

        let valid = check().await;
        let ttl = if valid {
            self.valid_ttl
        } else {
            self.invalid_ttl
        };
        self.cache.insert(key, valid, ttl).await;

        tracing::debug!(account_id, valid, ttl_secs = ttl.as_secs(), "Cached token validation");
        valid
    }

    /// Forget the verdict for a token, e.g. after it was refreshed.
    pub async fn invalidate(&self, account_id: &str, access_token: &str) {
        let key = (account_id.to_string(), token_fingerprint(access_token));
        self.cache.invalidate(&key).await;
    }

}
