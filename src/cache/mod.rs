//! Time-bounded response cache
//!
//! Keyed by a stable hash of the canonical query, intents, filters, result
//! count, and the active index/model version tag. Expiry is checked at
//! read time, so a stale entry is a miss even before eviction runs. Size
//! is bounded by LRU. The cache is the only state shared across requests;
//! racing writes resolve last-write-wins, which is harmless because both
//! values are equivalent for the same key.

use crate::passage::Passage;
use crate::query::{Intent, QueryFilters};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for ad-hoc queries, seconds
    pub ttl_secs: u64,

    /// TTL for explicitly pinned queries, seconds
    pub pinned_ttl_secs: u64,

    /// LRU bound on entry count
    pub max_entries: usize,

    /// Active index/model generation; part of every key
    pub version_tag: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            pinned_ttl_secs: 3600,
            max_entries: 512,
            version_tag: "v1".to_string(),
        }
    }
}

/// Stable cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash the canonical query, intents, filters, result count, and the
    /// version tag into one key
    pub fn build(
        canonical: &str,
        intents: &[(Intent, f32)],
        filters: &QueryFilters,
        top_k: usize,
        version_tag: &str,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(canonical.as_bytes());
        hasher.update(b"|");
        for (intent, _) in intents {
            hasher.update(intent.as_str().as_bytes());
            hasher.update(b",");
        }
        hasher.update(b"|");
        // Struct serialization order is fixed, so this is deterministic
        if let Ok(filter_bytes) = serde_json::to_vec(filters) {
            hasher.update(&filter_bytes);
        }
        hasher.update(b"|");
        hasher.update(&top_k.to_le_bytes());
        hasher.update(b"|");
        hasher.update(version_tag.as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Cached final response for one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub passages: Vec<Passage>,
    pub warnings: Vec<String>,
    pub degraded: bool,
}

struct CacheEntry {
    value: CachedResponse,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

struct CacheInner {
    entries: AHashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

/// Concurrent TTL + LRU cache
pub struct QueryCache {
    inner: RwLock<CacheInner>,
    config: CacheConfig,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                entries: AHashMap::new(),
                order: VecDeque::new(),
            }),
            config,
        }
    }

    pub fn version_tag(&self) -> &str {
        &self.config.version_tag
    }

    /// Look up a key; an expired entry behaves exactly like a miss
    pub async fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        let mut inner = self.inner.write().await;

        let hit = match inner.entries.get(key.as_str()) {
            None => return None,
            Some(entry) if entry.expired() => None,
            Some(entry) => Some(entry.value.clone()),
        };

        match hit {
            None => {
                inner.entries.remove(key.as_str());
                inner.order.retain(|k| k != key.as_str());
                tracing::debug!(key = key.as_str(), "cache entry expired");
                None
            }
            Some(value) => {
                inner.order.retain(|k| k != key.as_str());
                inner.order.push_back(key.as_str().to_string());
                Some(value)
            }
        }
    }

    /// Store a response; last write wins on racing keys
    pub async fn put(&self, key: &CacheKey, value: CachedResponse, pinned: bool) {
        let ttl = Duration::from_secs(if pinned {
            self.config.pinned_ttl_secs
        } else {
            self.config.ttl_secs
        });

        let mut inner = self.inner.write().await;
        let key = key.as_str().to_string();

        if !inner.entries.contains_key(&key) {
            while inner.entries.len() >= self.config.max_entries {
                let Some(evicted) = inner.order.pop_front() else {
                    break;
                };
                inner.entries.remove(&evicted);
                tracing::debug!(key = %evicted, "cache entry evicted");
            }
        } else {
            inner.order.retain(|k| k != &key);
        }

        inner.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
        inner.order.push_back(key);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
