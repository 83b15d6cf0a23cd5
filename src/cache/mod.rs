//! Two-tier adaptive cache.
//!
//! - **L1**: bounded, recency-ordered, uncompressed JSON bytes ([`lru::LruStore`])
//! - **L2**: unbounded map of zstd-compressed entries
//!
//! Large values (over `compression_threshold`) and `force_compress` writes go straight
//! to L2. L1 evictees that were read more than `hot_access_threshold` times are
//! compressed into L2 instead of being dropped. An L2 hit is promoted back into L1.
//!
//! Values are serialized with serde_json, so any `Serialize + DeserializeOwned` type can
//! be cached and read back as the same type.

pub mod entry;
pub mod lru;
pub mod patterns;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ResilienceError;
use crate::events::{EventSink, ResilienceEvent};
use crate::sync::lock;
use entry::{CacheEntry, EntryInfo, Tier};
use lru::LruStore;
use patterns::AccessPatterns;

pub use entry::SetOptions;
pub use patterns::PrefetchCandidate;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// L1 entry budget.
    pub max_entries: usize,
    /// L1 byte budget.
    pub max_bytes: usize,
    /// Default TTL for entries written without one. `None` keeps entries until evicted.
    pub max_age_ms: Option<u64>,
    /// Serialized values larger than this are compressed into L2.
    pub compression_threshold: usize,
    pub compression_level: i32,
    /// L1 evictees read more than this many times are demoted to L2 instead of dropped.
    pub hot_access_threshold: u64,
    /// Access timestamps kept per key for pattern analysis.
    pub access_history: usize,
    pub pattern_retention_ms: u64,
    pub predictability_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            max_bytes: 64 * 1024 * 1024,
            max_age_ms: Some(60 * 60 * 1000),
            compression_threshold: 1024,
            compression_level: 3,
            hot_access_threshold: 3,
            access_history: 100,
            pattern_retention_ms: 24 * 60 * 60 * 1000,
            predictability_ratio: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub name: String,
    pub l1_entries: usize,
    pub l1_bytes: usize,
    pub l2_entries: usize,
    pub l2_bytes: usize,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Keys with recorded access history.
    pub tracked_keys: usize,
    pub sets: u64,
    pub evictions: u64,
    pub demotions: u64,
    /// Uncompressed bytes divided by compressed bytes over all L2 writes.
    pub compression_ratio: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub expired_l1: usize,
    pub expired_l2: usize,
    pub patterns_pruned: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MsetReport {
    pub stored: usize,
    pub failed: Vec<String>,
}

#[derive(Debug, Default)]
struct Counters {
    l1_hits: u64,
    l2_hits: u64,
    misses: u64,
    sets: u64,
    evictions: u64,
    demotions: u64,
    raw_bytes: u64,
    compressed_bytes: u64,
}

#[derive(Debug)]
struct CacheInner {
    l1: LruStore,
    l2: HashMap<String, CacheEntry>,
    patterns: AccessPatterns,
    counters: Counters,
}

enum Lookup {
    L1(Vec<u8>),
    L2(CacheEntry),
    Miss,
}

#[derive(Debug)]
pub struct IntelligentCache {
    name: String,
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    events: EventSink,
}

impl IntelligentCache {
    pub fn new(name: impl Into<String>, config: CacheConfig, events: EventSink) -> Self {
        let inner = CacheInner {
            l1: LruStore::new(config.max_entries.max(1), config.max_bytes),
            l2: HashMap::new(),
            patterns: AccessPatterns::new(config.access_history, config.predictability_ratio),
            counters: Counters::default(),
        };
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(inner),
            events,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ResilienceError> {
        let now = Instant::now();
        let lookup = {
            let mut inner = lock(&self.inner);
            inner.patterns.record(key, now);

            let l1 = inner.l1.get_mut(key).map(|entry| {
                if entry.is_expired(now) {
                    None
                } else {
                    entry.touch(now);
                    Some(entry.data.clone())
                }
            });

            match l1 {
                Some(Some(data)) => {
                    inner.counters.l1_hits += 1;
                    Lookup::L1(data)
                }
                Some(None) => {
                    inner.l1.remove(key);
                    inner.counters.misses += 1;
                    Lookup::Miss
                }
                None => match inner.l2.remove(key) {
                    Some(entry) if !entry.is_expired(now) => {
                        inner.counters.l2_hits += 1;
                        Lookup::L2(entry)
                    }
                    _ => {
                        inner.counters.misses += 1;
                        Lookup::Miss
                    }
                },
            }
        };

        match lookup {
            Lookup::Miss => Ok(None),
            Lookup::L1(data) => decode(&data).map(Some),
            Lookup::L2(mut entry) => {
                let raw = decompress(&entry.data)?;
                let value = decode(&raw);
                entry.replace_data(raw, false);
                entry.touch(now);
                if self.promote(key, entry) {
                    tracing::debug!(cache = %self.name, key, "promoted entry from L2 to L1");
                }
                value.map(Some)
            }
        }
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> Result<(), ResilienceError> {
        let raw = serde_json::to_vec(value)
            .map_err(|e| ResilienceError::Cache(format!("serialize '{key}': {e}")))?;
        let ttl = options.ttl.or(self.config.max_age_ms.map(Duration::from_millis));
        let tags: HashSet<String> = options.tags.into_iter().collect();

        if options.force_compress || raw.len() > self.config.compression_threshold {
            let compressed = compress(&raw, self.config.compression_level)?;
            let entry = CacheEntry::new(compressed, true, tags, ttl);
            let mut inner = lock(&self.inner);
            inner.counters.sets += 1;
            inner.counters.raw_bytes += raw.len() as u64;
            inner.counters.compressed_bytes += entry.size as u64;
            inner.l1.remove(key);
            inner.l2.insert(key.to_string(), entry);
        } else {
            lock(&self.inner).counters.sets += 1;
            self.insert_l1(key.to_string(), CacheEntry::new(raw, false, tags, ttl));
        }
        Ok(())
    }

    /// Remove `key` from both tiers. Returns whether anything was removed.
    pub async fn delete(&self, key: &str) -> bool {
        let mut inner = lock(&self.inner);
        let in_l1 = inner.l1.remove(key).is_some();
        let in_l2 = inner.l2.remove(key).is_some();
        in_l1 || in_l2
    }

    /// Remove every entry tagged `tag` from both tiers and return how many went.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let removed = {
            let mut inner = lock(&self.inner);
            let from_l1 = inner.l1.remove_where(|entry| entry.tags.contains(tag)).len();
            let before = inner.l2.len();
            inner.l2.retain(|_, entry| !entry.tags.contains(tag));
            from_l1 + (before - inner.l2.len())
        };

        if removed > 0 {
            tracing::info!(cache = %self.name, tag, removed, "invalidated cache entries by tag");
        }
        self.events.emit(ResilienceEvent::CacheInvalidated {
            tag: tag.to_string(),
            removed,
        });
        removed
    }

    /// Fetch several keys concurrently. A key that fails to decode is logged and reported
    /// as a miss without affecting the others.
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> HashMap<String, Option<T>> {
        let lookups = keys.iter().map(|key| async move {
            let value = match self.get::<T>(key).await {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(cache = %self.name, key = %key, error = %e, "mget entry failed");
                    None
                }
            };
            (key.clone(), value)
        });
        join_all(lookups).await.into_iter().collect()
    }

    /// Store several entries concurrently; failures are collected, not propagated.
    pub async fn mset<T: Serialize>(&self, entries: Vec<(String, T, SetOptions)>) -> MsetReport {
        let writes = entries.iter().map(|(key, value, options)| async move {
            (key, self.set(key, value, options.clone()).await)
        });

        let mut report = MsetReport::default();
        for (key, result) in join_all(writes).await {
            match result {
                Ok(()) => report.stored += 1,
                Err(e) => {
                    tracing::warn!(cache = %self.name, key = %key, error = %e, "mset entry failed");
                    report.failed.push(key.clone());
                }
            }
        }
        report
    }

    /// Purge expired entries and stale access history.
    pub async fn cleanup(&self) -> CleanupReport {
        let now = Instant::now();
        let report = {
            let mut inner = lock(&self.inner);
            let expired_l1 = inner.l1.remove_where(|entry| entry.is_expired(now)).len();
            let before = inner.l2.len();
            inner.l2.retain(|_, entry| !entry.is_expired(now));
            let expired_l2 = before - inner.l2.len();
            let retention = Duration::from_millis(self.config.pattern_retention_ms);
            let patterns_pruned = inner.patterns.prune(now, retention);
            CleanupReport {
                expired_l1,
                expired_l2,
                patterns_pruned,
            }
        };

        tracing::debug!(cache = %self.name, ?report, "cache cleanup finished");
        self.events.emit(ResilienceEvent::CleanupCompleted {
            component: format!("cache:{}", self.name),
            removed: report.expired_l1 + report.expired_l2,
        });
        report
    }

    pub fn prefetch_candidates(&self, limit: usize) -> Vec<PrefetchCandidate> {
        lock(&self.inner).patterns.prefetch_candidates(limit)
    }

    pub fn inspect(&self, key: &str) -> Option<EntryInfo> {
        let inner = lock(&self.inner);
        if let Some(entry) = inner.l1.peek(key) {
            return Some(EntryInfo::from_entry(Tier::L1, entry));
        }
        inner
            .l2
            .get(key)
            .map(|entry| EntryInfo::from_entry(Tier::L2, entry))
    }

    pub fn stats(&self) -> CacheStats {
        let inner = lock(&self.inner);
        let c = &inner.counters;
        let lookups = c.l1_hits + c.l2_hits + c.misses;
        CacheStats {
            name: self.name.clone(),
            l1_entries: inner.l1.len(),
            l1_bytes: inner.l1.bytes(),
            l2_entries: inner.l2.len(),
            l2_bytes: inner.l2.values().map(|entry| entry.size).sum(),
            l1_hits: c.l1_hits,
            l2_hits: c.l2_hits,
            misses: c.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                (c.l1_hits + c.l2_hits) as f64 / lookups as f64
            },
            tracked_keys: inner.patterns.tracked_keys(),
            sets: c.sets,
            evictions: c.evictions,
            demotions: c.demotions,
            compression_ratio: if c.compressed_bytes == 0 {
                1.0
            } else {
                c.raw_bytes as f64 / c.compressed_bytes as f64
            },
        }
    }

    fn insert_l1(&self, key: String, entry: CacheEntry) {
        let evicted = {
            let mut inner = lock(&self.inner);
            inner.l2.remove(&key);
            inner.l1.insert(key, entry)
        };
        for (key, entry) in evicted {
            self.evict(key, entry);
        }
    }

    /// Move a decompressed L2 hit into L1. Returns `false`, leaving the cache as it
    /// is, when a write for `key` landed while the entry was out of both tiers.
    fn promote(&self, key: &str, entry: CacheEntry) -> bool {
        let evicted = {
            let mut inner = lock(&self.inner);
            if inner.l1.peek(key).is_some() || inner.l2.contains_key(key) {
                return false;
            }
            inner.l1.insert(key.to_string(), entry)
        };
        for (key, entry) in evicted {
            self.evict(key, entry);
        }
        true
    }

    /// Demote a hot evictee into L2, or drop a cold one.
    fn evict(&self, key: String, entry: CacheEntry) {
        let hot = entry.access_count > self.config.hot_access_threshold
            && !entry.is_expired(Instant::now());
        let demoted = hot && self.demote(&key, entry);

        if !demoted {
            lock(&self.inner).counters.evictions += 1;
        }
        tracing::debug!(cache = %self.name, key = %key, demoted, "evicted entry from L1");
        self.events.emit(ResilienceEvent::CacheEvicted { key, demoted });
    }

    fn demote(&self, key: &str, mut entry: CacheEntry) -> bool {
        let raw_len = entry.size as u64;
        match compress(&entry.data, self.config.compression_level) {
            Ok(compressed) => entry.replace_data(compressed, true),
            Err(e) => {
                tracing::warn!(cache = %self.name, key, error = %e, "failed to demote evicted entry");
                return false;
            }
        }

        let mut inner = lock(&self.inner);
        // A newer write for the same key wins over the demoted copy.
        if inner.l1.peek(key).is_none() && !inner.l2.contains_key(key) {
            inner.counters.raw_bytes += raw_len;
            inner.counters.compressed_bytes += entry.size as u64;
            inner.l2.insert(key.to_string(), entry);
        }
        inner.counters.demotions += 1;
        true
    }
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ResilienceError> {
    serde_json::from_slice(data).map_err(|e| ResilienceError::Cache(format!("deserialize: {e}")))
}

fn compress(data: &[u8], level: i32) -> Result<Vec<u8>, ResilienceError> {
    zstd::encode_all(data, level).map_err(|e| ResilienceError::Cache(format!("compress: {e}")))
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, ResilienceError> {
    zstd::decode_all(data).map_err(|e| ResilienceError::Cache(format!("decompress: {e}")))
}
