use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// Which tier currently holds an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    L1,
    L2,
}

/// A stored cache value. `data` is serialized JSON, zstd-compressed when `compressed`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Vec<u8>,
    pub compressed: bool,
    /// Always `data.len()`; kept alongside for size accounting.
    pub size: usize,
    pub created_at: Instant,
    pub last_access: Instant,
    pub access_count: u64,
    pub tags: HashSet<String>,
    pub ttl: Option<Duration>,
}

impl CacheEntry {
    pub fn new(data: Vec<u8>, compressed: bool, tags: HashSet<String>, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            size: data.len(),
            data,
            compressed,
            created_at: now,
            last_access: now,
            access_count: 0,
            tags,
            ttl,
        }
    }

    /// Replace the stored bytes, keeping `size` in step.
    pub fn replace_data(&mut self, data: Vec<u8>, compressed: bool) {
        self.size = data.len();
        self.data = data;
        self.compressed = compressed;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.created_at) >= ttl)
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_access = now;
        self.access_count += 1;
    }
}

/// Options for [`IntelligentCache::set`](super::IntelligentCache::set).
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Overrides the cache's `max_age_ms` default.
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    /// Store compressed in L2 regardless of size.
    pub force_compress: bool,
}

impl SetOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn compressed(mut self) -> Self {
        self.force_compress = true;
        self
    }
}

/// Read-only view of an entry, for diagnostics and tests.
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub tier: Tier,
    pub compressed: bool,
    pub size: usize,
    pub access_count: u64,
    /// Time since the entry was last written or read.
    pub idle_ms: u64,
    pub tags: Vec<String>,
}

impl EntryInfo {
    pub(crate) fn from_entry(tier: Tier, entry: &CacheEntry) -> Self {
        let mut tags: Vec<String> = entry.tags.iter().cloned().collect();
        tags.sort();
        Self {
            tier,
            compressed: entry.compressed,
            size: entry.size,
            access_count: entry.access_count,
            idle_ms: Instant::now()
                .saturating_duration_since(entry.last_access)
                .as_millis() as u64,
            tags,
        }
    }
}
