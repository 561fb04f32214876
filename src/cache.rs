use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::record::{Record, RecordType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub name: String,
    pub rtype: RecordType,
    /// Pre-computed hash for faster lookups.
    hash: u64,
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl CacheKey {
    pub fn new(name: &str, rtype: RecordType) -> Self {
        let name = name.to_ascii_lowercase();

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        rtype.hash(&mut hasher);
        let hash = hasher.finish();

        Self { name, rtype, hash }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    records: Vec<Record>,
    expires_at: Instant,
    negative: bool,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expired_evictions: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// TTL-indexed store of prior answers, keyed by `(name, type)`.
///
/// Expired entries are removed lazily on access. Beyond the capacity cap,
/// the entry closest to expiry is evicted first. An entry with an empty
/// record list is a negative answer (NXDOMAIN / NoData) held for the
/// configured negative TTL.
#[derive(Debug)]
pub struct RecordCache {
    entries: DashMap<CacheKey, CacheEntry>,
    max_entries: usize,
    negative_ttl: Duration,
    stats: CacheStats,
}

impl RecordCache {
    pub fn new(max_entries: usize, negative_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            negative_ttl,
            stats: CacheStats::default(),
        }
    }

    /// Returns the stored records if present and unexpired. A `Some` with an
    /// empty list is a negative cache hit.
    pub fn get_records(&self, name: &str, rtype: RecordType) -> Option<Vec<Record>> {
        let key = CacheKey::new(name, rtype);
        let now = Instant::now();

        if let Some(entry) = self.entries.get(&key) {
            if !entry.is_expired(now) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                trace!(name = %key.name, rtype = %rtype, negative = entry.negative, "cache hit");
                return Some(entry.records.clone());
            }
            drop(entry);
            self.entries.remove(&key);
            self.stats.expired_evictions.fetch_add(1, Ordering::Relaxed);
            debug!(name = %key.name, rtype = %rtype, "removed expired cache entry");
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        trace!(name = %key.name, rtype = %rtype, "cache miss");
        None
    }

    /// First stored record for `(name, type)`, if any.
    pub fn get_record(&self, name: &str, rtype: RecordType) -> Option<Record> {
        self.get_records(name, rtype)
            .and_then(|records| records.into_iter().next())
    }

    /// Stores records under `expires_at = now + min(ttl)`. An empty list is
    /// stored as a negative entry with the negative TTL. A zero minimum TTL
    /// stores nothing. Replaces any existing entry for the key.
    pub fn put(&self, name: &str, rtype: RecordType, records: Vec<Record>) {
        let negative = records.is_empty();
        let ttl = if negative {
            self.negative_ttl
        } else {
            let min_ttl = records.iter().map(|r| r.ttl).min().unwrap_or(0);
            Duration::from_secs(u64::from(min_ttl))
        };

        if ttl.is_zero() {
            debug!(name = %name, rtype = %rtype, "not caching zero-TTL answer");
            return;
        }

        let key = CacheKey::new(name, rtype);
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.evict_earliest();
        }

        debug!(
            name = %key.name,
            rtype = %rtype,
            ttl_secs = ttl.as_secs(),
            negative,
            "caching answer"
        );
        self.entries.insert(
            key,
            CacheEntry {
                records,
                expires_at: Instant::now() + ttl,
                negative,
            },
        );
    }

    /// Evicts the entry with the earliest expiry.
    fn evict_earliest(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|item| item.value().expires_at)
            .map(|item| item.key().clone());

        if let Some(key) = victim {
            self.entries.remove(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(name = %key.name, "evicted cache entry closest to expiry");
        }
    }

    /// Drops every expired entry. Expiry is otherwise lazy, so callers that
    /// care about memory can run this periodically.
    pub fn remove_expired(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.stats
                .expired_evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "swept expired cache entries");
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
