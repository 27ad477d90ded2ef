//! Response cache
//!
//! Maps a normalized (model, prompt, generation parameters) key to a
//! previously produced completion. Entries expire after a fixed TTL and the
//! table is bounded by least-recently-used eviction. A disabled cache holds
//! no table at all: every lookup misses and every store is a no-op.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use locallab_kernel::config::LocalLabConfig;
use locallab_kernel::types::{Completion, GenerationParams};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// SHA-256 digest of a canonical request encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Derive the key for a request against `model_id`.
    ///
    /// Normalization: CRLF line endings in the prompt become LF and all other
    /// whitespace is kept; temperature and top-p are formatted to four
    /// decimals; stop sequences are sorted and deduplicated. `params.max_tokens` should already be
    /// resolved so that an explicit default and an unset value collide.
    pub fn new(model_id: &str, prompt: &str, params: &GenerationParams) -> Self {
        let prompt = prompt.replace("\r\n", "\n");
        let max_tokens = params
            .max_tokens
            .map_or_else(|| "-".to_string(), |n| n.to_string());

        let mut stop: Vec<&str> = params.stop.iter().map(String::as_str).collect();
        stop.sort_unstable();
        stop.dedup();

        let mut hasher = Sha256::new();
        // length-prefixed fields, so no two field tuples share an encoding
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        field(model_id.as_bytes());
        field(prompt.as_bytes());
        field(format!("{:.4}", params.temperature).as_bytes());
        field(format!("{:.4}", params.top_p).as_bytes());
        field(max_tokens.as_bytes());
        field(&(stop.len() as u64).to_le_bytes());
        for s in stop {
            field(s.as_bytes());
        }

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Self(digest)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.to_hex()[..12])
    }
}

/// A published completion. Immutable once stored.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub completion: Completion,
    pub created_at: Instant,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

struct Slot {
    entry: Arc<CacheEntry>,
    tick: u64,
}

#[derive(Default)]
struct Table {
    slots: HashMap<CacheKey, Slot>,
    // recency order: lowest tick is least recently used
    recency: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl Table {
    fn touch(&mut self, key: CacheKey) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(slot) = self.slots.get_mut(&key) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            self.recency.insert(tick, key);
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.recency.remove(&slot.tick);
        Some(slot)
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

struct Inner {
    ttl: Duration,
    max_entries: usize,
    table: Mutex<Table>,
    counters: Counters,
}

impl Inner {
    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.duration_since(entry.created_at) >= self.ttl
    }
}

/// TTL + LRU completion cache, shared across scheduler tasks.
pub struct ResponseCache {
    inner: Option<Inner>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Some(Inner {
                ttl,
                max_entries: max_entries.max(1),
                table: Mutex::new(Table::default()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn from_config(config: &LocalLabConfig) -> Self {
        if config.enable_cache {
            Self::new(config.cache_ttl(), config.cache_max_entries)
        } else {
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Fresh entry for `key`, if any. Expired entries are dropped on sight.
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let inner = self.inner.as_ref()?;
        let mut table = inner.table.lock();

        let entry = match table.slots.get(key) {
            Some(slot) => Arc::clone(&slot.entry),
            None => {
                inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if inner.is_expired(&entry, Instant::now()) {
            table.remove(key);
            inner.counters.expirations.fetch_add(1, Ordering::Relaxed);
            inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = ?key, "Cache entry expired");
            return None;
        }

        table.touch(*key);
        inner.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Publish `completion` under `key`, replacing any previous entry.
    pub fn store(&self, key: CacheKey, completion: &Completion) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };

        let entry = Arc::new(CacheEntry {
            completion: Completion {
                cached: false,
                ..completion.clone()
            },
            created_at: Instant::now(),
        });

        let mut table = inner.table.lock();
        table.remove(&key);
        table.tick += 1;
        let tick = table.tick;
        table.slots.insert(key, Slot { entry, tick });
        table.recency.insert(tick, key);
        inner.counters.insertions.fetch_add(1, Ordering::Relaxed);

        while table.slots.len() > inner.max_entries {
            let Some((_, lru)) = table.recency.pop_first() else {
                break;
            };
            table.slots.remove(&lru);
            inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = ?lru, "Cache entry evicted");
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn invalidate_expired(&self) -> usize {
        let Some(inner) = self.inner.as_ref() else {
            return 0;
        };

        let now = Instant::now();
        let mut table = inner.table.lock();
        let expired: Vec<CacheKey> = table
            .slots
            .iter()
            .filter(|(_, slot)| inner.is_expired(&slot.entry, now))
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            table.remove(key);
        }

        inner
            .counters
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.table.lock().slots.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Some(inner) = self.inner.as_ref() {
            let mut table = inner.table.lock();
            table.slots.clear();
            table.recency.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let Some(inner) = self.inner.as_ref() else {
            return CacheStats::default();
        };
        let c = &inner.counters;
        CacheStats {
            enabled: true,
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            insertions: c.insertions.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            entries: inner.table.lock().slots.len(),
        }
    }

    /// Sweep expired entries every `interval` until `shutdown` fires.
    ///
    /// Returns `None` for a disabled cache.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }
        let cache = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.invalidate_expired();
                        if removed > 0 {
                            debug!(removed, "Swept expired cache entries");
                        }
                    }
                }
            }
        }))
    }
}
