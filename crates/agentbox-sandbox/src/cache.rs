//! Content-addressed cache of compiled modules
//!
//! Entries are keyed by the SHA-256 of the source text and bounded both by
//! count and by total size. Eviction runs inside `set`, least recently
//! accessed first, until both budgets hold again.

use crate::module::CompiledModule;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A cached module with usage stats
#[derive(Debug, Clone)]
pub struct CachedModuleEntry {
    pub hash: String,
    pub module: Arc<CompiledModule>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    /// Logical access clock, strictly increasing across the cache
    recency: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub size_bytes: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CachedModuleEntry>,
    size_bytes: u64,
    hits: u64,
    misses: u64,
    clock: u64,
}

impl CacheInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn lookup(&mut self, hash: &str) -> Option<Arc<CompiledModule>> {
        let recency = self.tick();
        match self.entries.get_mut(hash) {
            Some(entry) => {
                entry.recency = recency;
                entry.access_count += 1;
                entry.last_accessed_at = Utc::now();
                let module = entry.module.clone();
                self.hits += 1;
                Some(module)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn evict(&mut self, max_entries: usize, max_size_bytes: u64) {
        while self.entries.len() > max_entries || self.size_bytes > max_size_bytes {
            let Some(oldest) = self
                .entries
                .values()
                .min_by_key(|entry| entry.recency)
                .map(|entry| entry.hash.clone())
            else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                self.size_bytes -= entry.size_bytes;
                debug!(hash = %&entry.hash[..12], size = entry.size_bytes, "Evicted module from cache");
            }
        }
    }
}

/// Shared module cache; every operation is atomic
pub struct ModuleCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
    max_size_bytes: u64,
}

impl ModuleCache {
    pub fn new(max_entries: usize, max_size_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_entries,
            max_size_bytes,
        }
    }

    /// Hex SHA-256 digest of the source text
    pub fn hash_source(source: &str) -> String {
        hex::encode(Sha256::digest(source.as_bytes()))
    }

    /// Store a compiled module and return its hash.
    ///
    /// Storing bytes that are already present only refreshes their recency;
    /// the module already cached is kept.
    pub fn set(&self, source: &str, module: Arc<CompiledModule>) -> String {
        let hash = Self::hash_source(source);
        let mut inner = self.inner.lock();
        let recency = inner.tick();
        let now = Utc::now();

        if let Some(entry) = inner.entries.get_mut(&hash) {
            entry.recency = recency;
            entry.last_accessed_at = now;
            return hash;
        }

        let size_bytes = module.size_bytes();
        inner.entries.insert(
            hash.clone(),
            CachedModuleEntry {
                hash: hash.clone(),
                module,
                size_bytes,
                created_at: now,
                last_accessed_at: now,
                access_count: 0,
                recency,
            },
        );
        inner.size_bytes += size_bytes;
        debug!(hash = %&hash[..12], size = size_bytes, entries = inner.entries.len(), "Cached module");

        inner.evict(self.max_entries, self.max_size_bytes);
        hash
    }

    pub fn get(&self, source: &str) -> Option<Arc<CompiledModule>> {
        self.get_by_hash(&Self::hash_source(source))
    }

    pub fn get_by_hash(&self, hash: &str) -> Option<Arc<CompiledModule>> {
        self.inner.lock().lookup(hash)
    }

    /// Presence check; touches neither counters nor recency
    pub fn has(&self, source: &str) -> bool {
        self.inner.lock().entries.contains_key(&Self::hash_source(source))
    }

    pub fn delete(&self, source: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.remove(&Self::hash_source(source)) {
            Some(entry) => {
                inner.size_bytes -= entry.size_bytes;
                true
            }
            None => false,
        }
    }

    /// Drop every entry and reset the counters
    pub fn clear(&self) {
        *self.inner.lock() = CacheInner::default();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entries: inner.entries.len(),
            size_bytes: inner.size_bytes,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }

    /// Snapshot of all entries, least recently accessed first
    pub fn entries(&self) -> Vec<CachedModuleEntry> {
        let inner = self.inner.lock();
        let mut entries: Vec<_> = inner.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.recency);
        entries
    }
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::new(crate::config::CACHE_MAX_ENTRIES_DEFAULT, crate::config::CACHE_MAX_BYTES_DEFAULT)
    }
}
