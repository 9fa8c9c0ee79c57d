//! In-process [`StorageAdapter`] backed by a `DashMap`.
//!
//! Entries past their `expires_at` read as misses and are removed by
//! `purge_expired`. With `max_entries` set, inserts past the limit evict according
//! to the configured [`EvictionPolicy`]. This is the default provider of a cache manager and the
//! adapter the test suites build on.

use crate::adapter::{
    AdapterCapabilities, AdapterMetadata, AdapterStats, HealthReport, StorageAdapter, StoredEntry,
};
use crate::error::Result;
use crate::stats::CacheStats;
use crate::utils::{glob_match, move_key_to_end, now_millis, remove_key_from_order};
use crate::EvictionPolicy;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Settings for [`MemoryAdapter`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryAdapterConfig {
    /// Maximum number of entries (`None` = unlimited).
    pub max_entries: Option<usize>,
    pub policy: EvictionPolicy,
}

impl MemoryAdapterConfig {
    #[must_use]
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Debug, Clone)]
struct MemoryRecord {
    entry: StoredEntry,
    /// Hits since insertion, for LFU
    frequency: u64,
}

/// Process-local storage adapter.
///
/// Entries live in a [`DashMap`]; a `Mutex`-guarded order queue tracks insertion or
/// recency for eviction. Expired entries are dropped lazily on read and by
/// [`purge_expired`](Self::purge_expired).
///
/// # Thread Safety
///
/// The map shards allow concurrent reads and writes. Whenever both are needed the
/// order lock is taken first and no map guard is held while waiting for it.
///
/// # Examples
///
/// ```
/// use cachemux_core::{EvictionPolicy, MemoryAdapter, MemoryAdapterConfig};
///
/// let adapter = MemoryAdapter::new(
///     MemoryAdapterConfig::default()
///         .with_max_entries(1_000)
///         .with_policy(EvictionPolicy::LFU),
/// );
/// assert_eq!(adapter.len(), 0);
/// ```
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    entries: DashMap<String, MemoryRecord>,
    order: Mutex<VecDeque<String>>,
    config: MemoryAdapterConfig,
    stats: CacheStats,
    evictions: AtomicU64,
}

impl MemoryAdapter {
    pub fn new(config: MemoryAdapterConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &MemoryAdapterConfig {
        &self.config
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every expired entry.
    ///
    /// # Returns
    ///
    /// The number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = now_millis();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|r| r.value().entry.is_expired_at(now))
            .map(|r| r.key().clone())
            .collect();

        if expired.is_empty() {
            return 0;
        }

        let mut order = self.order.lock();
        let mut removed = 0;
        for key in &expired {
            // Re-check under the order lock: the key may have been rewritten meanwhile
            if self
                .entries
                .remove_if(key, |_, r| r.entry.is_expired_at(now))
                .is_some()
            {
                remove_key_from_order(&mut order, key);
                removed += 1;
            }
        }
        removed
    }

    fn remove_key(&self, key: &str) -> bool {
        let mut order = self.order.lock();
        let removed = self.entries.remove(key).is_some();
        if removed {
            remove_key_from_order(&mut order, key);
        }
        removed
    }

    /// Evicts entries until there is room for one more.
    fn evict_for_insert(&self, order: &mut VecDeque<String>) {
        let Some(limit) = self.config.max_entries else {
            return;
        };
        if limit == 0 {
            return;
        }

        while self.entries.len() >= limit && !order.is_empty() {
            let victim = match self.config.policy {
                EvictionPolicy::FIFO | EvictionPolicy::LRU => order.pop_front(),
                EvictionPolicy::LFU => self.find_min_frequency_key(order).map(|key| {
                    remove_key_from_order(order, &key);
                    key
                }),
                EvictionPolicy::Random => {
                    let idx = fastrand::usize(..order.len());
                    order.remove(idx)
                }
            };

            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(key = %key, policy = ?self.config.policy, "evicted entry");
                }
                None => break,
            }
        }
    }

    /// Key with the lowest hit count; the earliest in the queue wins ties.
    fn find_min_frequency_key(&self, order: &VecDeque<String>) -> Option<String> {
        let mut min_freq_key: Option<&String> = None;
        let mut min_freq = u64::MAX;
        for key in order {
            if let Some(record) = self.entries.get(key) {
                if record.frequency < min_freq {
                    min_freq = record.frequency;
                    min_freq_key = Some(key);
                }
            }
        }
        min_freq_key.cloned()
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>> {
        let now = now_millis();
        let found = match self.entries.get_mut(key) {
            Some(mut record) => {
                if record.entry.is_expired_at(now) {
                    None
                } else {
                    if self.config.policy.tracks_frequency() {
                        record.frequency = record.frequency.saturating_add(1);
                    }
                    Some(record.entry.clone())
                }
            }
            None => {
                self.stats.record_miss();
                return Ok(None);
            }
        };

        match found {
            Some(entry) => {
                self.stats.record_hit();
                if self.config.max_entries.is_some() && self.config.policy.reorders_on_hit() {
                    let mut order = self.order.lock();
                    // Double-check after acquiring lock
                    if self.entries.contains_key(key) {
                        move_key_to_end(&mut order, key);
                    }
                }
                Ok(Some(entry))
            }
            None => {
                // Expired: drop it only if it was not rewritten in between
                let mut order = self.order.lock();
                if self
                    .entries
                    .remove_if(key, |_, r| r.entry.is_expired_at(now))
                    .is_some()
                {
                    remove_key_from_order(&mut order, key);
                }
                self.stats.record_miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, entry: StoredEntry) -> Result<()> {
        let mut order = self.order.lock();

        if let Some(mut record) = self.entries.get_mut(key) {
            record.entry = entry;
            drop(record);
            if self.config.policy.reorders_on_hit() {
                move_key_to_end(&mut order, key);
            }
        } else {
            self.evict_for_insert(&mut order);
            order.push_back(key.to_string());
            self.entries.insert(
                key.to_string(),
                MemoryRecord {
                    entry,
                    frequency: 0,
                },
            );
        }

        self.stats.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.remove_key(key);
        if removed {
            self.stats.record_delete();
        }
        Ok(removed)
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let now = now_millis();
        Ok(self
            .entries
            .get(key)
            .is_some_and(|r| !r.entry.is_expired_at(now)))
    }

    async fn clear(&self) -> Result<()> {
        let mut order = self.order.lock();
        self.entries.clear();
        order.clear();
        Ok(())
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let now = now_millis();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|r| !r.value().entry.is_expired_at(now))
            .filter(|r| pattern.map_or(true, |p| glob_match(p, r.key())))
            .map(|r| r.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_stats(&self) -> Result<AdapterStats> {
        let size_bytes = self.entries.iter().map(|r| r.value().entry.size()).sum();
        Ok(AdapterStats {
            entries: self.entries.len(),
            size_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
            counters: self.stats.snapshot(),
        })
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<AdapterMetadata>> {
        let now = now_millis();
        Ok(self
            .entries
            .get(key)
            .filter(|r| !r.entry.is_expired_at(now))
            .map(|r| r.entry.metadata()))
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            metadata: true,
            native_ttl: true,
        }
    }

    async fn health_check(&self) -> HealthReport {
        HealthReport::healthy()
    }
}
