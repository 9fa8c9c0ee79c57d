//! # Provider Orchestrator
//!
//! Holds the registered storage adapters ("providers") in ascending priority order
//! and routes every cache operation across them.
//!
//! ## Routing
//!
//! - **Reads** walk the providers in order and stop at the first hit. A provider
//!   that errors is recorded and skipped; nothing is written back to earlier
//!   providers.
//! - **Writes** (`set`, `delete`, `clear`) fan out to all providers concurrently.
//!   Failures are isolated per provider; `set` and `clear` only fail when every
//!   provider failed.
//!
//! ## Demotion
//!
//! Every adapter error bumps the provider's error counter. When the counter first
//! exceeds the error threshold (5 by default) the provider is moved behind all
//! others (`max(priority) + 1`). [`ProviderOrchestrator::reset_error_counts`]
//! zeroes the counters but leaves priorities where they are.
//!
//! Values are serialized once per write; every provider stores the same bytes.

use crate::adapter::{AdapterMetadata, AdapterStats, HealthStatus, StorageAdapter, StoredEntry, WriteOptions};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakers};
use crate::error::{CacheError, Result};
use crate::events::{CacheEvent, EventBus};
use crate::serialization::Serializer;
use crate::stats::{CacheStats, StatsSnapshot};
use crate::value::CacheValue;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of errors a provider may accumulate before demotion.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 5;

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Demote a provider once its error count exceeds this.
    pub error_threshold: u32,
    /// Per-provider circuit breakers; `None` disables them.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            circuit_breaker: None,
        }
    }
}

/// A successful read: the decoded value and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub value: CacheValue,
    pub provider: String,
    pub entry: StoredEntry,
}

/// Per-provider view returned by [`ProviderOrchestrator::get_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStats {
    pub name: String,
    pub priority: i32,
    pub error_count: u32,
    pub last_error: Option<String>,
    /// Orchestrator-side counters for this provider.
    pub counters: StatsSnapshot,
    /// Adapter-reported stats, if the adapter answered.
    pub adapter: Option<AdapterStats>,
}

/// Health classification of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub status: HealthStatus,
    pub priority: i32,
    pub error_count: u32,
    pub last_error: Option<String>,
}

struct Registration {
    name: String,
    adapter: Arc<dyn StorageAdapter>,
    priority: AtomicI32,
    /// Registration order, breaks priority ties
    seq: u64,
    error_count: AtomicU32,
    last_error: Mutex<Option<String>>,
    stats: CacheStats,
}

impl Registration {
    fn priority(&self) -> i32 {
        self.priority.load(Ordering::SeqCst)
    }

    fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }
}

/// Classifies an error count: 0 healthy, up to `threshold` degraded, above unhealthy.
pub fn classify_health(error_count: u32, threshold: u32) -> HealthStatus {
    if error_count == 0 {
        HealthStatus::Healthy
    } else if error_count <= threshold {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

/// Routes operations across ranked storage adapters.
pub struct ProviderOrchestrator {
    providers: RwLock<Vec<Arc<Registration>>>,
    next_seq: AtomicU64,
    serializer: Serializer,
    events: EventBus,
    breakers: Option<CircuitBreakers>,
    error_threshold: u32,
}

impl ProviderOrchestrator {
    pub fn new(serializer: Serializer, events: EventBus, config: OrchestratorConfig) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            serializer,
            events,
            breakers: config.circuit_breaker.map(CircuitBreakers::new),
            error_threshold: config.error_threshold,
        }
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    /// Registers `adapter` under `name`. An existing provider with the same name is
    /// replaced.
    pub fn register(&self, name: impl Into<String>, adapter: Arc<dyn StorageAdapter>, priority: i32) {
        let name = name.into();
        let registration = Arc::new(Registration {
            name: name.clone(),
            adapter,
            priority: AtomicI32::new(priority),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            error_count: AtomicU32::new(0),
            last_error: Mutex::new(None),
            stats: CacheStats::new(),
        });

        {
            let mut providers = self.providers.write();
            providers.retain(|p| p.name != name);
            providers.push(registration);
            sort_providers(&mut providers);
        }
        if let Some(breakers) = &self.breakers {
            breakers.remove(&name);
        }

        info!(provider = %name, priority, "provider registered");
        self.events.publish(CacheEvent::ProviderInitialized {
            provider: name,
            priority,
        });
    }

    /// Removes the provider named `name`. Returns `true` if it existed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut providers = self.providers.write();
            let before = providers.len();
            providers.retain(|p| p.name != name);
            providers.len() != before
        };
        if removed {
            if let Some(breakers) = &self.breakers {
                breakers.remove(name);
            }
            info!(provider = %name, "provider unregistered");
        }
        removed
    }

    /// Provider names in iteration order.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.read().iter().map(|p| p.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    /// Reads `key` from the first provider that has it.
    ///
    /// Expired entries count as misses even when the adapter still returns them.
    /// Provider failures (including undecodable entries) are recorded and skipped,
    /// so this never fails: a miss everywhere and a failure everywhere both yield
    /// `None`.
    pub async fn get(&self, key: &str) -> Option<Lookup> {
        for reg in self.snapshot() {
            if !self.admit(&reg) {
                continue;
            }
            match reg.adapter.get(key).await {
                Ok(Some(entry)) if entry.is_expired() => {
                    self.on_success(&reg);
                    reg.stats.record_miss();
                }
                Ok(Some(entry)) => match self.serializer.deserialize(&entry.payload) {
                    Ok(value) => {
                        self.on_success(&reg);
                        reg.stats.record_hit();
                        debug!(key, provider = %reg.name, "cache hit");
                        return Some(Lookup {
                            value,
                            provider: reg.name.clone(),
                            entry,
                        });
                    }
                    Err(e) => self.on_failure(&reg, "get", Some(key), &e),
                },
                Ok(None) => {
                    self.on_success(&reg);
                    reg.stats.record_miss();
                }
                Err(e) => self.on_failure(&reg, "get", Some(key), &e),
            }
        }
        None
    }

    /// True if any provider holds `key`. Stops at the first positive answer.
    pub async fn has(&self, key: &str) -> bool {
        for reg in self.snapshot() {
            if !self.admit(&reg) {
                continue;
            }
            match reg.adapter.has(key).await {
                Ok(true) => {
                    self.on_success(&reg);
                    return true;
                }
                Ok(false) => self.on_success(&reg),
                Err(e) => self.on_failure(&reg, "has", Some(key), &e),
            }
        }
        false
    }

    /// Serializes `value` once and writes it to every provider.
    ///
    /// # Returns
    ///
    /// The stored payload size in bytes.
    ///
    /// # Errors
    ///
    /// Serialization errors, or the last provider error when no provider accepted
    /// the write.
    pub async fn set(&self, key: &str, value: &CacheValue, options: &WriteOptions) -> Result<usize> {
        let payload = self.serializer.serialize(value)?;
        let size = payload.data.len();
        let entry = StoredEntry::new(payload, options);

        let providers = self.snapshot();
        let writes = providers.iter().map(|reg| {
            let entry = entry.clone();
            async move {
                if !self.admit(reg) {
                    return Err(skipped(reg));
                }
                reg.adapter.set(key, entry).await
            }
        });
        let results = join_all(writes).await;

        self.settle_writes(&providers, results, "set", Some(key))?;
        Ok(size)
    }

    /// Writes several values, batching per provider.
    ///
    /// # Returns
    ///
    /// Stored payload size per key.
    pub async fn set_many(
        &self,
        entries: Vec<(String, CacheValue)>,
        options: &WriteOptions,
    ) -> Result<HashMap<String, usize>> {
        let mut sizes = HashMap::with_capacity(entries.len());
        let mut stored = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let payload = self.serializer.serialize(&value)?;
            sizes.insert(key.clone(), payload.data.len());
            stored.push((key, StoredEntry::new(payload, options)));
        }

        let providers = self.snapshot();
        let writes = providers.iter().map(|reg| {
            let batch = stored.clone();
            async move {
                if !self.admit(reg) {
                    return Err(skipped(reg));
                }
                reg.adapter.set_many(batch).await
            }
        });
        let results = join_all(writes).await;

        self.settle_writes(&providers, results, "set_many", None)?;
        Ok(sizes)
    }

    /// Deletes `key` everywhere. Returns `true` if any provider removed it.
    pub async fn delete(&self, key: &str) -> bool {
        let providers = self.snapshot();
        let deletes = providers.iter().map(|reg| async move {
            if !self.admit(reg) {
                return Err(skipped(reg));
            }
            reg.adapter.delete(key).await
        });
        let results = join_all(deletes).await;

        let mut deleted = false;
        for (reg, result) in providers.iter().zip(results) {
            match result {
                Ok(removed) => {
                    self.on_success(reg);
                    if removed {
                        reg.stats.record_delete();
                        deleted = true;
                    }
                }
                Err(e) if is_skip(&e) => {}
                Err(e) => self.on_failure(reg, "delete", Some(key), &e),
            }
        }
        deleted
    }

    /// Clears every provider.
    ///
    /// # Errors
    ///
    /// The last provider error when no provider could be cleared.
    pub async fn clear(&self) -> Result<()> {
        let providers = self.snapshot();
        let clears = providers.iter().map(|reg| async move {
            if !self.admit(reg) {
                return Err(skipped(reg));
            }
            reg.adapter.clear().await
        });
        let results = join_all(clears).await;
        self.settle_writes(&providers, results, "clear", None)
    }

    /// Batched read: for each key, the first provider that has it.
    ///
    /// Every requested key has a slot in the result.
    pub async fn get_many(&self, keys: &[String]) -> HashMap<String, Option<CacheValue>> {
        let mut found: HashMap<String, Option<CacheValue>> =
            keys.iter().map(|k| (k.clone(), None)).collect();
        let mut remaining: Vec<String> = found.keys().cloned().collect();
        remaining.sort();

        for reg in self.snapshot() {
            if remaining.is_empty() {
                break;
            }
            if !self.admit(&reg) {
                continue;
            }
            let batch = match reg.adapter.get_many(&remaining).await {
                Ok(batch) => {
                    self.on_success(&reg);
                    batch
                }
                Err(e) => {
                    self.on_failure(&reg, "get_many", None, &e);
                    continue;
                }
            };

            let mut still_missing = Vec::with_capacity(remaining.len());
            for key in remaining {
                let decoded = batch
                    .get(&key)
                    .and_then(Option::as_ref)
                    .filter(|entry| !entry.is_expired())
                    .map(|entry| self.serializer.deserialize(&entry.payload));
                match decoded {
                    Some(Ok(value)) => {
                        reg.stats.record_hit();
                        found.insert(key, Some(value));
                    }
                    Some(Err(e)) => {
                        self.on_failure(&reg, "get_many", Some(&key), &e);
                        still_missing.push(key);
                    }
                    None => {
                        reg.stats.record_miss();
                        still_missing.push(key);
                    }
                }
            }
            remaining = still_missing;
        }
        found
    }

    /// Union of keys across providers, deduplicated and sorted.
    pub async fn keys(&self, pattern: Option<&str>) -> Vec<String> {
        let mut all = BTreeSet::new();
        for reg in self.snapshot() {
            if !self.admit(&reg) {
                continue;
            }
            match reg.adapter.keys(pattern).await {
                Ok(keys) => {
                    self.on_success(&reg);
                    all.extend(keys);
                }
                Err(e) => self.on_failure(&reg, "keys", None, &e),
            }
        }
        all.into_iter().collect()
    }

    /// Metadata from the first provider that supports it and knows `key`.
    pub async fn get_entry_metadata(&self, key: &str) -> Option<AdapterMetadata> {
        for reg in self.snapshot() {
            if !reg.adapter.capabilities().metadata || !self.admit(&reg) {
                continue;
            }
            match reg.adapter.get_metadata(key).await {
                Ok(Some(meta)) => return Some(meta),
                Ok(None) => {}
                Err(e) => self.on_failure(&reg, "get_metadata", Some(key), &e),
            }
        }
        None
    }

    /// Stats for every provider, keyed by name.
    pub async fn get_stats(&self) -> BTreeMap<String, ProviderStats> {
        let mut out = BTreeMap::new();
        for reg in self.snapshot() {
            let adapter = match reg.adapter.get_stats().await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    debug!(provider = %reg.name, error = %e, "adapter stats unavailable");
                    None
                }
            };
            out.insert(
                reg.name.clone(),
                ProviderStats {
                    name: reg.name.clone(),
                    priority: reg.priority(),
                    error_count: reg.error_count(),
                    last_error: reg.last_error.lock().clone(),
                    counters: reg.stats.snapshot(),
                    adapter,
                },
            );
        }
        out
    }

    /// Health of every provider in iteration order.
    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.snapshot()
            .iter()
            .map(|reg| {
                let error_count = reg.error_count();
                ProviderHealth {
                    name: reg.name.clone(),
                    status: classify_health(error_count, self.error_threshold),
                    priority: reg.priority(),
                    error_count,
                    last_error: reg.last_error.lock().clone(),
                }
            })
            .collect()
    }

    /// Zeroes error counters and last errors. Priorities are not restored.
    pub fn reset_error_counts(&self) {
        for reg in self.snapshot() {
            reg.error_count.store(0, Ordering::SeqCst);
            *reg.last_error.lock() = None;
        }
        if let Some(breakers) = &self.breakers {
            breakers.reset_all();
        }
        info!("provider error counts reset");
    }

    /// Current priority of `name`.
    pub fn priority_of(&self, name: &str) -> Option<i32> {
        self.providers
            .read()
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.priority())
    }

    fn snapshot(&self) -> Vec<Arc<Registration>> {
        self.providers.read().clone()
    }

    /// Consults the provider's breaker, when breakers are enabled.
    fn admit(&self, reg: &Registration) -> bool {
        match &self.breakers {
            Some(breakers) => match breakers.get(&reg.name).check() {
                Ok(()) => true,
                Err(e) => {
                    debug!(provider = %reg.name, error = %e, "provider skipped");
                    false
                }
            },
            None => true,
        }
    }

    fn on_success(&self, reg: &Registration) {
        if let Some(breakers) = &self.breakers {
            breakers.get(&reg.name).record_success();
        }
    }

    fn on_failure(&self, reg: &Registration, operation: &str, key: Option<&str>, error: &CacheError) {
        if let Some(breakers) = &self.breakers {
            breakers.get(&reg.name).record_failure();
        }
        reg.stats.record_error();
        *reg.last_error.lock() = Some(error.to_string());
        let count = reg.error_count.fetch_add(1, Ordering::SeqCst) + 1;

        warn!(
            provider = %reg.name,
            operation,
            key = key.unwrap_or(""),
            error_count = count,
            error = %error,
            "provider operation failed"
        );
        self.events.publish(CacheEvent::Error {
            key: key.map(str::to_string),
            provider: Some(reg.name.clone()),
            operation: operation.to_string(),
            code: error.code(),
            message: error.to_string(),
        });

        if count == self.error_threshold.saturating_add(1) {
            self.demote(&reg.name);
        }
    }

    /// Moves `name` behind every other provider.
    fn demote(&self, name: &str) {
        let mut providers = self.providers.write();
        let max = providers.iter().map(|p| p.priority()).max().unwrap_or(0);
        if let Some(reg) = providers.iter().find(|p| p.name == name) {
            let new_priority = max.saturating_add(1);
            reg.priority.store(new_priority, Ordering::SeqCst);
            warn!(provider = %name, priority = new_priority, "provider demoted");
        }
        sort_providers(&mut providers);
    }

    /// Records fan-out results; fails only if no provider succeeded.
    fn settle_writes<T>(
        &self,
        providers: &[Arc<Registration>],
        results: Vec<Result<T>>,
        operation: &str,
        key: Option<&str>,
    ) -> Result<()> {
        let mut succeeded = 0usize;
        let mut last_error: Option<CacheError> = None;

        for (reg, result) in providers.iter().zip(results) {
            match result {
                Ok(_) => {
                    self.on_success(reg);
                    if operation.starts_with("set") {
                        reg.stats.record_set();
                    }
                    succeeded += 1;
                }
                Err(e) if is_skip(&e) => last_error = Some(e),
                Err(e) => {
                    self.on_failure(reg, operation, key, &e);
                    last_error = Some(match e {
                        CacheError::Provider { .. } => e,
                        other => CacheError::provider(&reg.name, other),
                    });
                }
            }
        }

        if succeeded > 0 {
            if last_error.is_some() {
                debug!(operation, succeeded, total = providers.len(), "partial write");
            }
            return Ok(());
        }
        Err(last_error.unwrap_or_else(|| {
            CacheError::provider("*", format!("no providers registered for {operation}"))
        }))
    }
}

fn sort_providers(providers: &mut [Arc<Registration>]) {
    providers.sort_by_key(|p| (p.priority(), p.seq));
}

fn skipped(reg: &Registration) -> CacheError {
    CacheError::CircuitOpen {
        name: reg.name.clone(),
        retry_in: std::time::Duration::ZERO,
    }
}

fn is_skip(error: &CacheError) -> bool {
    matches!(error, CacheError::CircuitOpen { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAdapter;

    fn orchestrator() -> ProviderOrchestrator {
        ProviderOrchestrator::new(
            Serializer::default(),
            EventBus::default(),
            OrchestratorConfig::default(),
        )
    }

    #[test]
    fn test_classify_health() {
        assert_eq!(classify_health(0, 5), HealthStatus::Healthy);
        assert_eq!(classify_health(1, 5), HealthStatus::Degraded);
        assert_eq!(classify_health(5, 5), HealthStatus::Degraded);
        assert_eq!(classify_health(6, 5), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_registration_order_and_replacement() {
        let orch = orchestrator();
        orch.register("b", Arc::new(MemoryAdapter::default()), 1);
        orch.register("a", Arc::new(MemoryAdapter::default()), 1);
        orch.register("fast", Arc::new(MemoryAdapter::default()), 0);
        assert_eq!(orch.provider_names(), vec!["fast", "b", "a"]);

        // Same name replaces, new priority applies
        orch.register("b", Arc::new(MemoryAdapter::default()), 5);
        assert_eq!(orch.provider_names(), vec!["fast", "a", "b"]);
        assert_eq!(orch.len(), 3);

        assert!(orch.unregister("a"));
        assert!(!orch.unregister("a"));
        assert_eq!(orch.provider_names(), vec!["fast", "b"]);
    }

    #[tokio::test]
    async fn test_set_reaches_every_provider() {
        let orch = orchestrator();
        let first = Arc::new(MemoryAdapter::default());
        let second = Arc::new(MemoryAdapter::default());
        orch.register("first", first.clone(), 0);
        orch.register("second", second.clone(), 1);

        let size = orch
            .set("k", &CacheValue::from("v"), &WriteOptions::default())
            .await
            .unwrap();
        assert!(size > 0);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);

        let hit = orch.get("k").await.unwrap();
        assert_eq!(hit.provider, "first");
        assert_eq!(hit.value, CacheValue::from("v"));

        assert!(orch.delete("k").await);
        assert!(!orch.delete("k").await);
        assert!(orch.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_set_without_providers_fails() {
        let orch = orchestrator();
        let err = orch
            .set("k", &CacheValue::Null, &WriteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::ProviderError);
        assert!(orch.get("k").await.is_none());
    }
}
