//! The [`CacheManager`] façade.
//!
//! Every operation runs the same pipeline: key validation, then admission control
//! (rate limiter, then the operation's circuit breaker), then the provider
//! orchestrator or compute engine. The metadata index and statistics are updated
//! alongside.
//!
//! Reads (`get`, `has`, `delete`) never fail because of a provider; they degrade to
//! a miss. Writes (`set`, `set_many`, `clear`) and `get_or_compute` propagate
//! failures. Validation and admission errors propagate from every operation.

use crate::config::{CacheConfig, DEFAULT_PROVIDER_NAME};
use cachemux_core::adapter::{StorageAdapter, WriteOptions};
use cachemux_core::circuit_breaker::{CircuitBreaker, CircuitBreakers, CircuitState};
use cachemux_core::compute::{compute_fn, ComputeEngine, ComputeOptions, ComputeResult};
use cachemux_core::error::{CacheError, ErrorCode, Result};
use cachemux_core::events::{CacheEvent, EventBus};
use cachemux_core::memory::MemoryAdapter;
use cachemux_core::metadata::{EntryMetadata, MetadataIndex, MetadataUpdate};
use cachemux_core::provider::{OrchestratorConfig, ProviderHealth, ProviderOrchestrator, ProviderStats};
use cachemux_core::rate_limiter::RateLimiter;
use cachemux_core::serialization::Serializer;
use cachemux_core::stats::{CacheStats, StatsSnapshot};
use cachemux_core::utils::validate_key;
use cachemux_core::value::CacheValue;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Options for [`CacheManager::set`] and [`CacheManager::set_many`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Overrides the configured default TTL.
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Aggregate view returned by [`CacheManager::get_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStats {
    /// Façade-level counters.
    pub cache: StatsSnapshot,
    pub providers: BTreeMap<String, ProviderStats>,
    /// Keys tracked by the metadata index.
    pub tracked_keys: usize,
    pub in_flight: usize,
    /// Operation breakers that have been used, by operation name.
    pub circuits: BTreeMap<String, CircuitState>,
}

/// Multi-provider cache with get-or-compute.
///
/// # Examples
///
/// ```
/// use cachemux::{CacheManager, CacheValue, SetOptions};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> cachemux::Result<()> {
/// let cache = CacheManager::builder().build()?;
///
/// cache.set("greeting", "hello", SetOptions::new()).await?;
/// assert_eq!(cache.get("greeting").await?, Some(CacheValue::from("hello")));
///
/// let answer = cache
///     .get_or_compute("answer", || async { Ok(CacheValue::from(42)) }, Default::default())
///     .await?;
/// assert_eq!(answer.value, CacheValue::from(42));
/// # Ok(())
/// # }
/// ```
pub struct CacheManager {
    config: CacheConfig,
    orchestrator: Arc<ProviderOrchestrator>,
    engine: ComputeEngine,
    metadata: Arc<MetadataIndex>,
    limiter: Option<Arc<RateLimiter>>,
    breakers: Option<CircuitBreakers>,
    events: EventBus,
    stats: CacheStats,
    sweeper: Option<JoinHandle<()>>,
}

impl CacheManager {
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::default()
    }

    /// Builds a manager from `config` with only the built-in provider (if enabled).
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_deref()
    }

    /// Reads `key` from the first provider that has it.
    ///
    /// # Errors
    ///
    /// Validation and admission errors only; provider failures read as a miss.
    pub async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        self.validate(key)?;
        let breaker = self.admit("get", 1, Some(key)).await?;
        self.events.publish(CacheEvent::Get {
            key: key.to_string(),
        });

        let found = self.orchestrator.get(key).await;
        settle(breaker.as_deref(), &Ok::<(), CacheError>(()));

        match found {
            Some(hit) => {
                self.stats.record_hit();
                self.metadata.record_access(key);
                self.events.publish(CacheEvent::GetHit {
                    key: key.to_string(),
                    provider: Some(hit.provider),
                });
                Ok(Some(hit.value))
            }
            None => {
                self.stats.record_miss();
                self.events.publish(CacheEvent::GetMiss {
                    key: key.to_string(),
                });
                Ok(None)
            }
        }
    }

    /// Like [`get`](Self::get), decoding the value into `T`.
    ///
    /// # Errors
    ///
    /// Additionally `DESERIALIZATION_ERROR` when the cached value does not fit `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => value.deserialize_into().map(Some),
            None => Ok(None),
        }
    }

    /// Stores `value` in every provider.
    ///
    /// # Errors
    ///
    /// Validation, admission and serialization errors, or a provider error when no
    /// provider accepted the write.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        options: SetOptions,
    ) -> Result<()> {
        self.validate(key)?;
        let breaker = self.admit("set", 1, Some(key)).await?;

        let value = value.into();
        let ttl = options.ttl.or(self.config.default_ttl);
        let result = self
            .orchestrator
            .set(key, &value, &WriteOptions::with_ttl(ttl))
            .await;
        settle(breaker.as_deref(), &result);

        let size = result.map_err(|e| self.fail("set", Some(key), e))?;
        self.track(key, &options.tags, size, ttl);
        self.stats.record_set();
        self.events.publish(CacheEvent::Set {
            key: key.to_string(),
            ttl,
            tags: options.tags,
        });
        Ok(())
    }

    /// Like [`set`](Self::set) for any serde-serializable value.
    pub async fn set_as<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> Result<()> {
        let value = CacheValue::from_serialize(value)?;
        self.set(key, value, options).await
    }

    /// Removes `key` from every provider and from the metadata index.
    ///
    /// # Returns
    ///
    /// `true` if any provider held the key.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.validate(key)?;
        let breaker = self.admit("delete", 1, Some(key)).await?;

        let deleted = self.remove(key).await;
        settle(breaker.as_deref(), &Ok::<(), CacheError>(()));
        Ok(deleted)
    }

    /// Clears every provider, the metadata index and pending refresh bookkeeping.
    pub async fn clear(&self) -> Result<()> {
        let breaker = self.admit("clear", 1, None).await?;

        let result = self.orchestrator.clear().await;
        settle(breaker.as_deref(), &result);
        result.map_err(|e| self.fail("clear", None, e))?;

        self.metadata.clear();
        self.engine.forget_all();
        self.events.publish(CacheEvent::Clear);
        info!("cache cleared");
        Ok(())
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        self.validate(key)?;
        let breaker = self.admit("has", 1, Some(key)).await?;

        let present = self.orchestrator.has(key).await;
        settle(breaker.as_deref(), &Ok::<(), CacheError>(()));
        Ok(present)
    }

    /// Returns the cached value, or computes, stores and returns it.
    ///
    /// Concurrent calls for the same key share one computation. A cached value older
    /// than `ttl * refresh_threshold` is returned with `stale: true` and refreshed in
    /// the background.
    ///
    /// # Errors
    ///
    /// Validation and admission errors, invalid options, or `COMPUTE_ERROR` once
    /// every retry failed.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        compute: F,
        options: ComputeOptions,
    ) -> Result<ComputeResult>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CacheValue>> + Send + 'static,
    {
        self.validate(key)?;
        let breaker = self.admit("get_or_compute", 1, Some(key)).await?;

        let result = self
            .engine
            .get_or_compute(key, compute_fn(compute), options)
            .await;
        settle(breaker.as_deref(), &result);

        match result {
            Ok(computed) => {
                if computed.stale {
                    debug!(key, "stale value served");
                }
                Ok(computed)
            }
            Err(e) => Err(self.fail("get_or_compute", Some(key), e)),
        }
    }

    /// Reads several keys. Every requested key has a slot in the result.
    ///
    /// An empty request returns an empty map without touching the rate limiter.
    pub async fn get_many(&self, keys: &[&str]) -> Result<HashMap<String, Option<CacheValue>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        for key in keys {
            self.validate(key)?;
        }
        let breaker = self.admit("get_many", count_of(keys.len()), None).await?;

        let owned: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let found = self.orchestrator.get_many(&owned).await;
        settle(breaker.as_deref(), &Ok::<(), CacheError>(()));

        for (key, value) in &found {
            if value.is_some() {
                self.stats.record_hit();
                self.metadata.record_access(key);
            } else {
                self.stats.record_miss();
            }
        }
        Ok(found)
    }

    /// Writes several values with shared options.
    pub async fn set_many(&self, entries: Vec<(String, CacheValue)>, options: SetOptions) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        for (key, _) in &entries {
            self.validate(key)?;
        }
        let breaker = self.admit("set_many", count_of(entries.len()), None).await?;

        let ttl = options.ttl.or(self.config.default_ttl);
        let result = self
            .orchestrator
            .set_many(entries, &WriteOptions::with_ttl(ttl))
            .await;
        settle(breaker.as_deref(), &result);

        let sizes = result.map_err(|e| self.fail("set_many", None, e))?;
        for (key, size) in sizes {
            self.track(&key, &options.tags, size, ttl);
            self.stats.record_set();
            self.events.publish(CacheEvent::Set {
                key,
                ttl,
                tags: options.tags.clone(),
            });
        }
        Ok(())
    }

    /// Deletes every key carrying `tag`.
    ///
    /// # Returns
    ///
    /// Number of keys invalidated.
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<usize> {
        let breaker = self.admit("invalidate", 1, None).await?;

        let keys = self.metadata.find_by_tag(tag);
        for key in &keys {
            self.remove(key).await;
        }
        settle(breaker.as_deref(), &Ok::<(), CacheError>(()));

        info!(tag, count = keys.len(), "invalidated by tag");
        Ok(keys.len())
    }

    /// Deletes every key starting with `prefix`, whether or not it has metadata.
    ///
    /// # Returns
    ///
    /// Number of keys invalidated.
    pub async fn invalidate_by_prefix(&self, prefix: &str) -> Result<usize> {
        let breaker = self.admit("invalidate", 1, None).await?;

        let mut keys: BTreeSet<String> = self.metadata.find_by_prefix(prefix).into_iter().collect();
        keys.extend(
            self.orchestrator
                .keys(None)
                .await
                .into_iter()
                .filter(|k| k.starts_with(prefix)),
        );
        for key in &keys {
            self.remove(key).await;
        }
        settle(breaker.as_deref(), &Ok::<(), CacheError>(()));

        info!(prefix, count = keys.len(), "invalidated by prefix");
        Ok(keys.len())
    }

    /// Registers a storage adapter. Lower priorities are consulted first.
    pub fn register_provider(&self, name: &str, adapter: Arc<dyn StorageAdapter>, priority: i32) {
        self.orchestrator.register(name, adapter, priority);
    }

    pub fn unregister_provider(&self, name: &str) -> bool {
        self.orchestrator.unregister(name)
    }

    /// Provider names in the order reads consult them.
    pub fn provider_names(&self) -> Vec<String> {
        self.orchestrator.provider_names()
    }

    /// Collects counters from the façade, every provider and the engine.
    ///
    /// Also publishes a `stats:update` event.
    pub async fn get_stats(&self) -> ManagerStats {
        let cache = self.stats.snapshot();
        self.events.publish(CacheEvent::StatsUpdate { stats: cache });

        ManagerStats {
            cache,
            providers: self.orchestrator.get_stats().await,
            tracked_keys: self.metadata.len(),
            in_flight: self.engine.in_flight_count(),
            circuits: self
                .breakers
                .as_ref()
                .map(CircuitBreakers::states)
                .unwrap_or_default(),
        }
    }

    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.orchestrator.provider_health()
    }

    /// Zeroes provider error counts. Demoted providers keep their priority.
    pub fn reset_error_counts(&self) {
        self.orchestrator.reset_error_counts();
    }

    /// Deletes every key whose metadata says it has expired.
    ///
    /// # Returns
    ///
    /// Number of keys removed.
    pub async fn cleanup_expired(&self) -> usize {
        let expired = self.metadata.find_expired();
        for key in &expired {
            self.remove(key).await;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired keys cleaned up");
        }
        expired.len()
    }

    /// Index metadata for `key`, if tracked.
    pub fn get_metadata(&self, key: &str) -> Result<Option<EntryMetadata>> {
        self.validate(key)?;
        Ok(self.metadata.get(key))
    }

    /// Receives every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn validate(&self, key: &str) -> Result<()> {
        validate_key(key, self.config.max_key_length)
    }

    /// Rate limit, then breaker. Returns the breaker to settle once the call ends.
    async fn admit(
        &self,
        operation: &str,
        count: u32,
        key: Option<&str>,
    ) -> Result<Option<Arc<CircuitBreaker>>> {
        if let Some(limiter) = &self.limiter {
            limiter
                .check_limit(operation, count)
                .await
                .map_err(|e| self.fail(operation, key, e))?;
        }
        let Some(breakers) = &self.breakers else {
            return Ok(None);
        };
        let breaker = breakers.get(operation);
        breaker.check().map_err(|e| self.fail(operation, key, e))?;
        Ok(Some(breaker))
    }

    /// Records a failure that is about to be returned.
    fn fail(&self, operation: &str, key: Option<&str>, error: CacheError) -> CacheError {
        self.stats.record_error();
        warn!(operation, key = key.unwrap_or(""), error = %error, "cache operation failed");
        self.events.publish(CacheEvent::Error {
            key: key.map(str::to_string),
            provider: None,
            operation: operation.to_string(),
            code: error.code(),
            message: error.to_string(),
        });
        error
    }

    async fn remove(&self, key: &str) -> bool {
        let deleted = self.orchestrator.delete(key).await;
        self.metadata.delete(key);
        self.engine.forget(key);
        if deleted {
            self.stats.record_delete();
        }
        self.events.publish(CacheEvent::Delete {
            key: key.to_string(),
            deleted,
        });
        deleted
    }

    fn track(&self, key: &str, tags: &[String], size: usize, ttl: Option<Duration>) {
        let mut update = MetadataUpdate::new()
            .with_tags(tags.iter().cloned())
            .with_size(size);
        if let Some(ttl) = ttl {
            update = update.with_ttl(ttl);
        }
        self.metadata.set(key, update);
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Records the outcome of an admitted call on its breaker.
///
/// Caller mistakes and compute-function failures do not count against storage.
fn settle<T>(breaker: Option<&CircuitBreaker>, result: &Result<T>) {
    let Some(breaker) = breaker else { return };
    match result {
        Ok(_) => breaker.record_success(),
        Err(e) if e.is_validation() || e.is_admission() || e.code() == ErrorCode::ComputeError => {}
        Err(_) => breaker.record_failure(),
    }
}

fn count_of(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Builder for [`CacheManager`].
///
/// ```
/// use std::sync::Arc;
/// use cachemux::{CacheConfig, CacheManager, MemoryAdapter, MemoryAdapterConfig};
///
/// let cache = CacheManager::builder()
///     .config(CacheConfig::default().without_memory_provider())
///     .provider("l1", Arc::new(MemoryAdapter::new(MemoryAdapterConfig::default())), 0)
///     .provider("l2", Arc::new(MemoryAdapter::new(MemoryAdapterConfig::default())), 1)
///     .build()
///     .unwrap();
///
/// assert_eq!(cache.provider_names(), vec!["l1", "l2"]);
/// ```
#[derive(Default)]
pub struct CacheManagerBuilder {
    config: CacheConfig,
    providers: Vec<(String, Arc<dyn StorageAdapter>, i32)>,
}

impl CacheManagerBuilder {
    #[must_use]
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a provider, registered in call order.
    #[must_use]
    pub fn provider(mut self, name: impl Into<String>, adapter: Arc<dyn StorageAdapter>, priority: i32) -> Self {
        self.providers.push((name.into(), adapter, priority));
        self
    }

    /// Validates the config and assembles the manager.
    ///
    /// The rate limiter's sweeper is only started when called inside a tokio
    /// runtime.
    pub fn build(self) -> Result<CacheManager> {
        let config = self.config;
        config.validate()?;

        let events = EventBus::new(config.event_capacity);
        let orchestrator = Arc::new(ProviderOrchestrator::new(
            Serializer::new(config.serializer.clone()),
            events.clone(),
            OrchestratorConfig {
                error_threshold: config.error_threshold,
                circuit_breaker: config.circuit_breaker,
            },
        ));
        if config.memory_provider {
            orchestrator.register(
                DEFAULT_PROVIDER_NAME,
                Arc::new(MemoryAdapter::new(config.memory.clone())),
                0,
            );
        }
        for (name, adapter, priority) in self.providers {
            orchestrator.register(name, adapter, priority);
        }

        let metadata = Arc::new(MetadataIndex::new());
        let engine = ComputeEngine::new(
            Arc::clone(&orchestrator),
            Arc::clone(&metadata),
            events.clone(),
            config.compute.clone(),
        );

        let limiter = config
            .rate_limit
            .clone()
            .map(|rate_limit| Arc::new(RateLimiter::new(rate_limit)));
        let sweeper = match (&limiter, tokio::runtime::Handle::try_current()) {
            (Some(limiter), Ok(_)) => Some(limiter.spawn_sweeper()),
            _ => None,
        };

        info!(
            providers = orchestrator.len(),
            rate_limited = limiter.is_some(),
            circuit_breakers = config.circuit_breaker.is_some(),
            "cache manager ready"
        );

        Ok(CacheManager {
            breakers: config.circuit_breaker.map(CircuitBreakers::new),
            config,
            orchestrator,
            engine,
            metadata,
            limiter,
            events,
            stats: CacheStats::new(),
            sweeper,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_of_saturates() {
        assert_eq!(count_of(3), 3);
        assert_eq!(count_of(usize::MAX), u32::MAX);
    }

    #[test]
    fn test_settle_ignores_caller_errors() {
        let breaker = CircuitBreaker::new(
            "op",
            cachemux_core::CircuitBreakerConfig::default().with_failure_threshold(1),
        );
        settle(
            Some(&breaker),
            &Err::<(), _>(CacheError::InvalidKey("bad".into())),
        );
        settle(Some(&breaker), &Err::<(), _>(CacheError::compute("k", "boom")));
        assert_eq!(breaker.state(), CircuitState::Closed);

        settle(Some(&breaker), &Err::<(), _>(CacheError::provider("*", "down")));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_build_outside_runtime_skips_sweeper() {
        let cache = CacheManager::new(
            CacheConfig::default()
                .with_rate_limit(cachemux_core::RateLimitConfig::default()),
        )
        .unwrap();
        assert!(cache.sweeper.is_none());
        assert!(cache.rate_limiter().is_some());
        assert_eq!(cache.provider_names(), vec![DEFAULT_PROVIDER_NAME]);
    }
}
