//! # Compute Engine
//!
//! Implements get-or-compute with stale-while-revalidate semantics.
//!
//! For a key, [`ComputeEngine::get_or_compute`]:
//!
//! 1. Joins an in-flight computation for the same key if there is one, so the
//!    compute function runs at most once per key at a time.
//! 2. Otherwise looks the key up. A cached value is returned immediately, flagged
//!    `stale` when `now - refreshed_at > ttl * refresh_threshold`; a stale value
//!    also schedules a background refresh (at most one per key per cool-down).
//! 3. On a miss, runs the compute function under retry with exponential backoff,
//!    stores the result with its ttl, tags and compute bookkeeping, and returns it.
//!
//! The work for a key runs on its own tokio task. Callers that stop awaiting do not
//! cancel it; the value still lands in the cache.

use crate::adapter::WriteOptions;
use crate::error::{CacheError, Result};
use crate::events::{CacheEvent, EventBus};
use crate::metadata::{MetadataIndex, MetadataUpdate};
use crate::provider::ProviderOrchestrator;
use crate::retry::{with_retry, RetryExhausted, RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};
use crate::utils::now_millis;
use crate::value::CacheValue;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub const DEFAULT_COMPUTE_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_REFRESH_THRESHOLD: f64 = 0.75;
pub const DEFAULT_REFRESH_COOLDOWN: Duration = Duration::from_secs(60);

/// Produces a fresh value for a key. Called once per attempt.
pub type ComputeFn = Arc<dyn Fn() -> BoxFuture<'static, Result<CacheValue>> + Send + Sync>;

/// Wraps an async closure as a [`ComputeFn`].
///
/// # Examples
///
/// ```
/// use cachemux_core::compute::compute_fn;
/// use cachemux_core::CacheValue;
///
/// let f = compute_fn(|| async { Ok(CacheValue::from(42)) });
/// ```
pub fn compute_fn<F, Fut>(f: F) -> ComputeFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CacheValue>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Engine-wide defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    #[serde(rename = "ttl_ms", with = "crate::utils::duration_ms")]
    pub ttl: Duration,
    /// Fraction of the ttl after which a value counts as stale.
    pub refresh_threshold: f64,
    pub background_refresh: bool,
    pub max_retries: u32,
    #[serde(rename = "retry_delay_ms", with = "crate::utils::duration_ms")]
    pub retry_delay: Duration,
    /// Minimum time between two background refreshes of the same key.
    #[serde(rename = "refresh_cooldown_ms", with = "crate::utils::duration_ms")]
    pub refresh_cooldown: Duration,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_COMPUTE_TTL,
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
            background_refresh: true,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            refresh_cooldown: DEFAULT_REFRESH_COOLDOWN,
        }
    }
}

impl ComputeConfig {
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_threshold(mut self, threshold: f64) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    #[must_use]
    pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.refresh_cooldown = cooldown;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_ttl(self.ttl)?;
        validate_threshold(self.refresh_threshold)
    }
}

/// Per-call overrides; unset fields fall back to [`ComputeConfig`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputeOptions {
    pub ttl: Option<Duration>,
    pub refresh_threshold: Option<f64>,
    pub background_refresh: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    /// Tags recorded with the stored value.
    pub tags: Vec<String>,
}

impl ComputeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_refresh_threshold(mut self, threshold: f64) -> Self {
        self.refresh_threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn with_background_refresh(mut self, enabled: bool) -> Self {
        self.background_refresh = Some(enabled);
        self
    }

    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = Some(max_retries);
        self.retry_delay = Some(retry_delay);
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

    fn resolve(self, config: &ComputeConfig) -> Result<Resolved> {
        let resolved = Resolved {
            ttl: self.ttl.unwrap_or(config.ttl),
            refresh_threshold: self.refresh_threshold.unwrap_or(config.refresh_threshold),
            background_refresh: self.background_refresh.unwrap_or(config.background_refresh),
            retry: RetryPolicy::new(
                self.max_retries.unwrap_or(config.max_retries),
                self.retry_delay.unwrap_or(config.retry_delay),
            ),
            tags: self.tags,
        };
        validate_ttl(resolved.ttl)?;
        validate_threshold(resolved.refresh_threshold)?;
        Ok(resolved)
    }
}

#[derive(Debug, Clone)]
struct Resolved {
    ttl: Duration,
    refresh_threshold: f64,
    background_refresh: bool,
    retry: RetryPolicy,
    tags: Vec<String>,
}

/// Outcome of [`ComputeEngine::get_or_compute`].
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeResult {
    pub value: CacheValue,
    /// Duration of the computation that produced the value; zero when unknown.
    pub compute_time: Duration,
    /// True when a cached value was older than `ttl * refresh_threshold`.
    pub stale: bool,
}

/// Staleness rule: older than `ttl * threshold` since the last refresh.
///
/// Values without a refresh time are never stale.
pub fn is_stale(refreshed_at: Option<u64>, now: u64, ttl: Duration, threshold: f64) -> bool {
    match refreshed_at {
        Some(at) => {
            let age = now.saturating_sub(at) as f64;
            age > ttl.as_millis() as f64 * threshold
        }
        None => false,
    }
}

fn validate_ttl(ttl: Duration) -> Result<()> {
    if ttl.is_zero() {
        return Err(CacheError::InvalidArgument("compute ttl must be positive".into()));
    }
    Ok(())
}

fn validate_threshold(threshold: f64) -> Result<()> {
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(CacheError::InvalidArgument(format!(
            "refresh_threshold must be in (0, 1], got {threshold}"
        )));
    }
    Ok(())
}

type SharedCompute = Shared<BoxFuture<'static, Result<ComputeResult>>>;

#[derive(Debug, Clone, Copy)]
struct RefreshRecord {
    scheduled_at: Instant,
    running: bool,
}

struct EngineInner {
    orchestrator: Arc<ProviderOrchestrator>,
    metadata: Arc<MetadataIndex>,
    events: EventBus,
    config: ComputeConfig,
    in_flight: DashMap<String, SharedCompute>,
    refreshes: DashMap<String, RefreshRecord>,
}

/// Get-or-compute front end over a [`ProviderOrchestrator`].
///
/// Cloning the engine shares its in-flight and refresh state.
#[derive(Clone)]
pub struct ComputeEngine {
    inner: Arc<EngineInner>,
}

impl ComputeEngine {
    pub fn new(
        orchestrator: Arc<ProviderOrchestrator>,
        metadata: Arc<MetadataIndex>,
        events: EventBus,
        config: ComputeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                orchestrator,
                metadata,
                events,
                config,
                in_flight: DashMap::new(),
                refreshes: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.inner.config
    }

    /// Returns the cached value for `key`, computing and storing it on a miss.
    ///
    /// # Arguments
    ///
    /// * `key` - Cache key, already validated by the caller
    /// * `compute` - Produces the value; retried with backoff on failure
    /// * `options` - Per-call overrides of the engine defaults
    ///
    /// # Errors
    ///
    /// * `INVALID_ARGUMENT` for out-of-range options
    /// * `COMPUTE_ERROR` when every attempt failed; every caller joined to the same
    ///   computation receives the same error
    pub async fn get_or_compute(
        &self,
        key: &str,
        compute: ComputeFn,
        options: ComputeOptions,
    ) -> Result<ComputeResult> {
        let resolved = options.resolve(&self.inner.config)?;

        let shared = match self.inner.in_flight.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                debug!(key, "joining in-flight computation");
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                let inner = Arc::clone(&self.inner);
                let owned_key = key.to_string();
                // The task only removes its slot after this insert: the shard lock
                // is held until `slot.insert` returns.
                let task = tokio::spawn(async move {
                    let result = inner.lookup_or_compute(&owned_key, compute, resolved).await;
                    inner.in_flight.remove(&owned_key);
                    result
                });
                let joined: BoxFuture<'static, Result<ComputeResult>> = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(CacheError::Unknown(format!("computation task failed: {e}")))
                    })
                }
                .boxed();
                let shared = joined.shared();
                slot.insert(shared.clone());
                shared
            }
        };

        shared.await
    }

    /// Number of keys with a computation in flight.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// True while a background refresh for `key` is running or cooling down.
    pub fn is_refresh_scheduled(&self, key: &str) -> bool {
        let cooldown = self.inner.config.refresh_cooldown;
        self.inner
            .refreshes
            .get(key)
            .is_some_and(|r| r.running || r.scheduled_at.elapsed() < cooldown)
    }

    /// Drops refresh bookkeeping for `key`.
    pub fn forget(&self, key: &str) {
        self.inner.refreshes.remove(key);
    }

    /// Drops all refresh bookkeeping.
    pub fn forget_all(&self) {
        self.inner.refreshes.clear();
    }
}

impl EngineInner {
    async fn lookup_or_compute(
        self: &Arc<Self>,
        key: &str,
        compute: ComputeFn,
        resolved: Resolved,
    ) -> Result<ComputeResult> {
        if let Some(hit) = self.orchestrator.get(key).await {
            self.metadata.record_access(key);
            let meta = self.metadata.get(key);

            let refreshed_at = match meta.as_ref().and_then(|m| m.refreshed_at) {
                Some(at) => Some(at),
                None => match hit.entry.refreshed_at {
                    Some(at) => Some(at),
                    None => self
                        .orchestrator
                        .get_entry_metadata(key)
                        .await
                        .and_then(|m| m.refreshed_at),
                },
            };
            let compute_time = meta
                .and_then(|m| m.compute_time)
                .or(hit.entry.compute_time)
                .unwrap_or(Duration::ZERO);

            let stale = is_stale(
                refreshed_at,
                now_millis(),
                resolved.ttl,
                resolved.refresh_threshold,
            );
            if stale {
                debug!(key, provider = %hit.provider, "serving stale value");
                if resolved.background_refresh {
                    self.schedule_refresh(key, compute, resolved);
                }
            }

            return Ok(ComputeResult {
                value: hit.value,
                compute_time,
                stale,
            });
        }

        self.events.publish(CacheEvent::ComputeStart {
            key: key.to_string(),
        });
        match self.compute_and_store(key, &compute, &resolved).await {
            Ok((value, compute_time)) => {
                self.events.publish(CacheEvent::ComputeSuccess {
                    key: key.to_string(),
                    compute_time,
                });
                Ok(ComputeResult {
                    value,
                    compute_time,
                    stale: false,
                })
            }
            Err(e) => {
                warn!(key, error = %e, "computation failed");
                self.events.publish(CacheEvent::ComputeError {
                    key: key.to_string(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Runs `compute` under retry and stores the result.
    ///
    /// A storage failure after a successful computation is logged; the value is
    /// still returned.
    async fn compute_and_store(
        &self,
        key: &str,
        compute: &ComputeFn,
        resolved: &Resolved,
    ) -> Result<(CacheValue, Duration)> {
        let outcome = with_retry(&resolved.retry, "compute", || {
            let compute = Arc::clone(compute);
            async move {
                let started = Instant::now();
                let value = compute().await?;
                Ok((value, started.elapsed()))
            }
        })
        .await;

        let (value, compute_time) = outcome.map_err(|exhausted| compute_failure(key, exhausted))?;

        let refreshed_at = now_millis();
        let options = WriteOptions {
            ttl: Some(resolved.ttl),
            compute_time: Some(compute_time),
            refreshed_at: Some(refreshed_at),
        };
        match self.orchestrator.set(key, &value, &options).await {
            Ok(size) => {
                self.metadata.set(
                    key,
                    MetadataUpdate::new()
                        .with_tags(resolved.tags.iter().cloned())
                        .with_size(size)
                        .with_ttl(resolved.ttl),
                );
                self.metadata.set_compute_info(key, compute_time, refreshed_at);
            }
            Err(e) => {
                warn!(key, error = %e, "computed value could not be stored");
                self.events.publish(CacheEvent::Error {
                    key: Some(key.to_string()),
                    provider: None,
                    operation: "compute:store".to_string(),
                    code: e.code(),
                    message: e.to_string(),
                });
            }
        }

        Ok((value, compute_time))
    }

    /// Starts a background refresh unless one is running or cooling down.
    fn schedule_refresh(self: &Arc<Self>, key: &str, compute: ComputeFn, resolved: Resolved) -> bool {
        let now = Instant::now();
        let cooldown = self.config.refresh_cooldown;
        let record = RefreshRecord {
            scheduled_at: now,
            running: true,
        };

        match self.refreshes.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                let current = *existing.get();
                if current.running || now.duration_since(current.scheduled_at) < cooldown {
                    trace!(key, "refresh already scheduled");
                    return false;
                }
                existing.insert(record);
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }

        let inner = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            inner.run_refresh(&key, compute, resolved).await;
        });
        true
    }

    async fn run_refresh(&self, key: &str, compute: ComputeFn, resolved: Resolved) {
        self.events.publish(CacheEvent::RefreshStart {
            key: key.to_string(),
        });
        debug!(key, "background refresh started");

        match self.compute_and_store(key, &compute, &resolved).await {
            Ok((_, compute_time)) => {
                self.events.publish(CacheEvent::RefreshSuccess {
                    key: key.to_string(),
                    compute_time,
                });
            }
            Err(e) => {
                warn!(key, error = %e, "background refresh failed");
                self.events.publish(CacheEvent::RefreshError {
                    key: key.to_string(),
                    message: e.to_string(),
                });
            }
        }

        if let Some(mut record) = self.refreshes.get_mut(key) {
            record.running = false;
        }
    }
}

fn compute_failure(key: &str, exhausted: RetryExhausted<CacheError>) -> CacheError {
    let message = match exhausted.last_error {
        CacheError::Compute { message, .. } => message,
        other => other.to_string(),
    };
    CacheError::Compute {
        key: key.to_string(),
        attempts: exhausted.attempts,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_stale_boundary() {
        let ttl = Duration::from_secs(100);
        // 75% of 100s = 75s
        assert!(!is_stale(Some(0), 75_000, ttl, 0.75));
        assert!(is_stale(Some(0), 75_001, ttl, 0.75));
        assert!(!is_stale(None, u64::MAX, ttl, 0.75));
        // Clock going backwards is never stale
        assert!(!is_stale(Some(10_000), 5_000, ttl, 0.75));
    }

    #[test]
    fn test_options_resolve_against_config() {
        let config = ComputeConfig::default();
        let resolved = ComputeOptions::new()
            .with_ttl(Duration::from_secs(10))
            .with_tags(["a"])
            .resolve(&config)
            .unwrap();
        assert_eq!(resolved.ttl, Duration::from_secs(10));
        assert_eq!(resolved.refresh_threshold, DEFAULT_REFRESH_THRESHOLD);
        assert_eq!(resolved.retry, RetryPolicy::default());
        assert_eq!(resolved.tags, vec!["a".to_string()]);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let config = ComputeConfig::default();
        let err = ComputeOptions::new()
            .with_refresh_threshold(1.5)
            .resolve(&config)
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidArgument);

        assert!(ComputeOptions::new()
            .with_ttl(Duration::ZERO)
            .resolve(&config)
            .is_err());
    }

    #[test]
    fn test_compute_failure_rewrites_attempts() {
        let err = compute_failure(
            "k",
            RetryExhausted {
                attempts: 4,
                last_error: CacheError::compute("k", "boom"),
            },
        );
        assert_eq!(
            err,
            CacheError::Compute {
                key: "k".into(),
                attempts: 4,
                message: "boom".into()
            }
        );
    }
}
