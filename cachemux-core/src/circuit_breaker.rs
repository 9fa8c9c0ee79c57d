//! Circuit breaker for automatic failure protection.
//!
//! A breaker counts consecutive failures. Once the count reaches the threshold the
//! breaker opens and every call fails fast with `CIRCUIT_OPEN` until the reset
//! timeout elapses. The next call is then let through as a probe (half-open): a
//! success closes the breaker, a failure opens it again.

use crate::error::{CacheError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MONITOR_WINDOW: Duration = Duration::from_secs(60);

/// Breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed.
    #[serde(rename = "reset_timeout_ms", with = "crate::utils::duration_ms")]
    pub reset_timeout: Duration,
    /// Failures older than this no longer count toward the threshold.
    #[serde(rename = "monitor_window_ms", with = "crate::utils::duration_ms")]
    pub monitor_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            monitor_window: DEFAULT_MONITOR_WINDOW,
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_monitor_window(mut self, window: Duration) -> Self {
        self.monitor_window = window;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(CacheError::InvalidArgument(
                "circuit breaker failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Requests are allowed.
    Closed,
    /// Requests are rejected.
    Open,
    /// A probe request is allowed to test recovery.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
}

/// A single named breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                window_start: None,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Checks if a request is allowed.
    ///
    /// Moves an open breaker to half-open once the reset timeout has elapsed.
    ///
    /// # Errors
    ///
    /// `CIRCUIT_OPEN` with the remaining cool-down while open.
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.reset_timeout);
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    debug!(breaker = %self.name, "circuit half-open");
                    Ok(())
                } else {
                    Err(CacheError::CircuitOpen {
                        name: self.name.clone(),
                        retry_in: self.config.reset_timeout - elapsed,
                    })
                }
            }
        }
    }

    /// True while open and still cooling down.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|at| at.elapsed() < self.config.reset_timeout)
    }

    /// Records a successful request.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failures = 0;
        inner.window_start = None;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            debug!(breaker = %self.name, "circuit closed");
        }
    }

    /// Records a failed request.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                let window_expired = inner
                    .window_start
                    .map_or(true, |start| now.duration_since(start) > self.config.monitor_window);
                if window_expired {
                    inner.failures = 0;
                    inner.window_start = Some(now);
                }
                inner.failures = inner.failures.saturating_add(1);
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        "circuit opened"
                    );
                }
            }
        }
    }

    /// Runs `operation` under this breaker: check, await, record.
    pub async fn execute<F, T>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        match operation.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Forces the breaker closed with a zero count.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.window_start = None;
        inner.opened_at = None;
    }
}

/// Registry handing out one breaker per name.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Returns the breaker for `name`, creating it on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config)))
                .value(),
        )
    }

    /// Breaker for `name` if one was created.
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    pub fn remove(&self, name: &str) {
        self.breakers.remove(name);
    }

    /// Current state of every breaker, by name.
    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|b| (b.key().clone(), b.value().state()))
            .collect()
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.value().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_reset_timeout(Duration::from_secs(30)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(3);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check().is_ok());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());

        let err = cb.check().unwrap_err();
        assert_eq!(err.code(), ErrorCode::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let cb = breaker(3);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_closes_on_success() {
        let cb = breaker(1);
        cb.record_failure();
        assert!(cb.check().is_err());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!cb.is_open());
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_failure_reopens() {
        let cb = breaker(1);
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(31)).await;
        cb.check().unwrap();

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_window_restarts_count() {
        let cb = CircuitBreaker::new(
            "windowed",
            CircuitBreakerConfig::default()
                .with_failure_threshold(2)
                .with_monitor_window(Duration::from_secs(10)),
        );
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        cb.record_failure();
        assert_eq!(cb.failure_count(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_records_outcome() {
        let cb = breaker(1);
        let ok: Result<i32> = cb.execute(async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);

        let err: Result<i32> = cb
            .execute(async { Err(CacheError::Unknown("boom".into())) })
            .await;
        assert!(err.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        // Fails fast without running the operation
        let ran = std::sync::atomic::AtomicBool::new(false);
        let fast: Result<i32> = cb
            .execute(async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(2)
            })
            .await;
        assert_eq!(fast.unwrap_err().code(), ErrorCode::CircuitOpen);
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_registry_reuses_breakers() {
        let registry = CircuitBreakers::new(CircuitBreakerConfig::default());
        let a = registry.get("get");
        let b = registry.get("get");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.find("set").is_none());
        assert_eq!(registry.states().get("get"), Some(&CircuitState::Closed));

        a.reset();
        registry.reset_all();
        registry.remove("get");
        assert!(registry.find("get").is_none());
    }
}
