//! Sliding-window rate limiter.
//!
//! Each operation name owns a window of `{timestamp, count}` samples. A call is
//! admitted when the usage inside `[now - window, now]` plus its count stays within
//! the rule's ceiling. What happens otherwise depends on the rule's policy:
//!
//! | Policy | Ceiling       | Over the ceiling                                 |
//! |--------|---------------|--------------------------------------------------|
//! | Reject | `max`         | `RATE_LIMIT_EXCEEDED`                            |
//! | Burst  | `2 × max`     | `RATE_LIMIT_EXCEEDED`                            |
//! | Queue  | `max`         | wait in arrival order, `TIMEOUT` after 5 s       |
//!
//! A queue that already holds `queue_size` waiters rejects new callers with
//! `RATE_LIMIT_EXCEEDED`. Old samples are pruned lazily on every check and by a
//! periodic sweep (see [`RateLimiter::spawn_sweeper`]).

use crate::error::{CacheError, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};

pub const DEFAULT_MAX_REQUESTS: u32 = 1000;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Multiplier applied to `max_requests` in burst mode.
pub const BURST_MULTIPLIER: u32 = 2;

const MIN_QUEUE_POLL: Duration = Duration::from_millis(1);

/// What to do with a call that does not fit in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RateLimitPolicy {
    Reject,
    /// Allow up to twice the limit.
    Burst,
    /// Wait for capacity, at most `queue_size` waiters.
    Queue { queue_size: usize },
}

/// Limit for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitRule {
    pub max_requests: u32,
    #[serde(rename = "window_ms", with = "crate::utils::duration_ms")]
    pub window: Duration,
    pub policy: RateLimitPolicy,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
            policy: RateLimitPolicy::Reject,
        }
    }
}

impl RateLimitRule {
    pub fn new(max_requests: u32, window: Duration, policy: RateLimitPolicy) -> Self {
        Self {
            max_requests,
            window,
            policy,
        }
    }

    /// Largest usage the window may reach.
    pub fn ceiling(&self) -> u32 {
        match self.policy {
            RateLimitPolicy::Burst => self.max_requests.saturating_mul(BURST_MULTIPLIER),
            RateLimitPolicy::Reject | RateLimitPolicy::Queue { .. } => self.max_requests,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(CacheError::InvalidArgument(
                "rate limit max_requests must be at least 1".into(),
            ));
        }
        if self.window.is_zero() {
            return Err(CacheError::InvalidArgument(
                "rate limit window must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Limiter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Rule for operations without their own entry in `rules`.
    pub default_rule: RateLimitRule,
    /// Per-operation rules.
    pub rules: HashMap<String, RateLimitRule>,
    #[serde(rename = "queue_timeout_ms", with = "crate::utils::duration_ms")]
    pub queue_timeout: Duration,
    #[serde(rename = "sweep_interval_ms", with = "crate::utils::duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_rule: RateLimitRule::default(),
            rules: HashMap::new(),
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn with_default_rule(mut self, rule: RateLimitRule) -> Self {
        self.default_rule = rule;
        self
    }

    #[must_use]
    pub fn with_rule(mut self, operation: impl Into<String>, rule: RateLimitRule) -> Self {
        self.rules.insert(operation.into(), rule);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.default_rule.validate()?;
        for rule in self.rules.values() {
            rule.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    count: u32,
}

#[derive(Debug, Default)]
struct WaitQueue {
    /// FIFO turnstile; tokio's mutex grants the lock in request order
    turn: tokio::sync::Mutex<()>,
    waiting: AtomicUsize,
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-operation admission control.
#[derive(Debug)]
pub struct RateLimiter {
    default_rule: RwLock<RateLimitRule>,
    rules: RwLock<HashMap<String, RateLimitRule>>,
    windows: Mutex<HashMap<String, VecDeque<Sample>>>,
    queues: DashMap<String, Arc<WaitQueue>>,
    queue_timeout: Duration,
    sweep_interval: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            default_rule: RwLock::new(config.default_rule),
            rules: RwLock::new(config.rules),
            windows: Mutex::new(HashMap::new()),
            queues: DashMap::new(),
            queue_timeout: config.queue_timeout,
            sweep_interval: config.sweep_interval,
        }
    }

    /// Installs or replaces the rule for `operation`.
    pub fn configure(&self, operation: impl Into<String>, rule: RateLimitRule) {
        self.rules.write().insert(operation.into(), rule);
    }

    pub fn set_default_rule(&self, rule: RateLimitRule) {
        *self.default_rule.write() = rule;
    }

    /// Rule applied to `operation`.
    pub fn rule_for(&self, operation: &str) -> RateLimitRule {
        self.rules
            .read()
            .get(operation)
            .copied()
            .unwrap_or_else(|| *self.default_rule.read())
    }

    /// Admits `count` units of `operation`, waiting in queue mode.
    ///
    /// # Errors
    ///
    /// * `RATE_LIMIT_EXCEEDED` when the call does not fit (reject/burst), the
    ///   queue is full, or `count` exceeds the rule's ceiling outright
    /// * `TIMEOUT` when a queued call waited longer than the queue timeout
    pub async fn check_limit(&self, operation: &str, count: u32) -> Result<()> {
        let rule = self.rule_for(operation);
        let exceeded = || CacheError::RateLimitExceeded {
            operation: operation.to_string(),
            limit: rule.ceiling(),
            window: rule.window,
        };

        if count > rule.ceiling() {
            return Err(exceeded());
        }

        match rule.policy {
            RateLimitPolicy::Reject | RateLimitPolicy::Burst => {
                if self.try_acquire(operation, &rule, count) {
                    Ok(())
                } else {
                    debug!(operation, count, limit = rule.ceiling(), "rate limit exceeded");
                    Err(exceeded())
                }
            }
            RateLimitPolicy::Queue { queue_size } => {
                let queue = self.queue_for(operation);

                // Nobody waiting: take capacity directly if there is some
                if queue.waiting.load(Ordering::SeqCst) == 0
                    && self.try_acquire(operation, &rule, count)
                {
                    return Ok(());
                }

                if queue.waiting.fetch_add(1, Ordering::SeqCst) >= queue_size {
                    queue.waiting.fetch_sub(1, Ordering::SeqCst);
                    debug!(operation, queue_size, "rate limit queue full");
                    return Err(exceeded());
                }
                let _waiting = WaitingGuard(&queue.waiting);

                trace!(operation, count, "queued for rate limit capacity");
                let wait = async {
                    let _turn = queue.turn.lock().await;
                    loop {
                        if self.try_acquire(operation, &rule, count) {
                            return;
                        }
                        sleep(self.time_until_capacity(operation, &rule, count)).await;
                    }
                };

                timeout(self.queue_timeout, wait)
                    .await
                    .map_err(|_| CacheError::Timeout {
                        operation: operation.to_string(),
                        after: self.queue_timeout,
                    })
            }
        }
    }

    /// Usage inside the current window.
    pub fn current_usage(&self, operation: &str) -> u32 {
        let rule = self.rule_for(operation);
        let now = Instant::now();
        let mut windows = self.windows.lock();
        match windows.get_mut(operation) {
            Some(samples) => {
                prune(samples, now, rule.window);
                usage(samples)
            }
            None => 0,
        }
    }

    /// Clears the window of one operation, or of all operations.
    pub fn reset(&self, operation: Option<&str>) {
        let mut windows = self.windows.lock();
        match operation {
            Some(op) => {
                windows.remove(op);
            }
            None => windows.clear(),
        }
    }

    /// Prunes samples outside their windows and drops empty windows.
    ///
    /// # Returns
    ///
    /// Number of samples removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let rules = self.rules.read().clone();
        let default_rule = *self.default_rule.read();

        let mut windows = self.windows.lock();
        let mut removed = 0;
        windows.retain(|op, samples| {
            let window = rules.get(op).unwrap_or(&default_rule).window;
            let before = samples.len();
            prune(samples, now, window);
            removed += before - samples.len();
            !samples.is_empty()
        });
        removed
    }

    /// Starts the periodic sweep.
    ///
    /// The task holds a weak reference and ends once the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let removed = limiter.sweep();
                if removed > 0 {
                    trace!(removed, "rate limiter sweep");
                }
            }
        })
    }

    fn queue_for(&self, operation: &str) -> Arc<WaitQueue> {
        Arc::clone(
            self.queues
                .entry(operation.to_string())
                .or_default()
                .value(),
        )
    }

    fn try_acquire(&self, operation: &str, rule: &RateLimitRule, count: u32) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let samples = windows.entry(operation.to_string()).or_default();
        prune(samples, now, rule.window);
        if usage(samples).saturating_add(count) <= rule.ceiling() {
            samples.push_back(Sample { at: now, count });
            true
        } else {
            false
        }
    }

    /// How long until enough old samples leave the window for `count` to fit.
    fn time_until_capacity(&self, operation: &str, rule: &RateLimitRule, count: u32) -> Duration {
        let now = Instant::now();
        let windows = self.windows.lock();
        let Some(samples) = windows.get(operation) else {
            return MIN_QUEUE_POLL;
        };

        let mut used = usage(samples);
        for sample in samples {
            if used.saturating_add(count) <= rule.ceiling() {
                break;
            }
            used = used.saturating_sub(sample.count);
            let leaves_at = sample.at + rule.window;
            if used.saturating_add(count) <= rule.ceiling() {
                return leaves_at
                    .saturating_duration_since(now)
                    .max(MIN_QUEUE_POLL);
            }
        }
        MIN_QUEUE_POLL
    }
}

fn prune(samples: &mut VecDeque<Sample>, now: Instant, window: Duration) {
    while let Some(front) = samples.front() {
        if front.at + window < now {
            samples.pop_front();
        } else {
            break;
        }
    }
}

fn usage(samples: &VecDeque<Sample>) -> u32 {
    samples.iter().fold(0u32, |acc, s| acc.saturating_add(s.count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    fn limiter(rule: RateLimitRule) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default().with_default_rule(rule))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_policy() {
        let rl = limiter(RateLimitRule::new(3, Duration::from_secs(1), RateLimitPolicy::Reject));
        for _ in 0..3 {
            rl.check_limit("get", 1).await.unwrap();
        }
        let err = rl.check_limit("get", 1).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimitExceeded);
        assert_eq!(rl.current_usage("get"), 3);

        // Operations are limited independently
        rl.check_limit("set", 1).await.unwrap();

        // Capacity returns once the window has passed
        tokio::time::advance(Duration::from_millis(1001)).await;
        rl.check_limit("get", 1).await.unwrap();
        assert_eq!(rl.current_usage("get"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_allows_twice_the_limit() {
        let rl = limiter(RateLimitRule::new(2, Duration::from_secs(1), RateLimitPolicy::Burst));
        for _ in 0..4 {
            rl.check_limit("get", 1).await.unwrap();
        }
        assert!(rl.check_limit("get", 1).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_above_ceiling_is_rejected() {
        let rl = limiter(RateLimitRule::new(
            5,
            Duration::from_secs(1),
            RateLimitPolicy::Queue { queue_size: 10 },
        ));
        let err = rl.check_limit("bulk", 6).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimitExceeded);
        assert_eq!(rl.current_usage("bulk"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_waits_for_capacity() {
        let rl = Arc::new(limiter(RateLimitRule::new(
            1,
            Duration::from_secs(1),
            RateLimitPolicy::Queue { queue_size: 4 },
        )));
        rl.check_limit("get", 1).await.unwrap();

        let started = Instant::now();
        rl.check_limit("get", 1).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_times_out() {
        let rl = limiter(RateLimitRule::new(
            1,
            Duration::from_secs(60),
            RateLimitPolicy::Queue { queue_size: 4 },
        ));
        rl.check_limit("get", 1).await.unwrap();

        let err = rl.check_limit("get", 1).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_rejects() {
        let rl = Arc::new(limiter(RateLimitRule::new(
            1,
            Duration::from_secs(60),
            RateLimitPolicy::Queue { queue_size: 1 },
        )));
        rl.check_limit("get", 1).await.unwrap();

        let waiter = {
            let rl = Arc::clone(&rl);
            tokio::spawn(async move { rl.check_limit("get", 1).await })
        };
        // Let the waiter enqueue
        tokio::task::yield_now().await;

        let err = rl.check_limit("get", 1).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimitExceeded);

        let waited = waiter.await.unwrap().unwrap_err();
        assert_eq!(waited.code(), ErrorCode::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_overrides_default() {
        let rl = RateLimiter::default();
        rl.configure("set", RateLimitRule::new(1, Duration::from_secs(1), RateLimitPolicy::Reject));
        rl.check_limit("set", 1).await.unwrap();
        assert!(rl.check_limit("set", 1).await.is_err());
        // Default rule still governs other operations
        rl.check_limit("get", 1).await.unwrap();
        rl.check_limit("get", 1).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_and_reset() {
        let rl = limiter(RateLimitRule::new(10, Duration::from_secs(1), RateLimitPolicy::Reject));
        rl.check_limit("a", 2).await.unwrap();
        rl.check_limit("b", 3).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(rl.sweep(), 2);

        rl.check_limit("a", 1).await.unwrap();
        rl.reset(Some("a"));
        assert_eq!(rl.current_usage("a"), 0);
        rl.check_limit("b", 1).await.unwrap();
        rl.reset(None);
        assert_eq!(rl.current_usage("b"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_when_dropped() {
        let rl = Arc::new(RateLimiter::new(RateLimitConfig {
            sweep_interval: Duration::from_millis(10),
            ..RateLimitConfig::default()
        }));
        let handle = rl.spawn_sweeper();
        drop(rl);
        tokio::time::advance(Duration::from_millis(50)).await;
        handle.await.unwrap();
    }

    #[test]
    fn test_rule_validation() {
        assert!(RateLimitRule::default().validate().is_ok());
        assert!(RateLimitRule::new(0, Duration::from_secs(1), RateLimitPolicy::Reject)
            .validate()
            .is_err());
        assert_eq!(
            RateLimitRule::new(10, Duration::from_secs(1), RateLimitPolicy::Burst).ceiling(),
            20
        );
    }
}
