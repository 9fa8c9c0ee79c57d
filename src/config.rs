//! Settings for [`CacheManager`](crate::CacheManager).
//!
//! Every section deserializes with defaults, so a config file only needs the
//! values it changes:
//!
//! ```
//! use cachemux::CacheConfig;
//!
//! let config: CacheConfig = serde_json::from_str(r#"{
//!     "default_ttl_ms": 60000,
//!     "compute": { "refresh_threshold": 0.5 },
//!     "rate_limit": { "default_rule": { "max_requests": 100, "window_ms": 1000 } }
//! }"#).unwrap();
//!
//! assert_eq!(config.compute.refresh_threshold, 0.5);
//! assert!(config.validate().is_ok());
//! ```

use cachemux_core::circuit_breaker::CircuitBreakerConfig;
use cachemux_core::compute::ComputeConfig;
use cachemux_core::events::DEFAULT_EVENT_CAPACITY;
use cachemux_core::memory::MemoryAdapterConfig;
use cachemux_core::provider::DEFAULT_ERROR_THRESHOLD;
use cachemux_core::rate_limiter::RateLimitConfig;
use cachemux_core::serialization::SerializerConfig;
use cachemux_core::utils::DEFAULT_MAX_KEY_LENGTH;
use cachemux_core::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name under which the built-in memory provider is registered.
pub const DEFAULT_PROVIDER_NAME: &str = "memory";

/// Top-level cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Longest accepted key, in bytes.
    pub max_key_length: usize,
    /// TTL applied by `set` when the caller gives none; `None` keeps entries forever.
    #[serde(
        rename = "default_ttl_ms",
        with = "cachemux_core::utils::option_duration_ms"
    )]
    pub default_ttl: Option<Duration>,
    pub compute: ComputeConfig,
    pub serializer: SerializerConfig,
    /// Admission control; `None` disables rate limiting.
    pub rate_limit: Option<RateLimitConfig>,
    /// Per-operation and per-provider breakers; `None` disables them.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Provider errors tolerated before demotion.
    pub error_threshold: u32,
    pub event_capacity: usize,
    /// Register a [`MemoryAdapter`](cachemux_core::MemoryAdapter) at priority 0.
    pub memory_provider: bool,
    pub memory: MemoryAdapterConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_key_length: DEFAULT_MAX_KEY_LENGTH,
            default_ttl: None,
            compute: ComputeConfig::default(),
            serializer: SerializerConfig::default(),
            rate_limit: None,
            circuit_breaker: None,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            memory_provider: true,
            memory: MemoryAdapterConfig::default(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn with_max_key_length(mut self, len: usize) -> Self {
        self.max_key_length = len;
        self
    }

    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_compute(mut self, compute: ComputeConfig) -> Self {
        self.compute = compute;
        self
    }

    #[must_use]
    pub fn with_serializer(mut self, serializer: SerializerConfig) -> Self {
        self.serializer = serializer;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    #[must_use]
    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Skips registration of the built-in memory provider.
    #[must_use]
    pub fn without_memory_provider(mut self) -> Self {
        self.memory_provider = false;
        self
    }

    #[must_use]
    pub fn with_memory(mut self, memory: MemoryAdapterConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Rejects settings no cache can run with.
    ///
    /// # Errors
    ///
    /// `INVALID_ARGUMENT` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_key_length == 0 {
            return Err(CacheError::InvalidArgument(
                "max_key_length must be positive".into(),
            ));
        }
        if self.default_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(CacheError::InvalidArgument(
                "default_ttl must be positive when set".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(CacheError::InvalidArgument(
                "event_capacity must be positive".into(),
            ));
        }
        if self.memory.max_entries == Some(0) {
            return Err(CacheError::InvalidArgument(
                "memory.max_entries must be positive when set".into(),
            ));
        }
        self.compute.validate()?;
        self.serializer.compression.validate()?;
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        Ok(())
    }
}
