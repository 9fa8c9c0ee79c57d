//! # Cachemux Core
//!
//! Building blocks of the cachemux caching engine.
//!
//! ## Module Organization
//!
//! - [`value`] - Dynamic [`CacheValue`] preserving dates, regexps, sets, maps and bytes
//! - [`serialization`] - Type-tagged encoding with checksums and optional compression
//! - [`compression`] - LZ4 and gzip with size threshold and ratio guard
//! - [`adapter`] - The [`StorageAdapter`] trait every backend implements
//! - [`memory`] - In-process adapter with FIFO, LRU, LFU or random eviction
//! - [`provider`] - Priority-ordered orchestration across adapters with failover
//! - [`compute`] - Get-or-compute with deduplication and stale-while-revalidate
//! - [`metadata`] - Tag and prefix index over stored keys
//! - [`rate_limiter`] - Sliding-window limiter with reject, burst and queue modes
//! - [`circuit_breaker`] - Per-provider closed/open/half-open breakers
//! - [`retry`] - Exponential backoff around fallible async work
//! - [`events`] - Broadcast event bus
//! - [`stats`] - Lock-free hit/miss counters
//! - [`error`] - [`CacheError`] and its stable [`ErrorCode`]s
//!
//! Most applications use the `cachemux` crate, which assembles these pieces behind
//! a single manager.

pub mod adapter;
pub mod circuit_breaker;
pub mod compression;
pub mod compute;
pub mod error;
pub mod events;
pub mod eviction_policy;
pub mod memory;
pub mod metadata;
pub mod provider;
pub mod rate_limiter;
pub mod retry;
pub mod serialization;
pub mod stats;
pub mod utils;
pub mod value;

pub use adapter::{
    AdapterCapabilities, AdapterMetadata, AdapterStats, HealthReport, HealthStatus,
    StorageAdapter, StoredEntry, WriteOptions,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakers, CircuitState};
pub use compression::{AlgorithmChoice, CompressionAlgorithm, CompressionConfig, Compressor};
pub use compute::{compute_fn, ComputeConfig, ComputeEngine, ComputeFn, ComputeOptions, ComputeResult};
pub use error::{CacheError, ErrorCode, Result};
pub use events::{CacheEvent, EventBus};
pub use eviction_policy::EvictionPolicy;
pub use memory::{MemoryAdapter, MemoryAdapterConfig};
pub use metadata::{EntryMetadata, MetadataIndex, MetadataUpdate};
pub use provider::{
    Lookup, OrchestratorConfig, ProviderHealth, ProviderOrchestrator, ProviderStats,
};
pub use rate_limiter::{RateLimitConfig, RateLimitPolicy, RateLimitRule, RateLimiter};
pub use retry::{with_retry, RetryExhausted, RetryPolicy};
pub use serialization::{Payload, PayloadMetadata, Serializer, SerializerConfig};
pub use stats::{CacheStats, StatsSnapshot};
pub use value::CacheValue;

/// Re-exported so adapter implementations need no direct dependency.
pub use async_trait::async_trait;
