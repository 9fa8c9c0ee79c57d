//! # Cachemux
//!
//! A multi-backend caching engine. Application code asks for a value by key,
//! optionally with a function that computes it on a miss; cachemux handles the
//! rest:
//!
//! - **Provider failover**: storage adapters are consulted in priority order and
//!   a provider that keeps failing is demoted behind the others
//! - **Get-or-compute**: concurrent requests for the same key share a single
//!   computation, retried with exponential backoff
//! - **Stale-while-revalidate**: ageing values are served immediately and
//!   refreshed in the background
//! - **Admission control**: per-operation sliding-window rate limits and circuit
//!   breakers
//! - **Type-preserving storage**: dates, regexps, sets, maps, NaN and binary data
//!   survive the round trip, with checksums and optional compression
//! - **Tag and prefix invalidation** through a metadata index
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use cachemux::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> cachemux::Result<()> {
//! let cache = CacheManager::builder()
//!     .config(CacheConfig::default().with_default_ttl(Duration::from_secs(300)))
//!     .build()?;
//!
//! cache
//!     .set("user:1", "Ada", SetOptions::new().with_tags(["users"]))
//!     .await?;
//! assert_eq!(cache.get("user:1").await?, Some(CacheValue::from("Ada")));
//!
//! // Everything tagged "users" goes at once
//! assert_eq!(cache.invalidate_by_tag("users").await?, 1);
//! assert_eq!(cache.get("user:1").await?, None);
//! # Ok(())
//! # }
//! ```
//!
//! ## Typed Values
//!
//! Any serde type can be cached with [`CacheManager::set_as`] and read back with
//! [`CacheManager::get_as`]:
//!
//! ```rust
//! use cachemux::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Profile {
//!     name: String,
//!     visits: u32,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> cachemux::Result<()> {
//! let cache = CacheManager::builder().build()?;
//! let profile = Profile { name: "Ada".into(), visits: 3 };
//!
//! cache.set_as("profile:1", &profile, SetOptions::new()).await?;
//! assert_eq!(cache.get_as::<Profile>("profile:1").await?, Some(profile));
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Providers
//!
//! Backends implement [`StorageAdapter`] and are registered with a priority;
//! lower priorities are read first. See [`MemoryAdapter`] for a complete
//! implementation.

mod config;
mod manager;

pub use config::{CacheConfig, DEFAULT_PROVIDER_NAME};
pub use manager::{CacheManager, CacheManagerBuilder, ManagerStats, SetOptions};

pub use cachemux_core::{
    async_trait, AdapterCapabilities, AdapterMetadata, AdapterStats, CacheError, CacheEvent,
    CacheStats, CacheValue, CircuitBreakerConfig, CircuitState, CompressionConfig,
    ComputeConfig, ComputeOptions, ComputeResult, EntryMetadata, ErrorCode, EvictionPolicy,
    HealthReport, HealthStatus, MemoryAdapter, MemoryAdapterConfig, ProviderHealth,
    ProviderStats, RateLimitConfig, RateLimitPolicy, RateLimitRule, Result, SerializerConfig,
    StatsSnapshot, StorageAdapter, StoredEntry, WriteOptions,
};

/// The types most applications need.
pub mod prelude {
    pub use crate::{
        CacheConfig, CacheError, CacheManager, CacheValue, ComputeOptions, ErrorCode,
        SetOptions, StorageAdapter,
    };
}
