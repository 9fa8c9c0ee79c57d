//! # Storage Adapter Interface
//!
//! A storage adapter is any backend that can hold encoded cache entries: process
//! memory, browser storage, Redis, a file. The engine talks to every backend
//! through [`StorageAdapter`] and never depends on a concrete implementation.
//!
//! Adapters only store bytes. Serialization, fallback across providers, staleness,
//! and retries all live above this layer; an adapter should do exactly what it is
//! told and report failures as `Err`.
//!
//! ## Optional features
//!
//! Batch operations and `has` have default implementations built on the single-key
//! methods. Adapters that can do better override them. Adapters that can answer
//! [`get_metadata`](StorageAdapter::get_metadata) advertise it through
//! [`AdapterCapabilities::metadata`].
//!
//! # Examples
//!
//! ```
//! use cachemux_core::adapter::{StorageAdapter, StoredEntry, WriteOptions};
//! use cachemux_core::{MemoryAdapter, Serializer, CacheValue};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let adapter = MemoryAdapter::default();
//! let payload = Serializer::default().serialize(&CacheValue::from("hello")).unwrap();
//!
//! adapter
//!     .set("greeting", StoredEntry::new(payload, &WriteOptions::default()))
//!     .await
//!     .unwrap();
//! assert!(adapter.has("greeting").await.unwrap());
//! # });
//! ```

use crate::error::Result;
use crate::serialization::Payload;
use crate::stats::StatsSnapshot;
use crate::utils::now_millis;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// An encoded value plus the bookkeeping stored next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub payload: Payload,
    /// Unix milliseconds of the write.
    pub created_at: u64,
    /// Unix milliseconds after which the entry must not be returned.
    pub expires_at: Option<u64>,
    /// Unix milliseconds of the computation that produced the value.
    pub refreshed_at: Option<u64>,
    pub compute_time: Option<Duration>,
}

impl StoredEntry {
    /// Builds an entry written now with the given options.
    pub fn new(payload: Payload, options: &WriteOptions) -> Self {
        let created_at = now_millis();
        let expires_at = options
            .ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| created_at.saturating_add(ttl.as_millis() as u64));
        Self {
            payload,
            created_at,
            expires_at,
            refreshed_at: options.refreshed_at,
            compute_time: options.compute_time,
        }
    }

    /// True when an expiry is set and has passed at `now` (Unix milliseconds).
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Stored size in bytes.
    pub fn size(&self) -> usize {
        self.payload.data.len()
    }

    /// Metadata view of this entry.
    pub fn metadata(&self) -> AdapterMetadata {
        AdapterMetadata {
            created_at: self.created_at,
            expires_at: self.expires_at,
            refreshed_at: self.refreshed_at,
            compute_time: self.compute_time,
            size: self.size(),
            is_compressed: self.payload.metadata.is_compressed,
            checksum: self.payload.metadata.checksum.clone(),
        }
    }
}

/// Per-write options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Time to live; `None` or zero means no expiry.
    pub ttl: Option<Duration>,
    pub compute_time: Option<Duration>,
    pub refreshed_at: Option<u64>,
}

impl WriteOptions {
    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }
}

/// What an adapter knows about a stored entry without decoding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterMetadata {
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub refreshed_at: Option<u64>,
    pub compute_time: Option<Duration>,
    pub size: usize,
    pub is_compressed: bool,
    pub checksum: Option<String>,
}

/// Optional features an adapter supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    /// [`StorageAdapter::get_metadata`] returns real data.
    pub metadata: bool,
    /// The backend expires entries itself.
    pub native_ttl: bool,
}

/// Counters reported by an adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterStats {
    pub entries: usize,
    /// Sum of stored sizes in bytes, when known.
    pub size_bytes: usize,
    pub evictions: u64,
    pub counters: StatsSnapshot,
}

/// Three-level health classification shared by adapters and providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

/// Result of [`StorageAdapter::health_check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub healthy: bool,
    /// Unix milliseconds of the check.
    pub timestamp: u64,
    pub message: Option<String>,
}

impl HealthReport {
    pub fn new(status: HealthStatus, message: Option<String>) -> Self {
        Self {
            status,
            healthy: status.is_healthy(),
            timestamp: now_millis(),
            message,
        }
    }

    pub fn healthy() -> Self {
        Self::new(HealthStatus::Healthy, None)
    }
}

/// Uniform contract for a storage backend.
///
/// Implementations must be safe to share across tasks (`Send + Sync`) since the
/// orchestrator calls them concurrently.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Returns the entry for `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>>;

    /// Stores `entry` under `key`, replacing any previous entry.
    ///
    /// Expiry is carried by [`StoredEntry::expires_at`].
    async fn set(&self, key: &str, entry: StoredEntry) -> Result<()>;

    /// Removes `key`. Returns `true` if something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Removes every entry.
    async fn clear(&self) -> Result<()>;

    /// Keys currently stored, optionally filtered by a `*`/`?` glob.
    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>>;

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Batched read. The result holds one slot per requested key.
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Option<StoredEntry>>> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            out.insert(key.clone(), self.get(key).await?);
        }
        Ok(out)
    }

    /// Batched write.
    async fn set_many(&self, entries: Vec<(String, StoredEntry)>) -> Result<()> {
        for (key, entry) in entries {
            self.set(&key, entry).await?;
        }
        Ok(())
    }

    async fn get_stats(&self) -> Result<AdapterStats> {
        Ok(AdapterStats {
            entries: self.keys(None).await?.len(),
            ..AdapterStats::default()
        })
    }

    /// Entry bookkeeping without the payload.
    ///
    /// Only meaningful when [`capabilities`](Self::capabilities) reports `metadata`.
    async fn get_metadata(&self, _key: &str) -> Result<Option<AdapterMetadata>> {
        Ok(None)
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    async fn health_check(&self) -> HealthReport {
        match self.keys(None).await {
            Ok(_) => HealthReport::healthy(),
            Err(e) => HealthReport::new(HealthStatus::Unhealthy, Some(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::Serializer;
    use crate::value::CacheValue;

    fn payload() -> Payload {
        Serializer::default()
            .serialize(&CacheValue::from("v"))
            .unwrap()
    }

    #[test]
    fn test_entry_expiry_from_ttl() {
        let entry = StoredEntry::new(
            payload(),
            &WriteOptions::with_ttl(Some(Duration::from_secs(10))),
        );
        assert_eq!(entry.expires_at, Some(entry.created_at + 10_000));
        assert!(!entry.is_expired());
        assert!(entry.is_expired_at(entry.created_at + 10_000));
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let entry = StoredEntry::new(payload(), &WriteOptions::with_ttl(Some(Duration::ZERO)));
        assert!(entry.expires_at.is_none());
        assert!(!entry.is_expired_at(u64::MAX));
    }

    #[test]
    fn test_metadata_view() {
        let options = WriteOptions {
            ttl: None,
            compute_time: Some(Duration::from_millis(12)),
            refreshed_at: Some(99),
        };
        let entry = StoredEntry::new(payload(), &options);
        let meta = entry.metadata();
        assert_eq!(meta.refreshed_at, Some(99));
        assert_eq!(meta.compute_time, Some(Duration::from_millis(12)));
        assert_eq!(meta.size, entry.size());
        assert!(meta.checksum.is_some());
    }

    #[test]
    fn test_health_report() {
        let report = HealthReport::new(HealthStatus::Degraded, None);
        assert!(!report.healthy);
        assert!(HealthReport::healthy().healthy);
    }
}
