//! # Diagnostic Events
//!
//! Every cache operation publishes a [`CacheEvent`] on a tokio broadcast channel.
//! The channel is a side channel for observability only:
//!
//! - Publishing never fails and never blocks; with no subscribers the event is dropped
//! - A subscriber that falls behind by more than the channel capacity misses events
//!   (it sees `RecvError::Lagged`)
//!
//! # Examples
//!
//! ```
//! use cachemux_core::events::{CacheEvent, EventBus};
//!
//! # tokio_test_block_on(async {
//! let bus = EventBus::new(16);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(CacheEvent::GetMiss { key: "user:1".into() });
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.event_type(), "get:miss");
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use crate::error::ErrorCode;
use crate::stats::StatsSnapshot;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

/// Default broadcast channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Closed set of diagnostic events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    /// A read started.
    Get { key: String },
    /// A read found a value.
    GetHit {
        key: String,
        /// Provider that served the value, when known.
        provider: Option<String>,
    },
    /// A read found nothing.
    GetMiss { key: String },
    Set {
        key: String,
        ttl: Option<Duration>,
        tags: Vec<String>,
    },
    Delete { key: String, deleted: bool },
    Clear,
    /// A failure that was handled (logged) rather than returned.
    Error {
        key: Option<String>,
        provider: Option<String>,
        operation: String,
        code: ErrorCode,
        message: String,
    },
    ComputeStart { key: String },
    ComputeSuccess { key: String, compute_time: Duration },
    ComputeError { key: String, message: String },
    RefreshStart { key: String },
    RefreshSuccess { key: String, compute_time: Duration },
    RefreshError { key: String, message: String },
    StatsUpdate { stats: StatsSnapshot },
    ProviderInitialized { provider: String, priority: i32 },
}

impl CacheEvent {
    /// Event name as used in logs, e.g. `"get:hit"`.
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::Get { .. } => "get",
            CacheEvent::GetHit { .. } => "get:hit",
            CacheEvent::GetMiss { .. } => "get:miss",
            CacheEvent::Set { .. } => "set",
            CacheEvent::Delete { .. } => "delete",
            CacheEvent::Clear => "clear",
            CacheEvent::Error { .. } => "error",
            CacheEvent::ComputeStart { .. } => "compute:start",
            CacheEvent::ComputeSuccess { .. } => "compute:success",
            CacheEvent::ComputeError { .. } => "compute:error",
            CacheEvent::RefreshStart { .. } => "refresh:start",
            CacheEvent::RefreshSuccess { .. } => "refresh:success",
            CacheEvent::RefreshError { .. } => "refresh:error",
            CacheEvent::StatsUpdate { .. } => "stats:update",
            CacheEvent::ProviderInitialized { .. } => "provider:initialized",
        }
    }

    /// Key the event is about, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::Get { key }
            | CacheEvent::GetHit { key, .. }
            | CacheEvent::GetMiss { key }
            | CacheEvent::Set { key, .. }
            | CacheEvent::Delete { key, .. }
            | CacheEvent::ComputeStart { key }
            | CacheEvent::ComputeSuccess { key, .. }
            | CacheEvent::ComputeError { key, .. }
            | CacheEvent::RefreshStart { key }
            | CacheEvent::RefreshSuccess { key, .. }
            | CacheEvent::RefreshError { key, .. } => Some(key),
            CacheEvent::Error { key, .. } => key.as_deref(),
            CacheEvent::Clear
            | CacheEvent::StatsUpdate { .. }
            | CacheEvent::ProviderInitialized { .. } => None,
        }
    }
}

/// Broadcast channel for [`CacheEvent`]s.
///
/// Cloning the bus shares the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    ///
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to all current subscribers.
    pub fn publish(&self, event: CacheEvent) {
        let event_type = event.event_type();
        match self.tx.send(event) {
            Ok(receivers) => trace!(event_type, receivers, "published cache event"),
            Err(_) => trace!(event_type, "no subscribers for cache event"),
        }
    }

    /// Returns a receiver for all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
