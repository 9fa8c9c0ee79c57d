#![allow(dead_code)]

use cachemux_core::adapter::{StorageAdapter, StoredEntry};
use cachemux_core::{async_trait, CacheError, MemoryAdapter, MemoryAdapterConfig, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Adapter that fails every call while `failing` is set, delegating otherwise.
#[derive(Default)]
pub struct FlakyAdapter {
    inner: MemoryAdapter,
    failing: AtomicBool,
    pub calls: AtomicUsize,
}

impl FlakyAdapter {
    pub fn failing() -> Arc<Self> {
        let adapter = Self::default();
        adapter.failing.store(true, Ordering::SeqCst);
        Arc::new(adapter)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::provider("flaky", "backend unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageAdapter for FlakyAdapter {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>> {
        self.enter()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, entry: StoredEntry) -> Result<()> {
        self.enter()?;
        self.inner.set(key, entry).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.enter()?;
        self.inner.delete(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.enter()?;
        self.inner.clear().await
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        self.enter()?;
        self.inner.keys(pattern).await
    }
}

/// Memory adapter that sleeps before every read.
pub struct SlowAdapter {
    inner: MemoryAdapter,
    delay: Duration,
    pub reads: AtomicUsize,
}

impl SlowAdapter {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryAdapter::new(MemoryAdapterConfig::default()),
            delay,
            reads: AtomicUsize::new(0),
        })
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageAdapter for SlowAdapter {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, entry: StoredEntry) -> Result<()> {
        self.inner.set(key, entry).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        self.inner.keys(pattern).await
    }
}
