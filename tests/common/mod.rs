#![allow(dead_code)]

use cachemux::{async_trait, CacheError, MemoryAdapter, Result, StorageAdapter, StoredEntry};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Memory-backed adapter that can be switched into failure and slowed down.
#[derive(Default)]
pub struct TestAdapter {
    inner: MemoryAdapter,
    failing: AtomicBool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl TestAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let adapter = Self::default();
        adapter.failing.store(true, Ordering::SeqCst);
        Arc::new(adapter)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Direct access to the backing store, bypassing failure injection.
    pub fn store(&self) -> &MemoryAdapter {
        &self.inner
    }

    async fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::provider("test", "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for TestAdapter {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>> {
        self.enter().await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, entry: StoredEntry) -> Result<()> {
        self.enter().await?;
        self.inner.set(key, entry).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.enter().await?;
        self.inner.delete(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.enter().await?;
        self.inner.clear().await
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        self.enter().await?;
        self.inner.keys(pattern).await
    }
}

/// Installs a test-writer subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
