//! Counter store abstraction.
//!
//! The admission engine keeps no counters of its own; every window lives in
//! a store reachable through [`CounterStore`].

mod memory;
mod redis;

pub use memory::MemoryCounterStore;
pub use self::redis::RedisCounterStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::StoreConfig;
use crate::error::StoreError;

/// Remaining lifetime of a counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist
    Missing,
    /// The key exists but will never expire
    Persistent,
    /// The key expires after this many seconds
    Expires(u64),
}

/// An atomic integer counter service with per-key expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key`, creating it at 1 when absent, and return
    /// the new value.
    async fn increment(&self, key: &str) -> Result<u64, StoreError>;

    /// Set or reset the time-to-live of `key`.
    async fn expire(&self, key: &str, seconds: u64) -> Result<(), StoreError>;

    /// Report the remaining lifetime of `key`.
    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError>;

    /// Increment `key` and arm its expiry when this hit created it.
    ///
    /// The provided implementation is two separate calls. Stores that can do
    /// it in one atomic step should override it.
    async fn increment_with_expiry(&self, key: &str, seconds: u64) -> Result<u64, StoreError> {
        let count = self.increment(key).await?;
        if count == 1 {
            self.expire(key, seconds).await?;
        }
        Ok(count)
    }
}

/// How often the in-process store drops expired counters.
const MEMORY_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Build the store selected by `config.url`.
///
/// Must be called from within a tokio runtime.
pub fn from_config(config: &StoreConfig) -> Result<Arc<dyn CounterStore>, StoreError> {
    if config.is_memory() {
        info!("Using in-process counter store; limits are not shared between instances");
        let store = Arc::new(MemoryCounterStore::new());
        store.spawn_purger(MEMORY_PURGE_INTERVAL);
        return Ok(store);
    }

    info!("Using Redis counter store");
    Ok(Arc::new(RedisCounterStore::open(&config.url)?))
}
