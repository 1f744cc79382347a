//! In-process counter store.
//!
//! Keeps fixed-window counters in a map guarded by a mutex. Expiry uses the
//! tokio clock, so a paused runtime in tests controls window resets. Limits
//! are per process; use Redis when several instances share a budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use super::{CounterStore, KeyTtl};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Counter store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, Entry>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`, or `None` when absent or expired.
    pub fn get(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let counters = self.counters.lock();
        counters
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.count)
    }

    /// Drop every expired counter.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        let before = counters.len();
        counters.retain(|_, entry| !entry.is_expired(now));
        before - counters.len()
    }

    /// Periodically drop expired counters so clients that never return do
    /// not keep their entries alive. The task ends once the store is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_purger(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    trace!(purged = purged, "Purged expired counters");
                }
            }
        })
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let counters = self.counters.lock();
        counters.values().filter(|entry| !entry.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a counter without expiry, as left behind by an interrupted
    /// increment/expire pair.
    #[cfg(test)]
    pub(crate) fn insert_persistent(&self, key: &str, count: u64) {
        self.counters.lock().insert(
            key.to_string(),
            Entry {
                count,
                expires_at: None,
            },
        );
    }

    fn bump<'a>(
        counters: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> &'a mut Entry {
        let entry = counters.entry(key.to_string()).or_insert(Entry {
            count: 0,
            expires_at: None,
        });
        if entry.is_expired(now) {
            *entry = Entry {
                count: 0,
                expires_at: None,
            };
        }
        entry.count += 1;
        entry
    }
}

/// Round to the nearest second, as Redis `TTL` reports it.
fn whole_seconds(remaining: Duration) -> u64 {
    let millis = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX);
    millis.saturating_add(500) / 1000
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        Ok(Self::bump(&mut counters, key, now).count)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        let expired = match counters.get(key) {
            Some(entry) => entry.is_expired(now),
            None => return Ok(()),
        };
        if expired {
            counters.remove(key);
        } else if let Some(entry) = counters.get_mut(key) {
            entry.expires_at = Some(now + Duration::from_secs(seconds));
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let now = Instant::now();
        let counters = self.counters.lock();
        let ttl = match counters.get(key) {
            None => KeyTtl::Missing,
            Some(entry) if entry.is_expired(now) => KeyTtl::Missing,
            Some(Entry { expires_at: None, .. }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(whole_seconds(at.saturating_duration_since(now))),
        };
        Ok(ttl)
    }

    /// Increment and arm the expiry under one lock. A counter found without
    /// an expiry is re-armed as well.
    async fn increment_with_expiry(&self, key: &str, seconds: u64) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        let entry = Self::bump(&mut counters, key, now);
        if entry.expires_at.is_none() {
            entry.expires_at = Some(now + Duration::from_secs(seconds));
        }
        Ok(entry.count)
    }
}
