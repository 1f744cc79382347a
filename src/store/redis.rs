//! Redis-backed counter store for multi-instance deployments.
//!
//! Uses Redis `INCR` + `EXPIRE` fixed-window counters. The connection is a
//! [`ConnectionManager`]: a single multiplexed connection that is cheap to
//! clone across concurrent requests and reconnects on failure.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{CounterStore, KeyTtl};
use crate::error::StoreError;

/// Increments KEYS[1] and arms an expiry of ARGV[1] seconds when the key was
/// just created or has lost its expiry. An existing expiry is never touched,
/// so later hits cannot extend a window.
const INCREMENT_WITH_EXPIRY: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 or redis.call('TTL', KEYS[1]) == -1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Counter store backed by a Redis server.
pub struct RedisCounterStore {
    client: Client,
    /// Established on first use, so a Redis outage at boot only degrades
    /// admission instead of preventing startup.
    conn: OnceCell<ConnectionManager>,
    script: Script,
}

impl RedisCounterStore {
    /// Create a store for `url`. No connection is made until the first call.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(unavailable)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            script: Script::new(INCREMENT_WITH_EXPIRY),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                debug!("Connecting to Redis");
                let conn = ConnectionManager::new(self.client.clone()).await?;
                info!("Connected to Redis");
                Ok::<_, RedisError>(conn)
            })
            .await
            .map_err(unavailable)?;
        Ok(conn.clone())
    }
}

fn unavailable(err: RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn expiry_arg(seconds: u64) -> i64 {
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        conn.incr(key, 1_u64).await.map_err(unavailable)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        conn.expire::<_, ()>(key, expiry_arg(seconds))
            .await
            .map_err(unavailable)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let mut conn = self.connection().await?;
        let ttl: i64 = conn.ttl(key).await.map_err(unavailable)?;

        // -2: no such key, -1: key without expiry
        Ok(match ttl {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            secs => KeyTtl::Expires(secs.max(0) as u64),
        })
    }

    async fn increment_with_expiry(&self, key: &str, seconds: u64) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        self.script
            .key(key)
            .arg(expiry_arg(seconds))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)
    }
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("connected", &self.conn.initialized())
            .finish_non_exhaustive()
    }
}
