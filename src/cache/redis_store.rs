//! Redis binding for the cache store.
//!
//! One multiplexed connection, recreated on loss with bounded exponential
//! backoff. While no connection is up, operations fail fast with a
//! transient error so the apply path can nak-retry instead of blocking.

use super::{CacheError, CacheStore};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

struct ConnState {
    conn: Option<MultiplexedConnection>,
    attempts: u32,
    next_attempt: Option<Instant>,
}

pub struct RedisStore {
    client: Client,
    state: Mutex<ConnState>,
    connection_timeout: Duration,
    command_timeout: Duration,
    reconnects: AtomicU64,
}

fn classify(e: &redis::RedisError) -> CacheError {
    use redis::ErrorKind;
    let transient = e.is_io_error()
        || e.is_timeout()
        || e.is_connection_dropped()
        || e.is_connection_refusal()
        || matches!(
            e.kind(),
            ErrorKind::TryAgain | ErrorKind::BusyLoadingError | ErrorKind::MasterDown
        );
    if transient {
        CacheError::Transient(e.to_string())
    } else {
        CacheError::Permanent(e.to_string())
    }
}

impl RedisStore {
    /// Creates the store without connecting; the first operation (or
    /// [`CacheStore::ping`] at startup) establishes the connection.
    pub fn new(
        url: &str,
        connection_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self, CacheError> {
        let client =
            Client::open(url).map_err(|e| CacheError::Permanent(format!("bad cache URL: {e}")))?;
        Ok(Self {
            client,
            state: Mutex::new(ConnState {
                conn: None,
                attempts: 0,
                next_attempt: None,
            }),
            connection_timeout,
            command_timeout,
            reconnects: AtomicU64::new(0),
        })
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    fn backoff(attempts: u32) -> Duration {
        let exp = RECONNECT_BASE.saturating_mul(1u32 << attempts.min(16));
        exp.min(RECONNECT_CAP)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        let mut state = self.state.lock().await;
        if let Some(conn) = &state.conn {
            return Ok(conn.clone());
        }

        if let Some(at) = state.next_attempt {
            if Instant::now() < at {
                return Err(CacheError::Transient(
                    "cache disconnected, reconnect pending".to_string(),
                ));
            }
        }

        match tokio::time::timeout(
            self.connection_timeout,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => {
                if state.attempts > 0 {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!("cache reconnected after {} attempts", state.attempts);
                }
                state.conn = Some(conn.clone());
                state.attempts = 0;
                state.next_attempt = None;
                Ok(conn)
            }
            Ok(Err(e)) => {
                let delay = Self::backoff(state.attempts);
                state.attempts = state.attempts.saturating_add(1);
                state.next_attempt = Some(Instant::now() + delay);
                warn!("cache connect failed (retry in {:?}): {}", delay, e);
                Err(classify(&e))
            }
            Err(_) => {
                let delay = Self::backoff(state.attempts);
                state.attempts = state.attempts.saturating_add(1);
                state.next_attempt = Some(Instant::now() + delay);
                warn!("cache connect timed out (retry in {:?})", delay);
                Err(CacheError::Transient("cache connect timeout".to_string()))
            }
        }
    }

    /// Drops the cached connection so the next call reconnects.
    async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.conn = None;
    }

    async fn finish<T>(
        &self,
        result: Result<redis::RedisResult<T>, tokio::time::error::Elapsed>,
    ) -> Result<T, CacheError> {
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let classified = classify(&e);
                if classified.is_transient() {
                    self.invalidate().await;
                }
                Err(classified)
            }
            Err(_) => {
                self.invalidate().await;
                Err(CacheError::Transient("cache command timeout".to_string()))
            }
        }
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    fn reconnects(&self) -> u64 {
        self.reconnect_count()
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let result = tokio::time::timeout(self.command_timeout, async {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await;
        self.finish(result).await.map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let result = tokio::time::timeout(self.command_timeout, conn.get(key)).await;
        self.finish(result).await
    }

    async fn set_with_index(
        &self,
        key: &str,
        value: &str,
        index_key: &str,
        member: &str,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(key, value)
            .ignore()
            .sadd(index_key, member)
            .ignore();
        let result =
            tokio::time::timeout(self.command_timeout, pipe.query_async::<()>(&mut conn)).await;
        self.finish(result).await
    }

    async fn delete_with_index(
        &self,
        key: &str,
        index_key: &str,
        member: &str,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(key)
            .ignore()
            .srem(index_key, member)
            .ignore();
        let result =
            tokio::time::timeout(self.command_timeout, pipe.query_async::<()>(&mut conn)).await;
        self.finish(result).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.connection().await?;
        let result = tokio::time::timeout(self.command_timeout, conn.smembers(key)).await;
        self.finish(result).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let result = tokio::time::timeout(self.command_timeout, conn.hset(key, field, value)).await;
        self.finish(result).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let result = tokio::time::timeout(self.command_timeout, conn.hget(key, field)).await;
        self.finish(result).await
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let result =
            tokio::time::timeout(self.command_timeout, conn.hset_multiple(key, &fields)).await;
        self.finish(result).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, CacheError> {
        let mut conn = self.connection().await?;
        let result = tokio::time::timeout(self.command_timeout, conn.hgetall(key)).await;
        let fields: std::collections::HashMap<String, String> = self.finish(result).await?;
        Ok(fields.into_iter().collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let result = tokio::time::timeout(self.command_timeout, conn.publish(channel, payload)).await;
        self.finish(result).await
    }
}
