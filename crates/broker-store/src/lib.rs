//! Durable state projection: a small key/value-plus-set store abstraction,
//! backed by Redis in production. Every mutation the scheduler makes to an
//! instance's membership or the challenge/port indices goes through here so
//! that a restarted broker can reconstruct its view of the fleet.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("key not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for broker_common::BrokerError {
    fn from(err: StoreError) -> Self {
        broker_common::BrokerError::Store(err.to_string())
    }
}

/// One operation in an atomic batch, applied via [`StateStore::pipeline`].
#[derive(Debug, Clone)]
pub enum StoreOp {
    Set { key: String, value: String },
    Del { key: String },
    Incr { key: String, by: i64 },
    Sadd { key: String, member: String },
    Srem { key: String, member: String },
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn incr(&self, key: &str, by: i64) -> Result<i64>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;
    async fn scard(&self, key: &str) -> Result<u64>;

    /// Apply every op atomically. Used for compound state transitions such as
    /// saving an instance record alongside its challenge-index and port-index
    /// membership in one step.
    async fn pipeline(&self, ops: Vec<StoreOp>) -> Result<()>;

    /// Wipes every key. Used only by the `reset` CLI command.
    async fn flush(&self) -> Result<()>;
}

/// Production store: `redis::aio::ConnectionManager` transparently
/// reconnects, so callers never have to manage connection lifecycles.
#[derive(Clone)]
pub struct RedisStateStore {
    conn: ConnectionManager,
}

impl RedisStateStore {
    #[instrument(skip(url))]
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!("connected to redis state store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del(key).await?;
        Ok(())
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, by).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(key, member).await?)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(key).await?)
    }

    async fn pipeline(&self, ops: Vec<StoreOp>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                StoreOp::Set { key, value } => {
                    pipe.set(key, value);
                }
                StoreOp::Del { key } => {
                    pipe.del(key);
                }
                StoreOp::Incr { key, by } => {
                    pipe.incr(key, by);
                }
                StoreOp::Sadd { key, member } => {
                    pipe.sadd(key, member);
                }
                StoreOp::Srem { key, member } => {
                    pipe.srem(key, member);
                }
            }
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-memory store for unit and property tests. Mirrors Redis's string/set
/// split exactly so the scheduler can be tested without a running server.
#[derive(Default)]
pub struct InMemoryStateStore {
    strings: RwLock<HashMap<String, String>>,
    sets: RwLock<HashMap<String, HashSet<String>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.strings.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.strings
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.strings.write().await.remove(key);
        self.sets.write().await.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut strings = self.strings.write().await;
        let current = strings
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + by;
        strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.sets
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(set) = self.sets.write().await.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .read()
            .await
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .sets
            .read()
            .await
            .get(key)
            .map(|set| set.contains(member))
            .unwrap_or(false))
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        Ok(self
            .sets
            .read()
            .await
            .get(key)
            .map(|set| set.len() as u64)
            .unwrap_or(0))
    }

    async fn pipeline(&self, ops: Vec<StoreOp>) -> Result<()> {
        for op in ops {
            match op {
                StoreOp::Set { key, value } => self.set(&key, &value).await?,
                StoreOp::Del { key } => self.del(&key).await?,
                StoreOp::Incr { key, by } => {
                    self.incr(&key, by).await?;
                }
                StoreOp::Sadd { key, member } => self.sadd(&key, &member).await?,
                StoreOp::Srem { key, member } => self.srem(&key, &member).await?,
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.strings.write().await.clear();
        self.sets.write().await.clear();
        Ok(())
    }
}

pub fn shared_in_memory() -> Arc<InMemoryStateStore> {
    Arc::new(InMemoryStateStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_del_roundtrip() {
        let store = InMemoryStateStore::new();
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_membership() {
        let store = InMemoryStateStore::new();
        store.sadd("ports", "9001").await.unwrap();
        store.sadd("ports", "9002").await.unwrap();
        assert_eq!(store.scard("ports").await.unwrap(), 2);
        assert!(store.sismember("ports", "9001").await.unwrap());
        store.srem("ports", "9001").await.unwrap();
        assert!(!store.sismember("ports", "9001").await.unwrap());
        assert_eq!(store.scard("ports").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pipeline_is_applied_in_order() {
        let store = InMemoryStateStore::new();
        store
            .pipeline(vec![
                StoreOp::Set {
                    key: "instance:c1".into(),
                    value: "{}".into(),
                },
                StoreOp::Sadd {
                    key: "challenge:echo:instances".into(),
                    member: "c1".into(),
                },
                StoreOp::Sadd {
                    key: "used_ports".into(),
                    member: "9001".into(),
                },
            ])
            .await
            .unwrap();

        assert!(store.get("instance:c1").await.unwrap().is_some());
        assert!(store
            .sismember("challenge:echo:instances", "c1")
            .await
            .unwrap());
        assert!(store.sismember("used_ports", "9001").await.unwrap());
    }

    #[tokio::test]
    async fn incr_tracks_running_total() {
        let store = InMemoryStateStore::new();
        assert_eq!(store.incr("counter", 1).await.unwrap(), 1);
        assert_eq!(store.incr("counter", 4).await.unwrap(), 5);
        assert_eq!(store.incr("counter", -2).await.unwrap(), 3);
    }
}
