//! Key/value store for metadata records, job status and cached query results.
//!
//! Layer and cube records, render-job status and cached query results are all
//! JSON strings behind one flat namespace. Absence is a normal return value,
//! not an error; key construction is the caller's responsibility (see
//! [`crate::keys`]).

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use tiles_common::{TileError, TileResult};

/// Byte-addressed map for JSON records and counters.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a value; `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> TileResult<Option<String>>;

    /// Store a value, overwriting any previous one.
    async fn set(&self, key: &str, value: &str) -> TileResult<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> TileResult<()>;

    /// Atomically increment an integer counter, returning the new value.
    /// Missing keys start from zero.
    async fn incr(&self, key: &str) -> TileResult<i64>;
}

/// Fetch and deserialize a JSON record.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> TileResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => {
            let value = serde_json::from_str(&raw)
                .map_err(|e| TileError::Cache(format!("Corrupt record at {}: {}", key, e)))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Serialize and store a JSON record.
pub async fn set_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> TileResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw).await
}

/// Redis-backed store used in production.
///
/// Holds a single multiplexed connection shared by every request; the
/// connection is cheap to clone per call and safe for concurrent use.
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to Redis.
    pub async fn connect(redis_url: &str) -> TileResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| TileError::Cache(format!("Redis connection failed: {}", e)))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TileError::Cache(format!("Redis connection failed: {}", e)))?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> TileResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| TileError::Cache(format!("Get failed: {}", e)))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> TileResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(key, value)
            .await
            .map_err(|e| TileError::Cache(format!("Set failed: {}", e)))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> TileResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| TileError::Cache(format!("Delete failed: {}", e)))?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> TileResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn
            .incr(key, 1)
            .await
            .map_err(|e| TileError::Cache(format!("Incr failed: {}", e)))?;
        Ok(value)
    }
}

/// In-memory store for tests and single-process setups.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> TileResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> TileResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> TileResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> TileResult<i64> {
        let mut entries = self.entries.write().await;
        let current: i64 = match entries.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| TileError::Cache(format!("Non-numeric counter at {}", key)))?,
            None => 0,
        };
        let next = current + 1;
        entries.insert(key.to_string(), next.to_string());
        Ok(next)
    }
}
