//! Key/value backends for lesson metadata.
//!
//! The [`StateStore`] trait covers exactly what the session state manager
//! needs: string CRUD on the metadata database, prefix listing, and flushing
//! a whole numbered database.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::allocator::METADATA_DB;
use crate::Result;

/// Storage operations used by [`SessionStateManager`](crate::SessionStateManager).
///
/// `get`/`set`/`delete`/`exists`/`keys_with_prefix` act on the metadata
/// database. `flush_database` acts on the numbered database it is given.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads a metadata value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes a metadata value, replacing any previous one.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Deletes a metadata key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Returns `true` if the metadata key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Lists metadata keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Removes every key from database `db`.
    async fn flush_database(&self, db: u8) -> Result<()>;
}

// ============================================================================
// Redis
// ============================================================================

/// [`StateStore`] backed by a Redis server.
///
/// The metadata connection is opened on first use and shared afterwards.
/// Each flush opens its own short-lived connection scoped to the target
/// database so the metadata connection never changes database.
#[derive(Debug)]
pub struct RedisStateStore {
    host: String,
    port: u16,
    client: redis::Client,
    metadata: OnceCell<MultiplexedConnection>,
}

impl RedisStateStore {
    /// Creates a store for the server at `host:port`. No connection is made
    /// until the first operation.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        let client = redis::Client::open(connection_url(&host, port, METADATA_DB))?;
        Ok(Self {
            host,
            port,
            client,
            metadata: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let conn = self
            .metadata
            .get_or_try_init(|| async {
                info!(host = %self.host, port = self.port, "Connecting to metadata database");
                self.client.get_multiplexed_async_connection().await
            })
            .await?;
        Ok(conn.clone())
    }
}

/// Builds a `redis://` URL selecting database `db`.
#[must_use]
pub fn connection_url(host: &str, port: u16, db: u8) -> String {
    format!("redis://{host}:{port}/{db}")
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        Ok(conn.exists::<_, bool>(key).await?)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.keys::<_, Vec<String>>(format!("{prefix}*")).await?)
    }

    async fn flush_database(&self, db: u8) -> Result<()> {
        let client = redis::Client::open(connection_url(&self.host, self.port, db))?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("FLUSHDB").query_async::<_, ()>(&mut conn).await?;
        info!(database = db, "Flushed database");
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// [`StateStore`] holding every numbered database in memory.
///
/// Used by tests and by the `local` transport when no server is available.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    databases: Mutex<HashMap<u8, HashMap<String, String>>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a key into an arbitrary database, as a lesson would.
    pub async fn insert_into(&self, db: u8, key: impl Into<String>, value: impl Into<String>) {
        self.databases
            .lock()
            .await
            .entry(db)
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Returns the number of keys in database `db`.
    pub async fn database_len(&self, db: u8) -> usize {
        self.databases.lock().await.get(&db).map_or(0, HashMap::len)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let databases = self.databases.lock().await;
        Ok(databases
            .get(&METADATA_DB)
            .and_then(|metadata| metadata.get(key))
            .cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.insert_into(METADATA_DB, key, value).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if let Some(metadata) = self.databases.lock().await.get_mut(&METADATA_DB) {
            metadata.remove(key);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let databases = self.databases.lock().await;
        let mut keys: Vec<String> = databases
            .get(&METADATA_DB)
            .map(|metadata| {
                metadata
                    .keys()
                    .filter(|key| key.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn flush_database(&self, db: u8) -> Result<()> {
        self.databases.lock().await.remove(&db);
        debug!(database = db, "Flushed in-memory database");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_url() {
        assert_eq!(connection_url("127.0.0.1", 6379, 0), "redis://127.0.0.1:6379/0");
        assert_eq!(connection_url("cache", 6380, 7), "redis://cache:6380/7");
    }

    #[test]
    fn test_redis_store_construction_is_lazy() {
        // No server is listening on this port; construction must still succeed.
        let store = RedisStateStore::new("127.0.0.1", 1);
        assert!(store.is_ok());
    }

    #[tokio::test]
    async fn test_memory_crud() {
        let store = MemoryStateStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(!store.exists("a").await.unwrap());

        store.set("a", "1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(store.exists("a").await.unwrap());

        store.delete("a").await.unwrap();
        assert!(!store.exists("a").await.unwrap());
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_keys_with_prefix() {
        let store = MemoryStateStore::new();
        store.set("prism:lesson:state:b", "{}").await.unwrap();
        store.set("prism:lesson:state:a", "{}").await.unwrap();
        store.set("other:key", "{}").await.unwrap();

        let keys = store.keys_with_prefix("prism:lesson:state:").await.unwrap();
        assert_eq!(keys, vec!["prism:lesson:state:a", "prism:lesson:state:b"]);
    }

    #[tokio::test]
    async fn test_memory_flush_only_touches_target_database() {
        let store = MemoryStateStore::new();
        store.set("meta", "kept").await.unwrap();
        store.insert_into(3, "user:1", "Max").await;
        store.insert_into(4, "user:2", "Ada").await;

        store.flush_database(3).await.unwrap();

        assert_eq!(store.database_len(3).await, 0);
        assert_eq!(store.database_len(4).await, 1);
        assert!(store.exists("meta").await.unwrap());
    }
}
