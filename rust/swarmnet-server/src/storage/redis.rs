//! # Redis Data Model
//!
//!```text
//! {
//!     // Round/stage counter, a single value
//!     "rl_swarm_rs": "{\"value\": [3, 1], \"expiration\": 1700000000.0}",
//!     // Reward record of a (round, stage), a hash with one field per peer
//!     "rl_swarm_rewards_3_1": {
//!         "PeerId_1": "{\"value\": 12.5, \"expiration\": 1700000000.0}",
//!         "PeerId_2": "{\"value\": 3.0, \"expiration\": 1700000100.0}"
//!     },
//!     // Output record of a peer for a (round, stage), a hash with one field per question hash
//!     "rl_swarm_outputs_PeerId_1_3_1": {
//!         "QuestionHash_1": "{\"value\": [1699990000.0, {...}], \"expiration\": 1700000000.0}"
//!     },
//!     // Leaderboard of a (round, stage), a single value
//!     "rl_swarm_leaderboard_3_1": "{\"value\": [[\"PeerId_1\", 12.5]], \"expiration\": ...}"
//! }
//! ```
//!
//! Every value is wrapped together with its own expiration time. The key itself expires at the
//! latest expiration of its values, expired hash fields are filtered on read.
use std::{collections::BTreeMap, collections::HashMap, sync::Arc};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, IntoConnectionInfo, RedisResult, Script};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{
    storage::{
        traits::Expiring,
        ReadOptions,
        StorageError,
        StorageResult,
        StoreValue,
        SwarmStorage,
    },
    utils::Clock,
};

pub use redis::RedisError;

#[derive(Clone)]
pub struct Client {
    raw_connection: ConnectionManager,
    semaphore: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("semaphore", &self.semaphore)
            .field("clock", &self.clock)
            .finish()
    }
}

pub struct Connection {
    connection: ConnectionManager,
    _permit: OwnedSemaphorePermit,
}

fn to_storage_err(e: RedisError) -> StorageError {
    anyhow::anyhow!(e)
}

impl Client {
    /// Creates a new Redis client.
    ///
    /// `url` to which Redis instance the client should connect to.
    /// The URL format is `redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]`.
    /// `n` is the maximum number of concurrent uses on a shared connection.
    /// `clock` decides which values count as expired when they are read.
    ///
    /// The [`Client`] uses a [`redis::aio::ConnectionManager`] that automatically reconnects
    /// if the connection is dropped.
    pub async fn new<T: IntoConnectionInfo>(
        url: T,
        n: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RedisError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_tokio_connection_manager().await?;
        Ok(Self {
            raw_connection: connection,
            semaphore: Arc::new(Semaphore::new(n)),
            clock,
        })
    }

    /// Acquires access to the shared connection.
    ///
    /// If the maximum number of concurrent uses the shared connection is reached,
    /// the method will wait until a pending usage is completed.
    pub async fn connection(&self) -> StorageResult<Connection> {
        let _permit = self.semaphore.clone().acquire_owned().await?;
        Ok(Connection {
            connection: self.raw_connection.clone(),
            _permit,
        })
    }
}

impl Connection {
    /// Returns the type of the value stored at `key`: `"none"`, `"string"` or `"hash"`.
    async fn key_type(&mut self, key: &str) -> RedisResult<String> {
        // https://redis.io/commands/type
        redis::cmd("TYPE")
            .arg(key)
            .query_async(&mut self.connection)
            .await
    }

    /// Stores a single value and lets the key expire with it.
    pub async fn set_value(mut self, key: &str, payload: &str, expire_at: usize) -> RedisResult<()> {
        debug!("set value of {}", key);
        // https://redis.io/commands/set
        // > If key already holds a value, it is overwritten, regardless of its type.
        redis::pipe()
            .atomic()
            .set(key, payload)
            .ignore()
            .expire_at(key, expire_at)
            .ignore()
            .query_async(&mut self.connection)
            .await
    }

    /// Retrieves a single value.
    pub async fn get_value(mut self, key: &str) -> RedisResult<Option<String>> {
        debug!("get value of {}", key);
        if self.key_type(key).await? != "string" {
            return Ok(None);
        }
        self.connection.get(key).await
    }

    /// Stores a sub-entry of a hash.
    ///
    /// The key's TTL is only ever extended, so that the longest living field survives.
    pub async fn set_entry(
        mut self,
        key: &str,
        field: &str,
        payload: &str,
        expire_at: usize,
    ) -> RedisResult<()> {
        debug!("set entry {} of {}", field, key);
        let script = Script::new(
            r#"
                local key = KEYS[1]
                local expire_at = tonumber(ARGV[3])
                local now = tonumber(redis.call("TIME")[1])

                -- an already expired value is not stored
                if expire_at <= now then
                    return 0
                end

                -- a single value under the same key is replaced by the hash
                if redis.call("TYPE", key).ok ~= "hash" then
                    redis.call("DEL", key)
                end
                redis.call("HSET", key, ARGV[1], ARGV[2])

                -- TTL returns -1 if the key has no expiration
                local ttl = redis.call("TTL", key)
                if ttl < 0 or now + ttl < expire_at then
                    redis.call("EXPIREAT", key, expire_at)
                end

                return 0
            "#,
        );

        script
            .key(key)
            .arg(field)
            .arg(payload)
            .arg(expire_at)
            .invoke_async(&mut self.connection)
            .await
    }

    /// Retrieves one sub-entry of a hash.
    pub async fn get_entry(mut self, key: &str, field: &str) -> RedisResult<Option<String>> {
        debug!("get entry {} of {}", field, key);
        if self.key_type(key).await? != "hash" {
            return Ok(None);
        }
        // https://redis.io/commands/hget
        // > Bulk string reply: the value associated with field, or nil when field is not present
        //   in the hash or key does not exist.
        self.connection.hget(key, field).await
    }

    /// Retrieves all sub-entries of a hash.
    pub async fn get_entries(mut self, key: &str) -> RedisResult<HashMap<String, String>> {
        debug!("get entries of {}", key);
        if self.key_type(key).await? != "hash" {
            return Ok(HashMap::new());
        }
        // https://redis.io/commands/hgetall
        // > Array reply: list of fields and their values stored in the hash, or an empty
        //   list when key does not exist.
        self.connection.hgetall(key).await
    }

    /// Deletes all data in the current database.
    pub async fn flush_db(mut self) -> RedisResult<()> {
        debug!("flush current database");
        // https://redis.io/commands/flushdb
        // > This command never fails.
        redis::cmd("FLUSHDB")
            .arg("ASYNC")
            .query_async(&mut self.connection)
            .await
    }

    /// Pings the Redis server. Useful for checking whether there is a connection
    /// between the client and Redis.
    pub async fn ping(mut self) -> RedisResult<()> {
        // https://redis.io/commands/ping
        redis::cmd("PING").query_async(&mut self.connection).await
    }
}

fn expire_at(expiration: f64) -> usize {
    expiration.max(0.).ceil() as usize
}

fn decode(key: &str, payload: &str, now: f64) -> Option<Value> {
    match serde_json::from_str::<Expiring>(payload) {
        Ok(expiring) if expiring.is_live(now) => Some(expiring.value),
        Ok(_) => None,
        Err(err) => {
            warn!("ignoring malformed value of {}: {}", key, err);
            None
        }
    }
}

#[async_trait]
impl SwarmStorage for Client {
    async fn get(
        &mut self,
        key: &str,
        subkey: Option<&str>,
        _options: ReadOptions,
    ) -> StorageResult<Option<StoreValue>> {
        let now = self.clock.now();

        if let Some(field) = subkey {
            let payload = self
                .connection()
                .await?
                .get_entry(key, field)
                .await
                .map_err(to_storage_err)?;
            return Ok(payload
                .and_then(|payload| decode(key, &payload, now))
                .map(StoreValue::Single));
        }

        let entries = self
            .connection()
            .await?
            .get_entries(key)
            .await
            .map_err(to_storage_err)?;
        if !entries.is_empty() {
            let live: BTreeMap<String, Value> = entries
                .into_iter()
                .filter_map(|(field, payload)| decode(key, &payload, now).map(|v| (field, v)))
                .collect();
            return Ok((!live.is_empty()).then(|| StoreValue::Entries(live)));
        }

        let payload = self
            .connection()
            .await?
            .get_value(key)
            .await
            .map_err(to_storage_err)?;
        Ok(payload
            .and_then(|payload| decode(key, &payload, now))
            .map(StoreValue::Single))
    }

    async fn put(
        &mut self,
        key: &str,
        subkey: Option<&str>,
        value: Value,
        expiration: f64,
    ) -> StorageResult<()> {
        let payload = serde_json::to_string(&Expiring { value, expiration })?;
        let connection = self.connection().await?;
        match subkey {
            Some(field) => connection
                .set_entry(key, field, &payload, expire_at(expiration))
                .await
                .map_err(to_storage_err),
            None => connection
                .set_value(key, &payload, expire_at(expiration))
                .await
                .map_err(to_storage_err),
        }
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        self.connection()
            .await?
            .ping()
            .await
            .map_err(to_storage_err)
    }
}
