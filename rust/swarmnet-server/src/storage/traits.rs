//! Storage API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like broken pipe, connection refused, etc.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// The default number of contributors consulted per read.
pub const DEFAULT_BEAM_SIZE: usize = 500;

/// A value read from the store, with its expiration wrapper removed.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreValue {
    /// A key written without sub-keys.
    Single(Value),
    /// A key written with sub-keys, mapping each live sub-key to its value.
    Entries(BTreeMap<String, Value>),
}

impl StoreValue {
    /// Returns the sub-entries, or `None` for a single value.
    pub fn into_entries(self) -> Option<BTreeMap<String, Value>> {
        match self {
            Self::Entries(entries) => Some(entries),
            Self::Single(_) => None,
        }
    }

    /// Returns the single value, or `None` for sub-entries.
    pub fn into_single(self) -> Option<Value> {
        match self {
            Self::Single(value) => Some(value),
            Self::Entries(_) => None,
        }
    }
}

/// Read hints.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOptions {
    /// Prefer the freshest value over a cached one.
    pub latest: bool,
    /// Bound on the number of distributed contributors consulted. Under churn a bounded beam can
    /// miss live contributors.
    pub beam_size: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            latest: true,
            beam_size: DEFAULT_BEAM_SIZE,
        }
    }
}

/// A stored value together with its absolute expiration time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Expiring {
    pub value: Value,
    pub expiration: f64,
}

impl Expiring {
    pub fn is_live(&self, now: f64) -> bool {
        self.expiration > now
    }
}

#[async_trait]
/// An abstract shared key-value store with expiring entries.
///
/// Keys hold either a single value or a mapping of sub-keys to values. Every value carries its
/// own expiration time; expired values are never returned.
pub trait SwarmStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Reads a key.
    ///
    /// # Behavior
    ///
    /// - If the key is unknown or all of its values expired, return `StorageResult::Ok(None)`.
    /// - If `subkey` is given, return the live value of that sub-key as
    ///   `StorageResult::Ok(Some(StoreValue::Single(_)))`, or `None` if it is absent.
    /// - If the key holds sub-entries, return all live ones as `StoreValue::Entries`.
    /// - Otherwise return the single value.
    async fn get(
        &mut self,
        key: &str,
        subkey: Option<&str>,
        options: ReadOptions,
    ) -> StorageResult<Option<StoreValue>>;

    /// Writes a value that expires at the absolute store time `expiration`.
    ///
    /// # Behavior
    ///
    /// - Without `subkey` the key is overwritten with a single value.
    /// - With `subkey` only that sub-entry is overwritten; other sub-entries are kept.
    async fn put(
        &mut self,
        key: &str,
        subkey: Option<&str>,
        value: Value,
        expiration: f64,
    ) -> StorageResult<()>;

    /// Checks if the store is ready to process requests.
    async fn is_ready(&mut self) -> StorageResult<()>;
}
