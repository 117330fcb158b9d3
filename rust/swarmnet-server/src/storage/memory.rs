//! An in-process store.
//!
//! All clones share the same entries, so peers, the dashboard cache and tests running in one
//! process observe each other's writes immediately.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;

use crate::{
    storage::{
        traits::Expiring,
        ReadOptions,
        StorageResult,
        StoreValue,
        SwarmStorage,
    },
    utils::Clock,
};

/// Number of writes between two purges of expired values.
const PURGE_EVERY: usize = 64;

#[derive(Debug)]
enum Slot {
    Single(Expiring),
    Entries(BTreeMap<String, Expiring>),
}

#[derive(Clone, Debug)]
pub struct MemoryStore {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    writes: Arc<AtomicUsize>,
    clock: Arc<dyn Clock>,
}

fn purge(slots: &mut HashMap<String, Slot>, now: f64) {
    slots.retain(|_, slot| match slot {
        Slot::Single(value) => value.is_live(now),
        Slot::Entries(entries) => {
            entries.retain(|_, value| value.is_live(now));
            !entries.is_empty()
        }
    });
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            writes: Arc::new(AtomicUsize::new(0)),
            clock,
        }
    }

    /// Drops every expired value.
    ///
    /// Writes also do this every 64 puts, so the store stays bounded without calling it.
    pub fn purge_expired(&self) -> StorageResult<()> {
        let now = self.clock.now();
        purge(&mut *self.lock()?, now);
        Ok(())
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, Slot>>> {
        self.slots
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

#[async_trait]
impl SwarmStorage for MemoryStore {
    async fn get(
        &mut self,
        key: &str,
        subkey: Option<&str>,
        _options: ReadOptions,
    ) -> StorageResult<Option<StoreValue>> {
        let now = self.clock.now();
        let slots = self.lock()?;
        let value = match (slots.get(key), subkey) {
            (None, _) => None,
            (Some(Slot::Single(value)), None) => value
                .is_live(now)
                .then(|| StoreValue::Single(value.value.clone())),
            (Some(Slot::Single(_)), Some(_)) => None,
            (Some(Slot::Entries(entries)), Some(subkey)) => entries
                .get(subkey)
                .filter(|value| value.is_live(now))
                .map(|value| StoreValue::Single(value.value.clone())),
            (Some(Slot::Entries(entries)), None) => {
                let live: BTreeMap<String, Value> = entries
                    .iter()
                    .filter(|(_, value)| value.is_live(now))
                    .map(|(subkey, value)| (subkey.clone(), value.value.clone()))
                    .collect();
                (!live.is_empty()).then(|| StoreValue::Entries(live))
            }
        };
        Ok(value)
    }

    async fn put(
        &mut self,
        key: &str,
        subkey: Option<&str>,
        value: Value,
        expiration: f64,
    ) -> StorageResult<()> {
        let value = Expiring { value, expiration };
        let mut slots = self.lock()?;
        match subkey {
            None => {
                slots.insert(key.to_string(), Slot::Single(value));
            }
            Some(subkey) => {
                let slot = slots
                    .entry(key.to_string())
                    .or_insert_with(|| Slot::Entries(BTreeMap::new()));
                if let Slot::Single(_) = slot {
                    *slot = Slot::Entries(BTreeMap::new());
                }
                if let Slot::Entries(entries) = slot {
                    entries.insert(subkey.to_string(), value);
                }
            }
        }
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_EVERY == 0 {
            purge(&mut slots, self.clock.now());
        }
        Ok(())
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        self.lock().map(|_| ())
    }
}
