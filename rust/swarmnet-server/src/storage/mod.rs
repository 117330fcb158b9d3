//! Storage backends and typed access to the shared records.
//!
//! The shared store is the only channel between peers. It is best-effort and eventually
//! consistent: readers must tolerate absent, stale and expired values.

pub mod keys;
pub mod memory;
pub mod redis;
pub mod store;
pub(crate) mod traits;

pub use self::{
    memory::MemoryStore,
    store::{SwarmStore, DEFAULT_EXPIRATION},
    traits::{
        ReadOptions,
        StorageError,
        StorageResult,
        StoreValue,
        SwarmStorage,
        DEFAULT_BEAM_SIZE,
    },
};
