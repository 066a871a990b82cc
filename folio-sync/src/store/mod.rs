//! Local key-value persistence for queued writes and settings.
//!
//! ```text
//! DurableWriteQueue ──▶ dyn DurableStore ──┬──▶ RocksStore  (cf "queue")
//!                                          └──▶ MemoryStore (fallback / spill)
//! Settings          ──▶ dyn SettingsStore ─┬──▶ RocksStore  (cf "settings")
//!                                          └──▶ MemoryStore
//! ```
//!
//! [`Storage::open`] picks the backing store once: RocksDB when a path is
//! configured and the database opens, otherwise an in-memory store with a
//! warning. The engine never fails to start because local storage is
//! unavailable.

mod memory;
mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use crate::error::StoreError;
use crate::queue::{QueuedWrite, WriteKind};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Ordered storage of pending writes.
///
/// Implementations assign strictly increasing ids so iteration order is
/// enqueue order.
pub trait DurableStore: Send + Sync {
    /// Persist one write and return the id assigned to it.
    fn append(
        &self,
        kind: WriteKind,
        payload: &[u8],
        enqueued_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Return every stored write in id order and delete exactly those
    /// writes in one transaction.
    fn take_all(&self) -> Result<Vec<QueuedWrite>, StoreError>;

    /// Number of stored writes.
    fn count(&self) -> Result<usize, StoreError>;

    /// Delete every stored write.
    fn clear(&self) -> Result<(), StoreError>;

    /// Whether writes survive a process restart.
    fn is_durable(&self) -> bool;
}

/// Persisted string settings.
pub trait SettingsStore: Send + Sync {
    fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`; `None` deletes the key.
    fn put_setting(&self, key: &str, value: Option<&str>) -> Result<(), StoreError>;
}

/// The pair of stores handed to the engine at construction.
#[derive(Clone)]
pub struct Storage {
    pub queue: Arc<dyn DurableStore>,
    pub settings: Arc<dyn SettingsStore>,
}

impl Storage {
    /// Open RocksDB at `config`, falling back to memory if that fails.
    pub fn open(config: Option<StoreConfig>) -> Self {
        let Some(config) = config else {
            log::info!("No storage path configured, using in-memory storage");
            return Self::in_memory();
        };

        let path = config.path.clone();
        match RocksStore::open(config) {
            Ok(store) => {
                log::info!("Opened durable store at {}", path.display());
                Self::from_shared(Arc::new(store))
            }
            Err(e) => {
                log::warn!(
                    "Durable store at {} unavailable ({e}), falling back to in-memory storage; \
                     queued writes will not survive a restart",
                    path.display()
                );
                Self::in_memory()
            }
        }
    }

    /// Non-durable storage.
    pub fn in_memory() -> Self {
        Self::from_shared(Arc::new(MemoryStore::new()))
    }

    /// Use one object for both roles.
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: DurableStore + SettingsStore + 'static,
    {
        Self {
            queue: store.clone(),
            settings: store,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.queue.is_durable()
    }
}
