//! In-memory store used when no durable store is available.

use super::{DurableStore, SettingsStore};
use crate::error::StoreError;
use crate::queue::{QueuedWrite, WriteKind};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    next_id: u64,
    writes: BTreeMap<u64, QueuedWrite>,
    settings: HashMap<String, String>,
}

/// Process-lifetime store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DurableStore for MemoryStore {
    fn append(
        &self,
        kind: WriteKind,
        payload: &[u8],
        enqueued_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.writes.insert(
            id,
            QueuedWrite {
                id,
                kind,
                payload: payload.to_vec(),
                enqueued_at,
            },
        );
        Ok(id)
    }

    fn take_all(&self) -> Result<Vec<QueuedWrite>, StoreError> {
        let writes = std::mem::take(&mut self.lock().writes);
        Ok(writes.into_values().collect())
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.lock().writes.len())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.lock().writes.clear();
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

impl SettingsStore for MemoryStore {
    fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().settings.get(key).cloned())
    }

    fn put_setting(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match value {
            Some(value) => inner.settings.insert(key.to_string(), value.to_string()),
            None => inner.settings.remove(key),
        };
        Ok(())
    }
}
