//! Durable FIFO of writes that could not be delivered yet.
//!
//! Writes land here when the client is offline or a push fails, and are
//! replayed in enqueue order by `SyncClient::flush_queue`.
//!
//! ```text
//! enqueue ──▶ primary store (RocksDB) ──┐
//!     │  append failed once               ├──▶ drain: primary first, then spill
//!     └──────▶ spill (memory) ───────────┘
//! ```
//!
//! A failed durable append flips the queue into degraded mode for the rest of
//! the process: later writes go to the in-memory spill so that ordering holds,
//! and `is_degraded()` reports the loss of durability.

use crate::error::StoreError;
use crate::store::{DurableStore, MemoryStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a queued write carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    /// Full serialized project document
    ProjectSnapshot,
}

/// A write waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedWrite {
    /// Assigned by the store, increasing in enqueue order
    pub id: u64,
    pub kind: WriteKind,
    /// Opaque serialized project
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

/// The write queue.
pub struct DurableWriteQueue {
    primary: Arc<dyn DurableStore>,
    spill: MemoryStore,
    /// Set after the first failed durable append
    spilling: AtomicBool,
}

impl DurableWriteQueue {
    pub fn new(primary: Arc<dyn DurableStore>) -> Self {
        if !primary.is_durable() {
            log::warn!("Write queue is not durable; pending writes are lost on restart");
        }
        Self {
            primary,
            spill: MemoryStore::new(),
            spilling: AtomicBool::new(false),
        }
    }

    /// Queue backed only by memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Append a project snapshot.
    pub fn enqueue(&self, payload: Vec<u8>) -> Result<QueuedWrite, StoreError> {
        self.enqueue_at(WriteKind::ProjectSnapshot, payload, Utc::now())
    }

    fn enqueue_at(
        &self,
        kind: WriteKind,
        payload: Vec<u8>,
        enqueued_at: DateTime<Utc>,
    ) -> Result<QueuedWrite, StoreError> {
        if !self.spilling.load(Ordering::SeqCst) {
            match self.primary.append(kind, &payload, enqueued_at) {
                Ok(id) => {
                    log::debug!("Queued write {id} ({} bytes)", payload.len());
                    return Ok(QueuedWrite { id, kind, payload, enqueued_at });
                }
                Err(e) => {
                    log::error!(
                        "Durable append failed ({e}); queue degraded to memory for this session"
                    );
                    self.spilling.store(true, Ordering::SeqCst);
                }
            }
        }

        let id = self.spill.append(kind, &payload, enqueued_at)?;
        Ok(QueuedWrite { id, kind, payload, enqueued_at })
    }

    /// Put writes back in the given order, keeping their original timestamps.
    pub fn requeue(&self, writes: Vec<QueuedWrite>) -> Result<(), StoreError> {
        for write in writes {
            self.enqueue_at(write.kind, write.payload, write.enqueued_at)?;
        }
        Ok(())
    }

    /// Remove and return every queued write in FIFO order.
    ///
    /// If the primary store fails nothing is removed.
    pub fn drain(&self) -> Result<Vec<QueuedWrite>, StoreError> {
        let mut writes = self.primary.take_all()?;
        if self.spilling.load(Ordering::SeqCst) {
            writes.extend(self.spill.take_all()?);
        }
        if !writes.is_empty() {
            log::debug!("Drained {} queued writes", writes.len());
        }
        Ok(writes)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.primary.count()? + self.spill.count()?)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.primary.clear()?;
        self.spill.clear()
    }

    /// Whether accepted writes may be lost on restart.
    pub fn is_degraded(&self) -> bool {
        !self.primary.is_durable() || self.spilling.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RocksStore, StoreConfig};
    use std::sync::atomic::AtomicUsize;

    /// Durable store whose appends start failing after `ok_appends`.
    struct FlakyStore {
        inner: MemoryStore,
        ok_appends: usize,
        appends: AtomicUsize,
    }

    impl DurableStore for FlakyStore {
        fn append(
            &self,
            kind: WriteKind,
            payload: &[u8],
            enqueued_at: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            if self.appends.fetch_add(1, Ordering::SeqCst) >= self.ok_appends {
                return Err(StoreError::Database("disk full".into()));
            }
            self.inner.append(kind, payload, enqueued_at)
        }
        fn take_all(&self) -> Result<Vec<QueuedWrite>, StoreError> {
            self.inner.take_all()
        }
        fn count(&self) -> Result<usize, StoreError> {
            self.inner.count()
        }
        fn clear(&self) -> Result<(), StoreError> {
            self.inner.clear()
        }
        fn is_durable(&self) -> bool {
            true
        }
    }

    fn payloads(writes: &[QueuedWrite]) -> Vec<&[u8]> {
        writes.iter().map(|w| w.payload.as_slice()).collect()
    }

    #[test]
    fn test_enqueue_then_drain_is_fifo() {
        let queue = DurableWriteQueue::in_memory();
        queue.enqueue(b"w1".to_vec()).unwrap();
        queue.enqueue(b"w2".to_vec()).unwrap();
        queue.enqueue(b"w3".to_vec()).unwrap();
        assert_eq!(queue.len().unwrap(), 3);

        let drained = queue.drain().unwrap();
        assert_eq!(payloads(&drained), vec![b"w1".as_slice(), b"w2", b"w3"]);
        assert_eq!(queue.len().unwrap(), 0);
    }

    #[test]
    fn test_drain_empty_is_idempotent() {
        let queue = DurableWriteQueue::in_memory();
        assert!(queue.drain().unwrap().is_empty());
        assert!(queue.drain().unwrap().is_empty());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_len_has_no_side_effects() {
        let queue = DurableWriteQueue::in_memory();
        queue.enqueue(b"x".to_vec()).unwrap();
        assert_eq!(queue.len().unwrap(), 1);
        assert_eq!(queue.len().unwrap(), 1);
        assert_eq!(queue.drain().unwrap().len(), 1);
    }

    #[test]
    fn test_clear() {
        let queue = DurableWriteQueue::in_memory();
        queue.enqueue(b"x".to_vec()).unwrap();
        queue.clear().unwrap();
        assert!(queue.drain().unwrap().is_empty());
    }

    #[test]
    fn test_requeue_preserves_order_and_timestamps() {
        let queue = DurableWriteQueue::in_memory();
        queue.enqueue(b"a".to_vec()).unwrap();
        queue.enqueue(b"b".to_vec()).unwrap();
        let drained = queue.drain().unwrap();
        let stamps: Vec<_> = drained.iter().map(|w| w.enqueued_at).collect();

        queue.requeue(drained).unwrap();
        let again = queue.drain().unwrap();
        assert_eq!(payloads(&again), vec![b"a".as_slice(), b"b"]);
        assert_eq!(again.iter().map(|w| w.enqueued_at).collect::<Vec<_>>(), stamps);
    }

    #[test]
    fn test_memory_queue_reports_degraded() {
        assert!(DurableWriteQueue::in_memory().is_degraded());
    }

    #[test]
    fn test_rocks_queue_is_not_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let queue = DurableWriteQueue::new(Arc::new(store));
        assert!(!queue.is_degraded());
    }

    #[test]
    fn test_failed_append_spills_and_keeps_order() {
        let queue = DurableWriteQueue::new(Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            ok_appends: 2,
            appends: AtomicUsize::new(0),
        }));

        queue.enqueue(b"1".to_vec()).unwrap();
        queue.enqueue(b"2".to_vec()).unwrap();
        assert!(!queue.is_degraded());

        queue.enqueue(b"3".to_vec()).unwrap();
        queue.enqueue(b"4".to_vec()).unwrap();
        assert!(queue.is_degraded());
        assert_eq!(queue.len().unwrap(), 4);

        let drained = queue.drain().unwrap();
        assert_eq!(payloads(&drained), vec![b"1".as_slice(), b"2", b"3", b"4"]);
    }
}
