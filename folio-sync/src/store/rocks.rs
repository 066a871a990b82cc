//! RocksDB-backed durable store.
//!
//! Column families:
//! - `queue`    — pending writes, keyed by big-endian u64 sequence so that
//!   iteration order is enqueue order. Values are bincode records whose
//!   payload is LZ4 compressed.
//! - `settings` — UTF-8 key/value pairs.
//!
//! Every write is synced to disk before the call returns: a write the queue
//! has accepted must survive a crash.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use super::{DurableStore, SettingsStore};
use crate::error::StoreError;
use crate::queue::{QueuedWrite, WriteKind};
use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const CF_QUEUE: &str = "queue";
const CF_SETTINGS: &str = "settings";

const COLUMN_FAMILIES: &[&str] = &[CF_QUEUE, CF_SETTINGS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 8MB)
    pub block_cache_size: usize,
    /// Max open files for RocksDB (default: 64)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 4MB)
    pub write_buffer_size: usize,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }

    /// Create config for testing (tiny caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            max_open_files: 16,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// On-disk shape of a queued write.
#[derive(Debug, Serialize, Deserialize)]
struct QueueRecord {
    kind: WriteKind,
    /// Milliseconds since the Unix epoch
    enqueued_at_ms: i64,
    /// LZ4 compressed, size prepended
    payload: Vec<u8>,
}

impl QueueRecord {
    fn new(kind: WriteKind, payload: &[u8], enqueued_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            enqueued_at_ms: enqueued_at.timestamp_millis(),
            payload: lz4_flex::compress_prepend_size(payload),
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }

    fn into_write(self, id: u64) -> Result<QueuedWrite, StoreError> {
        let payload = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let enqueued_at = DateTime::from_timestamp_millis(self.enqueued_at_ms)
            .ok_or_else(|| StoreError::Deserialization(format!("bad timestamp {}", self.enqueued_at_ms)))?;
        Ok(QueuedWrite {
            id,
            kind: self.kind,
            payload,
            enqueued_at,
        })
    }
}

fn decode_key(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// RocksDB-backed queue and settings store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, callers serialise via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next queue id
    sequence: AtomicU64,
    /// Serialises `take_all` so two drains never return the same write
    drain_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db);
        log::debug!("Recovered queue sequence {sequence} at {}", config.path.display());

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            drain_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_QUEUE => {
                // Payloads are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_SETTINGS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Next id after the highest key in the queue.
    ///
    /// Ids are never reused while writes remain, so restart order matches
    /// enqueue order.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let Some(cf) = db.cf_handle(CF_QUEUE) else {
            return 0;
        };

        let mut iter = db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) => decode_key(&key).map_or(0, |id| id + 1),
            _ => 0,
        }
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    fn sync_writes() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl DurableStore for RocksStore {
    fn append(
        &self,
        kind: WriteKind,
        payload: &[u8],
        enqueued_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let cf = self.cf(CF_QUEUE)?;
        let record = QueueRecord::new(kind, payload, enqueued_at).encode()?;
        let id = self.sequence.fetch_add(1, Ordering::SeqCst);

        self.db
            .put_cf_opt(cf, id.to_be_bytes(), &record, &Self::sync_writes())?;
        Ok(id)
    }

    fn take_all(&self) -> Result<Vec<QueuedWrite>, StoreError> {
        let _guard = self.drain_lock.lock().unwrap_or_else(|e| e.into_inner());
        let cf = self.cf(CF_QUEUE)?;

        let mut batch = WriteBatch::default();
        let mut taken = 0usize;
        let mut writes = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            batch.delete_cf(cf, &key);
            taken += 1;

            let Some(id) = decode_key(&key) else {
                log::warn!("Dropping queue entry with malformed key ({} bytes)", key.len());
                continue;
            };
            match QueueRecord::decode(&value).and_then(|r| r.into_write(id)) {
                Ok(write) => writes.push(write),
                Err(e) => log::warn!("Dropping unreadable queued write {id}: {e}"),
            }
        }

        if taken > 0 {
            self.db.write_opt(batch, &Self::sync_writes())?;
        }
        Ok(writes)
    }

    fn count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_QUEUE)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.drain_lock.lock().unwrap_or_else(|e| e.into_inner());
        let cf = self.cf(CF_QUEUE)?;

        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(cf, &key);
        }
        self.db.write_opt(batch, &Self::sync_writes())?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}

impl SettingsStore for RocksStore {
    fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_SETTINGS)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn put_setting(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        let cf = self.cf(CF_SETTINGS)?;
        match value {
            Some(value) => self
                .db
                .put_cf_opt(cf, key.as_bytes(), value.as_bytes(), &Self::sync_writes())?,
            None => self.db.delete_cf_opt(cf, key.as_bytes(), &Self::sync_writes())?,
        }
        Ok(())
    }
}
