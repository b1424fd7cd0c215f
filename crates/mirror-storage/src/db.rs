//! RocksDB wrapper for registry-mirror storage.
//!
//! Provides:
//! - Database open with column family setup
//! - Checkpoint get/put
//! - Per-index record reads, writes, ordered scans, copy and clear

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use tracing::{debug, info};

use crate::column_families::{build_cf_descriptors, CF_CHECKPOINTS, CF_INDEX_META, CF_RECORDS};
use crate::error::StorageError;
use crate::keys::{CheckpointKey, RecordKey};

/// Main storage interface
pub struct Storage {
    db: DB,
}

impl Storage {
    /// Open storage at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening storage at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(4);

        let db = DB::open_cf_descriptors(&db_opts, path, build_cf_descriptors())?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(name.to_string()))
    }

    /// Store a checkpoint
    pub fn put_checkpoint(&self, name: &str, checkpoint_bytes: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        self.db
            .put_cf(cf, CheckpointKey::new(name).to_bytes(), checkpoint_bytes)?;
        Ok(())
    }

    /// Get a checkpoint
    pub fn get_checkpoint(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        Ok(self.db.get_cf(cf, CheckpointKey::new(name).to_bytes())?)
    }

    // ==================== Record Methods ====================

    pub fn put_record(&self, index: &str, object_id: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(CF_RECORDS)?;
        let key = RecordKey::new(index, object_id)?;
        self.db.put_cf(cf, key.to_bytes(), bytes)?;
        Ok(())
    }

    /// Write several records of one index atomically
    pub fn put_records(&self, index: &str, records: &[(String, Vec<u8>)]) -> Result<(), StorageError> {
        let cf = self.cf(CF_RECORDS)?;
        let mut batch = WriteBatch::default();
        for (object_id, bytes) in records {
            batch.put_cf(cf, RecordKey::new(index, object_id)?.to_bytes(), bytes);
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn get_record(&self, index: &str, object_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(CF_RECORDS)?;
        let key = RecordKey::new(index, object_id)?;
        Ok(self.db.get_cf(cf, key.to_bytes())?)
    }

    /// Delete a record. Missing records are not an error.
    pub fn delete_record(&self, index: &str, object_id: &str) -> Result<(), StorageError> {
        let cf = self.cf(CF_RECORDS)?;
        let key = RecordKey::new(index, object_id)?;
        self.db.delete_cf(cf, key.to_bytes())?;
        Ok(())
    }

    /// Visit records of `index` in objectID order, starting strictly after
    /// `after`. The visitor returns `false` to stop.
    pub fn scan_records<F>(&self, index: &str, after: Option<&str>, mut visit: F) -> Result<(), StorageError>
    where
        F: FnMut(&str, &[u8]) -> Result<bool, StorageError>,
    {
        let cf = self.cf(CF_RECORDS)?;
        let start = match after {
            Some(id) => RecordKey::after(index, id),
            None => RecordKey::prefix(index),
        };
        let end = RecordKey::prefix_end(index);

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.as_ref() >= end.as_slice() {
                break;
            }
            let record_key = RecordKey::from_bytes(&key)?;
            if !visit(&record_key.object_id, &value)? {
                break;
            }
        }
        Ok(())
    }

    pub fn count_records(&self, index: &str) -> Result<u64, StorageError> {
        let mut count = 0u64;
        self.scan_records(index, None, |_, _| {
            count += 1;
            Ok(true)
        })?;
        Ok(count)
    }

    /// Remove every record of `index`
    pub fn clear_index(&self, index: &str) -> Result<(), StorageError> {
        let cf = self.cf(CF_RECORDS)?;
        self.db
            .delete_range_cf(cf, RecordKey::prefix(index), RecordKey::prefix_end(index))?;
        debug!(index, "Cleared index");
        Ok(())
    }

    /// Replace `dst` with the records of `src`
    pub fn copy_index(&self, src: &str, dst: &str) -> Result<u64, StorageError> {
        let cf = self.cf(CF_RECORDS)?;
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(cf, RecordKey::prefix(dst), RecordKey::prefix_end(dst));

        let mut copied = 0u64;
        self.scan_records(src, None, |object_id, value| {
            batch.put_cf(cf, RecordKey::new(dst, object_id)?.to_bytes(), value);
            copied += 1;
            Ok(true)
        })?;

        self.db.write(batch)?;
        info!(src, dst, copied, "Copied index");
        Ok(copied)
    }

    pub fn put_index_meta(&self, index: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(CF_INDEX_META)?;
        self.db.put_cf(cf, format!("settings:{}", index).into_bytes(), bytes)?;
        Ok(())
    }

    pub fn get_index_meta(&self, index: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(CF_INDEX_META)?;
        Ok(self.db.get_cf(cf, format!("settings:{}", index).into_bytes())?)
    }
}
