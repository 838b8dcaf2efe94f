//! RocksDB-backed durable store.
//!
//! All operations are synchronous blocking I/O, serialized by the event
//! loop's single-threaded invocation. A write failure is surfaced as a
//! [`StoreError`] and halts the replica.

use lockstep_core::{StateStore, StoreError};
use rocksdb::{Options, DB};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Error type for opening the store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    DatabaseError(String),
}

/// RocksDB-based implementation of [`StateStore`].
pub struct RocksDbStore {
    db: DB,
}

impl RocksDbStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_keep_log_file_num(4);

        let db =
            DB::open(&opts, path).map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok(Self { db })
    }

    /// Internal: collect key/value pairs in `[start, end)`.
    fn iter_range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            start,
            rocksdb::Direction::Forward,
        ));
        iter.take_while(|item| match item {
            Ok((key, _)) => key.as_ref() < end,
            Err(_) => false,
        })
        .filter_map(|item| item.ok().map(|(k, v)| (k.to_vec(), v.to_vec())))
        .collect()
    }
}

impl StateStore for RocksDbStore {
    fn store_state(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.db
            .put(key.as_bytes(), value)
            .map_err(|e| StoreError(e.to_string()))
    }

    fn del_state(&mut self, key: &str) {
        if let Err(e) = self.db.delete(key.as_bytes()) {
            // Deletion is garbage collection; a failed delete only wastes
            // space and is retried at the next watermark move.
            warn!(key, error = %e, "failed to delete stale record");
        }
    }

    fn read_state(&self, key: &str) -> Option<Vec<u8>> {
        self.db.get(key.as_bytes()).ok().flatten()
    }

    fn read_state_set(&self, prefix: &str) -> BTreeMap<String, Vec<u8>> {
        let start = prefix.as_bytes().to_vec();
        let mut end = start.clone();
        // The keyspace is ASCII, so bumping the last byte bounds the prefix.
        if let Some(last) = end.last_mut() {
            *last += 1;
        }
        self.iter_range(&start, &end)
            .into_iter()
            .filter_map(|(k, v)| String::from_utf8(k).ok().map(|k| (k, v)))
            .filter(|(k, _)| k.starts_with(prefix))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_prefix_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RocksDbStore::open(dir.path()).unwrap();

        store.store_state("pset.1", b"a").unwrap();
        store.store_state("pset.10", b"b").unwrap();
        store.store_state("qset.0.1.ff", b"c").unwrap();
        store.store_state("chkpt.2", b"d").unwrap();

        assert_eq!(store.read_state("pset.1"), Some(b"a".to_vec()));
        assert_eq!(store.read_state("nope"), None);

        let psets = store.read_state_set("pset.");
        assert_eq!(psets.len(), 2);
        assert!(psets.contains_key("pset.1"));
        assert!(psets.contains_key("pset.10"));

        store.del_state("pset.1");
        assert_eq!(store.read_state("pset.1"), None);
        store.del_state("pset.1"); // idempotent

        assert_eq!(store.read_state_set("chkpt.").len(), 1);
    }

    #[test]
    fn reopen_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = RocksDbStore::open(dir.path()).unwrap();
            store.store_state("qset.0.3.ab", b"entry").unwrap();
        }
        let store = RocksDbStore::open(dir.path()).unwrap();
        assert_eq!(store.read_state("qset.0.3.ab"), Some(b"entry".to_vec()));
    }
}
