//! Thin wrapper around the embedded ordered key/value library backing the
//! index. Offers point ops, atomic write batches, point-in-time snapshots
//! and prefix/range cursors; a read snapshot is threaded through the read
//! options so bulk scans see a consistent view.

use std::path::Path;

use leveldb::batch::{Batch, Writebatch};
use leveldb::database::cache::Cache;
use leveldb::database::Database;
use leveldb::iterator::{Iterable, LevelDBIterator};
use leveldb::kv::KV;
use leveldb::options::{Options, ReadOptions, WriteOptions};
use leveldb::snapshots::{Snapshot, Snapshots};
use leveldb_sys::Compression;

use crate::config::{IndexBackend, IndexCompression, StoreConfig};
use crate::Result;

/// Raw index key bytes, as the backing library wants them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct IndexKey(pub(crate) Vec<u8>);

impl db_key::Key for IndexKey {
    fn from_u8(key: &[u8]) -> Self {
        IndexKey(key.to_vec())
    }

    fn as_slice<T, F: Fn(&[u8]) -> T>(&self, f: F) -> T {
        f(&self.0)
    }
}

pub(crate) fn write_opts(sync: bool) -> WriteOptions {
    let mut options = WriteOptions::new();
    options.sync = sync;
    options
}

/// The sorted key/value index.
pub(crate) struct Index {
    db: Database<IndexKey>,
    verify_checksums: bool,
}

impl Index {
    /// Open (or create) the index under `path` with the configured backend.
    pub(crate) fn open(path: &Path, config: &StoreConfig, backend: IndexBackend) -> Result<Index> {
        match backend {
            IndexBackend::LevelDb => Index::open_leveldb(path, config),
        }
    }

    fn open_leveldb(path: &Path, config: &StoreConfig) -> Result<Index> {
        let mut options = Options::new();
        options.create_if_missing = true;
        options.paranoid_checks = config.paranoid_checks;
        options.write_buffer_size = config.index_write_buffer_size;
        options.max_open_files = config.index_max_open_files;
        options.block_size = config.index_block_size;
        options.block_restart_interval = config.index_block_restart_interval;
        options.compression = match config.index_compression {
            IndexCompression::Snappy => Compression::Snappy,
            IndexCompression::None => Compression::No,
        };
        if let Some(bytes) = config.index_cache_size {
            options.cache = Some(Cache::new(bytes));
        }

        let db = Database::open(path, options)?;
        Ok(Index {
            db,
            verify_checksums: config.verify_checksums,
        })
    }

    fn read_opts<'a>(&self, snapshot: Option<&'a Snapshot<'a, IndexKey>>) -> ReadOptions<'a, IndexKey> {
        let mut options = ReadOptions::new();
        options.verify_checksums = self.verify_checksums;
        options.snapshot = snapshot;
        options
    }

    /// Point lookup, optionally pinned to `snapshot`.
    pub(crate) fn get<'a>(
        &'a self,
        snapshot: Option<&'a Snapshot<'a, IndexKey>>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(self.read_opts(snapshot), IndexKey(key.to_vec()))?)
    }

    pub(crate) fn put(&self, key: &[u8], value: &[u8], sync: bool) -> Result<()> {
        Ok(self.db.put(write_opts(sync), IndexKey(key.to_vec()), value)?)
    }

    pub(crate) fn delete(&self, key: &[u8], sync: bool) -> Result<()> {
        Ok(self.db.delete(write_opts(sync), IndexKey(key.to_vec()))?)
    }

    /// Apply a batch atomically.
    pub(crate) fn write_batch(&self, batch: &Writebatch<IndexKey>, sync: bool) -> Result<()> {
        Ok(self.db.write(write_opts(sync), batch)?)
    }

    /// Point-in-time view of the index.
    pub(crate) fn snapshot(&self) -> Snapshot<'_, IndexKey> {
        self.db.snapshot()
    }

    /// Walk keys in order starting at the first key `>= start`, until `f`
    /// returns `false` or the keyspace ends.
    pub(crate) fn scan_from<'a>(
        &'a self,
        snapshot: Option<&'a Snapshot<'a, IndexKey>>,
        start: &[u8],
        mut f: impl FnMut(Vec<u8>, Vec<u8>) -> Result<bool>,
    ) -> Result<()> {
        let start = IndexKey(start.to_vec());
        for (key, value) in self.db.iter(self.read_opts(snapshot)).from(&start) {
            if !f(key.0, value)? {
                break;
            }
        }
        Ok(())
    }

    /// Walk every `(key, value)` under `prefix` in order.
    pub(crate) fn scan_prefix<'a>(
        &'a self,
        snapshot: Option<&'a Snapshot<'a, IndexKey>>,
        prefix: &[u8],
        mut f: impl FnMut(Vec<u8>, Vec<u8>) -> Result<bool>,
    ) -> Result<()> {
        self.scan_from(snapshot, prefix, |key, value| {
            if !key.starts_with(prefix) {
                return Ok(false);
            }
            f(key, value)
        })
    }

    /// Walk the keys under `prefix` without materializing values.
    pub(crate) fn scan_prefix_keys<'a>(
        &'a self,
        snapshot: Option<&'a Snapshot<'a, IndexKey>>,
        prefix: &[u8],
        mut f: impl FnMut(Vec<u8>) -> Result<bool>,
    ) -> Result<()> {
        let start = IndexKey(prefix.to_vec());
        for key in self.db.keys_iter(self.read_opts(snapshot)).from(&start) {
            if !key.0.starts_with(prefix) {
                break;
            }
            if !f(key.0)? {
                break;
            }
        }
        Ok(())
    }

    /// Greatest key carrying `prefix`, if any.
    pub(crate) fn last_key_with_prefix(&self, prefix: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut last = None;
        self.scan_prefix_keys(None, prefix, |key| {
            last = Some(key);
            Ok(true)
        })?;
        Ok(last)
    }
}
