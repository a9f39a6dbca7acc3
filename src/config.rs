//! Store configuration and the index factory table.

use std::path::PathBuf;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// Rotation threshold per log file.
pub const DEFAULT_LOG_SIZE: u64 = 100 * 1024 * 1024;
/// Log write buffer size.
pub const DEFAULT_LOG_WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;
/// Factory identifiers tried when none are configured.
pub const DEFAULT_INDEX_FACTORY: &str = "leveldb";

/// Block compression applied by the index library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexCompression {
    /// Snappy block compression (the library default).
    Snappy,
    /// No compression.
    None,
}

/// Configuration for a [`MessageStore`](crate::MessageStore).
///
/// `directory` is required; everything else has a usable default. The
/// struct deserializes from JSON so the admin binary can load it from a
/// config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Data directory holding log segments and index directories.
    pub directory: PathBuf,
    /// Fsync the log after unit-of-work batches that carried a
    /// completion listener.
    pub sync: bool,
    /// Verify index block checksums on every read.
    pub verify_checksums: bool,
    /// Enable the index library's strict integrity checks.
    pub paranoid_checks: bool,
    /// Rotation threshold per log file, in bytes.
    pub log_size: u64,
    /// Log write buffer, in bytes.
    pub log_write_buffer_size: usize,
    /// Open-file limit handed to the index library.
    pub index_max_open_files: Option<i32>,
    /// Index block restart interval, passed through.
    pub index_block_restart_interval: Option<i32>,
    /// Index block size in bytes, passed through.
    pub index_block_size: Option<usize>,
    /// Index write buffer in bytes, passed through.
    pub index_write_buffer_size: Option<usize>,
    /// Index block compression.
    pub index_compression: IndexCompression,
    /// Index block cache capacity in bytes.
    pub index_cache_size: Option<usize>,
    /// Comma list of index factory identifiers, tried in order.
    pub index_factory: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            directory: PathBuf::new(),
            sync: true,
            verify_checksums: false,
            paranoid_checks: false,
            log_size: DEFAULT_LOG_SIZE,
            log_write_buffer_size: DEFAULT_LOG_WRITE_BUFFER_SIZE,
            index_max_open_files: None,
            index_block_restart_interval: None,
            index_block_size: None,
            index_write_buffer_size: None,
            index_compression: IndexCompression::Snappy,
            index_cache_size: None,
            index_factory: DEFAULT_INDEX_FACTORY.to_owned(),
        }
    }
}

impl StoreConfig {
    /// Config rooted at `directory` with all defaults.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        StoreConfig {
            directory: directory.into(),
            ..StoreConfig::default()
        }
    }

    /// Set the fsync policy.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Set the per-file rotation threshold.
    pub fn with_log_size(mut self, log_size: u64) -> Self {
        self.log_size = log_size;
        self
    }

    /// Validate the parts of the configuration that would otherwise fail
    /// deep inside `start`.
    pub(crate) fn validate(&self) -> Result<IndexBackend> {
        if self.directory.as_os_str().is_empty() {
            return Err(StoreError::Config("directory is required".to_owned()));
        }
        if self.log_size == 0 {
            return Err(StoreError::Config("log_size must be non-zero".to_owned()));
        }
        IndexBackend::select(&self.index_factory)
    }
}

/// An entry in the static index factory table.
///
/// Factory identifiers are resolved here instead of by reflective class
/// loading; `index_factory` is a comma list and the first recognised
/// identifier wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexBackend {
    /// The native LevelDB library.
    LevelDb,
}

impl IndexBackend {
    pub(crate) fn select(list: &str) -> Result<IndexBackend> {
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match name {
                "leveldb" => return Ok(IndexBackend::LevelDb),
                other => warn!("unknown index factory {:?}, trying next", other),
            }
        }
        Err(StoreError::Config(format!(
            "no usable index factory in {:?}",
            list
        )))
    }
}
