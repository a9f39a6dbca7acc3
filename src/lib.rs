#![deny(missing_docs)]
//! A log-structured persistent message store for a messaging broker.
//!
//! The store pairs an append-only record log (the source of truth) with a
//! sorted key/value index (fast lookup). The index is checkpointed by
//! hard-linking its directory and rebuilt on startup by replaying the tail
//! of the log; a per-segment reference ledger tracks which log files still
//! hold live messages so obsolete segments can be reclaimed.

mod config;
mod error;
mod index;
mod keys;
mod ledger;
mod log;
mod records;
mod store;

pub use config::{
    IndexCompression, StoreConfig, DEFAULT_INDEX_FACTORY, DEFAULT_LOG_SIZE,
    DEFAULT_LOG_WRITE_BUFFER_SIZE,
};
pub use error::{Result, StoreError};
pub use self::log::LogInfo;
pub use records::{
    locator_cell, CompletionCallback, Locator, LocatorCell, MapAction, MessageAction,
    MessageRecord, QueueEntryRange, QueueEntryRecord, QueueRecord, UnitOfWork,
};
pub use store::{DumpStats, MessageLookup, MessageStore};
