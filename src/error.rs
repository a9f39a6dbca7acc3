use thiserror::Error;

/// Error type for the message store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// IO error
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Error surfaced by the embedded index library
    #[error("index error: {0}")]
    Index(#[from] leveldb::database::error::Error),
    /// Record payload encode/decode error
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    /// Ledger encode/decode error
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// A record in the log failed its length or checksum validation.
    /// During replay this truncates the tail; anywhere else it indicates
    /// a corrupted log or a program bug.
    #[error("corrupt record at log position {position}: {reason}")]
    Corrupt {
        /// Logical log position of the bad record.
        position: u64,
        /// What failed to validate.
        reason: String,
    },
    /// Invalid configuration, surfaced from `start`
    #[error("configuration error: {0}")]
    Config(String),
    /// The store has been stopped, or was never started
    #[error("store is not running")]
    Stopped,
    /// Error with a string message
    #[error("{0}")]
    StringError(String),
}

/// Custom result type for StoreError
pub type Result<T> = std::result::Result<T, StoreError>;
