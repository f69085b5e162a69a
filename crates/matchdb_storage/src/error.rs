//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another connection is already registered for the same store path.
    #[error("connection already active for {path}")]
    AlreadyActive {
        /// Path of the store that is already in use.
        path: PathBuf,
    },

    /// Attempted to create a table that already exists.
    #[error("table already exists: {table}")]
    TableExists {
        /// Name of the table.
        table: String,
    },

    /// Attempted to operate on a table that was never created.
    #[error("unknown table: {table}")]
    UnknownTable {
        /// Name of the table.
        table: String,
    },

    /// Attempted to insert a row whose key is already present.
    #[error("duplicate key in table {table}: {key}")]
    DuplicateKey {
        /// Name of the table.
        table: String,
        /// The offending key.
        key: String,
    },

    /// A batched write failed partway through.
    ///
    /// Sub-batches committed before the failure remain durable; the failing
    /// sub-batch and everything after it were not applied.
    #[error("batch {batch_index} failed on table {table}, key {key}: {source}")]
    Batch {
        /// Name of the table being written.
        table: String,
        /// First key of the failing sub-batch.
        key: String,
        /// Zero-based index of the failing sub-batch.
        batch_index: usize,
        /// The underlying engine failure.
        #[source]
        source: Box<StorageError>,
    },

    /// The store file is corrupted.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    /// The backend is closed.
    #[error("backend is closed")]
    Closed,
}

impl StorageError {
    /// Creates a corrupted-store error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Creates an unknown-table error.
    pub fn unknown_table(table: impl Into<String>) -> Self {
        Self::UnknownTable {
            table: table.into(),
        }
    }

    /// Creates a duplicate-key error.
    pub fn duplicate_key(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::DuplicateKey {
            table: table.into(),
            key: key.into(),
        }
    }
}
