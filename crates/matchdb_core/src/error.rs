//! Error types for matchdb core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in matchdb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] matchdb_storage::StorageError),

    /// Payload codec error.
    #[error("codec error: {0}")]
    Codec(#[from] matchdb_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A database, table, or object name contains the reserved separator, or
    /// an identifier cannot be made storage-safe.
    #[error("invalid name: {name}")]
    InvalidName {
        /// The offending name.
        name: String,
    },

    /// A synthetic storage key could not be mapped back to its original.
    #[error("invalid storage key: {key}")]
    InvalidKey {
        /// The offending storage key.
        key: String,
    },

    /// A database with the same name is already attached to the cache.
    #[error("database already attached to cache: {name}")]
    DuplicateDatabase {
        /// The database name.
        name: String,
    },

    /// A flush targeted a database the cache does not know.
    #[error("database not attached to cache: {name}")]
    UnknownDatabase {
        /// The database name.
        name: String,
    },

    /// A flush was asked to persist a key that is not held in the cache.
    ///
    /// This is a programming error in the caller, never silently ignored.
    #[error("cache integrity violation: {key} is not cached")]
    CacheIntegrity {
        /// The composite key that was requested.
        key: String,
    },

    /// The store is closed.
    #[error("store is closed")]
    StoreClosed,
}

impl CoreError {
    /// Creates an invalid-name error.
    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName { name: name.into() }
    }

    /// Creates an invalid-key error.
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey { key: key.into() }
    }

    /// Creates a cache-integrity error.
    pub fn cache_integrity(key: impl Into<String>) -> Self {
        Self::CacheIntegrity { key: key.into() }
    }
}
