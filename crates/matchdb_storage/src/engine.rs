//! Table engine trait definition.

use crate::error::StorageResult;
use std::sync::Arc;

/// A single mutation inside a batched write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert a new row.
    Insert {
        /// Row key.
        key: String,
        /// Row value.
        blob: Vec<u8>,
    },
    /// Overwrite an existing row.
    Update {
        /// Row key.
        key: String,
        /// Row value.
        blob: Vec<u8>,
    },
    /// Remove a row.
    Delete {
        /// Row key.
        key: String,
    },
}

impl BatchOp {
    /// Returns the key this operation targets.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Insert { key, .. } | Self::Update { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// A low-level table store engine for matchdb.
///
/// Engines are **opaque blob stores organized as tables**: each table maps a
/// string key to a byte blob. Engines do not interpret blobs - the layers
/// above own serialization and all key/table-name encoding.
///
/// # Invariants
///
/// - Single-row mutations are durable once the call returns `Ok`
/// - `apply_batch` is atomic: either every operation in the slice is applied
///   and durable, or none is
/// - `has_table` compares table names case-insensitively
/// - Engines must be `Send + Sync`; the backend serializes all access through
///   its connection gate, so engines need no ordering guarantees of their own
///
/// # Implementors
///
/// - [`super::MemoryEngine`] - For testing and ephemeral stores
/// - [`super::FileEngine`] - For persistent storage
pub trait TableEngine: Send + Sync {
    /// Creates a new, empty table.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::TableExists`] if a table with that name
    /// (compared case-insensitively) already exists.
    fn create_table(&self, table: &str) -> StorageResult<()>;

    /// Checks whether a table exists, ignoring ASCII case.
    fn has_table(&self, table: &str) -> StorageResult<bool>;

    /// Returns the names of all tables, in creation order.
    fn table_names(&self) -> StorageResult<Vec<String>>;

    /// Inserts a single row.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::UnknownTable`] if the table does not
    /// exist and [`crate::StorageError::DuplicateKey`] if the key is already
    /// present.
    fn insert(&self, table: &str, key: &str, blob: &[u8]) -> StorageResult<()>;

    /// Overwrites the value of an existing row.
    ///
    /// Updating an absent key is a no-op, mirroring the zero-rows-affected
    /// behavior of a SQL `UPDATE`.
    fn update(&self, table: &str, key: &str, blob: &[u8]) -> StorageResult<()>;

    /// Deletes a single row. Deleting an absent key is a no-op.
    fn delete(&self, table: &str, key: &str) -> StorageResult<()>;

    /// Fetches a single row, or `None` if the key is absent.
    fn fetch(&self, table: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Reads an entire table as `(key, blob)` pairs in key order.
    fn scan(&self, table: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Returns the keys of a table, in key order.
    fn keys(&self, table: &str) -> StorageResult<Vec<String>>;

    /// Returns the number of rows in a table.
    fn row_count(&self, table: &str) -> StorageResult<u64>;

    /// Applies a batch of mutations as one transaction.
    ///
    /// # Errors
    ///
    /// On any failure nothing from the batch is applied; the caller may treat
    /// previously applied batches as durable.
    fn apply_batch(&self, table: &str, ops: &[BatchOp]) -> StorageResult<()>;

    /// Releases the engine's resources. Called exactly once by the backend.
    fn close(&self) -> StorageResult<()>;
}

/// Shared-ownership engines are themselves engines, delegating every operation
/// to the pointee. Lets an engine be observed through a cloned `Arc` handle
/// while another `Arc` is handed to a backend as a `Box<dyn TableEngine>`.
impl<T: TableEngine + ?Sized> TableEngine for Arc<T> {
    fn create_table(&self, table: &str) -> StorageResult<()> {
        (**self).create_table(table)
    }

    fn has_table(&self, table: &str) -> StorageResult<bool> {
        (**self).has_table(table)
    }

    fn table_names(&self) -> StorageResult<Vec<String>> {
        (**self).table_names()
    }

    fn insert(&self, table: &str, key: &str, blob: &[u8]) -> StorageResult<()> {
        (**self).insert(table, key, blob)
    }

    fn update(&self, table: &str, key: &str, blob: &[u8]) -> StorageResult<()> {
        (**self).update(table, key, blob)
    }

    fn delete(&self, table: &str, key: &str) -> StorageResult<()> {
        (**self).delete(table, key)
    }

    fn fetch(&self, table: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        (**self).fetch(table, key)
    }

    fn scan(&self, table: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        (**self).scan(table)
    }

    fn keys(&self, table: &str) -> StorageResult<Vec<String>> {
        (**self).keys(table)
    }

    fn row_count(&self, table: &str) -> StorageResult<u64> {
        (**self).row_count(table)
    }

    fn apply_batch(&self, table: &str, ops: &[BatchOp]) -> StorageResult<()> {
        (**self).apply_batch(table, ops)
    }

    fn close(&self) -> StorageResult<()> {
        (**self).close()
    }
}
