//! The gated storage backend.
//!
//! A [`Backend`] owns exactly one engine connection for one logical database
//! and serializes every physical operation through its connection gate. It is
//! the only way the layers above touch an engine.

use crate::engine::{BatchOp, TableEngine};
use crate::error::{StorageError, StorageResult};
use crate::file::FileEngine;
use crate::gate::ConnectionGate;
use crate::memory::MemoryEngine;
use crate::registry::ConnectionRegistry;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Default number of rows per committed sub-batch in [`Backend::bulk_upsert`].
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Name of the engine log file inside a store directory.
const STORE_FILE: &str = "tables.log";

/// Durable storage of key -> blob rows per table, with exclusive-connection
/// discipline.
///
/// All operations acquire the backend-wide connection permit before touching
/// the engine and release it before returning, including on error paths.
/// [`Backend::close`] drains the permit first so in-flight operations finish
/// before the connection is torn down.
pub struct Backend {
    name: String,
    path: Option<PathBuf>,
    registry: Option<ConnectionRegistry>,
    gate: ConnectionGate<Box<dyn TableEngine>>,
    closed: Mutex<bool>,
    batch_size: usize,
}

impl Backend {
    /// Opens a persistent backend under `folder/db_name`.
    ///
    /// Creates the folder if needed. When `delete_existing` is set, a prior
    /// store directory at that path is removed first (it must not be active
    /// in the registry). The `(db_name, path)` pair is registered in the
    /// given registry for the lifetime of the backend.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyActive`] if the store path is already
    /// registered, or an I/O error if the folder or log file cannot be set
    /// up.
    pub fn open(
        folder: &Path,
        db_name: &str,
        delete_existing: bool,
        registry: &ConnectionRegistry,
    ) -> StorageResult<Self> {
        let store_dir = folder.join(db_name);

        // Register first: holding the path is what makes the wipe below safe.
        registry.register(db_name, &store_dir)?;

        let engine = (|| {
            if store_dir.exists() && delete_existing {
                debug!(path = %store_dir.display(), "removing previous store");
                fs::remove_dir_all(&store_dir)?;
            }
            fs::create_dir_all(&store_dir)?;
            FileEngine::open(&store_dir.join(STORE_FILE))
        })();
        let engine = match engine {
            Ok(engine) => engine,
            Err(e) => {
                registry.release(db_name, &store_dir);
                return Err(e);
            }
        };

        debug!(db = db_name, path = %store_dir.display(), "backend opened");

        Ok(Self {
            name: db_name.to_string(),
            path: Some(store_dir),
            registry: Some(registry.clone()),
            gate: ConnectionGate::new(Box::new(engine) as Box<dyn TableEngine>),
            closed: Mutex::new(false),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    /// Opens an ephemeral in-memory backend, for tests and scratch stores.
    #[must_use]
    pub fn open_in_memory(db_name: &str) -> Self {
        Self::with_engine(db_name, Box::new(MemoryEngine::new()))
    }

    /// Wraps an arbitrary engine. This is the seam tests use to observe or
    /// perturb engine behavior.
    #[must_use]
    pub fn with_engine(db_name: &str, engine: Box<dyn TableEngine>) -> Self {
        Self {
            name: db_name.to_string(),
            path: None,
            registry: None,
            gate: ConnectionGate::new(engine),
            closed: Mutex::new(false),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Sets the number of rows per committed sub-batch.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Returns the database name this backend serves.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the store directory, or `None` for in-memory backends.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if *self.closed.lock() {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    /// Creates a two-column table (`key` primary key, `value` blob).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TableExists`] if the table already exists.
    pub fn create_table(&self, table: &str) -> StorageResult<()> {
        self.ensure_open()?;
        trace!(db = %self.name, table, "create table");
        self.gate.acquire().create_table(table)
    }

    /// Case-insensitive table existence check against the live catalog.
    pub fn has_table(&self, table: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        self.gate.acquire().has_table(table)
    }

    /// Inserts a single row.
    pub fn insert(&self, table: &str, key: &str, blob: &[u8]) -> StorageResult<()> {
        self.ensure_open()?;
        trace!(db = %self.name, table, key, "insert row");
        self.gate.acquire().insert(table, key, blob)
    }

    /// Overwrites an existing row.
    pub fn update(&self, table: &str, key: &str, blob: &[u8]) -> StorageResult<()> {
        self.ensure_open()?;
        trace!(db = %self.name, table, key, "update row");
        self.gate.acquire().update(table, key, blob)
    }

    /// Deletes a single row.
    pub fn delete(&self, table: &str, key: &str) -> StorageResult<()> {
        self.ensure_open()?;
        trace!(db = %self.name, table, key, "delete row");
        self.gate.acquire().delete(table, key)
    }

    /// Fetches a single row, or `None` if the key is absent.
    pub fn fetch(&self, table: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        trace!(db = %self.name, table, key, "fetch row");
        self.gate.acquire().fetch(table, key)
    }

    /// Reads an entire table. Guarded by the same permit as writers, so the
    /// scan never observes an in-flight batch.
    pub fn scan(&self, table: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        self.ensure_open()?;
        trace!(db = %self.name, table, "scan table");
        self.gate.acquire().scan(table)
    }

    /// Returns the set of keys currently stored in a table.
    pub fn key_set(&self, table: &str) -> StorageResult<HashSet<String>> {
        self.ensure_open()?;
        Ok(self.gate.acquire().keys(table)?.into_iter().collect())
    }

    /// Returns the number of rows in a table.
    pub fn row_count(&self, table: &str) -> StorageResult<u64> {
        self.ensure_open()?;
        self.gate.acquire().row_count(table)
    }

    /// Writes a set of rows, routing each to an insert or update depending on
    /// membership in `existing`.
    ///
    /// Rows are applied in sub-batches of the configured batch size, each
    /// committed as one engine transaction. A failing sub-batch aborts the
    /// call; earlier sub-batches stay durable.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Batch`] carrying the table, the first key of
    /// the failing sub-batch, and its index.
    pub fn bulk_upsert(
        &self,
        table: &str,
        rows: &HashMap<String, Vec<u8>>,
        existing: &HashSet<String>,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        trace!(db = %self.name, table, rows = rows.len(), "bulk upsert");

        let ops: Vec<BatchOp> = rows
            .iter()
            .map(|(key, blob)| {
                if existing.contains(key) {
                    BatchOp::Update {
                        key: key.clone(),
                        blob: blob.clone(),
                    }
                } else {
                    BatchOp::Insert {
                        key: key.clone(),
                        blob: blob.clone(),
                    }
                }
            })
            .collect();

        let engine = self.gate.acquire();
        for (batch_index, batch) in ops.chunks(self.batch_size).enumerate() {
            engine
                .apply_batch(table, batch)
                .map_err(|e| StorageError::Batch {
                    table: table.to_string(),
                    key: batch[0].key().to_string(),
                    batch_index,
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    /// Closes the backend: drains in-flight operations, releases the engine
    /// and the registry entry. Idempotent; failures while closing an
    /// already-broken connection are logged, never propagated.
    pub fn close(&self) {
        let mut closed = self.closed.lock();
        if *closed {
            return;
        }
        *closed = true;

        let engine = self.gate.drain();
        if let Err(e) = engine.close() {
            warn!(db = %self.name, error = %e, "engine close failed");
        }
        drop(engine);

        if let (Some(registry), Some(path)) = (&self.registry, &self.path) {
            registry.release(&self.name, path);
        }
        debug!(db = %self.name, "backend closed");
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("closed", &*self.closed.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rows(pairs: &[(&str, &[u8])]) -> HashMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn open_creates_store_directory() {
        let temp = tempdir().unwrap();
        let registry = ConnectionRegistry::new();

        let backend = Backend::open(temp.path(), "results", false, &registry).unwrap();
        assert!(temp.path().join("results").is_dir());
        assert!(registry.is_active(temp.path().join("results").as_path()));
        backend.close();
        assert!(!registry.is_active(temp.path().join("results").as_path()));
    }

    #[test]
    fn second_open_on_same_path_rejected() {
        let temp = tempdir().unwrap();
        let registry = ConnectionRegistry::new();

        let _first = Backend::open(temp.path(), "results", false, &registry).unwrap();
        let second = Backend::open(temp.path(), "results", false, &registry);
        assert!(matches!(second, Err(StorageError::AlreadyActive { .. })));
    }

    #[test]
    fn reopen_after_close_succeeds() {
        let temp = tempdir().unwrap();
        let registry = ConnectionRegistry::new();

        let backend = Backend::open(temp.path(), "results", false, &registry).unwrap();
        backend.create_table("hits").unwrap();
        backend.insert("hits", "a", b"1").unwrap();
        backend.close();

        let backend = Backend::open(temp.path(), "results", false, &registry).unwrap();
        assert_eq!(backend.fetch("hits", "a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn delete_existing_wipes_prior_store() {
        let temp = tempdir().unwrap();
        let registry = ConnectionRegistry::new();

        let backend = Backend::open(temp.path(), "results", false, &registry).unwrap();
        backend.create_table("hits").unwrap();
        backend.insert("hits", "a", b"1").unwrap();
        backend.close();

        let backend = Backend::open(temp.path(), "results", true, &registry).unwrap();
        assert!(!backend.has_table("hits").unwrap());
    }

    #[test]
    fn close_is_idempotent() {
        let backend = Backend::open_in_memory("results");
        backend.close();
        backend.close();
        assert!(matches!(
            backend.has_table("hits"),
            Err(StorageError::Closed)
        ));
    }

    #[test]
    fn bulk_upsert_routes_inserts_and_updates() {
        let backend = Backend::open_in_memory("results");
        backend.create_table("hits").unwrap();
        backend.insert("hits", "old", b"0").unwrap();

        let existing: HashSet<String> = backend.key_set("hits").unwrap();
        backend
            .bulk_upsert(
                "hits",
                &rows(&[("old", b"1"), ("new", b"2")]),
                &existing,
            )
            .unwrap();

        assert_eq!(backend.fetch("hits", "old").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.fetch("hits", "new").unwrap(), Some(b"2".to_vec()));
        assert_eq!(backend.row_count("hits").unwrap(), 2);
    }

    #[test]
    fn bulk_upsert_commits_per_batch() {
        let engine = MemoryEngine::new();
        engine.create_table("hits").unwrap();
        // Two rows fit in the fuse, the rest of the second batch does not.
        engine.fail_after_ops(2);

        let backend = Backend::with_engine("results", Box::new(engine)).with_batch_size(2);

        let mut all = HashMap::new();
        for i in 0..5 {
            all.insert(format!("k{i}"), vec![i as u8]);
        }

        let result = backend.bulk_upsert("hits", &all, &HashSet::new());
        let err = result.unwrap_err();
        match err {
            StorageError::Batch { batch_index, .. } => assert_eq!(batch_index, 1),
            other => panic!("unexpected error: {other}"),
        }

        // The first committed sub-batch is durable, the failed one absent.
        assert_eq!(backend.row_count("hits").unwrap(), 2);
    }

    #[test]
    fn scan_sees_committed_rows_only() {
        let backend = Backend::open_in_memory("results");
        backend.create_table("hits").unwrap();
        backend
            .bulk_upsert("hits", &rows(&[("a", b"1"), ("b", b"2")]), &HashSet::new())
            .unwrap();

        let scanned = backend.scan("hits").unwrap();
        assert_eq!(scanned.len(), 2);
    }
}
