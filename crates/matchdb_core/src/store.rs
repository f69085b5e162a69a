//! Persistent object store façade.
//!
//! An [`ObjectStore`] ties one database's backend, the shared write-back
//! cache, and the key codec together: reads go through the cache and fall
//! back to the backend, writes land in the cache dirty and reach the backend
//! on eviction or an explicit save. Key-codec indexes and the used-tables
//! registry are persisted in a well-known metadata table across sessions.

use crate::cache::{ObjectCache, CACHE_SEPARATOR};
use crate::error::{CoreError, CoreResult};
use crate::keys::{KeyCodec, KeyIndexState};
use crate::progress::{canceled, ProgressHandler};
use matchdb_codec::{from_bytes, to_bytes};
use matchdb_storage::{Backend, ConnectionRegistry};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// Table holding one row per persisted store attribute.
const METADATA_TABLE: &str = "db_attributes";

/// Metadata row keys.
const LONG_TABLES_KEY: &str = "long_table_names";
const LONG_KEYS_KEY: &str = "long_keys";
const USED_TABLES_KEY: &str = "used_tables";
const CONNECTION_LOG_KEY: &str = "connection_log";

/// In-flight bulk load, coalescing concurrent requests for the same table.
#[derive(Debug)]
struct CurrentLoad {
    table: String,
    generation: u64,
    /// Whether the pass currently running is a full-table scan. A full scan
    /// covers every later request for the table, so such requests only wait.
    active_full: bool,
    pending_keys: HashSet<String>,
    pending_full: bool,
}

#[derive(Debug, Default)]
struct LoadState {
    current: Option<CurrentLoad>,
}

/// The per-database façade over cache, key codec, and storage backend.
///
/// # Lifecycle
///
/// Opened with [`ObjectStore::open`] (or [`ObjectStore::open_in_memory`] for
/// tests), which registers the store with the shared cache, loads persisted
/// metadata, and appends a best-effort connection-log row. Closed exactly
/// once with [`ObjectStore::close`]; dropping the store closes it as well.
pub struct ObjectStore<P> {
    name: String,
    backend: Arc<Backend>,
    cache: Arc<ObjectCache<P>>,
    codec: Mutex<KeyCodec>,
    used_tables: RwLock<HashSet<String>>,
    load_state: Mutex<LoadState>,
    load_done: Condvar,
    load_counter: AtomicU64,
    closed: Mutex<bool>,
}

impl<P> ObjectStore<P> {
    /// Opens a persistent store under `folder/db_name` and attaches it to the
    /// shared cache.
    ///
    /// # Errors
    ///
    /// Fails if the database name contains the reserved cache separator, if
    /// the store path is already active in the registry, or if persisted
    /// metadata cannot be read.
    pub fn open(
        folder: &Path,
        db_name: &str,
        delete_existing: bool,
        cache: Arc<ObjectCache<P>>,
        registry: &ConnectionRegistry,
    ) -> CoreResult<Arc<Self>> {
        if db_name.contains(CACHE_SEPARATOR) {
            return Err(CoreError::invalid_name(db_name));
        }
        let batch_size = cache.config().batch_size;
        let backend = Arc::new(
            Backend::open(folder, db_name, delete_existing, registry)?
                .with_batch_size(batch_size),
        );
        Self::establish(backend, cache)
    }

    /// Opens an ephemeral in-memory store, for tests and scratch sessions.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid or already attached to the cache.
    pub fn open_in_memory(db_name: &str, cache: Arc<ObjectCache<P>>) -> CoreResult<Arc<Self>> {
        let batch_size = cache.config().batch_size;
        let backend = Arc::new(Backend::open_in_memory(db_name).with_batch_size(batch_size));
        Self::establish(backend, cache)
    }

    /// Attaches a store to a pre-built backend.
    ///
    /// This is a lower-level constructor for callers that configure the
    /// backend themselves (custom engines, batch sizes). Most code should
    /// prefer [`ObjectStore::open`].
    ///
    /// # Errors
    ///
    /// Fails if the backend's name is already attached to the cache or its
    /// metadata cannot be read.
    pub fn open_with_backend(
        backend: Arc<Backend>,
        cache: Arc<ObjectCache<P>>,
    ) -> CoreResult<Arc<Self>> {
        Self::establish(backend, cache)
    }

    /// Registers the backend with the cache and loads persisted metadata.
    fn establish(backend: Arc<Backend>, cache: Arc<ObjectCache<P>>) -> CoreResult<Arc<Self>> {
        let name = backend.name().to_string();
        let config = cache.config().clone();

        cache.add_database(Arc::clone(&backend))?;

        let loaded = (|| -> CoreResult<(KeyIndexState, HashSet<String>)> {
            let mut state = KeyIndexState::default();
            let mut used = HashSet::new();
            if backend.has_table(METADATA_TABLE)? {
                if let Some(blob) = backend.fetch(METADATA_TABLE, LONG_TABLES_KEY)? {
                    state.long_tables = from_bytes(&blob)?;
                }
                if let Some(blob) = backend.fetch(METADATA_TABLE, LONG_KEYS_KEY)? {
                    state.long_keys = from_bytes(&blob)?;
                }
                if let Some(blob) = backend.fetch(METADATA_TABLE, USED_TABLES_KEY)? {
                    let tables: Vec<String> = from_bytes(&blob)?;
                    used = tables.into_iter().collect();
                }
            } else {
                backend.create_table(METADATA_TABLE)?;
            }
            Ok((state, used))
        })();

        let (codec_state, used_tables) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                cache.remove_database(&name);
                backend.close();
                return Err(e);
            }
        };

        let store = Arc::new(Self {
            name: name.clone(),
            backend,
            cache,
            codec: Mutex::new(KeyCodec::from_state(
                codec_state,
                config.max_key_length,
                config.max_table_name_length,
            )),
            used_tables: RwLock::new(used_tables),
            load_state: Mutex::new(LoadState::default()),
            load_done: Condvar::new(),
            load_counter: AtomicU64::new(0),
            closed: Mutex::new(false),
        });

        store.log_connection();
        debug!(db = %name, "store established");
        Ok(store)
    }

    /// Returns the database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the shared cache this store is attached to.
    #[must_use]
    pub fn cache(&self) -> &Arc<ObjectCache<P>> {
        &self.cache
    }

    /// Returns the store directory, or `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.backend.path()
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.closed.lock() {
            Err(CoreError::StoreClosed)
        } else {
            Ok(())
        }
    }

    /// Closes the store: persists key-codec indexes and the used-tables
    /// registry (best-effort), detaches from the shared cache, and releases
    /// the physical connection. Idempotent.
    ///
    /// Dirty cache entries are *not* flushed here; call
    /// [`ObjectCache::save_all`] first if they must survive.
    pub fn close(&self) -> CoreResult<()> {
        let mut closed = self.closed.lock();
        if *closed {
            return Ok(());
        }
        *closed = true;
        drop(closed);

        debug!(db = %self.name, "closing store");
        if let Err(e) = self.persist_metadata() {
            warn!(db = %self.name, error = %e, "failed to persist store metadata");
        }
        self.cache.remove_database(&self.name);
        self.backend.close();
        Ok(())
    }

    /// Writes one metadata row, inserting or updating as needed.
    fn write_attribute(&self, key: &str, blob: &[u8]) -> CoreResult<()> {
        if self.backend.fetch(METADATA_TABLE, key)?.is_some() {
            self.backend.update(METADATA_TABLE, key, blob)?;
        } else {
            self.backend.insert(METADATA_TABLE, key, blob)?;
        }
        Ok(())
    }

    fn persist_metadata(&self) -> CoreResult<()> {
        let (long_tables, long_keys) = {
            let codec = self.codec.lock();
            let state = codec.state();
            (to_bytes(&state.long_tables)?, to_bytes(&state.long_keys)?)
        };
        self.write_attribute(LONG_TABLES_KEY, &long_tables)?;
        self.write_attribute(LONG_KEYS_KEY, &long_keys)?;

        let mut used: Vec<String> = self.used_tables.read().iter().cloned().collect();
        used.sort();
        self.write_attribute(USED_TABLES_KEY, &to_bytes(&used)?)?;
        Ok(())
    }

    /// Appends a connection timestamp to the metadata log. Best-effort: a
    /// failure here must not prevent the store from opening.
    fn log_connection(&self) {
        let result = (|| -> CoreResult<()> {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let mut log: Vec<u64> = match self.backend.fetch(METADATA_TABLE, CONNECTION_LOG_KEY)? {
                Some(blob) => from_bytes(&blob)?,
                None => Vec::new(),
            };
            log.push(now);
            self.write_attribute(CONNECTION_LOG_KEY, &to_bytes(&log)?)
        })();
        if let Err(e) = result {
            warn!(db = %self.name, error = %e, "failed to write connection log");
        }
    }

    /// Creates the table in the backend if it does not exist yet and marks it
    /// used.
    ///
    /// # Errors
    ///
    /// Fails if the corrected name is invalid or the backend cannot create
    /// the table.
    pub fn ensure_table(&self, table: &str) -> CoreResult<()> {
        self.ensure_open()?;
        let storage_table = self.codec.lock().correct_table_name(table)?;
        let mut used = self.used_tables.write();
        if used.contains(&storage_table) {
            return Ok(());
        }
        if !self.backend.has_table(&storage_table)? {
            self.backend.create_table(&storage_table)?;
        }
        used.insert(storage_table);
        Ok(())
    }

    /// Recovers the original object key behind a synthetic storage key, as
    /// produced for overflow-length keys.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidKey`] for a suffix that was never
    /// allocated.
    pub fn original_key(&self, table: &str, storage_key: &str) -> CoreResult<String> {
        self.codec.lock().original_key(table, storage_key)
    }
}

impl<P> ObjectStore<P>
where
    P: Serialize + DeserializeOwned,
{
    /// Corrects the table name and object key for storage.
    fn correct(&self, table: &str, key: &str) -> CoreResult<(String, String)> {
        let mut codec = self.codec.lock();
        let storage_table = codec.correct_table_name(table)?;
        let storage_key = codec.correct_key(table, key);
        Ok((storage_table, storage_key))
    }

    /// Stores an object.
    ///
    /// With `use_cache`, the object lands in the cache marked dirty and is
    /// written out later by eviction or an explicit save. Without it, the
    /// object is written straight through to the backend and any stale cache
    /// entry for the key is invalidated.
    ///
    /// # Errors
    ///
    /// Fails on invalid names, on serialization failure, or on a backend
    /// error (including a duplicate key on the straight-through path).
    pub fn put(&self, table: &str, key: &str, payload: P, use_cache: bool) -> CoreResult<()> {
        self.ensure_open()?;
        self.ensure_table(table)?;
        let (storage_table, storage_key) = self.correct(table, key)?;
        trace!(db = %self.name, table = %storage_table, key = %storage_key, use_cache, "put object");

        if use_cache {
            self.cache
                .put(&self.name, &storage_table, &storage_key, payload, true)
        } else {
            let blob = to_bytes(&payload)?;
            self.backend.insert(&storage_table, &storage_key, &blob)?;
            self.cache.remove(&self.name, &storage_table, &storage_key);
            Ok(())
        }
    }

    /// Stores a set of objects through the backend's batched write path.
    ///
    /// When `all_new` is set the membership scan is skipped and every row is
    /// routed as an insert; callers that know their keys are fresh save a
    /// full key-set read this way.
    ///
    /// # Errors
    ///
    /// Surfaces batch failures with table, key, and batch index attached.
    pub fn put_many(
        &self,
        table: &str,
        payloads: HashMap<String, P>,
        all_new: bool,
    ) -> CoreResult<()> {
        self.ensure_open()?;
        self.ensure_table(table)?;
        let storage_table = self.codec.lock().correct_table_name(table)?;
        trace!(db = %self.name, table = %storage_table, rows = payloads.len(), all_new, "put many");

        let mut rows = HashMap::with_capacity(payloads.len());
        {
            let mut codec = self.codec.lock();
            for (key, payload) in &payloads {
                rows.insert(codec.correct_key(table, key), to_bytes(payload)?);
            }
        }
        let existing = if all_new {
            HashSet::new()
        } else {
            self.backend.key_set(&storage_table)?
        };
        self.backend.bulk_upsert(&storage_table, &rows, &existing)?;
        Ok(())
    }

    /// Retrieves an object.
    ///
    /// Checks the cache first. On a miss, falls back to the backend only when
    /// `allow_backend_fallback` is set and the table is known to have been
    /// used; a fetched object is placed in the cache clean when
    /// `populate_cache` is set.
    ///
    /// # Errors
    ///
    /// Fails on invalid names, backend errors, or a payload that does not
    /// deserialize.
    pub fn get(
        &self,
        table: &str,
        key: &str,
        allow_backend_fallback: bool,
        populate_cache: bool,
    ) -> CoreResult<Option<Arc<P>>> {
        self.ensure_open()?;
        let (storage_table, storage_key) = self.correct(table, key)?;

        if let Some(payload) = self.cache.get(&self.name, &storage_table, &storage_key) {
            return Ok(Some(payload));
        }
        if !allow_backend_fallback || !self.used_tables.read().contains(&storage_table) {
            return Ok(None);
        }
        trace!(db = %self.name, table = %storage_table, key = %storage_key, "cache miss, fetching");

        match self.backend.fetch(&storage_table, &storage_key)? {
            None => Ok(None),
            Some(blob) => {
                let payload = Arc::new(from_bytes::<P>(&blob)?);
                if populate_cache {
                    self.cache.put_shared(
                        &self.name,
                        &storage_table,
                        &storage_key,
                        Arc::clone(&payload),
                        false,
                    )?;
                }
                Ok(Some(payload))
            }
        }
    }

    /// Checks whether an object exists in the cache or the backend.
    ///
    /// A cache hit short-circuits when `check_cache` is set; a table never
    /// used short-circuits to `false` without a backend query.
    pub fn exists(&self, table: &str, key: &str, check_cache: bool) -> CoreResult<bool> {
        self.ensure_open()?;
        let (storage_table, storage_key) = self.correct(table, key)?;

        if check_cache && self.cache.contains(&self.name, &storage_table, &storage_key) {
            return Ok(true);
        }
        if !self.used_tables.read().contains(&storage_table) {
            return Ok(false);
        }
        Ok(self.backend.fetch(&storage_table, &storage_key)?.is_some())
    }

    /// Deletes an object from the cache and the backend.
    ///
    /// Both steps are attempted; a backend failure is surfaced after the
    /// cache entry is already gone.
    pub fn delete(&self, table: &str, key: &str) -> CoreResult<()> {
        self.ensure_open()?;
        let (storage_table, storage_key) = self.correct(table, key)?;
        trace!(db = %self.name, table = %storage_table, key = %storage_key, "delete object");

        self.cache.remove(&self.name, &storage_table, &storage_key);
        if self.used_tables.read().contains(&storage_table) {
            self.backend.delete(&storage_table, &storage_key)?;
        }
        Ok(())
    }

    /// Loads a table (or a set of its keys) into the cache.
    ///
    /// Rows already cache-resident are skipped. Progress is reported per row
    /// and cancellation is honored between rows.
    ///
    /// Concurrent calls coalesce: a second caller for a table already being
    /// loaded merges its key set onto the in-flight request and waits for it
    /// instead of issuing a duplicate scan; a call for a different table
    /// waits for the load slot.
    ///
    /// # Errors
    ///
    /// Surfaces backend and deserialization errors; the load slot is
    /// released either way.
    pub fn bulk_load(
        &self,
        table: &str,
        keys: Option<&HashSet<String>>,
        progress: Option<&dyn ProgressHandler>,
    ) -> CoreResult<()> {
        self.ensure_open()?;
        let storage_table = self.codec.lock().correct_table_name(table)?;
        if !self.used_tables.read().contains(&storage_table) {
            return Ok(());
        }
        let corrected: Option<HashSet<String>> = keys.map(|keys| {
            let mut codec = self.codec.lock();
            keys.iter().map(|key| codec.correct_key(table, key)).collect()
        });

        // Claim the load slot or join an in-flight load of the same table.
        {
            let mut state = self.load_state.lock();
            loop {
                match &mut state.current {
                    None => {
                        state.current = Some(CurrentLoad {
                            table: storage_table.clone(),
                            generation: self.load_counter.fetch_add(1, Ordering::SeqCst),
                            active_full: corrected.is_none(),
                            pending_keys: HashSet::new(),
                            pending_full: false,
                        });
                        break;
                    }
                    Some(current) if current.table == storage_table => {
                        match &corrected {
                            // A running full scan already covers these keys.
                            Some(keys) if !current.active_full => {
                                current.pending_keys.extend(keys.iter().cloned());
                            }
                            Some(_) => {}
                            None if !current.active_full => current.pending_full = true,
                            None => {}
                        }
                        let generation = current.generation;
                        while state
                            .current
                            .as_ref()
                            .is_some_and(|c| c.generation == generation)
                        {
                            self.load_done.wait(&mut state);
                        }
                        return Ok(());
                    }
                    Some(_) => {
                        self.load_done.wait(&mut state);
                    }
                }
            }
        }

        // Leader: run our own request, then drain whatever got merged onto
        // the slot while we were scanning.
        let result = (|| -> CoreResult<()> {
            if !self.run_load(&storage_table, corrected.as_ref(), progress)? {
                return Ok(()); // canceled
            }
            loop {
                let pending = {
                    let mut state = self.load_state.lock();
                    let Some(current) = state.current.as_mut() else {
                        break;
                    };
                    if current.pending_full {
                        current.pending_full = false;
                        current.pending_keys.clear();
                        current.active_full = true;
                        None
                    } else if !current.pending_keys.is_empty() {
                        current.active_full = false;
                        Some(std::mem::take(&mut current.pending_keys))
                    } else {
                        break;
                    }
                };
                if !self.run_load(&storage_table, pending.as_ref(), progress)? {
                    return Ok(()); // canceled
                }
            }
            Ok(())
        })();

        let mut state = self.load_state.lock();
        state.current = None;
        self.load_done.notify_all();
        result
    }

    /// One load pass: a full scan for `None`, a keyed lookup otherwise.
    /// Returns `false` if canceled.
    fn run_load(
        &self,
        storage_table: &str,
        keys: Option<&HashSet<String>>,
        progress: Option<&dyn ProgressHandler>,
    ) -> CoreResult<bool> {
        match keys {
            None => {
                let total = self.backend.row_count(storage_table)?;
                if let Some(p) = progress {
                    p.reset_counter();
                    p.set_maximum(total as usize);
                    p.set_indeterminate(false);
                }
                trace!(db = %self.name, table = %storage_table, rows = total, "bulk load scan");
                let rows = self.backend.scan(storage_table)?;
                for (key, blob) in rows {
                    if canceled(progress) {
                        return Ok(false);
                    }
                    if !self.cache.contains(&self.name, storage_table, &key) {
                        let payload: P = from_bytes(&blob)?;
                        self.cache
                            .put(&self.name, storage_table, &key, payload, false)?;
                    }
                    if let Some(p) = progress {
                        p.increment();
                    }
                }
            }
            Some(keys) => {
                if let Some(p) = progress {
                    p.reset_counter();
                    p.set_maximum(keys.len());
                    p.set_indeterminate(false);
                }
                for key in keys {
                    if canceled(progress) {
                        return Ok(false);
                    }
                    if !self.cache.contains(&self.name, storage_table, key) {
                        if let Some(blob) = self.backend.fetch(storage_table, key)? {
                            let payload: P = from_bytes(&blob)?;
                            self.cache
                                .put(&self.name, storage_table, key, payload, false)?;
                        }
                    }
                    if let Some(p) = progress {
                        p.increment();
                    }
                }
            }
        }
        Ok(true)
    }
}

impl<P> Drop for ObjectStore<P> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl<P> std::fmt::Debug for ObjectStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("name", &self.name)
            .field("used_tables", &self.used_tables.read().len())
            .field("closed", &*self.closed.lock())
            .finish_non_exhaustive()
    }
}


/// Persistence tests that require a real file system.
#[cfg(test)]
mod persistence_tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    fn cache() -> Arc<ObjectCache<String>> {
        Arc::new(ObjectCache::new(
            Config::new()
                .automated_memory_management(false)
                .cache_size(100),
        ))
    }

    #[test]
    fn objects_persist_across_sessions() {
        let temp = tempdir().unwrap();
        let registry = ConnectionRegistry::new();

        // First session: write through and close cleanly.
        {
            let store =
                ObjectStore::open(temp.path(), "results", false, cache(), &registry).unwrap();
            store.put("hits", "k", "payload".to_string(), false).unwrap();
            store.close().unwrap();
        }

        // Second session: the row and the used-tables registry survive.
        {
            let store =
                ObjectStore::open(temp.path(), "results", false, cache(), &registry).unwrap();
            assert_eq!(
                store.get("hits", "k", true, false).unwrap().as_deref(),
                Some(&"payload".to_string())
            );
            store.close().unwrap();
        }
    }

    #[test]
    fn used_tables_registry_gates_fallback_after_reopen() {
        let temp = tempdir().unwrap();
        let registry = ConnectionRegistry::new();

        {
            let store =
                ObjectStore::open(temp.path(), "results", false, cache(), &registry).unwrap();
            store.put("hits", "k", "v".to_string(), false).unwrap();
            store.close().unwrap();
        }

        {
            let store =
                ObjectStore::open(temp.path(), "results", false, cache(), &registry).unwrap();
            // A table that was never created still short-circuits.
            assert_eq!(store.get("other", "k", true, false).unwrap(), None);
            assert!(store.exists("hits", "k", false).unwrap());
            store.close().unwrap();
        }
    }

    #[test]
    fn delete_existing_starts_fresh() {
        let temp = tempdir().unwrap();
        let registry = ConnectionRegistry::new();

        {
            let store =
                ObjectStore::open(temp.path(), "results", false, cache(), &registry).unwrap();
            store.put("hits", "k", "v".to_string(), false).unwrap();
            store.close().unwrap();
        }

        {
            let store =
                ObjectStore::open(temp.path(), "results", true, cache(), &registry).unwrap();
            assert_eq!(store.get("hits", "k", true, false).unwrap(), None);
            store.close().unwrap();
        }
    }
}
