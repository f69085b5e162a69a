//! Write-back object cache.
//!
//! One cache serves any number of databases: entries are keyed by the
//! composite `(database, table, object key)` and flushed to the owning
//! database's backend when evicted or explicitly saved. Writes land here
//! first and reach the backend later; a dirty entry is never discarded
//! except through a successful flush.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::memory::{FixedGauge, MemoryGauge};
use crate::progress::{canceled, ProgressHandler};
use matchdb_codec::to_bytes;
use matchdb_storage::Backend;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// Separator concatenating the parts of a composite cache key.
///
/// None of the three parts may contain it; insertion of such a name fails
/// with [`CoreError::InvalidName`].
pub const CACHE_SEPARATOR: &str = "_ccs_";

/// Share of the queue drained per eviction pass.
const EVICTION_SHARE: f64 = 0.25;

/// Composite cache key: database, table, and object key joined by the
/// reserved separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeKey(String);

impl CompositeKey {
    /// Builds a composite key, rejecting parts containing the separator.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidName`] naming the offending part.
    pub fn new(db: &str, table: &str, key: &str) -> CoreResult<Self> {
        for part in [db, table, key] {
            if part.contains(CACHE_SEPARATOR) {
                return Err(CoreError::invalid_name(part));
            }
        }
        Ok(Self::unchecked(db, table, key))
    }

    /// Joins the parts without validation. Lookup-only paths use this: a key
    /// containing the separator cannot match any stored entry anyway.
    fn unchecked(db: &str, table: &str, key: &str) -> Self {
        Self(format!("{db}{CACHE_SEPARATOR}{table}{CACHE_SEPARATOR}{key}"))
    }

    /// Splits the key back into `(database, table, object key)`.
    #[must_use]
    pub fn parts(&self) -> (&str, &str, &str) {
        let mut it = self.0.splitn(3, CACHE_SEPARATOR);
        let db = it.next().unwrap_or("");
        let table = it.next().unwrap_or("");
        let key = it.next().unwrap_or("");
        (db, table, key)
    }

    /// Returns the concatenated form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached payload and its dirty flag.
///
/// `dirty` means the payload has never been confirmed written to the backend
/// since its last mutation; a clean entry is known consistent with backend
/// state.
#[derive(Debug)]
struct CacheEntry<P> {
    payload: Arc<P>,
    dirty: bool,
}

/// Entry map and eviction queue, kept in lock-step: every queued key has an
/// entry and every entry is queued exactly once.
#[derive(Debug)]
struct CacheInner<P> {
    entries: HashMap<CompositeKey, CacheEntry<P>>,
    queue: VecDeque<CompositeKey>,
}

/// Bounded in-memory write-back cache shared by one or more databases.
///
/// # Eviction
///
/// Two policies, selected by [`Config::automated_memory_management`]:
/// fixed capacity (queue length bound) or memory pressure (an injected
/// [`MemoryGauge`] against [`Config::memory_share`]). Either way, eviction
/// drains a quarter of the queue per pass, flushing dirty entries to their
/// backends in one batched write and dropping clean ones.
///
/// # Concurrency
///
/// Eviction checks, flush routines, and in-place updates are mutually
/// exclusive through an internal maintenance lock. `get` is a pure lookup
/// with no side effects.
pub struct ObjectCache<P> {
    config: Config,
    gauge: Box<dyn MemoryGauge>,
    inner: RwLock<CacheInner<P>>,
    /// Pairs with `queue_ready`; `put` notifies under this lock.
    signal: Mutex<()>,
    queue_ready: Condvar,
    /// Serializes eviction checks, flush routines and in-place updates.
    maint: Mutex<()>,
    databases: RwLock<HashMap<String, Arc<Backend>>>,
}

impl<P> ObjectCache<P> {
    /// Creates a cache with the given configuration and a gauge that reports
    /// no memory pressure. With the default automated policy this means no
    /// eviction until a real gauge is supplied via [`ObjectCache::with_gauge`].
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_gauge(config, Box::new(FixedGauge::new(0.0)))
    }

    /// Creates a cache with an injected memory gauge.
    #[must_use]
    pub fn with_gauge(config: Config, gauge: Box<dyn MemoryGauge>) -> Self {
        Self {
            config,
            gauge,
            inner: RwLock::new(CacheInner {
                entries: HashMap::new(),
                queue: VecDeque::new(),
            }),
            signal: Mutex::new(()),
            queue_ready: Condvar::new(),
            maint: Mutex::new(()),
            databases: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cache configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Attaches a database so its entries can be flushed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidName`] if the database name contains the
    /// reserved separator, or [`CoreError::DuplicateDatabase`] if a database
    /// with the same name is already attached.
    pub fn add_database(&self, backend: Arc<Backend>) -> CoreResult<()> {
        let name = backend.name().to_string();
        if name.contains(CACHE_SEPARATOR) {
            return Err(CoreError::invalid_name(name));
        }
        let mut databases = self.databases.write();
        if databases.contains_key(&name) {
            return Err(CoreError::DuplicateDatabase { name });
        }
        databases.insert(name, backend);
        Ok(())
    }

    /// Detaches a database. Entries for it stay cached but can no longer be
    /// flushed until it is re-attached.
    pub fn remove_database(&self, name: &str) {
        self.databases.write().remove(name);
    }

    /// Returns the cached payload, or `None`. Pure lookup: no backend
    /// interaction, no eviction side effects.
    #[must_use]
    pub fn get(&self, db: &str, table: &str, key: &str) -> Option<Arc<P>> {
        let ck = CompositeKey::unchecked(db, table, key);
        self.inner
            .read()
            .entries
            .get(&ck)
            .map(|entry| Arc::clone(&entry.payload))
    }

    /// Checks whether an entry is cached.
    #[must_use]
    pub fn contains(&self, db: &str, table: &str, key: &str) -> bool {
        let ck = CompositeKey::unchecked(db, table, key);
        self.inner.read().entries.contains_key(&ck)
    }

    /// Returns the entry's dirty flag, or `None` if it is not cached.
    #[must_use]
    pub fn is_dirty(&self, db: &str, table: &str, key: &str) -> Option<bool> {
        let ck = CompositeKey::unchecked(db, table, key);
        self.inner.read().entries.get(&ck).map(|entry| entry.dirty)
    }

    /// Returns the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Checks whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Returns the oldest queued key, waiting if the queue is momentarily
    /// empty while entries exist. This is the single legitimate blocking
    /// point of the cache.
    fn front_blocking(&self) -> Option<CompositeKey> {
        loop {
            let mut signal = self.signal.lock();
            {
                let inner = self.inner.read();
                if let Some(key) = inner.queue.front() {
                    return Some(key.clone());
                }
                if inner.entries.is_empty() {
                    return None;
                }
            }
            self.queue_ready.wait(&mut signal);
        }
    }

    fn eviction_needed(&self) -> bool {
        if self.config.automated_memory_management {
            self.gauge.pressure() >= self.config.memory_share
        } else {
            self.inner.read().queue.len() > self.config.cache_size
        }
    }
}

/// Operations that can reach a backend flush need serializable payloads.
impl<P: Serialize> ObjectCache<P> {
    /// Inserts or silently replaces an entry, then runs the eviction check
    /// unless the cache is read-only.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidName`] if any name part contains the
    /// reserved separator, or a flush error raised by a triggered eviction.
    pub fn put(&self, db: &str, table: &str, key: &str, payload: P, dirty: bool) -> CoreResult<()> {
        self.put_shared(db, table, key, Arc::new(payload), dirty)
    }

    /// [`ObjectCache::put`] for payloads that are already shared.
    pub fn put_shared(
        &self,
        db: &str,
        table: &str,
        key: &str,
        payload: Arc<P>,
        dirty: bool,
    ) -> CoreResult<()> {
        let ck = CompositeKey::new(db, table, key)?;
        {
            let mut inner = self.inner.write();
            let replaced = inner
                .entries
                .insert(ck.clone(), CacheEntry { payload, dirty })
                .is_some();
            if replaced {
                inner.queue.retain(|queued| queued != &ck);
            }
            inner.queue.push_back(ck);
        }
        {
            let _signal = self.signal.lock();
            self.queue_ready.notify_one();
        }
        if self.config.read_only {
            return Ok(());
        }
        self.maybe_evict()
    }

    /// Marks an entry dirty and replaces its payload.
    ///
    /// Returns `false` without touching anything if the entry is absent.
    pub fn update_in_place(&self, db: &str, table: &str, key: &str, payload: P) -> CoreResult<bool> {
        let _maint = self.maint.lock();
        let ck = CompositeKey::unchecked(db, table, key);
        let mut inner = self.inner.write();
        match inner.entries.get_mut(&ck) {
            Some(entry) => {
                entry.payload = Arc::new(payload);
                entry.dirty = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes an entry and its queue slot. Absent entries are a no-op.
    pub fn remove(&self, db: &str, table: &str, key: &str) {
        let _maint = self.maint.lock();
        let ck = CompositeKey::unchecked(db, table, key);
        let mut inner = self.inner.write();
        if inner.entries.remove(&ck).is_some() {
            inner.queue.retain(|queued| queued != &ck);
        }
    }

    /// Flushes the given keys: dirty entries are grouped by `(db, table)` and
    /// written to their backend in one batched call per group; with `clear`,
    /// flushed and clean entries are then dropped from the cache.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CacheIntegrity`] if a requested key is not
    /// cached, or the storage error that aborted a group. Groups flushed
    /// before the failure stay flushed; the rest stay dirty in the cache.
    pub fn flush(&self, keys: &[CompositeKey], clear: bool) -> CoreResult<()> {
        let _maint = self.maint.lock();
        self.flush_locked(keys, clear)
    }

    /// The automatic-maintenance entry point: evicts until the configured
    /// policy is satisfied or the cache empties.
    ///
    /// # Errors
    ///
    /// Propagates flush errors; eviction is retried on the next maintenance
    /// trigger, not in place.
    pub fn maybe_evict(&self) -> CoreResult<()> {
        let _maint = self.maint.lock();
        loop {
            if !self.eviction_needed() {
                return Ok(());
            }
            let queue_len = self.inner.read().queue.len();
            if queue_len == 0 {
                return Ok(());
            }
            let to_remove = (queue_len as f64 * EVICTION_SHARE) as usize;
            if to_remove <= 1 {
                let Some(key) = self.front_blocking() else {
                    return Ok(());
                };
                self.flush_locked(std::slice::from_ref(&key), true)?;
            } else {
                let keys: Vec<CompositeKey> = {
                    let inner = self.inner.read();
                    inner.queue.iter().take(to_remove).cloned().collect()
                };
                trace!(count = keys.len(), "evicting batch");
                self.flush_locked(&keys, true)?;
            }
        }
    }

    /// Flushes and drops the given share of the oldest entries, regardless of
    /// memory pressure. Used for deliberate, proactive memory release.
    ///
    /// Cancellation through `progress` returns early without error; entries
    /// not yet flushed stay cached.
    pub fn reduce_by_share(
        &self,
        share: f64,
        progress: Option<&dyn ProgressHandler>,
    ) -> CoreResult<()> {
        let _maint = self.maint.lock();
        let keys: Vec<CompositeKey> = {
            let inner = self.inner.read();
            let to_remove = (inner.queue.len() as f64 * share) as usize;
            inner.queue.iter().take(to_remove).cloned().collect()
        };
        if let Some(p) = progress {
            p.reset_counter();
            p.set_maximum(keys.len());
            p.set_indeterminate(false);
        }
        for key in keys {
            if canceled(progress) {
                return Ok(());
            }
            self.flush_locked(std::slice::from_ref(&key), true)?;
            if let Some(p) = progress {
                p.increment();
            }
        }
        Ok(())
    }

    /// Flushes every dirty entry across all databases, reporting two ticks
    /// per entry (collect, persist). With `clear_on_success`, flushed entries
    /// are dropped from the cache.
    ///
    /// Cancellation through `progress` stops without error, leaving
    /// unflushed entries dirty.
    pub fn save_all(
        &self,
        progress: Option<&dyn ProgressHandler>,
        clear_on_success: bool,
    ) -> CoreResult<()> {
        let _maint = self.maint.lock();
        let keys: Vec<CompositeKey> = {
            let inner = self.inner.read();
            inner.queue.iter().cloned().collect()
        };
        if let Some(p) = progress {
            p.reset_counter();
            p.set_maximum(2 * keys.len());
            p.set_indeterminate(false);
        }
        for key in keys {
            if canceled(progress) {
                return Ok(());
            }
            if let Some(p) = progress {
                p.increment();
            }
            self.flush_locked(std::slice::from_ref(&key), clear_on_success)?;
            if let Some(p) = progress {
                p.increment();
            }
        }
        Ok(())
    }

    /// Flush body; caller holds the maintenance lock.
    fn flush_locked(&self, keys: &[CompositeKey], clear: bool) -> CoreResult<()> {
        let mut dirty_groups: HashMap<(String, String), Vec<(CompositeKey, Arc<P>)>> =
            HashMap::new();
        let mut clean_keys: Vec<CompositeKey> = Vec::new();
        {
            let inner = self.inner.read();
            for key in keys {
                let entry = inner
                    .entries
                    .get(key)
                    .ok_or_else(|| CoreError::cache_integrity(key.as_str()))?;
                if entry.dirty {
                    let (db, table, _) = key.parts();
                    dirty_groups
                        .entry((db.to_string(), table.to_string()))
                        .or_default()
                        .push((key.clone(), Arc::clone(&entry.payload)));
                } else {
                    clean_keys.push(key.clone());
                }
            }
        }

        for ((db, table), items) in dirty_groups {
            let backend = self
                .databases
                .read()
                .get(&db)
                .cloned()
                .ok_or_else(|| CoreError::UnknownDatabase { name: db.clone() })?;

            if let [(key, payload)] = items.as_slice() {
                let (_, _, object_key) = key.parts();
                let blob = to_bytes(payload.as_ref())?;
                if backend.fetch(&table, object_key)?.is_some() {
                    backend.update(&table, object_key, &blob)?;
                } else {
                    backend.insert(&table, object_key, &blob)?;
                }
            } else {
                let mut rows = HashMap::with_capacity(items.len());
                for (key, payload) in &items {
                    let (_, _, object_key) = key.parts();
                    rows.insert(object_key.to_string(), to_bytes(payload.as_ref())?);
                }
                let existing = backend.key_set(&table)?;
                backend.bulk_upsert(&table, &rows, &existing)?;
            }
            trace!(db = %db, table = %table, rows = items.len(), "flushed group");

            // A put may have replaced an entry while its old payload was
            // being written; such entries are newer dirty state and must
            // survive the flush untouched.
            let mut inner = self.inner.write();
            for (key, payload) in &items {
                let flushed = inner
                    .entries
                    .get(key)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.payload, payload));
                if !flushed {
                    continue;
                }
                if clear {
                    inner.entries.remove(key);
                    inner.queue.retain(|queued| queued != key);
                } else if let Some(entry) = inner.entries.get_mut(key) {
                    entry.dirty = false;
                }
            }
        }

        if clear {
            let mut inner = self.inner.write();
            for key in &clean_keys {
                if inner.entries.get(key).is_some_and(|entry| !entry.dirty) {
                    inner.entries.remove(key);
                    inner.queue.retain(|queued| queued != key);
                }
            }
        }
        Ok(())
    }
}

impl<P> std::fmt::Debug for ObjectCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ObjectCache")
            .field("entries", &inner.entries.len())
            .field("databases", &self.databases.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressCounter;
    use matchdb_codec::from_bytes;
    use matchdb_storage::{MemoryEngine, TableEngine};

    fn fixed_cache(capacity: usize) -> ObjectCache<String> {
        ObjectCache::new(
            Config::new()
                .automated_memory_management(false)
                .cache_size(capacity),
        )
    }

    fn backend_with_table(db: &str, table: &str) -> Arc<Backend> {
        let backend = Arc::new(Backend::open_in_memory(db));
        backend.create_table(table).unwrap();
        backend
    }

    fn stored(backend: &Backend, table: &str, key: &str) -> Option<String> {
        backend
            .fetch(table, key)
            .unwrap()
            .map(|blob| from_bytes(&blob).unwrap())
    }

    #[test]
    fn separator_rejected_in_every_part() {
        let cache = fixed_cache(10);
        for (db, table, key) in [
            ("d_ccs_1", "t", "k"),
            ("d", "t_ccs_1", "k"),
            ("d", "t", "k_ccs_1"),
        ] {
            let result = cache.put(db, table, key, "x".to_string(), true);
            assert!(matches!(result, Err(CoreError::InvalidName { .. })));
        }
    }

    #[test]
    fn database_name_with_separator_rejected() {
        let cache = fixed_cache(10);
        let backend = Arc::new(Backend::open_in_memory("db_ccs_1"));
        let result = cache.add_database(backend);
        assert!(matches!(result, Err(CoreError::InvalidName { .. })));
    }

    #[test]
    fn duplicate_database_rejected() {
        let cache = fixed_cache(10);
        cache
            .add_database(Arc::new(Backend::open_in_memory("d")))
            .unwrap();
        let result = cache.add_database(Arc::new(Backend::open_in_memory("d")));
        assert!(matches!(result, Err(CoreError::DuplicateDatabase { .. })));
    }

    #[test]
    fn put_then_get() {
        let cache = fixed_cache(10);
        cache.put("d", "t", "k", "payload".to_string(), true).unwrap();

        assert_eq!(cache.get("d", "t", "k").as_deref(), Some(&"payload".to_string()));
        assert_eq!(cache.get("d", "t", "other"), None);
        assert_eq!(cache.is_dirty("d", "t", "k"), Some(true));
    }

    #[test]
    fn repeated_put_keeps_one_entry() {
        let cache = fixed_cache(10);
        cache.put("d", "t", "k", "one".to_string(), true).unwrap();
        cache.put("d", "t", "k", "two".to_string(), true).unwrap();
        cache.put("d", "t", "k", "three".to_string(), true).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.inner.read().queue.len(), 1);
        assert_eq!(cache.get("d", "t", "k").as_deref(), Some(&"three".to_string()));
    }

    #[test]
    fn update_in_place_requires_presence() {
        let cache = fixed_cache(10);
        assert!(!cache.update_in_place("d", "t", "k", "x".to_string()).unwrap());

        cache.put("d", "t", "k", "x".to_string(), false).unwrap();
        assert_eq!(cache.is_dirty("d", "t", "k"), Some(false));

        assert!(cache.update_in_place("d", "t", "k", "y".to_string()).unwrap());
        assert_eq!(cache.is_dirty("d", "t", "k"), Some(true));
        assert_eq!(cache.get("d", "t", "k").as_deref(), Some(&"y".to_string()));
    }

    #[test]
    fn remove_drops_entry_and_queue_slot() {
        let cache = fixed_cache(10);
        cache.put("d", "t", "k", "x".to_string(), true).unwrap();
        cache.remove("d", "t", "k");

        assert!(cache.is_empty());
        assert!(cache.inner.read().queue.is_empty());
    }

    #[test]
    fn flush_persists_dirty_entry() {
        let cache = fixed_cache(10);
        let backend = backend_with_table("d", "t");
        cache.add_database(Arc::clone(&backend)).unwrap();

        cache.put("d", "t", "k", "payload".to_string(), true).unwrap();
        let key = CompositeKey::new("d", "t", "k").unwrap();
        cache.flush(&[key], true).unwrap();

        assert!(cache.is_empty());
        assert_eq!(stored(&backend, "t", "k"), Some("payload".to_string()));
    }

    #[test]
    fn flush_without_clear_marks_clean() {
        let cache = fixed_cache(10);
        let backend = backend_with_table("d", "t");
        cache.add_database(Arc::clone(&backend)).unwrap();

        cache.put("d", "t", "k", "payload".to_string(), true).unwrap();
        let key = CompositeKey::new("d", "t", "k").unwrap();
        cache.flush(&[key], false).unwrap();

        assert_eq!(cache.is_dirty("d", "t", "k"), Some(false));
        assert_eq!(stored(&backend, "t", "k"), Some("payload".to_string()));
    }

    #[test]
    fn flush_of_missing_key_is_integrity_violation() {
        let cache = fixed_cache(10);
        let key = CompositeKey::new("d", "t", "ghost").unwrap();
        let result = cache.flush(&[key], true);
        assert!(matches!(result, Err(CoreError::CacheIntegrity { .. })));
    }

    #[test]
    fn flush_updates_existing_backend_row() {
        let cache = fixed_cache(10);
        let backend = backend_with_table("d", "t");
        cache.add_database(Arc::clone(&backend)).unwrap();

        let key = CompositeKey::new("d", "t", "k").unwrap();
        cache.put("d", "t", "k", "v1".to_string(), true).unwrap();
        cache.flush(std::slice::from_ref(&key), false).unwrap();

        assert!(cache.update_in_place("d", "t", "k", "v2".to_string()).unwrap());
        cache.flush(&[key], true).unwrap();

        assert_eq!(stored(&backend, "t", "k"), Some("v2".to_string()));
    }

    #[test]
    fn capacity_eviction_flushes_oldest() {
        let cache = fixed_cache(4);
        let backend = backend_with_table("d", "t");
        cache.add_database(Arc::clone(&backend)).unwrap();

        for i in 0..5 {
            cache
                .put("d", "t", &format!("k{i}"), format!("v{i}"), true)
                .unwrap();
        }

        assert!(cache.inner.read().queue.len() <= 4);
        // The oldest entry left the cache and reached the backend.
        assert_eq!(cache.get("d", "t", "k0"), None);
        assert_eq!(stored(&backend, "t", "k0"), Some("v0".to_string()));
        // Newer entries are still cached and unflushed.
        assert!(cache.contains("d", "t", "k4"));
        assert_eq!(stored(&backend, "t", "k4"), None);
    }

    #[test]
    fn eviction_drops_clean_entries_without_write() {
        let cache = fixed_cache(1);
        let backend = backend_with_table("d", "t");
        cache.add_database(Arc::clone(&backend)).unwrap();

        cache.put("d", "t", "clean", "x".to_string(), false).unwrap();
        cache.put("d", "t", "next", "y".to_string(), false).unwrap();

        assert!(!cache.contains("d", "t", "clean"));
        assert_eq!(backend.fetch("t", "clean").unwrap(), None);
    }

    #[test]
    fn automated_policy_follows_gauge() {
        let gauge = Arc::new(FixedGauge::new(0.0));
        let cache: ObjectCache<String> = ObjectCache::with_gauge(
            Config::new().memory_share(0.8),
            Box::new(FnGaugeShim(Arc::clone(&gauge))),
        );
        let backend = backend_with_table("d", "t");
        cache.add_database(Arc::clone(&backend)).unwrap();

        for i in 0..8 {
            cache
                .put("d", "t", &format!("k{i}"), format!("v{i}"), true)
                .unwrap();
        }
        assert_eq!(cache.len(), 8);

        // Raise the pressure: the next maintenance pass drains everything,
        // flushing dirty entries along the way.
        gauge.set(0.95);
        cache.maybe_evict().unwrap();

        assert!(cache.is_empty());
        assert_eq!(backend.row_count("t").unwrap(), 8);
    }

    /// Delegates to a shared [`FixedGauge`] so tests can move the needle
    /// after handing the gauge to the cache.
    struct FnGaugeShim(Arc<FixedGauge>);

    impl MemoryGauge for FnGaugeShim {
        fn pressure(&self) -> f64 {
            self.0.pressure()
        }
    }

    #[test]
    fn read_only_cache_never_evicts_on_put() {
        let cache: ObjectCache<String> = ObjectCache::new(
            Config::new()
                .automated_memory_management(false)
                .cache_size(1)
                .read_only(true),
        );
        for i in 0..5 {
            cache
                .put("d", "t", &format!("k{i}"), "v".to_string(), false)
                .unwrap();
        }
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn reduce_by_share_drops_fraction() {
        let cache = fixed_cache(100);
        let backend = backend_with_table("d", "t");
        cache.add_database(Arc::clone(&backend)).unwrap();

        for i in 0..8 {
            cache
                .put("d", "t", &format!("k{i}"), format!("v{i}"), true)
                .unwrap();
        }

        let progress = ProgressCounter::new();
        cache.reduce_by_share(0.25, Some(&progress)).unwrap();

        assert_eq!(cache.len(), 6);
        assert_eq!(progress.value(), 2);
        assert_eq!(progress.maximum(), 2);
        assert_eq!(stored(&backend, "t", "k0"), Some("v0".to_string()));
        assert_eq!(stored(&backend, "t", "k1"), Some("v1".to_string()));
    }

    #[test]
    fn save_all_reports_two_ticks_per_entry() {
        let cache = fixed_cache(100);
        let backend = backend_with_table("d", "t");
        cache.add_database(Arc::clone(&backend)).unwrap();

        for i in 0..3 {
            cache
                .put("d", "t", &format!("k{i}"), format!("v{i}"), true)
                .unwrap();
        }

        let progress = ProgressCounter::new();
        cache.save_all(Some(&progress), true).unwrap();

        assert_eq!(progress.maximum(), 6);
        assert_eq!(progress.value(), 6);
        assert!(cache.is_empty());
        assert_eq!(backend.row_count("t").unwrap(), 3);
    }

    #[test]
    fn save_all_without_clear_keeps_clean_entries() {
        let cache = fixed_cache(100);
        let backend = backend_with_table("d", "t");
        cache.add_database(Arc::clone(&backend)).unwrap();

        cache.put("d", "t", "k", "v".to_string(), true).unwrap();
        cache.save_all(None, false).unwrap();

        assert_eq!(cache.is_dirty("d", "t", "k"), Some(false));
        assert_eq!(stored(&backend, "t", "k"), Some("v".to_string()));
    }

    #[test]
    fn canceled_save_all_leaves_rest_dirty() {
        let cache = fixed_cache(100);
        let backend = backend_with_table("d", "t");
        cache.add_database(Arc::clone(&backend)).unwrap();

        for i in 0..6 {
            cache
                .put("d", "t", &format!("k{i}"), format!("v{i}"), true)
                .unwrap();
        }

        // Cancel after four ticks: at most two entries persisted.
        let progress = ProgressCounter::canceling_after(4);
        cache.save_all(Some(&progress), true).unwrap();

        assert_eq!(backend.row_count("t").unwrap(), 2);
        let dirty_left = (0..6)
            .filter(|i| cache.is_dirty("d", "t", &format!("k{i}")) == Some(true))
            .count();
        assert_eq!(dirty_left, 4);
    }

    #[test]
    fn failed_flush_keeps_entries_dirty() {
        let cache = fixed_cache(100);
        let engine = MemoryEngine::new();
        engine.create_table("t").unwrap();
        engine.fail_after_ops(0);
        let backend = Arc::new(Backend::with_engine("d", Box::new(engine)));
        cache.add_database(Arc::clone(&backend)).unwrap();

        cache.put("d", "t", "k", "v".to_string(), true).unwrap();
        let key = CompositeKey::new("d", "t", "k").unwrap();
        let result = cache.flush(&[key], true);

        assert!(result.is_err());
        assert_eq!(cache.is_dirty("d", "t", "k"), Some(true));
        assert!(cache.contains("d", "t", "k"));
    }

    #[test]
    fn flush_for_detached_database_fails() {
        let cache = fixed_cache(100);
        cache.put("d", "t", "k", "v".to_string(), true).unwrap();
        let key = CompositeKey::new("d", "t", "k").unwrap();
        let result = cache.flush(&[key], true);
        assert!(matches!(result, Err(CoreError::UnknownDatabase { .. })));
    }

    #[test]
    fn composite_key_parts_roundtrip() {
        let key = CompositeKey::new("db", "table", "object").unwrap();
        assert_eq!(key.parts(), ("db", "table", "object"));
        assert_eq!(key.as_str(), "db_ccs_table_ccs_object");
    }
}
