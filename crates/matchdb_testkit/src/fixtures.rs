//! Payload fixtures and store builders.
//!
//! Provides convenience types for setting up test stores and observing
//! backend traffic in integration tests.

use matchdb_core::{Config, ObjectCache, ObjectStore};
use matchdb_storage::{BatchOp, ConnectionRegistry, MemoryEngine, StorageResult, TableEngine};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use tempfile::TempDir;

/// A representative identification-result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestHit {
    /// Identifier of the matched spectrum.
    pub spectrum: String,
    /// Match score.
    pub score: i64,
    /// Matched fragment annotations.
    pub fragments: Vec<String>,
}

/// Builds a deterministic payload for index `i`.
#[must_use]
pub fn hit(i: usize) -> TestHit {
    TestHit {
        spectrum: format!("spectrum_{i}"),
        score: (i as i64) * 10 - 5,
        fragments: vec![format!("b{i}"), format!("y{i}")],
    }
}

/// Decodes a backend blob into a [`TestHit`], panicking on mismatch. Lets
/// tests assert what actually landed in a backend row.
#[must_use]
pub fn decode_hit(blob: &[u8]) -> TestHit {
    matchdb_codec::from_bytes(blob).expect("blob does not decode to a TestHit")
}

/// Initializes tracing for test output. Safe to call from every test; only
/// the first call installs the subscriber. Respects `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A test store with its shared cache and automatic cleanup.
pub struct TestStore {
    /// The shared cache the store is attached to.
    pub cache: Arc<ObjectCache<TestHit>>,
    /// The store instance.
    pub store: Arc<ObjectStore<TestHit>>,
    /// The connection registry, shared so tests can open more stores.
    pub registry: ConnectionRegistry,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates an in-memory store on a fixed-capacity cache.
    #[must_use]
    pub fn in_memory(name: &str) -> Self {
        Self::in_memory_with_config(name, test_config())
    }

    /// Creates an in-memory store with the given configuration.
    #[must_use]
    pub fn in_memory_with_config(name: &str, config: Config) -> Self {
        let cache = Arc::new(ObjectCache::new(config));
        let store = ObjectStore::open_in_memory(name, Arc::clone(&cache))
            .expect("failed to open in-memory store");
        Self {
            cache,
            store,
            registry: ConnectionRegistry::new(),
            _temp_dir: None,
        }
    }

    /// Creates a file-backed store in a fresh temporary directory.
    #[must_use]
    pub fn on_disk(name: &str) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let cache = Arc::new(ObjectCache::new(test_config()));
        let registry = ConnectionRegistry::new();
        let store = ObjectStore::open(
            temp_dir.path(),
            name,
            false,
            Arc::clone(&cache),
            &registry,
        )
        .expect("failed to open on-disk store");
        Self {
            cache,
            store,
            registry,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the store folder, for reopening after a close.
    #[must_use]
    pub fn folder(&self) -> Option<&std::path::Path> {
        self._temp_dir.as_ref().map(TempDir::path)
    }
}

/// A fixed-capacity configuration suited to small deterministic tests.
#[must_use]
pub fn test_config() -> Config {
    Config::new()
        .automated_memory_management(false)
        .cache_size(1000)
}

/// A [`TableEngine`] wrapper counting full-table scans.
///
/// Used to assert that coalesced bulk loads issue a single scan. An optional
/// per-scan delay widens the window in which a second loader can arrive.
#[derive(Debug)]
pub struct ScanCountingEngine {
    inner: MemoryEngine,
    scans: AtomicUsize,
    scan_delay: std::time::Duration,
}

impl ScanCountingEngine {
    /// Wraps a fresh in-memory engine.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_delay(std::time::Duration::ZERO)
    }

    /// Wraps a fresh in-memory engine whose scans stall for `delay`.
    #[must_use]
    pub fn with_delay(delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryEngine::new(),
            scans: AtomicUsize::new(0),
            scan_delay: delay,
        })
    }

    /// Returns the number of full-table scans issued so far.
    #[must_use]
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

impl TableEngine for ScanCountingEngine {
    fn create_table(&self, table: &str) -> StorageResult<()> {
        self.inner.create_table(table)
    }

    fn has_table(&self, table: &str) -> StorageResult<bool> {
        self.inner.has_table(table)
    }

    fn table_names(&self) -> StorageResult<Vec<String>> {
        self.inner.table_names()
    }

    fn insert(&self, table: &str, key: &str, blob: &[u8]) -> StorageResult<()> {
        self.inner.insert(table, key, blob)
    }

    fn update(&self, table: &str, key: &str, blob: &[u8]) -> StorageResult<()> {
        self.inner.update(table, key, blob)
    }

    fn delete(&self, table: &str, key: &str) -> StorageResult<()> {
        self.inner.delete(table, key)
    }

    fn fetch(&self, table: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.fetch(table, key)
    }

    fn scan(&self, table: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if !self.scan_delay.is_zero() {
            std::thread::sleep(self.scan_delay);
        }
        self.inner.scan(table)
    }

    fn keys(&self, table: &str) -> StorageResult<Vec<String>> {
        self.inner.keys(table)
    }

    fn row_count(&self, table: &str) -> StorageResult<u64> {
        self.inner.row_count(table)
    }

    fn apply_batch(&self, table: &str, ops: &[BatchOp]) -> StorageResult<()> {
        self.inner.apply_batch(table, ops)
    }

    fn close(&self) -> StorageResult<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_fixture_is_deterministic() {
        assert_eq!(hit(3), hit(3));
        assert_ne!(hit(3), hit(4));
    }

    #[test]
    fn hit_field_names_are_stable() {
        // Payload shape is part of what persists in backends; renaming a
        // field breaks old stores.
        let json = serde_json::to_value(hit(1)).unwrap();
        assert!(json.get("spectrum").is_some());
        assert!(json.get("score").is_some());
        assert!(json.get("fragments").is_some());
    }

    #[test]
    fn decode_hit_roundtrips() {
        let blob = matchdb_codec::to_bytes(&hit(2)).unwrap();
        assert_eq!(decode_hit(&blob), hit(2));
    }

    #[test]
    fn in_memory_fixture_works() {
        let fixture = TestStore::in_memory("results");
        fixture.store.put("hits", "k", hit(1), true).unwrap();
        assert_eq!(
            fixture
                .store
                .get("hits", "k", false, false)
                .unwrap()
                .as_deref(),
            Some(&hit(1))
        );
    }

    #[test]
    fn on_disk_fixture_has_folder() {
        let fixture = TestStore::on_disk("results");
        assert!(fixture.folder().is_some());
    }

    #[test]
    fn scan_counter_increments() {
        let engine = ScanCountingEngine::new();
        engine.create_table("t").unwrap();
        assert_eq!(engine.scan_count(), 0);
        TableEngine::scan(&engine, "t").unwrap();
        assert_eq!(engine.scan_count(), 1);
    }
}
