//! Cross-crate scenarios exercising the store, cache, and backend together.

use matchdb_core::{
    Backend, Config, ConnectionRegistry, CoreError, ObjectCache, ObjectStore, ProgressCounter,
};
use matchdb_testkit::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn capacity_cache(capacity: usize) -> Arc<ObjectCache<TestHit>> {
    Arc::new(ObjectCache::new(
        Config::new()
            .automated_memory_management(false)
            .cache_size(capacity),
    ))
}

#[test]
fn capacity_bound_eviction_scenario() {
    init_tracing();
    let cache = capacity_cache(4);
    let store = ObjectStore::open_in_memory("d", Arc::clone(&cache)).unwrap();

    for i in 0..5 {
        store.put("t", &format!("k{i}"), hit(i), true).unwrap();
    }

    // The queue stabilized at the configured capacity.
    assert!(cache.len() <= 4);

    // The evicted oldest key is gone from the cache but retrievable from the
    // backend; without fallback it is absent.
    assert_eq!(store.get("t", "k0", false, false).unwrap(), None);
    assert_eq!(
        store.get("t", "k0", true, false).unwrap().as_deref(),
        Some(&hit(0))
    );
}

#[test]
fn write_back_survives_restart() {
    init_tracing();
    let fixture = TestStore::on_disk("results");
    let folder = fixture.folder().unwrap().to_path_buf();

    for i in 0..20 {
        fixture
            .store
            .put("hits", &format!("k{i}"), hit(i), true)
            .unwrap();
    }
    fixture.cache.save_all(None, true).unwrap();
    fixture.store.close().unwrap();

    // Second session: data comes back through the backend.
    let cache = capacity_cache(1000);
    let store =
        ObjectStore::open(&folder, "results", false, Arc::clone(&cache), &fixture.registry)
            .unwrap();
    assert_eq!(
        store.get("hits", "k7", true, true).unwrap().as_deref(),
        Some(&hit(7))
    );
    assert_eq!(cache.is_dirty("results", "hits", "k7"), Some(false));
    store.close().unwrap();
}

#[test]
fn long_key_indexes_survive_restart() {
    init_tracing();
    let registry = ConnectionRegistry::new();
    let temp = tempfile::tempdir().unwrap();
    let long_key = "a".repeat(1200);

    {
        let cache = capacity_cache(1000);
        let store =
            ObjectStore::open(temp.path(), "results", false, Arc::clone(&cache), &registry)
                .unwrap();
        store.put("hits", &long_key, hit(1), false).unwrap();
        assert_eq!(
            store.original_key("hits", "long_key_0").unwrap(),
            long_key
        );
        store.close().unwrap();
    }

    {
        let cache = capacity_cache(1000);
        let store =
            ObjectStore::open(temp.path(), "results", false, Arc::clone(&cache), &registry)
                .unwrap();
        // The index assignment persisted: the same key resolves to the same
        // synthetic form, and the used-tables registry still knows `hits`.
        assert_eq!(
            store.original_key("hits", "long_key_0").unwrap(),
            long_key
        );
        assert_eq!(
            store.get("hits", &long_key, true, false).unwrap().as_deref(),
            Some(&hit(1))
        );
        store.close().unwrap();
    }
}

#[test]
fn exclusive_connection_registration() {
    init_tracing();
    let registry = ConnectionRegistry::new();
    let temp = tempfile::tempdir().unwrap();

    let cache_a = capacity_cache(1000);
    let store_a =
        ObjectStore::open(temp.path(), "results", false, Arc::clone(&cache_a), &registry).unwrap();

    // Same path, different cache: the registry still refuses.
    let cache_b = capacity_cache(1000);
    let result = ObjectStore::open(temp.path(), "results", false, cache_b, &registry);
    assert!(matches!(
        result,
        Err(CoreError::Storage(
            matchdb_storage::StorageError::AlreadyActive { .. }
        ))
    ));

    store_a.close().unwrap();
    let cache_c = capacity_cache(1000);
    let reopened = ObjectStore::open(temp.path(), "results", false, cache_c, &registry);
    assert!(reopened.is_ok());
}

#[test]
fn coalesced_bulk_loads_issue_one_scan() {
    init_tracing();
    let engine = ScanCountingEngine::with_delay(Duration::from_millis(200));
    let backend = Arc::new(Backend::with_engine("d", Box::new(Arc::clone(&engine))));
    let cache = capacity_cache(1000);
    let store = ObjectStore::open_with_backend(backend, cache).unwrap();

    let mut payloads = HashMap::new();
    for i in 0..50 {
        payloads.insert(format!("k{i}"), hit(i));
    }
    store.put_many("hits", payloads, true).unwrap();

    let loader = {
        let store = Arc::clone(&store);
        thread::spawn(move || store.bulk_load("hits", None, None))
    };
    // Let the first loader claim the slot and enter its slow scan, then ask
    // for the same table again.
    thread::sleep(Duration::from_millis(50));
    store.bulk_load("hits", None, None).unwrap();
    loader.join().unwrap().unwrap();

    assert_eq!(engine.scan_count(), 1);
    assert_eq!(store.cache().len(), 50);
}

#[test]
fn put_many_batch_failure_leaves_committed_batches() {
    init_tracing();
    let engine = matchdb_storage::MemoryEngine::new();
    let backend = Arc::new(Backend::with_engine("d", Box::new(engine)).with_batch_size(3));
    let cache = capacity_cache(1000);
    let store = ObjectStore::open_with_backend(Arc::clone(&backend), cache).unwrap();
    store.ensure_table("hits").unwrap();

    // Pre-existing row collides with one of the inserts when the caller
    // wrongly claims every key is new.
    store.put("hits", "k4", hit(99), false).unwrap();

    let mut payloads = HashMap::new();
    for i in 0..9 {
        payloads.insert(format!("k{i}"), hit(i));
    }
    let result = store.put_many("hits", payloads, true);
    assert!(result.is_err());

    // Some sub-batches may have committed before the collision; every row
    // that did commit is durable and decodes cleanly.
    let committed = backend.key_set("hits").unwrap();
    for key in &committed {
        let blob = backend.fetch("hits", key).unwrap().unwrap();
        let _ = decode_hit(&blob);
    }
    assert!(committed.contains("k4"));
}

#[test]
fn save_all_cancellation_is_bounded() {
    init_tracing();
    let fixture = TestStore::in_memory("results");
    for i in 0..10 {
        fixture
            .store
            .put("hits", &format!("k{i}"), hit(i), true)
            .unwrap();
    }

    let progress = ProgressCounter::canceling_after(6);
    fixture.cache.save_all(Some(&progress), true).unwrap();

    // Two ticks per entry: six ticks means three entries persisted, the
    // remaining seven still cached and dirty.
    let dirty: usize = (0..10)
        .filter(|i| fixture.cache.is_dirty("results", "hits", &format!("k{i}")) == Some(true))
        .count();
    assert_eq!(dirty, 7);
}

#[test]
fn shared_cache_serves_two_databases() {
    init_tracing();
    let cache = capacity_cache(1000);
    let store_a = ObjectStore::open_in_memory("proteins", Arc::clone(&cache)).unwrap();
    let store_b = ObjectStore::open_in_memory("peptides", Arc::clone(&cache)).unwrap();

    store_a.put("hits", "k", hit(1), true).unwrap();
    store_b.put("hits", "k", hit(2), true).unwrap();

    // Same table and key, distinct databases: distinct entries.
    assert_eq!(
        store_a.get("hits", "k", false, false).unwrap().as_deref(),
        Some(&hit(1))
    );
    assert_eq!(
        store_b.get("hits", "k", false, false).unwrap().as_deref(),
        Some(&hit(2))
    );

    cache.save_all(None, true).unwrap();
    assert!(cache.is_empty());
    assert_eq!(
        store_a.get("hits", "k", true, false).unwrap().as_deref(),
        Some(&hit(1))
    );
    assert_eq!(
        store_b.get("hits", "k", true, false).unwrap().as_deref(),
        Some(&hit(2))
    );
}

#[test]
fn reduce_by_share_frees_memory_proactively() {
    init_tracing();
    let fixture = TestStore::in_memory("results");
    for i in 0..40 {
        fixture
            .store
            .put("hits", &format!("k{i}"), hit(i), true)
            .unwrap();
    }

    fixture.cache.reduce_by_share(0.5, None).unwrap();
    assert_eq!(fixture.cache.len(), 20);

    // Released entries are still reachable through the backend.
    assert_eq!(
        fixture
            .store
            .get("hits", "k0", true, false)
            .unwrap()
            .as_deref(),
        Some(&hit(0))
    );
}
