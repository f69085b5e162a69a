//! # matchdb Core
//!
//! Write-back object cache and persistent object store.
//!
//! This crate provides:
//! - [`ObjectCache`]: a bounded in-memory write-back cache shared by one or
//!   more databases, with dirty tracking and memory-pressure or
//!   fixed-capacity eviction
//! - [`ObjectStore`]: the per-database façade with read-through / write-back
//!   semantics, long-key indirection, and connection lifecycle
//! - [`KeyCodec`]: storage-safe encoding for overflow-length keys and table
//!   names
//! - [`ProgressHandler`] and [`MemoryGauge`]: the polled progress/cancel and
//!   heap-pressure capabilities the cache and store consume
//!
//! ## Example
//!
//! ```
//! use matchdb_core::{Config, ObjectCache, ObjectStore};
//! use std::sync::Arc;
//!
//! let cache = Arc::new(ObjectCache::new(
//!     Config::new().automated_memory_management(false).cache_size(1000),
//! ));
//! let store = ObjectStore::open_in_memory("results", Arc::clone(&cache)).unwrap();
//!
//! store.put("hits", "spectrum_1", "payload".to_string(), true).unwrap();
//! let hit = store.get("hits", "spectrum_1", true, true).unwrap();
//! assert_eq!(hit.as_deref(), Some(&"payload".to_string()));
//!
//! cache.save_all(None, true).unwrap();
//! store.close().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod error;
mod keys;
mod memory;
mod progress;
mod store;

pub use cache::{CompositeKey, ObjectCache, CACHE_SEPARATOR};
pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use keys::{KeyCodec, KeyIndexState, LONG_KEY_PREFIX, LONG_TABLE_PREFIX};
pub use memory::{FixedGauge, FnGauge, MemoryGauge};
pub use progress::{ProgressCounter, ProgressHandler};
pub use store::ObjectStore;

// Re-exported so callers can construct and share the storage-level types
// without depending on the storage crate directly.
pub use matchdb_storage::{Backend, ConnectionRegistry};
