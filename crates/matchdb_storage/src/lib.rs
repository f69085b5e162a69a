//! # matchdb Storage
//!
//! Table store engines and the gated storage backend for matchdb.
//!
//! This crate provides the lowest-level storage layer: engines are **opaque
//! blob stores organized as tables** (key -> blob rows); the [`Backend`]
//! wraps exactly one engine connection per logical database and serializes
//! all physical access through a drain-able connection permit.
//!
//! ## Design Principles
//!
//! - Engines do not interpret blobs; serialization and key encoding live in
//!   the layers above
//! - One backend per physical store, enforced by an explicit
//!   [`ConnectionRegistry`] (no process-wide statics)
//! - Batched writes commit per sub-batch; a mid-batch failure leaves earlier
//!   sub-batches durable
//!
//! ## Available Engines
//!
//! - [`MemoryEngine`] - For testing and ephemeral storage
//! - [`FileEngine`] - For persistent storage
//!
//! ## Example
//!
//! ```rust
//! use matchdb_storage::Backend;
//!
//! let backend = Backend::open_in_memory("results");
//! backend.create_table("hits").unwrap();
//! backend.insert("hits", "spectrum_1", b"payload").unwrap();
//! assert_eq!(
//!     backend.fetch("hits", "spectrum_1").unwrap(),
//!     Some(b"payload".to_vec())
//! );
//! backend.close();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod engine;
mod error;
mod file;
mod gate;
mod memory;
mod registry;

pub use backend::{Backend, DEFAULT_BATCH_SIZE};
pub use engine::{BatchOp, TableEngine};
pub use error::{StorageError, StorageResult};
pub use file::FileEngine;
pub use memory::MemoryEngine;
pub use registry::ConnectionRegistry;
