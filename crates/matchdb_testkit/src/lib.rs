//! # matchdb Testkit
//!
//! Test utilities for matchdb.
//!
//! This crate provides:
//! - Payload fixtures and store builders with automatic cleanup
//! - A scan-counting engine wrapper for observing backend traffic
//! - Tracing initialization for test logs
//!
//! ## Usage
//!
//! ```rust
//! use matchdb_testkit::prelude::*;
//!
//! let fixture = TestStore::in_memory("results");
//! fixture.store.put("hits", "k", hit(1), true).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::fixtures::*;
}

pub use fixtures::*;
