//! Long-key and long-table-name indirection.
//!
//! Storage engines cap identifier and key lengths. The [`KeyCodec`] maps
//! arbitrarily long logical keys and table names to storage-safe short forms
//! and back. Index allocation is append-only: once a `(table, key)` pair or a
//! table name has been assigned an index, it maps to the same synthetic form
//! for the lifetime of the store, including across restarts (the index state
//! is persisted in the store's metadata table).
//!
//! The codec has no locking of its own; the owning store serializes access.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Prefix of synthetic keys standing in for overflow-length object keys.
pub const LONG_KEY_PREFIX: &str = "long_key_";

/// Prefix of synthetic table names standing in for overflow-length names.
pub const LONG_TABLE_PREFIX: &str = "long_table_";

/// Characters the engine does not accept in table identifiers.
const FORBIDDEN_TABLE_CHARS: [char; 5] = [' ', '|', '-', '=', '.'];

/// Persistable index state of a [`KeyCodec`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIndexState {
    /// Overflow-length table names, in allocation order.
    pub long_tables: Vec<String>,
    /// Overflow-length object keys per table, in allocation order.
    pub long_keys: HashMap<String, Vec<String>>,
}

/// Maps long logical keys and table names to storage-safe identifiers.
#[derive(Debug)]
pub struct KeyCodec {
    max_key_length: usize,
    max_table_name_length: usize,
    state: KeyIndexState,
}

impl KeyCodec {
    /// Creates an empty codec with the given length limits.
    #[must_use]
    pub fn new(max_key_length: usize, max_table_name_length: usize) -> Self {
        Self::from_state(KeyIndexState::default(), max_key_length, max_table_name_length)
    }

    /// Restores a codec from persisted index state.
    #[must_use]
    pub fn from_state(
        state: KeyIndexState,
        max_key_length: usize,
        max_table_name_length: usize,
    ) -> Self {
        Self {
            max_key_length,
            max_table_name_length,
            state,
        }
    }

    /// Returns the index state for persistence.
    #[must_use]
    pub fn state(&self) -> &KeyIndexState {
        &self.state
    }

    /// Returns the storage form of an object key.
    ///
    /// Keys shorter than the limit, and keys that already carry the synthetic
    /// prefix, pass through unchanged. An overflow-length key is assigned an
    /// index in the table's long-key list (or found, if already assigned) and
    /// replaced by `long_key_<index>`.
    pub fn correct_key(&mut self, table: &str, key: &str) -> String {
        if key.len() < self.max_key_length || key.starts_with(LONG_KEY_PREFIX) {
            return key.to_string();
        }
        let keys = self.state.long_keys.entry(table.to_string()).or_default();
        let index = match keys.iter().position(|k| k == key) {
            Some(index) => index,
            None => {
                keys.push(key.to_string());
                keys.len() - 1
            }
        };
        format!("{LONG_KEY_PREFIX}{index}")
    }

    /// Recovers the original key behind a storage key.
    ///
    /// Non-synthetic keys come back unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidKey`] if the synthetic suffix is not a
    /// number or was never allocated for the table.
    pub fn original_key(&self, table: &str, storage_key: &str) -> CoreResult<String> {
        let Some(suffix) = storage_key.strip_prefix(LONG_KEY_PREFIX) else {
            return Ok(storage_key.to_string());
        };
        let index: usize = suffix
            .parse()
            .map_err(|_| CoreError::invalid_key(storage_key))?;
        self.state
            .long_keys
            .get(table)
            .and_then(|keys| keys.get(index))
            .cloned()
            .ok_or_else(|| CoreError::invalid_key(storage_key))
    }

    /// Returns the storage form of a table name.
    ///
    /// Characters the engine forbids in identifiers are replaced by `_`.
    /// Names at or over the length limit are assigned an index in the
    /// long-table list and replaced by `long_table_<index>`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidName`] if even the synthetic form would
    /// exceed the limit.
    pub fn correct_table_name(&mut self, table: &str) -> CoreResult<String> {
        let mut name = table.to_string();
        for c in FORBIDDEN_TABLE_CHARS {
            name = name.replace(c, "_");
        }

        if name.len() < self.max_table_name_length {
            return Ok(name);
        }

        let index = match self.state.long_tables.iter().position(|t| t == &name) {
            Some(index) => index,
            None => {
                self.state.long_tables.push(name);
                self.state.long_tables.len() - 1
            }
        };
        let synthetic = format!("{LONG_TABLE_PREFIX}{index}");
        if synthetic.len() >= self.max_table_name_length {
            return Err(CoreError::invalid_name(table));
        }
        Ok(synthetic)
    }
}
