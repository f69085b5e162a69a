//! In-memory table engine for testing.

use crate::engine::{BatchOp, TableEngine};
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;

type Table = BTreeMap<String, Vec<u8>>;

/// An in-memory table engine.
///
/// All data lives in process memory. Suitable for unit tests, integration
/// tests, and ephemeral stores that do not need persistence.
///
/// # Fault injection
///
/// Tests can call [`MemoryEngine::fail_after_ops`] to make the engine fail
/// once a given number of further mutations have been applied. The failure
/// respects batch atomicity: a batch that trips the fuse is not applied at
/// all, which makes sub-batch commit boundaries observable.
///
/// # Thread Safety
///
/// This engine is thread-safe and can be shared across threads.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    tables: RwLock<Vec<(String, Table)>>,
    fuse: Mutex<Option<usize>>,
}

impl MemoryEngine {
    /// Creates a new empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the fault-injection fuse: after `ops` further mutations, every
    /// subsequent mutation fails with [`StorageError::Corrupted`].
    pub fn fail_after_ops(&self, ops: usize) {
        *self.fuse.lock() = Some(ops);
    }

    /// Disarms the fault-injection fuse.
    pub fn clear_fault(&self) {
        *self.fuse.lock() = None;
    }

    fn position(&self, table: &str) -> Option<usize> {
        self.tables
            .read()
            .iter()
            .position(|(name, _)| name.eq_ignore_ascii_case(table))
    }

    /// Burns `ops` units of the fuse, failing if it is exhausted.
    fn burn(&self, ops: usize) -> StorageResult<()> {
        let mut fuse = self.fuse.lock();
        if let Some(remaining) = fuse.as_mut() {
            if *remaining < ops {
                return Err(StorageError::corrupted("injected engine failure"));
            }
            *remaining -= ops;
        }
        Ok(())
    }
}

impl TableEngine for MemoryEngine {
    fn create_table(&self, table: &str) -> StorageResult<()> {
        let mut tables = self.tables.write();
        if tables
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(table))
        {
            return Err(StorageError::TableExists {
                table: table.to_string(),
            });
        }
        tables.push((table.to_string(), Table::new()));
        Ok(())
    }

    fn has_table(&self, table: &str) -> StorageResult<bool> {
        Ok(self.position(table).is_some())
    }

    fn table_names(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .tables
            .read()
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn insert(&self, table: &str, key: &str, blob: &[u8]) -> StorageResult<()> {
        self.burn(1)?;
        let pos = self
            .position(table)
            .ok_or_else(|| StorageError::unknown_table(table))?;
        let mut tables = self.tables.write();
        let rows = &mut tables[pos].1;
        if rows.contains_key(key) {
            return Err(StorageError::duplicate_key(table, key));
        }
        rows.insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn update(&self, table: &str, key: &str, blob: &[u8]) -> StorageResult<()> {
        self.burn(1)?;
        let pos = self
            .position(table)
            .ok_or_else(|| StorageError::unknown_table(table))?;
        let mut tables = self.tables.write();
        if let Some(value) = tables[pos].1.get_mut(key) {
            *value = blob.to_vec();
        }
        Ok(())
    }

    fn delete(&self, table: &str, key: &str) -> StorageResult<()> {
        self.burn(1)?;
        let pos = self
            .position(table)
            .ok_or_else(|| StorageError::unknown_table(table))?;
        self.tables.write()[pos].1.remove(key);
        Ok(())
    }

    fn fetch(&self, table: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let pos = self
            .position(table)
            .ok_or_else(|| StorageError::unknown_table(table))?;
        Ok(self.tables.read()[pos].1.get(key).cloned())
    }

    fn scan(&self, table: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let pos = self
            .position(table)
            .ok_or_else(|| StorageError::unknown_table(table))?;
        Ok(self.tables.read()[pos]
            .1
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn keys(&self, table: &str) -> StorageResult<Vec<String>> {
        let pos = self
            .position(table)
            .ok_or_else(|| StorageError::unknown_table(table))?;
        Ok(self.tables.read()[pos].1.keys().cloned().collect())
    }

    fn row_count(&self, table: &str) -> StorageResult<u64> {
        let pos = self
            .position(table)
            .ok_or_else(|| StorageError::unknown_table(table))?;
        Ok(self.tables.read()[pos].1.len() as u64)
    }

    fn apply_batch(&self, table: &str, ops: &[BatchOp]) -> StorageResult<()> {
        self.burn(ops.len())?;
        let pos = self
            .position(table)
            .ok_or_else(|| StorageError::unknown_table(table))?;
        let mut tables = self.tables.write();

        // Stage into a copy so a failing op leaves nothing applied.
        let mut staged = tables[pos].1.clone();
        for op in ops {
            match op {
                BatchOp::Insert { key, blob } => {
                    if staged.contains_key(key) {
                        return Err(StorageError::duplicate_key(table, key.clone()));
                    }
                    staged.insert(key.clone(), blob.clone());
                }
                BatchOp::Update { key, blob } => {
                    if let Some(value) = staged.get_mut(key) {
                        *value = blob.clone();
                    }
                }
                BatchOp::Delete { key } => {
                    staged.remove(key);
                }
            }
        }
        tables[pos].1 = staged;
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
