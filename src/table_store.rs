//! Shared slot for the most recently uploaded table.
//!
//! The service is single-tenant: one dataset at a time, replaced wholesale by
//! each successful upload. Readers take a snapshot (DataFrame clones are
//! Arc-backed and cheap), so a question racing an upload sees either the old
//! table or the new one, never a torn mix.

use polars::prelude::*;
use std::sync::RwLock;

/// The parsed dataset plus the identifiers the rest of the pipeline needs.
#[derive(Debug, Clone)]
pub struct StoredTable {
    /// SQL identifier the table is registered under, derived from the file stem.
    pub name: String,
    /// Original upload filename, echoed back in the success message.
    pub source_file: String,
    pub df: DataFrame,
}

impl StoredTable {
    pub fn columns(&self) -> Vec<String> {
        self.df
            .get_column_names()
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

/// Holder of at most one table. Last writer wins.
#[derive(Default)]
pub struct TableStore {
    inner: RwLock<Option<StoredTable>>,
}

impl TableStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    pub fn set(&self, table: StoredTable) {
        *self.write_lock() = Some(table);
    }

    pub fn clear(&self) {
        *self.write_lock() = None;
    }

    /// Clone of the current table, or None before any successful upload.
    pub fn snapshot(&self) -> Option<StoredTable> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Option<StoredTable>> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoredTable {
        StoredTable {
            name: "sales".to_string(),
            source_file: "sales.csv".to_string(),
            df: df!["region" => ["North", "South"], "amount" => [10, 20]].unwrap(),
        }
    }

    #[test]
    fn starts_empty() {
        let store = TableStore::new();
        assert!(store.is_empty());
        assert!(store.snapshot().is_none());
    }

    #[test]
    fn set_then_clear() {
        let store = TableStore::new();
        store.set(sample());
        assert!(!store.is_empty());
        assert_eq!(store.snapshot().unwrap().name, "sales");

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn last_writer_wins() {
        let store = TableStore::new();
        store.set(sample());
        let mut other = sample();
        other.name = "inventory".to_string();
        store.set(other);
        assert_eq!(store.snapshot().unwrap().name, "inventory");
    }
}
