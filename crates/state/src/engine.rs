//! Storage-backend boundary.
//!
//! The storage layer targets a distributed column-family store we do not
//! implement: the [`StorageBackend`] trait is that interface boundary. The
//! contract mirrors what such stores actually guarantee —
//!
//! - atomicity per partition only; no cross-table or cross-partition
//!   transactions, no joins
//! - counters are a native commutative type: concurrent `merge_counter`
//!   calls merge correctly regardless of delivery order, and a merge into a
//!   missing row creates it at zero first (upsert, never "not found")
//! - `put_row_if` is the single conditional operation, the lightweight
//!   transaction these stores offer: compare and write are atomic within
//!   the row's partition
//! - `scan_prefix` is efficient only within a single partition
//!
//! A backend without native counters must simulate them with per-writer
//! shards summed at read time; it must not fall back to read-modify-write.
//!
//! [`MemoryBackend`] is the reference implementation used by tests: a set of
//! `parking_lot`-locked ordered maps, with counter merges applied under the
//! write lock so the commutativity contract holds trivially.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use snafu::Snafu;

use crate::tables::TableId;

/// Errors surfaced by storage backends.
#[derive(Debug, Snafu)]
pub enum BackendError {
    /// The backend could not complete the operation; retrying may help.
    #[snafu(display("storage unavailable for {table}: {message}", table = table.name()))]
    Unavailable {
        /// Table the operation targeted.
        table: TableId,
        /// Backend-specific detail.
        message: String,
    },

    /// A row operation was issued against a counter table, or a counter
    /// operation against a row table. Caller bug; never retryable.
    #[snafu(display("wrong table kind for {table}: {message}", table = table.name()))]
    WrongTableKind {
        /// Table the operation targeted.
        table: TableId,
        /// What was attempted.
        message: String,
    },
}

impl BackendError {
    /// Whether retrying the same operation can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Record-oriented interface to the underlying wide-column store.
///
/// Regular tables hold opaque row bytes keyed by the encodings in
/// [`crate::keys`]; counter tables hold named commutative counter fields.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Writes a row, overwriting any existing value (idempotent by key).
    async fn put_row(&self, table: TableId, key: &[u8], value: &[u8]) -> Result<()>;

    /// Writes a row only when its current value matches `expected`, with
    /// `None` meaning the row must be absent. Returns whether the write
    /// applied.
    ///
    /// Compare and write are atomic within the row's partition. Concurrent
    /// read-modify-write cycles over the same row must go through this call;
    /// a plain `put_row` would silently drop the losing writer's changes.
    async fn put_row_if(
        &self,
        table: TableId,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool>;

    /// Reads a row.
    async fn get_row(&self, table: TableId, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Deletes a row. Returns whether it existed.
    async fn delete_row(&self, table: TableId, key: &[u8]) -> Result<bool>;

    /// Scans rows whose key starts with `prefix`, in key order.
    ///
    /// Efficient only when `prefix` covers a partition key.
    async fn scan_prefix(&self, table: TableId, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies a signed delta to a named counter field.
    ///
    /// Missing rows are created at zero before the delta applies; this call
    /// never fails with "not found". There is no compensating read: callers
    /// own translating each logical event into exactly one delta.
    async fn merge_counter(&self, table: TableId, key: &[u8], field: &str, delta: i64)
    -> Result<()>;

    /// Reads all counter fields of a row. Missing rows read as empty.
    async fn read_counters(&self, table: TableId, key: &[u8]) -> Result<BTreeMap<String, i64>>;
}

/// In-memory storage backend.
///
/// All data is lost when the backend is dropped. Used by tests and as the
/// reference for backend semantics.
#[derive(Default)]
pub struct MemoryBackend {
    /// Row tables, ordered by key for prefix scans.
    rows: RwLock<HashMap<TableId, BTreeMap<Vec<u8>, Vec<u8>>>>,
    /// Counter tables: row key → field → accumulated value.
    counters: RwLock<HashMap<TableId, HashMap<Vec<u8>, BTreeMap<String, i64>>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in a table (counter rows included). Test helper.
    #[must_use]
    pub fn row_count(&self, table: TableId) -> usize {
        if table.is_counter() {
            self.counters.read().get(&table).map_or(0, HashMap::len)
        } else {
            self.rows.read().get(&table).map_or(0, BTreeMap::len)
        }
    }

    fn check_row_table(table: TableId, op: &str) -> Result<()> {
        if table.is_counter() {
            return Err(BackendError::WrongTableKind {
                table,
                message: format!("{op} on a counter table"),
            });
        }
        Ok(())
    }

    fn check_counter_table(table: TableId, op: &str) -> Result<()> {
        if !table.is_counter() {
            return Err(BackendError::WrongTableKind {
                table,
                message: format!("{op} on a row table"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn put_row(&self, table: TableId, key: &[u8], value: &[u8]) -> Result<()> {
        Self::check_row_table(table, "put_row")?;
        self.rows.write().entry(table).or_default().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn put_row_if(
        &self,
        table: TableId,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool> {
        Self::check_row_table(table, "put_row_if")?;
        let mut rows = self.rows.write();
        let tree = rows.entry(table).or_default();
        if tree.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        tree.insert(key.to_vec(), value.to_vec());
        Ok(true)
    }

    async fn get_row(&self, table: TableId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Self::check_row_table(table, "get_row")?;
        Ok(self.rows.read().get(&table).and_then(|t| t.get(key).cloned()))
    }

    async fn delete_row(&self, table: TableId, key: &[u8]) -> Result<bool> {
        Self::check_row_table(table, "delete_row")?;
        Ok(self.rows.write().entry(table).or_default().remove(key).is_some())
    }

    async fn scan_prefix(&self, table: TableId, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Self::check_row_table(table, "scan_prefix")?;
        let rows = self.rows.read();
        let Some(tree) = rows.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(tree
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn merge_counter(
        &self,
        table: TableId,
        key: &[u8],
        field: &str,
        delta: i64,
    ) -> Result<()> {
        Self::check_counter_table(table, "merge_counter")?;
        let mut counters = self.counters.write();
        let row = counters.entry(table).or_default().entry(key.to_vec()).or_default();
        *row.entry(field.to_string()).or_insert(0) += delta;
        Ok(())
    }

    async fn read_counters(&self, table: TableId, key: &[u8]) -> Result<BTreeMap<String, i64>> {
        Self::check_counter_table(table, "read_counters")?;
        Ok(self
            .counters
            .read()
            .get(&table)
            .and_then(|t| t.get(key).cloned())
            .unwrap_or_default())
    }
}
