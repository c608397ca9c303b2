//! Commutative counter ledger.
//!
//! Aggregates (vote tallies, view counts, follower counts, karma) live in
//! dedicated counter tables and are only ever written as signed deltas. The
//! ledger never reads before writing: each logical event translates into
//! exactly one delta, and the backend merges concurrent deltas commutatively.
//! Exactly-once is the caller's concern; [`crate::fanout`] enforces it by
//! diffing stored state before emitting deltas.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use plaza_types::{
    DiscussionCounterField, DiscussionCounters, PostCounterField, PostCounters, TopicCounterField,
    TopicCounters, UserCounterField, UserCounters,
};
use snafu::{ResultExt, Snafu};

use crate::engine::{BackendError, StorageBackend};
use crate::keys::encode_id;
use crate::tables::TableId;

/// Errors from ledger operations.
#[derive(Debug, Snafu)]
pub enum CounterError {
    /// The backend rejected or failed the operation.
    #[snafu(display("counter backend failure"))]
    Backend {
        /// Underlying backend error.
        source: BackendError,
    },
}

impl CounterError {
    /// Whether retrying the same operation can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { source } => source.is_retryable(),
        }
    }
}

/// Binds a typed counter row to its table and field enum.
pub trait CounterRow: Sized + Send + Sync + 'static {
    /// Counter table holding rows of this type.
    const TABLE: TableId;
    /// Field-name enum for this row.
    type Field: Copy + fmt::Display + Send;

    /// Materializes the typed row from the backend's field map.
    fn from_fields(fields: &BTreeMap<String, i64>) -> Self;
}

impl CounterRow for PostCounters {
    const TABLE: TableId = TableId::PostCounters;
    type Field = PostCounterField;

    fn from_fields(fields: &BTreeMap<String, i64>) -> Self {
        Self::from_fields(fields)
    }
}

impl CounterRow for UserCounters {
    const TABLE: TableId = TableId::UserCounters;
    type Field = UserCounterField;

    fn from_fields(fields: &BTreeMap<String, i64>) -> Self {
        Self::from_fields(fields)
    }
}

impl CounterRow for DiscussionCounters {
    const TABLE: TableId = TableId::DiscussionCounters;
    type Field = DiscussionCounterField;

    fn from_fields(fields: &BTreeMap<String, i64>) -> Self {
        Self::from_fields(fields)
    }
}

impl CounterRow for TopicCounters {
    const TABLE: TableId = TableId::TopicCounters;
    type Field = TopicCounterField;

    fn from_fields(fields: &BTreeMap<String, i64>) -> Self {
        Self::from_fields(fields)
    }
}

/// Ledger over the backend's counter tables.
#[derive(Clone)]
pub struct CounterLedger {
    backend: Arc<dyn StorageBackend>,
}

impl CounterLedger {
    /// Creates a ledger over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Applies a signed delta to one field of a typed counter row.
    ///
    /// Upsert semantics: a missing row is created at zero first.
    pub async fn increment<C: CounterRow>(
        &self,
        id: i64,
        field: C::Field,
        delta: i64,
    ) -> Result<(), CounterError> {
        self.increment_raw(C::TABLE, id, &field.to_string(), delta).await
    }

    /// Applies a signed delta by raw table and field name.
    ///
    /// Used by the repair path, which replays persisted writes.
    pub async fn increment_raw(
        &self,
        table: TableId,
        id: i64,
        field: &str,
        delta: i64,
    ) -> Result<(), CounterError> {
        self.backend
            .merge_counter(table, &encode_id(id), field, delta)
            .await
            .context(BackendSnafu)
    }

    /// Reads a typed counter row. Absent fields read as zero.
    pub async fn read<C: CounterRow>(&self, id: i64) -> Result<C, CounterError> {
        let fields = self
            .backend
            .read_counters(C::TABLE, &encode_id(id))
            .await
            .context(BackendSnafu)?;
        Ok(C::from_fields(&fields))
    }
}
