//! Fault injection utilities for exercising retry and repair paths.
//!
//! [`FlakyBackend`] wraps any [`StorageBackend`] and rejects a configured
//! number of writes (or reads) against a chosen table with a retryable
//! [`BackendError::Unavailable`]. Tests use it to drive writes down the
//! repair-queue path and to verify that the reconciler converges once the
//! faults clear.
//!
//! [`InterleavingBackend`] forces an await point before every storage call
//! so that concurrent mutations joined on one task actually interleave;
//! without it an in-memory backend completes each call synchronously and
//! races never materialize.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::engine::{BackendError, Result, StorageBackend};
use crate::tables::TableId;

/// A backend wrapper that injects transient failures.
///
/// Writes and reads carry independent budgets: operations against the
/// targeted table fail with a retryable error until the budget is spent,
/// after which the backend behaves normally again. All state is atomic, so
/// the wrapper can be shared across tasks.
pub struct FlakyBackend {
    inner: Arc<dyn StorageBackend>,
    writes: FaultBudget,
    reads: FaultBudget,
    rejected: AtomicU32,
}

/// One armed fault: a target table and a remaining failure count.
#[derive(Default)]
struct FaultBudget {
    target: RwLock<Option<TableId>>,
    remaining: AtomicU32,
}

impl FaultBudget {
    fn arm(&self, table: TableId, count: u32) {
        *self.target.write() = Some(table);
        self.remaining.store(count, Ordering::SeqCst);
    }

    fn disarm(&self) {
        *self.target.write() = None;
        self.remaining.store(0, Ordering::SeqCst);
    }

    /// Claims one unit of the budget if `table` is targeted; racing
    /// decrements are fine.
    fn claim(&self, table: TableId) -> bool {
        if *self.target.read() != Some(table) {
            return false;
        }
        let mut remaining = self.remaining.load(Ordering::SeqCst);
        while remaining > 0 {
            match self.remaining.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(current) => remaining = current,
            }
        }
        false
    }
}

impl FlakyBackend {
    /// Wraps a backend with fault injection disarmed.
    pub fn wrap(inner: Arc<dyn StorageBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            writes: FaultBudget::default(),
            reads: FaultBudget::default(),
            rejected: AtomicU32::new(0),
        })
    }

    /// Arms the wrapper: the next `count` writes against `table` fail.
    ///
    /// Re-arming resets the rejection counter.
    pub fn fail_writes(&self, table: TableId, count: u32) {
        self.writes.arm(table, count);
        self.rejected.store(0, Ordering::SeqCst);
    }

    /// Arms the wrapper: the next `count` row reads or scans against
    /// `table` fail. Counter reads are never intercepted.
    pub fn fail_reads(&self, table: TableId, count: u32) {
        self.reads.arm(table, count);
        self.rejected.store(0, Ordering::SeqCst);
    }

    /// Disarms the wrapper without waiting for the budgets to drain.
    pub fn clear(&self) {
        self.writes.disarm();
        self.reads.disarm();
    }

    /// Number of operations rejected since the last arming.
    pub fn rejected(&self) -> u32 {
        self.rejected.load(Ordering::SeqCst)
    }

    fn intercept(&self, budget: &FaultBudget, table: TableId) -> Result<()> {
        if budget.claim(table) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(BackendError::Unavailable {
                table,
                message: "injected fault".to_owned(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn put_row(&self, table: TableId, key: &[u8], value: &[u8]) -> Result<()> {
        self.intercept(&self.writes, table)?;
        self.inner.put_row(table, key, value).await
    }

    async fn put_row_if(
        &self,
        table: TableId,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool> {
        self.intercept(&self.writes, table)?;
        self.inner.put_row_if(table, key, expected, value).await
    }

    async fn get_row(&self, table: TableId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.intercept(&self.reads, table)?;
        self.inner.get_row(table, key).await
    }

    async fn delete_row(&self, table: TableId, key: &[u8]) -> Result<bool> {
        self.intercept(&self.writes, table)?;
        self.inner.delete_row(table, key).await
    }

    async fn scan_prefix(
        &self,
        table: TableId,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.intercept(&self.reads, table)?;
        self.inner.scan_prefix(table, prefix).await
    }

    async fn merge_counter(
        &self,
        table: TableId,
        key: &[u8],
        field: &str,
        delta: i64,
    ) -> Result<()> {
        self.intercept(&self.writes, table)?;
        self.inner.merge_counter(table, key, field, delta).await
    }

    async fn read_counters(
        &self,
        table: TableId,
        key: &[u8],
    ) -> Result<std::collections::BTreeMap<String, i64>> {
        self.inner.read_counters(table, key).await
    }
}

/// A backend wrapper that yields to the scheduler before every call.
///
/// Joining two mutations over this wrapper makes their storage calls
/// interleave deterministically enough to expose lost-update races.
pub struct InterleavingBackend {
    inner: Arc<dyn StorageBackend>,
}

impl InterleavingBackend {
    /// Wraps a backend.
    pub fn wrap(inner: Arc<dyn StorageBackend>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl StorageBackend for InterleavingBackend {
    async fn put_row(&self, table: TableId, key: &[u8], value: &[u8]) -> Result<()> {
        tokio::task::yield_now().await;
        self.inner.put_row(table, key, value).await
    }

    async fn put_row_if(
        &self,
        table: TableId,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.put_row_if(table, key, expected, value).await
    }

    async fn get_row(&self, table: TableId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        tokio::task::yield_now().await;
        self.inner.get_row(table, key).await
    }

    async fn delete_row(&self, table: TableId, key: &[u8]) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.delete_row(table, key).await
    }

    async fn scan_prefix(
        &self,
        table: TableId,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        tokio::task::yield_now().await;
        self.inner.scan_prefix(table, prefix).await
    }

    async fn merge_counter(
        &self,
        table: TableId,
        key: &[u8],
        field: &str,
        delta: i64,
    ) -> Result<()> {
        tokio::task::yield_now().await;
        self.inner.merge_counter(table, key, field, delta).await
    }

    async fn read_counters(
        &self,
        table: TableId,
        key: &[u8],
    ) -> Result<std::collections::BTreeMap<String, i64>> {
        tokio::task::yield_now().await;
        self.inner.read_counters(table, key).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::MemoryBackend;

    #[tokio::test]
    async fn test_starts_disarmed() {
        let inner: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let flaky = FlakyBackend::wrap(inner);
        flaky.put_row(TableId::Users, b"k", b"v").await.expect("put");
        assert_eq!(flaky.rejected(), 0);
    }

    #[tokio::test]
    async fn test_budget_spends_then_recovers() {
        let inner: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let flaky = FlakyBackend::wrap(inner);
        flaky.fail_writes(TableId::Users, 2);

        assert!(flaky.put_row(TableId::Users, b"k", b"v").await.is_err());
        assert!(flaky.put_row(TableId::Users, b"k", b"v").await.is_err());
        flaky.put_row(TableId::Users, b"k", b"v").await.expect("budget spent");
        assert_eq!(flaky.rejected(), 2);
    }

    #[tokio::test]
    async fn test_only_targeted_table_fails() {
        let inner: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let flaky = FlakyBackend::wrap(inner);
        flaky.fail_writes(TableId::UserTimeline, 1);

        flaky.put_row(TableId::Users, b"k", b"v").await.expect("other table");
        let err = flaky
            .put_row(TableId::UserTimeline, b"k", b"v")
            .await
            .expect_err("targeted table");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_reads_pass_through() {
        let inner: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        inner.put_row(TableId::Users, b"k", b"v").await.expect("seed");
        let flaky = FlakyBackend::wrap(inner);
        flaky.fail_writes(TableId::Users, 10);

        let row = flaky.get_row(TableId::Users, b"k").await.expect("get");
        assert_eq!(row.as_deref(), Some(&b"v"[..]));
        assert_eq!(flaky.rejected(), 0);
    }

    #[tokio::test]
    async fn test_read_faults_are_independent_of_write_faults() {
        let inner: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        inner.put_row(TableId::Discussions, b"k", b"v").await.expect("seed");
        let flaky = FlakyBackend::wrap(inner);
        flaky.fail_reads(TableId::Discussions, 1);

        flaky.put_row(TableId::Discussions, b"k", b"v2").await.expect("writes untouched");
        let err = flaky.get_row(TableId::Discussions, b"k").await.expect_err("read fault");
        assert!(err.is_retryable());
        // Budget spent
        flaky.get_row(TableId::Discussions, b"k").await.expect("recovered");

        let err =
            flaky.scan_prefix(TableId::Discussions, b"").await.err();
        assert!(err.is_none(), "scan uses the same spent budget");
    }

    #[tokio::test]
    async fn test_clear_disarms() {
        let inner: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let flaky = FlakyBackend::wrap(inner);
        flaky.fail_writes(TableId::Users, 10);
        flaky.clear();
        flaky.put_row(TableId::Users, b"k", b"v").await.expect("disarmed");
    }
}
