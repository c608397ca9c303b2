//! Relationship edge store.
//!
//! A logical edge (follow, vote) between a source and a target is
//! materialized as up to two physical rows: one partitioned by the source
//! for "everything this user points at" scans, and one partitioned by the
//! target for "everyone pointing at this" scans. The two rows are written
//! independently by the fan-out path; a crash between them leaves a
//! half-written edge that the reconciler repairs from the surviving side.
//!
//! Some edge kinds only ever get queried from one direction and keep a
//! single physical row; asking for the missing direction is a caller bug
//! surfaced as [`EdgeError::DirectionNotIndexed`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use plaza_types::codec::{self, CodecError};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::engine::{BackendError, StorageBackend};
use crate::keys::{clustering_of, encode_pair, partition_prefix};
use crate::tables::TableId;

/// Errors from edge operations.
#[derive(Debug, Snafu)]
pub enum EdgeError {
    /// The backend rejected or failed the operation.
    #[snafu(display("edge backend failure"))]
    Backend {
        /// Underlying backend error.
        source: BackendError,
    },

    /// Edge attributes failed to encode or decode.
    #[snafu(display("edge codec failure in {table}", table = table.name()))]
    Codec {
        /// Table holding the offending row.
        table: TableId,
        /// Underlying codec error.
        source: CodecError,
    },

    /// The edge kind keeps no source-side index to scan.
    #[snafu(display("{kind:?} is not indexed by source"))]
    DirectionNotIndexed {
        /// The edge kind.
        kind: EdgeKind,
    },
}

/// The logical edge kinds and their physical index tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// User follows user.
    FollowUser,
    /// User follows project.
    FollowProject,
    /// User follows channel.
    FollowChannel,
    /// User follows post (subscribes to its replies).
    FollowPost,
    /// User voted on post. Attributes carry the polarity.
    Vote,
}

impl EdgeKind {
    /// Table partitioned by the edge source, if this kind is indexed that way.
    #[must_use]
    pub const fn by_source(self) -> Option<TableId> {
        match self {
            Self::FollowUser => Some(TableId::UserFollowing),
            Self::FollowProject => Some(TableId::UserProjects),
            Self::Vote => Some(TableId::UserVotes),
            Self::FollowChannel | Self::FollowPost => None,
        }
    }

    /// Table partitioned by the edge target. Every kind has one; the
    /// target-side partition is the authoritative row for counts.
    #[must_use]
    pub const fn by_target(self) -> TableId {
        match self {
            Self::FollowUser => TableId::UserFollowers,
            Self::FollowProject => TableId::ProjectFollowers,
            Self::FollowChannel => TableId::ChannelFollowers,
            Self::FollowPost => TableId::PostFollowers,
            Self::Vote => TableId::PostVotes,
        }
    }
}

/// Attributes stored on each physical edge row.
///
/// Both rows of an edge carry identical attributes, so either side can
/// regenerate the other during repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct EdgeAttrs {
    /// When the edge was created.
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    /// Vote polarity; `None` for non-vote edges.
    pub positive: Option<bool>,
}

impl Default for EdgeAttrs {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One physical row of an edge, ready for the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRow {
    /// Index table the row belongs to.
    pub table: TableId,
    /// Encoded (partition, clustering) key.
    pub key: Vec<u8>,
}

/// Store for relationship edges over the backend.
#[derive(Clone)]
pub struct EdgeStore {
    backend: Arc<dyn StorageBackend>,
}

impl EdgeStore {
    /// Creates an edge store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Enumerates the physical rows a logical edge occupies, inverse row
    /// last.
    #[must_use]
    pub fn physical_rows(kind: EdgeKind, source: i64, target: i64) -> Vec<EdgeRow> {
        let mut rows = Vec::with_capacity(2);
        if let Some(table) = kind.by_source() {
            rows.push(EdgeRow { table, key: encode_pair(source, target) });
        }
        rows.push(EdgeRow { table: kind.by_target(), key: encode_pair(target, source) });
        rows
    }

    /// Writes one physical row of an edge.
    pub async fn put_row(&self, row: &EdgeRow, attrs: &EdgeAttrs) -> Result<(), EdgeError> {
        let bytes = codec::encode(attrs).context(CodecSnafu { table: row.table })?;
        self.backend.put_row(row.table, &row.key, &bytes).await.context(BackendSnafu)
    }

    /// Writes every physical row of an edge, in index order.
    ///
    /// Convenience for repair and tests; the fan-out path schedules the rows
    /// individually so each side can fail and be retried on its own.
    pub async fn link(
        &self,
        kind: EdgeKind,
        source: i64,
        target: i64,
        attrs: &EdgeAttrs,
    ) -> Result<(), EdgeError> {
        for row in Self::physical_rows(kind, source, target) {
            self.put_row(&row, attrs).await?;
        }
        Ok(())
    }

    /// Deletes every physical row of an edge. Returns whether any existed.
    pub async fn unlink(
        &self,
        kind: EdgeKind,
        source: i64,
        target: i64,
    ) -> Result<bool, EdgeError> {
        let mut existed = false;
        for row in Self::physical_rows(kind, source, target) {
            existed |= self
                .backend
                .delete_row(row.table, &row.key)
                .await
                .context(BackendSnafu)?;
        }
        Ok(existed)
    }

    /// Reads an edge's attributes, consulting the target index first.
    pub async fn get(
        &self,
        kind: EdgeKind,
        source: i64,
        target: i64,
    ) -> Result<Option<EdgeAttrs>, EdgeError> {
        for row in Self::physical_rows(kind, source, target).iter().rev() {
            let bytes =
                self.backend.get_row(row.table, &row.key).await.context(BackendSnafu)?;
            if let Some(bytes) = bytes {
                let attrs =
                    codec::decode(&bytes).context(CodecSnafu { table: row.table })?;
                return Ok(Some(attrs));
            }
        }
        Ok(None)
    }

    /// Lists targets of all edges of `kind` out of `source`, in target order.
    pub async fn list_from(
        &self,
        kind: EdgeKind,
        source: i64,
    ) -> Result<Vec<(i64, EdgeAttrs)>, EdgeError> {
        let Some(table) = kind.by_source() else {
            return Err(EdgeError::DirectionNotIndexed { kind });
        };
        self.scan_partition(table, source).await
    }

    /// Lists sources of all edges of `kind` into `target`, in source order.
    pub async fn list_to(
        &self,
        kind: EdgeKind,
        target: i64,
    ) -> Result<Vec<(i64, EdgeAttrs)>, EdgeError> {
        self.scan_partition(kind.by_target(), target).await
    }

    /// Counts edges of `kind` into `target` from the target index.
    ///
    /// This is the authoritative count the reconciler checks counters
    /// against.
    pub async fn count_to(&self, kind: EdgeKind, target: i64) -> Result<i64, EdgeError> {
        Ok(self.list_to(kind, target).await?.len() as i64)
    }

    async fn scan_partition(
        &self,
        table: TableId,
        partition: i64,
    ) -> Result<Vec<(i64, EdgeAttrs)>, EdgeError> {
        let rows = self
            .backend
            .scan_prefix(table, &partition_prefix(partition))
            .await
            .context(BackendSnafu)?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let Some(other) = clustering_of(&key) else {
                continue;
            };
            let attrs = codec::decode(&value).context(CodecSnafu { table })?;
            out.push((other, attrs));
        }
        Ok(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::MemoryBackend;

    fn store() -> EdgeStore {
        EdgeStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_follow_user_writes_both_sides() {
        let edges = store();
        edges
            .link(EdgeKind::FollowUser, 7, 9, &EdgeAttrs::default())
            .await
            .expect("link");

        let following = edges.list_from(EdgeKind::FollowUser, 7).await.expect("list");
        assert_eq!(following.len(), 1);
        assert_eq!(following[0].0, 9);

        let followers = edges.list_to(EdgeKind::FollowUser, 9).await.expect("list");
        assert_eq!(followers.len(), 1);
        assert_eq!(followers[0].0, 7);
    }

    #[tokio::test]
    async fn test_unlink_removes_both_sides() {
        let edges = store();
        edges
            .link(EdgeKind::FollowUser, 7, 9, &EdgeAttrs::default())
            .await
            .expect("link");

        assert!(edges.unlink(EdgeKind::FollowUser, 7, 9).await.expect("unlink"));
        assert!(!edges.unlink(EdgeKind::FollowUser, 7, 9).await.expect("unlink"));

        assert!(edges.list_from(EdgeKind::FollowUser, 7).await.expect("list").is_empty());
        assert!(edges.list_to(EdgeKind::FollowUser, 9).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_vote_polarity_roundtrips() {
        let edges = store();
        let attrs = EdgeAttrs::builder().positive(true).build();
        edges.link(EdgeKind::Vote, 7, 100, &attrs).await.expect("link");

        let loaded = edges.get(EdgeKind::Vote, 7, 100).await.expect("get").expect("present");
        assert_eq!(loaded.positive, Some(true));

        let by_post = edges.list_to(EdgeKind::Vote, 100).await.expect("list");
        assert_eq!(by_post, vec![(7, attrs)]);
        let by_user = edges.list_from(EdgeKind::Vote, 7).await.expect("list");
        assert_eq!(by_user, vec![(100, attrs)]);
    }

    #[tokio::test]
    async fn test_single_sided_kind_rejects_missing_direction() {
        let edges = store();
        edges
            .link(EdgeKind::FollowChannel, 7, 3, &EdgeAttrs::default())
            .await
            .expect("link");

        let followers = edges.list_to(EdgeKind::FollowChannel, 3).await.expect("list");
        assert_eq!(followers.len(), 1);

        let err = edges.list_from(EdgeKind::FollowChannel, 7).await.unwrap_err();
        assert!(matches!(err, EdgeError::DirectionNotIndexed { kind: EdgeKind::FollowChannel }));
    }

    #[tokio::test]
    async fn test_count_to_matches_row_count() {
        let edges = store();
        for follower in 1..=5 {
            edges
                .link(EdgeKind::FollowUser, follower, 9, &EdgeAttrs::default())
                .await
                .expect("link");
        }
        assert_eq!(edges.count_to(EdgeKind::FollowUser, 9).await.expect("count"), 5);
    }

    #[tokio::test]
    async fn test_relink_is_idempotent() {
        let edges = store();
        let attrs = EdgeAttrs::default();
        edges.link(EdgeKind::FollowUser, 7, 9, &attrs).await.expect("link");
        edges.link(EdgeKind::FollowUser, 7, 9, &attrs).await.expect("link");

        assert_eq!(edges.count_to(EdgeKind::FollowUser, 9).await.expect("count"), 1);
    }
}
