//! Failed-write repair and counter reconciliation.
//!
//! Secondary fan-out writes are best-effort: when one fails after its
//! retries, the fan-out writer persists the write as a [`RepairTask`] in the
//! repair queue table. The [`Reconciler`] drains that queue on a cadence and
//! replays each write until it lands or its attempt budget runs out.
//!
//! A [`PhysicalWrite`] is either a raw backend operation replayed verbatim,
//! or a self-contained operation (discussion membership, topic pointers,
//! follower timeline completion) that re-reads its inputs at execution time.
//! The latter kind updates shared rows through `put_row_if` so concurrent
//! executions never overwrite each other's changes, and may return follow-on
//! writes it determined from what the row held.
//!
//! The reconciler also closes counter drift: edge partitions, junction
//! partitions, and the discussion membership set are the authoritative
//! record, so counters that disagree with a fresh count are corrected with a
//! single signed delta.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use plaza_types::codec::{self, CodecError};
use plaza_types::snowflake::{self, SnowflakeError};
use plaza_types::{
    Discussion, DiscussionCounterField, DiscussionCounters, DiscussionId, EventId, MessageRef,
    PostCounterField, PostCounters, PostId, Topic, TopicCounterField, TopicId, UserCounterField,
    UserCounters, UserId, config::ReconcilerConfig,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

use crate::counters::CounterLedger;
use crate::edges::{EdgeKind, EdgeStore};
use crate::engine::{BackendError, StorageBackend};
use crate::keys::{clustering_of, encode_id, encode_pair, partition_prefix};
use crate::tables::TableId;

/// Attempts a conditional update makes before reporting contention.
const CONDITIONAL_ATTEMPTS: usize = 16;

/// Errors from the repair path.
#[derive(Debug, Snafu)]
pub enum RepairError {
    /// The backend rejected or failed the operation.
    #[snafu(display("repair backend failure"))]
    Backend {
        /// Underlying backend error.
        source: BackendError,
    },

    /// A queued task failed to encode or decode.
    #[snafu(display("repair task codec failure"))]
    Codec {
        /// Underlying codec error.
        source: CodecError,
    },

    /// Task id generation failed.
    #[snafu(display("repair task id generation failed"))]
    Id {
        /// Underlying generator error.
        source: SnowflakeError,
    },

    /// An edge scan during reconciliation failed.
    #[snafu(display("reconcile scan failure"))]
    Scan {
        /// Underlying edge error.
        source: crate::edges::EdgeError,
    },

    /// A counter read or delta during reconciliation failed.
    #[snafu(display("reconcile counter failure"))]
    Counter {
        /// Underlying ledger error.
        source: crate::counters::CounterError,
    },
}

/// Errors from executing a replayable write.
#[derive(Debug, Snafu)]
pub enum WriteError {
    /// The backend rejected or failed an operation.
    #[snafu(display("write storage failure"))]
    Storage {
        /// Underlying backend error.
        source: BackendError,
    },

    /// A row involved in the write failed to encode or decode.
    #[snafu(display("write codec failure in {table}", table = table.name()))]
    Encoding {
        /// Table holding the offending row.
        table: TableId,
        /// Underlying codec error.
        source: CodecError,
    },
}

impl WriteError {
    /// Whether retrying the same write can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { source } => source.is_retryable(),
            Self::Encoding { .. } => false,
        }
    }
}

/// A single replayable secondary write.
///
/// The raw variants carry exactly the information the backend call took the
/// first time, so replay is a verbatim re-issue; row writes are idempotent
/// by key, and a counter delta is queued at most once per failed merge. The
/// remaining variants re-read their inputs at execution time and update
/// shared rows through `put_row_if`, so concurrent executions serialize
/// instead of overwriting each other; replaying one re-derives everything
/// from current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhysicalWrite {
    /// Overwrite a row.
    PutRow {
        /// Target table.
        table: TableId,
        /// Encoded row key.
        key: Vec<u8>,
        /// Row bytes.
        value: Vec<u8>,
    },
    /// Delete a row.
    DeleteRow {
        /// Target table.
        table: TableId,
        /// Encoded row key.
        key: Vec<u8>,
    },
    /// Merge a counter delta.
    MergeCounter {
        /// Target counter table.
        table: TableId,
        /// Row id.
        id: i64,
        /// Field name.
        field: String,
        /// Signed delta.
        delta: i64,
    },
    /// Fold a post into its discussion: membership and the last-message
    /// pointer, with the member-count delta and topic follow-ons emitted
    /// only when this execution actually changed the row.
    NotePostInDiscussion {
        /// The discussion.
        discussion_id: DiscussionId,
        /// Post author; joins the membership set.
        user_id: UserId,
        /// The post.
        post_id: PostId,
        /// Post publish time, forwarded to the topic pointer.
        published_at: DateTime<Utc>,
    },
    /// Advance a topic's last-message pointer, never backwards.
    NoteTopicMessage {
        /// The topic.
        topic_id: TopicId,
        /// The post.
        post_id: PostId,
        /// Post publish time.
        at: DateTime<Utc>,
    },
    /// Insert a child into its parent topic's subtopic set.
    AdoptSubtopic {
        /// The parent topic.
        parent_id: TopicId,
        /// The child topic.
        child_id: TopicId,
    },
    /// Write a post into the timeline of every follower of its author,
    /// from a fresh follower scan. Idempotent over the whole set.
    FanOutTimeline {
        /// Post author.
        user_id: UserId,
        /// The post.
        post_id: PostId,
    },
}

impl PhysicalWrite {
    /// Table this write primarily targets.
    #[must_use]
    pub fn table(&self) -> TableId {
        match self {
            Self::PutRow { table, .. }
            | Self::DeleteRow { table, .. }
            | Self::MergeCounter { table, .. } => *table,
            Self::NotePostInDiscussion { .. } => TableId::Discussions,
            Self::NoteTopicMessage { .. } | Self::AdoptSubtopic { .. } => TableId::Topics,
            Self::FanOutTimeline { .. } => TableId::UserTimeline,
        }
    }

    /// Issues the write against the backend.
    ///
    /// Returns follow-on writes the operation determined during execution,
    /// such as counter deltas conditional on what the row held. Callers
    /// attempt those with the same best-effort policy as the original.
    pub async fn execute(
        &self,
        backend: &dyn StorageBackend,
    ) -> Result<Vec<PhysicalWrite>, WriteError> {
        match self {
            Self::PutRow { table, key, value } => {
                backend.put_row(*table, key, value).await.context(StorageSnafu)?;
                Ok(Vec::new())
            },
            Self::DeleteRow { table, key } => {
                backend.delete_row(*table, key).await.context(StorageSnafu)?;
                Ok(Vec::new())
            },
            Self::MergeCounter { table, id, field, delta } => {
                backend
                    .merge_counter(*table, &encode_id(*id), field, *delta)
                    .await
                    .context(StorageSnafu)?;
                Ok(Vec::new())
            },
            Self::NotePostInDiscussion { discussion_id, user_id, post_id, published_at } => {
                note_post_in_discussion(backend, *discussion_id, *user_id, *post_id, *published_at)
                    .await
            },
            Self::NoteTopicMessage { topic_id, post_id, at } => {
                note_topic_message(backend, *topic_id, *post_id, *at).await
            },
            Self::AdoptSubtopic { parent_id, child_id } => {
                adopt_subtopic(backend, *parent_id, *child_id).await
            },
            Self::FanOutTimeline { user_id, post_id } => {
                fan_out_timeline(backend, *user_id, *post_id).await
            },
        }
    }
}

/// Retryable error for a conditional update that kept losing its race.
fn contention(table: TableId) -> WriteError {
    WriteError::Storage {
        source: BackendError::Unavailable {
            table,
            message: "conditional write contention".to_string(),
        },
    }
}

async fn note_post_in_discussion(
    backend: &dyn StorageBackend,
    discussion_id: DiscussionId,
    user_id: UserId,
    post_id: PostId,
    published_at: DateTime<Utc>,
) -> Result<Vec<PhysicalWrite>, WriteError> {
    let key = encode_id(discussion_id.value());
    for _ in 0..CONDITIONAL_ATTEMPTS {
        let row = backend.get_row(TableId::Discussions, &key).await.context(StorageSnafu)?;
        let Some(bytes) = row else {
            tracing::warn!(
                discussion = %discussion_id,
                post = %post_id,
                "post anchored to missing discussion"
            );
            return Ok(Vec::new());
        };
        let mut discussion: Discussion = codec::decode(&bytes)
            .context(EncodingSnafu { table: TableId::Discussions })?;

        let joined = discussion.users.insert(user_id);
        // Post ids are time-ordered; never move the pointer backwards.
        let advanced = discussion.last_message.is_none_or(|last| last < post_id);
        if advanced {
            discussion.last_message = Some(post_id);
        }

        if joined || advanced {
            let updated = codec::encode(&discussion)
                .context(EncodingSnafu { table: TableId::Discussions })?;
            let applied = backend
                .put_row_if(TableId::Discussions, &key, Some(&bytes), &updated)
                .await
                .context(StorageSnafu)?;
            if !applied {
                // Lost to a concurrent update; re-read and try again
                continue;
            }
        }

        let mut next = Vec::new();
        if joined {
            next.push(PhysicalWrite::MergeCounter {
                table: TableId::DiscussionCounters,
                id: discussion_id.value(),
                field: DiscussionCounterField::UserCount.as_str().to_string(),
                delta: 1,
            });
        }
        if let Some(topic_id) = discussion.topic_id {
            next.push(PhysicalWrite::MergeCounter {
                table: TableId::TopicCounters,
                id: topic_id.value(),
                field: TopicCounterField::Messages.as_str().to_string(),
                delta: 1,
            });
            next.push(PhysicalWrite::NoteTopicMessage { topic_id, post_id, at: published_at });
        }
        return Ok(next);
    }
    Err(contention(TableId::Discussions))
}

async fn note_topic_message(
    backend: &dyn StorageBackend,
    topic_id: TopicId,
    post_id: PostId,
    at: DateTime<Utc>,
) -> Result<Vec<PhysicalWrite>, WriteError> {
    let key = encode_id(topic_id.value());
    for _ in 0..CONDITIONAL_ATTEMPTS {
        let row = backend.get_row(TableId::Topics, &key).await.context(StorageSnafu)?;
        let Some(bytes) = row else {
            tracing::warn!(topic = %topic_id, "discussion references missing topic");
            return Ok(Vec::new());
        };
        let mut topic: Topic =
            codec::decode(&bytes).context(EncodingSnafu { table: TableId::Topics })?;

        if topic.last_message.as_ref().is_some_and(|last| last.at >= at) {
            return Ok(Vec::new());
        }
        topic.last_message = Some(MessageRef { post_id, at });

        let updated =
            codec::encode(&topic).context(EncodingSnafu { table: TableId::Topics })?;
        let applied = backend
            .put_row_if(TableId::Topics, &key, Some(&bytes), &updated)
            .await
            .context(StorageSnafu)?;
        if applied {
            return Ok(Vec::new());
        }
    }
    Err(contention(TableId::Topics))
}

async fn adopt_subtopic(
    backend: &dyn StorageBackend,
    parent_id: TopicId,
    child_id: TopicId,
) -> Result<Vec<PhysicalWrite>, WriteError> {
    let key = encode_id(parent_id.value());
    for _ in 0..CONDITIONAL_ATTEMPTS {
        let row = backend.get_row(TableId::Topics, &key).await.context(StorageSnafu)?;
        let Some(bytes) = row else {
            tracing::warn!(topic = %parent_id, child = %child_id, "parent topic missing");
            return Ok(Vec::new());
        };
        let mut parent: Topic =
            codec::decode(&bytes).context(EncodingSnafu { table: TableId::Topics })?;

        if !parent.subtopics.insert(child_id) {
            return Ok(Vec::new());
        }

        let updated =
            codec::encode(&parent).context(EncodingSnafu { table: TableId::Topics })?;
        let applied = backend
            .put_row_if(TableId::Topics, &key, Some(&bytes), &updated)
            .await
            .context(StorageSnafu)?;
        if applied {
            return Ok(Vec::new());
        }
    }
    Err(contention(TableId::Topics))
}

async fn fan_out_timeline(
    backend: &dyn StorageBackend,
    user_id: UserId,
    post_id: PostId,
) -> Result<Vec<PhysicalWrite>, WriteError> {
    let author = codec::encode(&user_id)
        .context(EncodingSnafu { table: TableId::UserTimeline })?;

    backend
        .put_row(
            TableId::UserTimeline,
            &encode_pair(user_id.value(), post_id.value()),
            &author,
        )
        .await
        .context(StorageSnafu)?;

    let followers = backend
        .scan_prefix(TableId::UserFollowers, &partition_prefix(user_id.value()))
        .await
        .context(StorageSnafu)?;
    for (key, _) in followers {
        let Some(follower) = clustering_of(&key) else {
            continue;
        };
        backend
            .put_row(TableId::UserTimeline, &encode_pair(follower, post_id.value()), &author)
            .await
            .context(StorageSnafu)?;
    }
    Ok(Vec::new())
}

/// A queued failed write awaiting replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairTask {
    /// Queue key; snowflake, so queue order is submission order.
    pub id: EventId,
    /// Event that produced the failed write.
    pub event_id: EventId,
    /// When the write first failed.
    pub failed_at: DateTime<Utc>,
    /// Replay attempts made so far.
    pub attempts: u32,
    /// The write to replay.
    pub write: PhysicalWrite,
}

/// Persistent queue of failed secondary writes.
#[derive(Clone)]
pub struct RepairLog {
    backend: Arc<dyn StorageBackend>,
}

impl RepairLog {
    /// Creates a log over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Queues a failed write for replay.
    pub async fn enqueue(
        &self,
        event_id: EventId,
        write: PhysicalWrite,
    ) -> Result<EventId, RepairError> {
        let id = snowflake::generate_event_id().context(IdSnafu)?;
        let task = RepairTask { id, event_id, failed_at: Utc::now(), attempts: 0, write };
        self.put(&task).await?;
        Ok(id)
    }

    /// Rewrites a task, usually after bumping its attempt count.
    pub async fn put(&self, task: &RepairTask) -> Result<(), RepairError> {
        let bytes = codec::encode(task).context(CodecSnafu)?;
        self.backend
            .put_row(TableId::RepairQueue, &encode_id(task.id.value()), &bytes)
            .await
            .context(BackendSnafu)
    }

    /// Removes a task from the queue.
    pub async fn remove(&self, id: EventId) -> Result<(), RepairError> {
        self.backend
            .delete_row(TableId::RepairQueue, &encode_id(id.value()))
            .await
            .context(BackendSnafu)?;
        Ok(())
    }

    /// Lists up to `limit` tasks in queue order.
    pub async fn peek(&self, limit: usize) -> Result<Vec<RepairTask>, RepairError> {
        let rows = self
            .backend
            .scan_prefix(TableId::RepairQueue, &[])
            .await
            .context(BackendSnafu)?;
        rows.into_iter()
            .take(limit)
            .map(|(_, value)| codec::decode(&value).context(CodecSnafu))
            .collect()
    }

    /// Number of queued tasks.
    pub async fn len(&self) -> Result<usize, RepairError> {
        Ok(self
            .backend
            .scan_prefix(TableId::RepairQueue, &[])
            .await
            .context(BackendSnafu)?
            .len())
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> Result<bool, RepairError> {
        Ok(self.len().await? == 0)
    }
}

/// Outcome of one reconciler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks replayed successfully and removed.
    pub repaired: usize,
    /// Tasks that failed again and stay queued.
    pub deferred: usize,
    /// Tasks dropped after exhausting their attempt budget.
    pub abandoned: usize,
}

/// Replays failed writes and corrects counter drift.
#[derive(Clone)]
pub struct Reconciler {
    backend: Arc<dyn StorageBackend>,
    log: RepairLog,
    edges: EdgeStore,
    ledger: CounterLedger,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Creates a reconciler over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, config: ReconcilerConfig) -> Self {
        Self {
            log: RepairLog::new(Arc::clone(&backend)),
            edges: EdgeStore::new(Arc::clone(&backend)),
            ledger: CounterLedger::new(Arc::clone(&backend)),
            backend,
            config,
        }
    }

    /// The repair queue this reconciler drains.
    #[must_use]
    pub fn log(&self) -> &RepairLog {
        &self.log
    }

    /// Replays up to one batch of queued writes.
    ///
    /// Follow-on writes a replayed operation produces are attempted in the
    /// same pass and re-queued individually if they fail. A task that fails
    /// again has its attempt count bumped and stays queued; once the budget
    /// is spent, or the error is not retryable, the task is dropped and
    /// logged at error level, since at that point only a counter recount can
    /// recover the row's effect.
    pub async fn drain(&self) -> Result<DrainReport, RepairError> {
        let tasks = self.log.peek(self.config.batch).await?;
        let mut report = DrainReport::default();

        for mut task in tasks {
            let outcome = task.write.execute(self.backend.as_ref()).await;
            match outcome {
                Ok(next) => {
                    self.log.remove(task.id).await?;
                    report.repaired += 1;
                    self.settle(task.event_id, next).await?;
                },
                Err(err) => {
                    task.attempts += 1;
                    if !err.is_retryable() || task.attempts >= self.config.max_attempts {
                        tracing::error!(
                            task = %task.id,
                            event = %task.event_id,
                            table = task.write.table().name(),
                            attempts = task.attempts,
                            error = %err,
                            "abandoning repair task"
                        );
                        self.log.remove(task.id).await?;
                        report.abandoned += 1;
                    } else {
                        tracing::warn!(
                            task = %task.id,
                            table = task.write.table().name(),
                            attempts = task.attempts,
                            error = %err,
                            "repair attempt failed"
                        );
                        self.log.put(&task).await?;
                        report.deferred += 1;
                    }
                },
            }
        }

        Ok(report)
    }

    /// Executes follow-on writes transitively, queueing each failure as its
    /// own task.
    async fn settle(
        &self,
        event_id: EventId,
        writes: Vec<PhysicalWrite>,
    ) -> Result<(), RepairError> {
        let mut pending = writes;
        while let Some(write) = pending.pop() {
            match write.execute(self.backend.as_ref()).await {
                Ok(more) => pending.extend(more),
                Err(err) => {
                    tracing::warn!(
                        event = %event_id,
                        table = write.table().name(),
                        error = %err,
                        "follow-on write failed, queueing"
                    );
                    self.log.enqueue(event_id, write).await?;
                },
            }
        }
        Ok(())
    }

    /// Recounts a user's follow counters from the edge store and corrects
    /// any drift beyond the configured tolerance.
    ///
    /// Returns the net corrective delta applied (0 when within tolerance).
    pub async fn reconcile_follow_counters(&self, user: UserId) -> Result<i64, RepairError> {
        let counters: UserCounters =
            self.ledger.read(user.value()).await.context(CounterSnafu)?;

        let followers =
            self.edges.count_to(EdgeKind::FollowUser, user.value()).await.context(ScanSnafu)?;
        let following = self
            .edges
            .list_from(EdgeKind::FollowUser, user.value())
            .await
            .context(ScanSnafu)?
            .len() as i64;

        let mut applied = 0;
        applied += self
            .correct::<UserCounters>(
                user.value(),
                UserCounterField::FollowerCount,
                counters.follower_count,
                followers,
            )
            .await?;
        applied += self
            .correct::<UserCounters>(
                user.value(),
                UserCounterField::FollowingCount,
                counters.following_count,
                following,
            )
            .await?;
        Ok(applied)
    }

    /// Recounts a post's vote counters from the vote edge partition and
    /// corrects any drift beyond the configured tolerance.
    pub async fn reconcile_vote_counters(&self, post: PostId) -> Result<i64, RepairError> {
        let counters: PostCounters =
            self.ledger.read(post.value()).await.context(CounterSnafu)?;

        let votes =
            self.edges.list_to(EdgeKind::Vote, post.value()).await.context(ScanSnafu)?;
        let up = votes.iter().filter(|(_, attrs)| attrs.positive == Some(true)).count() as i64;
        let down =
            votes.iter().filter(|(_, attrs)| attrs.positive == Some(false)).count() as i64;

        let mut applied = 0;
        applied += self
            .correct::<PostCounters>(post.value(), PostCounterField::UpVotes, counters.up_votes, up)
            .await?;
        applied += self
            .correct::<PostCounters>(
                post.value(),
                PostCounterField::DownVotes,
                counters.down_votes,
                down,
            )
            .await?;
        applied += self
            .correct::<PostCounters>(
                post.value(),
                PostCounterField::Karma,
                counters.karma,
                up - down,
            )
            .await?;
        Ok(applied)
    }

    /// Recounts a discussion's counters from authoritative state and
    /// corrects any drift beyond the configured tolerance.
    ///
    /// The membership set in the discussion row is authoritative for
    /// `user_count`; the discussion's post partition is authoritative for
    /// `message_count`. A missing discussion applies nothing.
    pub async fn reconcile_discussion_counters(
        &self,
        discussion: DiscussionId,
    ) -> Result<i64, RepairError> {
        let key = encode_id(discussion.value());
        let row = self
            .backend
            .get_row(TableId::Discussions, &key)
            .await
            .context(BackendSnafu)?;
        let Some(bytes) = row else {
            return Ok(0);
        };
        let record: Discussion = codec::decode(&bytes).context(CodecSnafu)?;

        let posts = self
            .backend
            .scan_prefix(TableId::DiscussionPosts, &partition_prefix(discussion.value()))
            .await
            .context(BackendSnafu)?
            .len() as i64;

        let counters: DiscussionCounters =
            self.ledger.read(discussion.value()).await.context(CounterSnafu)?;

        let mut applied = 0;
        applied += self
            .correct::<DiscussionCounters>(
                discussion.value(),
                DiscussionCounterField::UserCount,
                counters.user_count,
                record.users.len() as i64,
            )
            .await?;
        applied += self
            .correct::<DiscussionCounters>(
                discussion.value(),
                DiscussionCounterField::MessageCount,
                counters.message_count,
                posts,
            )
            .await?;
        Ok(applied)
    }

    async fn correct<C: crate::counters::CounterRow>(
        &self,
        id: i64,
        field: C::Field,
        stored: i64,
        authoritative: i64,
    ) -> Result<i64, RepairError> {
        let drift = authoritative - stored;
        if drift.abs() <= self.config.drift_tolerance {
            return Ok(0);
        }
        tracing::warn!(
            id = id,
            field = %field,
            stored = stored,
            authoritative = authoritative,
            "correcting counter drift"
        );
        self.ledger.increment::<C>(id, field, drift).await.context(CounterSnafu)?;
        Ok(drift)
    }

    /// Drains the repair queue on the configured cadence until `token`
    /// fires. Pass failures are logged and do not stop the loop.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => {
                    tracing::debug!("reconciler stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.drain().await {
                Ok(report) if report != DrainReport::default() => {
                    tracing::debug!(
                        repaired = report.repaired,
                        deferred = report.deferred,
                        abandoned = report.abandoned,
                        "repair pass complete"
                    );
                },
                Ok(_) => {},
                Err(err) => {
                    tracing::warn!(error = %err, "repair pass failed");
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use plaza_types::config::ReconcilerConfig;

    use super::*;
    use crate::edges::EdgeAttrs;
    use crate::engine::MemoryBackend;

    fn reconciler() -> (Arc<MemoryBackend>, Reconciler) {
        let backend = Arc::new(MemoryBackend::new());
        let shared: Arc<dyn StorageBackend> = backend.clone();
        (backend, Reconciler::new(shared, ReconcilerConfig::default()))
    }

    #[tokio::test]
    async fn test_enqueue_replay_removes_task() {
        let (_, reconciler) = reconciler();
        let event = EventId::new(1);

        reconciler
            .log()
            .enqueue(
                event,
                PhysicalWrite::PutRow {
                    table: TableId::UserPosts,
                    key: crate::keys::encode_pair(7, 100),
                    value: Vec::new(),
                },
            )
            .await
            .expect("enqueue");
        assert_eq!(reconciler.log().len().await.expect("len"), 1);

        let report = reconciler.drain().await.expect("drain");
        assert_eq!(report.repaired, 1);
        assert!(reconciler.log().is_empty().await.expect("empty"));
    }

    #[tokio::test]
    async fn test_replayed_counter_delta_lands_once() {
        let (backend, reconciler) = reconciler();
        reconciler
            .log()
            .enqueue(
                EventId::new(1),
                PhysicalWrite::MergeCounter {
                    table: TableId::UserCounters,
                    id: 9,
                    field: "follower_count".to_string(),
                    delta: 1,
                },
            )
            .await
            .expect("enqueue");

        reconciler.drain().await.expect("drain");
        // Queue is empty, so a second pass must not re-apply
        reconciler.drain().await.expect("drain");

        let fields = backend
            .read_counters(TableId::UserCounters, &encode_id(9))
            .await
            .expect("read");
        assert_eq!(fields.get("follower_count"), Some(&1));
    }

    #[tokio::test]
    async fn test_drain_respects_batch_limit() {
        let backend = Arc::new(MemoryBackend::new());
        let shared: Arc<dyn StorageBackend> = backend.clone();
        let config = ReconcilerConfig::builder().batch(2).build();
        let reconciler = Reconciler::new(shared, config);

        for i in 0..5 {
            reconciler
                .log()
                .enqueue(
                    EventId::new(i),
                    PhysicalWrite::PutRow {
                        table: TableId::UserPosts,
                        key: crate::keys::encode_pair(7, i),
                        value: Vec::new(),
                    },
                )
                .await
                .expect("enqueue");
        }

        let report = reconciler.drain().await.expect("drain");
        assert_eq!(report.repaired, 2);
        assert_eq!(reconciler.log().len().await.expect("len"), 3);
    }

    #[tokio::test]
    async fn test_replayed_discussion_note_updates_membership() {
        let (backend, reconciler) = reconciler();
        let discussion = Discussion::builder()
            .id(1)
            .title("thread")
            .slug("thread")
            .user_id(5)
            .build();
        backend
            .put_row(
                TableId::Discussions,
                &encode_id(1),
                &codec::encode(&discussion).expect("encode"),
            )
            .await
            .expect("seed");

        reconciler
            .log()
            .enqueue(
                EventId::new(1),
                PhysicalWrite::NotePostInDiscussion {
                    discussion_id: DiscussionId::new(1),
                    user_id: UserId::new(7),
                    post_id: PostId::new(100),
                    published_at: Utc::now(),
                },
            )
            .await
            .expect("enqueue");

        let report = reconciler.drain().await.expect("drain");
        assert_eq!(report.repaired, 1);
        assert!(reconciler.log().is_empty().await.expect("empty"));

        let bytes = backend
            .get_row(TableId::Discussions, &encode_id(1))
            .await
            .expect("get")
            .expect("row");
        let stored: Discussion = codec::decode(&bytes).expect("decode");
        assert!(stored.users.contains(&UserId::new(7)));
        assert_eq!(stored.last_message, Some(PostId::new(100)));

        // The membership counter is a follow-on settled in the same pass
        let fields = backend
            .read_counters(TableId::DiscussionCounters, &encode_id(1))
            .await
            .expect("read");
        assert_eq!(fields.get("user_count"), Some(&1));
    }

    #[tokio::test]
    async fn test_discussion_note_rolls_up_into_topic() {
        let (backend, reconciler) = reconciler();
        let at = Utc::now();
        let discussion = Discussion::builder()
            .id(1)
            .title("thread")
            .slug("thread")
            .user_id(5)
            .topic_id(TopicId::new(3))
            .build();
        let topic = Topic::builder().id(3).slug("general").name("General").build();
        backend
            .put_row(
                TableId::Discussions,
                &encode_id(1),
                &codec::encode(&discussion).expect("encode"),
            )
            .await
            .expect("seed");
        backend
            .put_row(TableId::Topics, &encode_id(3), &codec::encode(&topic).expect("encode"))
            .await
            .expect("seed");

        reconciler
            .log()
            .enqueue(
                EventId::new(1),
                PhysicalWrite::NotePostInDiscussion {
                    discussion_id: DiscussionId::new(1),
                    user_id: UserId::new(7),
                    post_id: PostId::new(100),
                    published_at: at,
                },
            )
            .await
            .expect("enqueue");
        reconciler.drain().await.expect("drain");

        let bytes = backend
            .get_row(TableId::Topics, &encode_id(3))
            .await
            .expect("get")
            .expect("row");
        let stored: Topic = codec::decode(&bytes).expect("decode");
        assert_eq!(stored.last_message, Some(MessageRef { post_id: PostId::new(100), at }));

        let fields = backend
            .read_counters(TableId::TopicCounters, &encode_id(3))
            .await
            .expect("read");
        assert_eq!(fields.get("messages"), Some(&1));
    }

    #[tokio::test]
    async fn test_discussion_recount_corrects_from_membership() {
        let (backend, reconciler) = reconciler();
        let shared: Arc<dyn StorageBackend> = backend.clone();
        let ledger = CounterLedger::new(shared);

        let mut discussion = Discussion::builder()
            .id(1)
            .title("thread")
            .slug("thread")
            .user_id(5)
            .build();
        discussion.users.insert(UserId::new(5));
        discussion.users.insert(UserId::new(7));
        backend
            .put_row(
                TableId::Discussions,
                &encode_id(1),
                &codec::encode(&discussion).expect("encode"),
            )
            .await
            .expect("seed");
        for post in [100, 101, 102] {
            backend
                .put_row(TableId::DiscussionPosts, &encode_pair(1, post), &[])
                .await
                .expect("seed");
        }
        // user_count drifted high, message_count was never merged
        ledger
            .increment::<DiscussionCounters>(1, DiscussionCounterField::UserCount, 4)
            .await
            .expect("increment");

        reconciler
            .reconcile_discussion_counters(DiscussionId::new(1))
            .await
            .expect("reconcile");

        let counters: DiscussionCounters = ledger.read(1).await.expect("read");
        assert_eq!(counters.user_count, 2);
        assert_eq!(counters.message_count, 3);
    }

    #[tokio::test]
    async fn test_follower_drift_corrected_from_edges() {
        let (backend, reconciler) = reconciler();
        let shared: Arc<dyn StorageBackend> = backend.clone();
        let edges = EdgeStore::new(Arc::clone(&shared));
        let ledger = CounterLedger::new(shared);

        let target = UserId::new(9);
        for follower in 1..=3 {
            edges
                .link(EdgeKind::FollowUser, follower, target.value(), &EdgeAttrs::default())
                .await
                .expect("link");
        }
        // Inflate the counter past the edge count
        ledger
            .increment::<UserCounters>(target.value(), UserCounterField::FollowerCount, 8)
            .await
            .expect("increment");

        let applied = reconciler.reconcile_follow_counters(target).await.expect("reconcile");
        assert_eq!(applied, -5);

        let counters: UserCounters = ledger.read(target.value()).await.expect("read");
        assert_eq!(counters.follower_count, 3);
    }

    #[tokio::test]
    async fn test_vote_drift_corrected_including_karma() {
        let (backend, reconciler) = reconciler();
        let shared: Arc<dyn StorageBackend> = backend.clone();
        let edges = EdgeStore::new(Arc::clone(&shared));
        let ledger = CounterLedger::new(shared);

        let post = PostId::new(100);
        for voter in 1..=4 {
            let attrs = EdgeAttrs::builder().positive(voter != 4).build();
            edges
                .link(EdgeKind::Vote, voter, post.value(), &attrs)
                .await
                .expect("link");
        }
        // Counters never got the deltas

        reconciler.reconcile_vote_counters(post).await.expect("reconcile");

        let counters: PostCounters = ledger.read(post.value()).await.expect("read");
        assert_eq!(counters.up_votes, 3);
        assert_eq!(counters.down_votes, 1);
        assert_eq!(counters.karma, 2);
    }

    #[tokio::test]
    async fn test_counters_within_tolerance_left_alone() {
        let backend = Arc::new(MemoryBackend::new());
        let shared: Arc<dyn StorageBackend> = backend.clone();
        let config = ReconcilerConfig::builder().drift_tolerance(2).build();
        let reconciler = Reconciler::new(Arc::clone(&shared), config);
        let ledger = CounterLedger::new(shared);

        let target = UserId::new(9);
        // No edges; counter reads 2, within tolerance
        ledger
            .increment::<UserCounters>(target.value(), UserCounterField::FollowerCount, 2)
            .await
            .expect("increment");

        let applied = reconciler.reconcile_follow_counters(target).await.expect("reconcile");
        assert_eq!(applied, 0);

        let counters: UserCounters = ledger.read(target.value()).await.expect("read");
        assert_eq!(counters.follower_count, 2);
    }
}
