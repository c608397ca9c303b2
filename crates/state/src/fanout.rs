//! Index fan-out writer.
//!
//! One logical mutation expands into many physical writes across unrelated
//! partitions: the entity row, its unique index, junction rows, timeline
//! rows, edge rows, and counter deltas. The backend gives no cross-partition
//! atomicity, so this module owns the partial-failure policy:
//!
//! - the entity row and its unique index are must-succeed: they retry with
//!   bounded exponential backoff and abort the mutation if they cannot land;
//!   the index claim is a conditional insert, so concurrent claims of the
//!   same nick or slug settle to one owner
//! - everything else is best-effort: the writes are dispatched concurrently,
//!   awaited together, and each failure is queued for the reconciler instead
//!   of surfacing to the caller
//!
//! Writes that fold a post into a shared row (discussion membership, topic
//! pointers) and the follower timeline fan-out are self-contained
//! operations that read their inputs when they execute, so a failed read
//! reaches the repair queue as a replayable task instead of silently
//! dropping the dependent writes, and concurrent executions serialize
//! through conditional updates.
//!
//! Cancellation is honored only until the primary write is acknowledged.
//! From that point the mutation is committed and the fan-out runs to
//! completion (or failure-logging) even if the caller has gone away, so a
//! cancelled request can never leave a primary row with no fan-out attempted.
//!
//! Counters are incremented exactly once per logical event: every handler
//! reads the stored state first and emits deltas only for the actual change
//! (a repeated follow is a no-op, a vote flip emits the net adjustment).

use futures::future::join_all;
use plaza_types::codec;
use plaza_types::config::StoreConfig;
use plaza_types::snowflake::{self, SnowflakeError};
use plaza_types::validation::{
    ValidationError, validate_channel, validate_discussion, validate_post, validate_project,
    validate_topic, validate_user,
};
use plaza_types::{
    Channel, ChannelId, Discussion, DiscussionCounterField, DiscussionId, EventId, Post,
    PostCounterField, PostId, Project, ProjectId, Topic, TopicCounterField, TopicId, User,
    UserCounterField, UserId,
};
use snafu::Snafu;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::edges::{EdgeAttrs, EdgeKind, EdgeRow};
use crate::engine::StorageBackend;
use crate::keys::{encode_pair, encode_text_key};
use crate::records::{Record, RecordStore};
use crate::repair::{PhysicalWrite, RepairLog};
use crate::retry::{RetryFailure, with_retry, with_retry_cancellable};
use crate::tables::TableId;

/// Errors surfaced synchronously to the mutating caller.
///
/// Only validation and primary-write failures reach the caller; secondary
/// failures are queued for repair and invisible here.
#[derive(Debug, Snafu)]
pub enum MutationError {
    /// The payload failed shape or invariant checks; nothing was written.
    #[snafu(display("validation failed: {source}"))]
    Validation {
        /// The violated constraint.
        source: ValidationError,
    },

    /// A unique index (nick, slug) is already claimed by another entity.
    #[snafu(display("{entity} already exists: {key}"))]
    Conflict {
        /// Entity kind.
        entity: &'static str,
        /// The contested index key.
        key: String,
    },

    /// The mutation references an entity that does not exist.
    #[snafu(display("{entity} not found: {key}"))]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// The missing key.
        key: String,
    },

    /// A must-succeed write failed with a non-retryable error.
    #[snafu(display("primary write rejected: {message}"))]
    PrimaryRejected {
        /// Underlying error text.
        message: String,
    },

    /// A must-succeed write exhausted its retry budget. Not committed.
    #[snafu(display("primary write failed after {attempts} attempts: {message}"))]
    PrimaryExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        message: String,
    },

    /// The caller cancelled before the primary write was acknowledged.
    #[snafu(display("mutation cancelled before commit"))]
    Cancelled,

    /// Event id generation failed.
    #[snafu(display("event id generation failed"))]
    Id {
        /// Underlying generator error.
        source: SnowflakeError,
    },
}

fn primary_failure<E: fmt::Display>(failure: RetryFailure<E>) -> MutationError {
    match failure {
        RetryFailure::Rejected(err) => {
            MutationError::PrimaryRejected { message: err.to_string() }
        },
        RetryFailure::Exhausted { attempts, last } => {
            MutationError::PrimaryExhausted { attempts, message: last.to_string() }
        },
        RetryFailure::Cancelled => MutationError::Cancelled,
    }
}

/// What a follow edge points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowTarget {
    /// Follow another user.
    User(UserId),
    /// Follow a project.
    Project(ProjectId),
    /// Follow a channel.
    Channel(ChannelId),
    /// Subscribe to a post's replies.
    Post(PostId),
}

impl FollowTarget {
    fn kind(self) -> EdgeKind {
        match self {
            Self::User(_) => EdgeKind::FollowUser,
            Self::Project(_) => EdgeKind::FollowProject,
            Self::Channel(_) => EdgeKind::FollowChannel,
            Self::Post(_) => EdgeKind::FollowPost,
        }
    }

    fn id(self) -> i64 {
        match self {
            Self::User(id) => id.value(),
            Self::Project(id) => id.value(),
            Self::Channel(id) => id.value(),
            Self::Post(id) => id.value(),
        }
    }
}

/// A logical mutation descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Register a user and claim their nick.
    CreateUser(User),
    /// Publish a post and fan it out to every index it belongs in.
    CreatePost {
        /// The post.
        post: Post,
        /// Project timeline to announce the post in, if any. The
        /// association lives outside the post record.
        project_id: Option<ProjectId>,
    },
    /// Rewrite a post's primary row. Index rows are keyed and immutable;
    /// they are not touched.
    UpdatePost(Post),
    /// Soft-delete a post. Index rows are retained; reads filter.
    DeletePost {
        /// Post author (partition key).
        user_id: UserId,
        /// The post.
        post_id: PostId,
    },
    /// Count a post view.
    ViewPost {
        /// The post.
        post_id: PostId,
    },
    /// Open a discussion and claim its slug.
    CreateDiscussion(Discussion),
    /// Count a discussion view.
    ViewDiscussion {
        /// The discussion.
        discussion_id: DiscussionId,
    },
    /// Create a topic and claim its slug.
    CreateTopic(Topic),
    /// Count a topic view.
    ViewTopic {
        /// The topic.
        topic_id: TopicId,
    },
    /// Create a channel and claim its slug.
    CreateChannel(Channel),
    /// Create a project.
    CreateProject(Project),
    /// Create a follow edge.
    Follow {
        /// The following user.
        follower: UserId,
        /// What they follow.
        target: FollowTarget,
    },
    /// Remove a follow edge.
    Unfollow {
        /// The following user.
        follower: UserId,
        /// What they stop following.
        target: FollowTarget,
    },
    /// Cast or flip a vote on a post.
    Vote {
        /// The voting user.
        voter: UserId,
        /// The post's author (credited or debited karma).
        author: UserId,
        /// The post.
        post_id: PostId,
        /// Vote polarity.
        positive: bool,
    },
}

/// Outcome of an accepted mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    /// Event id assigned to this mutation.
    pub event_id: EventId,
    /// Whether state changed. `false` for idempotent no-ops such as a
    /// repeated follow or a vote with unchanged polarity.
    pub performed: bool,
    /// Secondary writes that failed and were queued for repair. Always zero
    /// when `detached`.
    pub repairs_queued: usize,
    /// Whether the fan-out was handed to a background task because the
    /// caller was cancellable.
    pub detached: bool,
}

/// Secondary work remaining after the primary write committed.
enum FanoutJob {
    /// Fully determined writes.
    Writes(Vec<PhysicalWrite>),
    /// Post fan-out; needs a follower scan.
    Post {
        post: Post,
        project_id: Option<ProjectId>,
    },
}

/// Applies logical mutations as fanned-out physical writes.
#[derive(Clone)]
pub struct FanoutWriter {
    backend: Arc<dyn StorageBackend>,
    posts: RecordStore<Post>,
    users: RecordStore<User>,
    discussions: RecordStore<Discussion>,
    topics: RecordStore<Topic>,
    channels: RecordStore<Channel>,
    projects: RecordStore<Project>,
    edges: crate::edges::EdgeStore,
    repair: RepairLog,
    config: StoreConfig,
}

impl FanoutWriter {
    /// Creates a writer over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, config: StoreConfig) -> Self {
        Self {
            posts: RecordStore::new(Arc::clone(&backend)),
            users: RecordStore::new(Arc::clone(&backend)),
            discussions: RecordStore::new(Arc::clone(&backend)),
            topics: RecordStore::new(Arc::clone(&backend)),
            channels: RecordStore::new(Arc::clone(&backend)),
            projects: RecordStore::new(Arc::clone(&backend)),
            edges: crate::edges::EdgeStore::new(Arc::clone(&backend)),
            repair: RepairLog::new(Arc::clone(&backend)),
            backend,
            config,
        }
    }

    /// The repair queue this writer feeds.
    #[must_use]
    pub fn repair_log(&self) -> &RepairLog {
        &self.repair
    }

    /// Applies a mutation, awaiting the full fan-out.
    ///
    /// Returns once every secondary write has been attempted; failures are
    /// queued for repair and counted in the receipt, never surfaced.
    pub async fn apply(&self, mutation: Mutation) -> Result<Receipt, MutationError> {
        let token = CancellationToken::new();
        self.execute(mutation, &token, false).await
    }

    /// Applies a mutation with caller cancellation.
    ///
    /// The token aborts the mutation only while the primary write is
    /// pending. Once it is acknowledged the mutation is committed and the
    /// remaining fan-out is detached to a background task.
    pub async fn apply_cancellable(
        &self,
        mutation: Mutation,
        token: &CancellationToken,
    ) -> Result<Receipt, MutationError> {
        self.execute(mutation, token, true).await
    }

    async fn execute(
        &self,
        mutation: Mutation,
        token: &CancellationToken,
        detach: bool,
    ) -> Result<Receipt, MutationError> {
        let event_id = snowflake::generate_event_id().map_err(|source| MutationError::Id {
            source,
        })?;

        let (performed, job) = match mutation {
            Mutation::CreateUser(user) => self.create_user(token, user).await?,
            Mutation::CreatePost { post, project_id } => {
                self.create_post(token, post, project_id).await?
            },
            Mutation::UpdatePost(post) => self.update_post(token, post).await?,
            Mutation::DeletePost { user_id, post_id } => {
                self.delete_post(token, user_id, post_id).await?
            },
            Mutation::ViewPost { post_id } => {
                self.bump_counter(
                    token,
                    TableId::PostCounters,
                    post_id.value(),
                    PostCounterField::Views.as_str(),
                )
                .await?
            },
            Mutation::CreateDiscussion(discussion) => {
                self.create_discussion(token, discussion).await?
            },
            Mutation::ViewDiscussion { discussion_id } => {
                self.bump_counter(
                    token,
                    TableId::DiscussionCounters,
                    discussion_id.value(),
                    DiscussionCounterField::ViewCount.as_str(),
                )
                .await?
            },
            Mutation::CreateTopic(topic) => self.create_topic(token, topic).await?,
            Mutation::ViewTopic { topic_id } => {
                self.bump_counter(
                    token,
                    TableId::TopicCounters,
                    topic_id.value(),
                    TopicCounterField::Views.as_str(),
                )
                .await?
            },
            Mutation::CreateChannel(channel) => self.create_channel(token, channel).await?,
            Mutation::CreateProject(project) => self.create_project(token, project).await?,
            Mutation::Follow { follower, target } => {
                self.follow(token, follower, target).await?
            },
            Mutation::Unfollow { follower, target } => {
                self.unfollow(token, follower, target).await?
            },
            Mutation::Vote { voter, author, post_id, positive } => {
                self.vote(token, voter, author, post_id, positive).await?
            },
        };

        // Committed. Cancellation no longer applies.
        let Some(job) = job.filter(|_| performed) else {
            return Ok(Receipt { event_id, performed, repairs_queued: 0, detached: false });
        };

        if detach {
            let writer = self.clone();
            tokio::spawn(async move {
                let queued = writer.run_job(event_id, job).await;
                if queued > 0 {
                    tracing::debug!(
                        event = %event_id,
                        queued = queued,
                        "detached fan-out queued repairs"
                    );
                }
            });
            Ok(Receipt { event_id, performed, repairs_queued: 0, detached: true })
        } else {
            let queued = self.run_job(event_id, job).await;
            Ok(Receipt { event_id, performed, repairs_queued: queued, detached: false })
        }
    }

    // ------------------------------------------------------------------
    // Mutation handlers: primary phase
    // ------------------------------------------------------------------

    async fn create_user(
        &self,
        token: &CancellationToken,
        user: User,
    ) -> Result<(bool, Option<FanoutJob>), MutationError> {
        validate_user(&user, &self.config.validation)
            .map_err(|source| MutationError::Validation { source })?;

        if self.must_get_record(token, &self.users, user.id).await?.is_some() {
            return Ok((false, None));
        }
        self.claim_unique_index(token, TableId::NickIndex, &user.nick, user.id.value(), "user")
            .await?;
        self.must_put_record(token, &self.users, &user).await?;
        Ok((true, None))
    }

    async fn create_post(
        &self,
        token: &CancellationToken,
        post: Post,
        project_id: Option<ProjectId>,
    ) -> Result<(bool, Option<FanoutJob>), MutationError> {
        validate_post(&post, &self.config.validation)
            .map_err(|source| MutationError::Validation { source })?;

        // Resubmission of an already-committed post must not re-run the
        // fan-out, or its counter deltas would apply twice.
        if self.must_get_record(token, &self.posts, post.key()).await?.is_some() {
            return Ok((false, None));
        }
        self.must_put_record(token, &self.posts, &post).await?;
        Ok((true, Some(FanoutJob::Post { post, project_id })))
    }

    async fn update_post(
        &self,
        token: &CancellationToken,
        post: Post,
    ) -> Result<(bool, Option<FanoutJob>), MutationError> {
        validate_post(&post, &self.config.validation)
            .map_err(|source| MutationError::Validation { source })?;

        if self.must_get_record(token, &self.posts, post.key()).await?.is_none() {
            return Err(MutationError::NotFound {
                entity: "post",
                key: post.id.to_string(),
            });
        }
        self.must_put_record(token, &self.posts, &post).await?;
        Ok((true, None))
    }

    async fn delete_post(
        &self,
        token: &CancellationToken,
        user_id: UserId,
        post_id: PostId,
    ) -> Result<(bool, Option<FanoutJob>), MutationError> {
        let Some(mut post) =
            self.must_get_record(token, &self.posts, (user_id, post_id)).await?
        else {
            return Err(MutationError::NotFound {
                entity: "post",
                key: post_id.to_string(),
            });
        };
        if post.deleted {
            return Ok((false, None));
        }
        post.deleted = true;
        self.must_put_record(token, &self.posts, &post).await?;
        Ok((true, None))
    }

    async fn create_discussion(
        &self,
        token: &CancellationToken,
        discussion: Discussion,
    ) -> Result<(bool, Option<FanoutJob>), MutationError> {
        validate_discussion(&discussion, &self.config.validation)
            .map_err(|source| MutationError::Validation { source })?;

        if self.must_get_record(token, &self.discussions, discussion.id).await?.is_some() {
            return Ok((false, None));
        }
        self.claim_unique_index(
            token,
            TableId::DiscussionSlugIndex,
            &discussion.slug,
            discussion.id.value(),
            "discussion",
        )
        .await?;
        self.must_put_record(token, &self.discussions, &discussion).await?;

        let mut writes = Vec::new();
        if let Some(topic_id) = discussion.topic_id {
            writes.push(PhysicalWrite::PutRow {
                table: TableId::TopicDiscussions,
                key: encode_pair(topic_id.value(), discussion.id.value()),
                value: Vec::new(),
            });
            writes.push(PhysicalWrite::MergeCounter {
                table: TableId::TopicCounters,
                id: topic_id.value(),
                field: TopicCounterField::Discussions.as_str().to_string(),
                delta: 1,
            });
        }
        Ok((true, Some(FanoutJob::Writes(writes))))
    }

    async fn create_topic(
        &self,
        token: &CancellationToken,
        topic: Topic,
    ) -> Result<(bool, Option<FanoutJob>), MutationError> {
        validate_topic(&topic, &self.config.validation)
            .map_err(|source| MutationError::Validation { source })?;

        if self.must_get_record(token, &self.topics, topic.id).await?.is_some() {
            return Ok((false, None));
        }
        self.claim_unique_index(
            token,
            TableId::TopicSlugIndex,
            &topic.slug,
            topic.id.value(),
            "topic",
        )
        .await?;
        self.must_put_record(token, &self.topics, &topic).await?;

        let job = topic.parent_topic.map(|parent_id| {
            FanoutJob::Writes(vec![PhysicalWrite::AdoptSubtopic {
                parent_id,
                child_id: topic.id,
            }])
        });
        Ok((true, job))
    }

    async fn create_channel(
        &self,
        token: &CancellationToken,
        channel: Channel,
    ) -> Result<(bool, Option<FanoutJob>), MutationError> {
        validate_channel(&channel, &self.config.validation)
            .map_err(|source| MutationError::Validation { source })?;

        if self.must_get_record(token, &self.channels, channel.id).await?.is_some() {
            return Ok((false, None));
        }
        self.claim_unique_index(
            token,
            TableId::ChannelSlugIndex,
            &channel.slug,
            channel.id.value(),
            "channel",
        )
        .await?;
        self.must_put_record(token, &self.channels, &channel).await?;
        Ok((true, None))
    }

    async fn create_project(
        &self,
        token: &CancellationToken,
        project: Project,
    ) -> Result<(bool, Option<FanoutJob>), MutationError> {
        validate_project(&project, &self.config.validation)
            .map_err(|source| MutationError::Validation { source })?;

        if self.must_get_record(token, &self.projects, project.id).await?.is_some() {
            return Ok((false, None));
        }
        self.must_put_record(token, &self.projects, &project).await?;
        Ok((true, None))
    }

    async fn follow(
        &self,
        token: &CancellationToken,
        follower: UserId,
        target: FollowTarget,
    ) -> Result<(bool, Option<FanoutJob>), MutationError> {
        let kind = target.kind();
        let (inverse, forward) = edge_rows(kind, follower.value(), target.id());

        // Repeated follow is a no-op; emitting the counter deltas again
        // would drift them.
        if self.must_get_row(token, &inverse).await?.is_some() {
            return Ok((false, None));
        }

        let attrs = EdgeAttrs::default();
        let attrs_bytes = codec::encode(&attrs)
            .map_err(|err| MutationError::PrimaryRejected { message: err.to_string() })?;
        self.must_execute(
            token,
            &PhysicalWrite::PutRow {
                table: inverse.table,
                key: inverse.key.clone(),
                value: attrs_bytes.clone(),
            },
        )
        .await?;

        let mut writes = Vec::new();
        if let Some(forward) = forward {
            writes.push(PhysicalWrite::PutRow {
                table: forward.table,
                key: forward.key,
                value: attrs_bytes,
            });
        }
        if let FollowTarget::User(target_user) = target {
            writes.push(user_counter(target_user, UserCounterField::FollowerCount, 1));
            writes.push(user_counter(follower, UserCounterField::FollowingCount, 1));
        }
        Ok((true, Some(FanoutJob::Writes(writes))))
    }

    async fn unfollow(
        &self,
        token: &CancellationToken,
        follower: UserId,
        target: FollowTarget,
    ) -> Result<(bool, Option<FanoutJob>), MutationError> {
        let kind = target.kind();
        let (inverse, forward) = edge_rows(kind, follower.value(), target.id());

        if self.must_get_row(token, &inverse).await?.is_none() {
            return Ok((false, None));
        }

        self.must_execute(
            token,
            &PhysicalWrite::DeleteRow { table: inverse.table, key: inverse.key.clone() },
        )
        .await?;

        let mut writes = Vec::new();
        if let Some(forward) = forward {
            writes.push(PhysicalWrite::DeleteRow { table: forward.table, key: forward.key });
        }
        if let FollowTarget::User(target_user) = target {
            writes.push(user_counter(target_user, UserCounterField::FollowerCount, -1));
            writes.push(user_counter(follower, UserCounterField::FollowingCount, -1));
        }
        Ok((true, Some(FanoutJob::Writes(writes))))
    }

    async fn vote(
        &self,
        token: &CancellationToken,
        voter: UserId,
        author: UserId,
        post_id: PostId,
        positive: bool,
    ) -> Result<(bool, Option<FanoutJob>), MutationError> {
        let (inverse, forward) = edge_rows(EdgeKind::Vote, voter.value(), post_id.value());

        let previous = match self.must_get_row(token, &inverse).await? {
            Some(bytes) => Some(codec::decode::<EdgeAttrs>(&bytes).map_err(|err| {
                MutationError::PrimaryRejected { message: err.to_string() }
            })?),
            None => None,
        };
        if previous.and_then(|attrs| attrs.positive) == Some(positive) {
            return Ok((false, None));
        }

        // Existence row keeps its creation time across polarity flips.
        let attrs = match previous {
            Some(prev) => EdgeAttrs { positive: Some(positive), ..prev },
            None => EdgeAttrs::builder().positive(positive).build(),
        };
        let attrs_bytes = codec::encode(&attrs)
            .map_err(|err| MutationError::PrimaryRejected { message: err.to_string() })?;
        self.must_execute(
            token,
            &PhysicalWrite::PutRow {
                table: inverse.table,
                key: inverse.key.clone(),
                value: attrs_bytes.clone(),
            },
        )
        .await?;

        let mut writes = Vec::new();
        if let Some(forward) = forward {
            writes.push(PhysicalWrite::PutRow {
                table: forward.table,
                key: forward.key,
                value: attrs_bytes,
            });
        }

        // Net deltas only: retract the previous polarity before crediting
        // the new one, so a flip never double-counts.
        if let Some(was_positive) = previous.and_then(|attrs| attrs.positive) {
            writes.extend(vote_deltas(voter, author, post_id, was_positive, -1));
        }
        writes.extend(vote_deltas(voter, author, post_id, positive, 1));
        Ok((true, Some(FanoutJob::Writes(writes))))
    }

    async fn bump_counter(
        &self,
        token: &CancellationToken,
        table: TableId,
        id: i64,
        field: &str,
    ) -> Result<(bool, Option<FanoutJob>), MutationError> {
        self.must_execute(
            token,
            &PhysicalWrite::MergeCounter { table, id, field: field.to_string(), delta: 1 },
        )
        .await?;
        Ok((true, None))
    }

    // ------------------------------------------------------------------
    // Primary-write plumbing
    // ------------------------------------------------------------------

    async fn must_execute(
        &self,
        token: &CancellationToken,
        write: &PhysicalWrite,
    ) -> Result<(), MutationError> {
        with_retry_cancellable(&self.config.retry, token, || {
            write.execute(self.backend.as_ref())
        })
        .await
        .map(|_| ())
        .map_err(primary_failure)
    }

    async fn must_get_row(
        &self,
        token: &CancellationToken,
        row: &EdgeRow,
    ) -> Result<Option<Vec<u8>>, MutationError> {
        with_retry_cancellable(&self.config.retry, token, || {
            self.backend.get_row(row.table, &row.key)
        })
        .await
        .map_err(primary_failure)
    }

    async fn must_get_record<R: Record>(
        &self,
        token: &CancellationToken,
        store: &RecordStore<R>,
        key: R::Key,
    ) -> Result<Option<R>, MutationError> {
        with_retry_cancellable(&self.config.retry, token, || store.get(key))
            .await
            .map_err(primary_failure)
    }

    async fn must_put_record<R: Record>(
        &self,
        token: &CancellationToken,
        store: &RecordStore<R>,
        record: &R,
    ) -> Result<(), MutationError> {
        with_retry_cancellable(&self.config.retry, token, || store.put(record))
            .await
            .map_err(primary_failure)
    }

    /// Claims a unique text index entry for `id`, rejecting a claim already
    /// held by a different entity. Reclaiming our own entry is a no-op.
    ///
    /// The claim is a conditional insert, so two concurrent claims of the
    /// same text settle to exactly one owner; the loser reads the winner's
    /// entry and conflicts.
    async fn claim_unique_index(
        &self,
        token: &CancellationToken,
        table: TableId,
        text: &str,
        id: i64,
        entity: &'static str,
    ) -> Result<(), MutationError> {
        let key = encode_text_key(text);
        let value = codec::encode(&id)
            .map_err(|err| MutationError::PrimaryRejected { message: err.to_string() })?;

        let claimed = with_retry_cancellable(&self.config.retry, token, || {
            self.backend.put_row_if(table, &key, None, &value)
        })
        .await
        .map_err(primary_failure)?;
        if claimed {
            return Ok(());
        }

        let existing = with_retry_cancellable(&self.config.retry, token, || {
            self.backend.get_row(table, &key)
        })
        .await
        .map_err(primary_failure)?;
        let Some(bytes) = existing else {
            // Index entries are never deleted, so a lost claim always
            // leaves an owner to read.
            return Err(MutationError::PrimaryRejected {
                message: format!("unique index entry for {text:?} vanished during claim"),
            });
        };
        let owner: i64 = codec::decode(&bytes)
            .map_err(|err| MutationError::PrimaryRejected { message: err.to_string() })?;
        if owner == id {
            Ok(())
        } else {
            Err(MutationError::Conflict { entity, key: text.to_string() })
        }
    }

    // ------------------------------------------------------------------
    // Secondary phase
    // ------------------------------------------------------------------

    async fn run_job(&self, event_id: EventId, job: FanoutJob) -> usize {
        let (writes, mut queued) = match job {
            FanoutJob::Writes(writes) => (writes, 0),
            FanoutJob::Post { post, project_id } => {
                self.plan_post_writes(event_id, &post, project_id).await
            },
        };
        queued += self.run_writes(event_id, writes).await;
        queued
    }

    async fn run_writes(&self, event_id: EventId, writes: Vec<PhysicalWrite>) -> usize {
        let attempts =
            writes.into_iter().map(|write| self.attempt_secondary(event_id, write));
        join_all(attempts).await.into_iter().sum()
    }

    /// Attempts one best-effort write and, transitively, the follow-on
    /// writes it produces; each final failure is queued for repair. Returns
    /// the number of repairs queued.
    async fn attempt_secondary(&self, event_id: EventId, write: PhysicalWrite) -> usize {
        let mut queued = 0;
        let mut pending = vec![write];
        while let Some(write) = pending.pop() {
            let outcome =
                with_retry(&self.config.retry, || write.execute(self.backend.as_ref())).await;
            match outcome {
                Ok(next) => pending.extend(next),
                Err(failure) => {
                    tracing::warn!(
                        event = %event_id,
                        table = write.table().name(),
                        error = %failure,
                        "secondary write failed, queueing repair"
                    );
                    if let Err(err) = self.repair.enqueue(event_id, write).await {
                        tracing::error!(
                            event = %event_id,
                            error = %err,
                            "failed to queue repair task"
                        );
                    }
                    queued += 1;
                },
            }
        }
        queued
    }

    /// Computes the full fan-out of a committed post.
    ///
    /// A failed or truncated follower scan never drops timeline entries: a
    /// self-contained completion task re-runs the scan on the repair path.
    /// Returns the writes to attempt and the number of repairs already
    /// queued.
    async fn plan_post_writes(
        &self,
        event_id: EventId,
        post: &Post,
        project_id: Option<ProjectId>,
    ) -> (Vec<PhysicalWrite>, usize) {
        let author_value = codec::encode(&post.user_id).unwrap_or_default();
        let mut writes = vec![
            PhysicalWrite::PutRow {
                table: TableId::UserPosts,
                key: encode_pair(post.user_id.value(), post.id.value()),
                value: Vec::new(),
            },
            // The author sees their own post in their timeline.
            PhysicalWrite::PutRow {
                table: TableId::UserTimeline,
                key: encode_pair(post.user_id.value(), post.id.value()),
                value: author_value.clone(),
            },
        ];

        if let Some(channel_id) = post.anchor.channel_id() {
            writes.push(PhysicalWrite::PutRow {
                table: TableId::ChannelTimeline,
                key: encode_pair(channel_id.value(), post.id.value()),
                value: author_value.clone(),
            });
        }
        if let Some(project_id) = project_id {
            writes.push(PhysicalWrite::PutRow {
                table: TableId::ProjectTimeline,
                key: encode_pair(project_id.value(), post.id.value()),
                value: author_value.clone(),
            });
        }
        if let Some(reply) = &post.reply_to {
            writes.push(PhysicalWrite::PutRow {
                table: TableId::PostReplies,
                key: encode_pair(reply.post_id.value(), post.id.value()),
                value: author_value.clone(),
            });
            writes.push(PhysicalWrite::MergeCounter {
                table: TableId::PostCounters,
                id: reply.post_id.value(),
                field: PostCounterField::Replies.as_str().to_string(),
                delta: 1,
            });
        }

        let mut queued = 0;
        match self.edges.list_to(EdgeKind::FollowUser, post.user_id.value()).await {
            Ok(followers) => {
                if followers.len() > self.config.fanout.max_timeline_fanout {
                    tracing::warn!(
                        user = %post.user_id,
                        followers = followers.len(),
                        bound = self.config.fanout.max_timeline_fanout,
                        "follower fan-out truncated, queueing completion"
                    );
                    queued += self
                        .defer(
                            event_id,
                            PhysicalWrite::FanOutTimeline {
                                user_id: post.user_id,
                                post_id: post.id,
                            },
                        )
                        .await;
                }
                for (follower, _) in
                    followers.into_iter().take(self.config.fanout.max_timeline_fanout)
                {
                    writes.push(PhysicalWrite::PutRow {
                        table: TableId::UserTimeline,
                        key: encode_pair(follower, post.id.value()),
                        value: author_value.clone(),
                    });
                }
            },
            Err(err) => {
                tracing::warn!(
                    user = %post.user_id,
                    error = %err,
                    "follower scan failed, queueing timeline fan-out"
                );
                queued += self
                    .defer(
                        event_id,
                        PhysicalWrite::FanOutTimeline {
                            user_id: post.user_id,
                            post_id: post.id,
                        },
                    )
                    .await;
            },
        }

        if let Some(discussion_id) = post.anchor.discussion_id() {
            writes.push(PhysicalWrite::PutRow {
                table: TableId::DiscussionPosts,
                key: encode_pair(discussion_id.value(), post.id.value()),
                value: author_value,
            });
            writes.push(PhysicalWrite::MergeCounter {
                table: TableId::DiscussionCounters,
                id: discussion_id.value(),
                field: DiscussionCounterField::MessageCount.as_str().to_string(),
                delta: 1,
            });
            writes.push(PhysicalWrite::NotePostInDiscussion {
                discussion_id,
                user_id: post.user_id,
                post_id: post.id,
                published_at: post.published_at,
            });
        }

        (writes, queued)
    }

    /// Queues a write for the reconciler without attempting it inline.
    /// Returns the number of repairs queued.
    async fn defer(&self, event_id: EventId, write: PhysicalWrite) -> usize {
        match self.repair.enqueue(event_id, write).await {
            Ok(_) => 1,
            Err(err) => {
                tracing::error!(
                    event = %event_id,
                    error = %err,
                    "failed to queue repair task"
                );
                0
            },
        }
    }
}

/// The (inverse, forward) physical rows of an edge. The inverse row exists
/// for every kind and is the one treated as primary.
fn edge_rows(kind: EdgeKind, source: i64, target: i64) -> (EdgeRow, Option<EdgeRow>) {
    let inverse = EdgeRow { table: kind.by_target(), key: encode_pair(target, source) };
    let forward = kind
        .by_source()
        .map(|table| EdgeRow { table, key: encode_pair(source, target) });
    (inverse, forward)
}

fn user_counter(user: UserId, field: UserCounterField, delta: i64) -> PhysicalWrite {
    PhysicalWrite::MergeCounter {
        table: TableId::UserCounters,
        id: user.value(),
        field: field.as_str().to_string(),
        delta,
    }
}

/// Counter deltas for one vote event with the given sign.
fn vote_deltas(
    voter: UserId,
    author: UserId,
    post_id: PostId,
    positive: bool,
    sign: i64,
) -> Vec<PhysicalWrite> {
    let (post_field, given, received) = if positive {
        (PostCounterField::UpVotes, UserCounterField::UpVoteGiven, UserCounterField::UpVoteReceived)
    } else {
        (
            PostCounterField::DownVotes,
            UserCounterField::DownVoteGiven,
            UserCounterField::DownVoteTaken,
        )
    };
    let karma = if positive { sign } else { -sign };
    vec![
        PhysicalWrite::MergeCounter {
            table: TableId::PostCounters,
            id: post_id.value(),
            field: post_field.as_str().to_string(),
            delta: sign,
        },
        PhysicalWrite::MergeCounter {
            table: TableId::PostCounters,
            id: post_id.value(),
            field: PostCounterField::Karma.as_str().to_string(),
            delta: karma,
        },
        user_counter(voter, given, sign),
        user_counter(author, received, sign),
        PhysicalWrite::MergeCounter {
            table: TableId::UserCounters,
            id: author.value(),
            field: UserCounterField::Karma.as_str().to_string(),
            delta: karma,
        },
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use plaza_types::PostAnchor;
    use plaza_types::config::{FanoutConfig, ReconcilerConfig};

    use super::*;
    use crate::counters::CounterLedger;
    use crate::engine::MemoryBackend;
    use crate::repair::Reconciler;
    use crate::testing::FlakyBackend;
    use plaza_types::{PostCounters, UserCounters};

    fn writer() -> (Arc<MemoryBackend>, FanoutWriter) {
        let backend = Arc::new(MemoryBackend::new());
        let shared: Arc<dyn StorageBackend> = backend.clone();
        (backend, FanoutWriter::new(shared, StoreConfig::default()))
    }

    fn post(id: i64, user: i64) -> Post {
        Post::builder()
            .id(PostId::new(id))
            .user_id(UserId::new(user))
            .user_nick("ada")
            .text("hello")
            .build()
    }

    #[tokio::test]
    async fn test_create_post_writes_primary_and_user_post() {
        let (backend, writer) = writer();
        let receipt = writer
            .apply(Mutation::CreatePost { post: post(100, 7), project_id: None })
            .await
            .expect("apply");

        assert!(receipt.performed);
        assert_eq!(receipt.repairs_queued, 0);
        assert_eq!(backend.row_count(TableId::Posts), 1);
        assert_eq!(backend.row_count(TableId::UserPosts), 1);
    }

    #[tokio::test]
    async fn test_create_post_rejects_empty_text() {
        let (backend, writer) = writer();
        let mut bad = post(100, 7);
        bad.text = String::new();

        let err = writer
            .apply(Mutation::CreatePost { post: bad, project_id: None })
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Validation { .. }));
        assert_eq!(backend.row_count(TableId::Posts), 0);
    }

    #[tokio::test]
    async fn test_duplicate_nick_conflicts() {
        let (_, writer) = writer();
        let first = User::builder().id(UserId::new(1)).nick("ada").build();
        let second = User::builder().id(UserId::new(2)).nick("ada").build();

        writer.apply(Mutation::CreateUser(first)).await.expect("apply");
        let err = writer.apply(Mutation::CreateUser(second)).await.unwrap_err();
        assert!(matches!(err, MutationError::Conflict { entity: "user", .. }));
    }

    #[tokio::test]
    async fn test_follow_then_repeat_is_noop() {
        let (backend, writer) = writer();
        let shared: Arc<dyn StorageBackend> = backend.clone();
        let ledger = CounterLedger::new(shared);

        let follow = Mutation::Follow {
            follower: UserId::new(7),
            target: FollowTarget::User(UserId::new(9)),
        };
        let first = writer.apply(follow.clone()).await.expect("apply");
        assert!(first.performed);
        let second = writer.apply(follow).await.expect("apply");
        assert!(!second.performed);

        let target: UserCounters = ledger.read(9).await.expect("read");
        assert_eq!(target.follower_count, 1);
        let follower: UserCounters = ledger.read(7).await.expect("read");
        assert_eq!(follower.following_count, 1);
    }

    #[tokio::test]
    async fn test_vote_flip_nets_out() {
        let (backend, writer) = writer();
        let shared: Arc<dyn StorageBackend> = backend.clone();
        let ledger = CounterLedger::new(shared);

        let vote = |positive| Mutation::Vote {
            voter: UserId::new(8),
            author: UserId::new(7),
            post_id: PostId::new(100),
            positive,
        };
        writer.apply(vote(true)).await.expect("apply");
        writer.apply(vote(false)).await.expect("apply");

        let counters: PostCounters = ledger.read(100).await.expect("read");
        assert_eq!(counters.up_votes, 0);
        assert_eq!(counters.down_votes, 1);
        assert_eq!(counters.karma, -1);

        let author: UserCounters = ledger.read(7).await.expect("read");
        assert_eq!(author.up_vote_received, 0);
        assert_eq!(author.down_vote_taken, 1);
        assert_eq!(author.karma, -1);
    }

    #[tokio::test]
    async fn test_repeated_vote_same_polarity_is_noop() {
        let (backend, writer) = writer();
        let shared: Arc<dyn StorageBackend> = backend.clone();
        let ledger = CounterLedger::new(shared);

        let vote = Mutation::Vote {
            voter: UserId::new(8),
            author: UserId::new(7),
            post_id: PostId::new(100),
            positive: true,
        };
        writer.apply(vote.clone()).await.expect("apply");
        let second = writer.apply(vote).await.expect("apply");
        assert!(!second.performed);

        let counters: PostCounters = ledger.read(100).await.expect("read");
        assert_eq!(counters.up_votes, 1);
    }

    #[tokio::test]
    async fn test_view_mutations_accumulate() {
        let (backend, writer) = writer();
        let shared: Arc<dyn StorageBackend> = backend.clone();
        let ledger = CounterLedger::new(shared);

        for _ in 0..3 {
            writer.apply(Mutation::ViewPost { post_id: PostId::new(100) }).await.expect("view");
        }
        writer
            .apply(Mutation::ViewDiscussion { discussion_id: DiscussionId::new(1) })
            .await
            .expect("view");
        writer.apply(Mutation::ViewTopic { topic_id: TopicId::new(5) }).await.expect("view");

        let post: PostCounters = ledger.read(100).await.expect("read");
        assert_eq!(post.views, 3);
        let discussion: plaza_types::DiscussionCounters = ledger.read(1).await.expect("read");
        assert_eq!(discussion.view_count, 1);
        let topic: plaza_types::TopicCounters = ledger.read(5).await.expect("read");
        assert_eq!(topic.views, 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_before_commit() {
        let (backend, writer) = writer();
        let token = CancellationToken::new();
        token.cancel();

        let err = writer
            .apply_cancellable(
                Mutation::CreatePost { post: post(100, 7), project_id: None },
                &token,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Cancelled));
        assert_eq!(backend.row_count(TableId::Posts), 0);
    }

    #[tokio::test]
    async fn test_discussion_anchor_fans_out() {
        let (backend, writer) = writer();
        let shared: Arc<dyn StorageBackend> = backend.clone();
        let ledger = CounterLedger::new(shared);

        let discussion = Discussion::builder()
            .id(DiscussionId::new(1))
            .title("t")
            .slug("t-1")
            .user_id(UserId::new(7))
            .build();
        writer.apply(Mutation::CreateDiscussion(discussion)).await.expect("apply");

        let mut anchored = post(100, 7);
        anchored.anchor = PostAnchor::Discussion(DiscussionId::new(1));
        writer
            .apply(Mutation::CreatePost { post: anchored, project_id: None })
            .await
            .expect("apply");

        assert_eq!(backend.row_count(TableId::DiscussionPosts), 1);
        let counters: plaza_types::DiscussionCounters = ledger.read(1).await.expect("read");
        assert_eq!(counters.message_count, 1);
        assert_eq!(counters.user_count, 1);

        let shared: Arc<dyn StorageBackend> = backend.clone();
        let discussions: RecordStore<Discussion> = RecordStore::new(shared);
        let stored = discussions
            .get(DiscussionId::new(1))
            .await
            .expect("get")
            .expect("present");
        assert!(stored.users.contains(&UserId::new(7)));
        assert_eq!(stored.last_message, Some(PostId::new(100)));
    }

    #[tokio::test]
    async fn test_subtopic_registered_with_parent() {
        let (backend, writer) = writer();
        let parent = Topic::builder().id(TopicId::new(3)).slug("general").name("General").build();
        writer.apply(Mutation::CreateTopic(parent)).await.expect("apply");

        let mut child =
            Topic::builder().id(TopicId::new(4)).slug("general-rust").name("Rust").build();
        child.parent_topic = Some(TopicId::new(3));
        let receipt = writer.apply(Mutation::CreateTopic(child)).await.expect("apply");
        assert!(receipt.performed);
        assert_eq!(receipt.repairs_queued, 0);

        let shared: Arc<dyn StorageBackend> = backend.clone();
        let topics: RecordStore<Topic> = RecordStore::new(shared);
        let stored = topics.get(TopicId::new(3)).await.expect("get").expect("present");
        assert!(stored.subtopics.contains(&TopicId::new(4)));
    }

    #[tokio::test]
    async fn test_truncated_fanout_queues_completion() {
        let backend = Arc::new(MemoryBackend::new());
        let shared: Arc<dyn StorageBackend> = backend.clone();
        let config = StoreConfig::builder()
            .fanout(FanoutConfig::builder().max_timeline_fanout(2).build())
            .build();
        let writer = FanoutWriter::new(Arc::clone(&shared), config);

        for follower in 1..=4 {
            writer
                .apply(Mutation::Follow {
                    follower: UserId::new(follower),
                    target: FollowTarget::User(UserId::new(7)),
                })
                .await
                .expect("follow");
        }

        let receipt = writer
            .apply(Mutation::CreatePost { post: post(100, 7), project_id: None })
            .await
            .expect("apply");
        assert_eq!(receipt.repairs_queued, 1);
        // Author plus the two followers inside the bound
        assert_eq!(backend.row_count(TableId::UserTimeline), 3);

        let reconciler = Reconciler::new(shared, ReconcilerConfig::default());
        let report = reconciler.drain().await.expect("drain");
        assert_eq!(report.repaired, 1);
        assert_eq!(backend.row_count(TableId::UserTimeline), 5);
    }

    #[tokio::test]
    async fn test_failed_follower_scan_queues_timeline_completion() {
        let inner = Arc::new(MemoryBackend::new());
        let inner_dyn: Arc<dyn StorageBackend> = inner.clone();
        let flaky = FlakyBackend::wrap(inner_dyn);
        let shared: Arc<dyn StorageBackend> = flaky.clone();
        let writer = FanoutWriter::new(Arc::clone(&shared), StoreConfig::default());

        writer
            .apply(Mutation::Follow {
                follower: UserId::new(8),
                target: FollowTarget::User(UserId::new(7)),
            })
            .await
            .expect("follow");

        flaky.fail_reads(TableId::UserFollowers, 4);
        let receipt = writer
            .apply(Mutation::CreatePost { post: post(100, 7), project_id: None })
            .await
            .expect("apply");
        assert_eq!(receipt.repairs_queued, 1);
        // Only the author's own timeline row landed inline
        assert_eq!(inner.row_count(TableId::UserTimeline), 1);

        flaky.clear();
        let reconciler = Reconciler::new(shared, ReconcilerConfig::default());
        let report = reconciler.drain().await.expect("drain");
        assert_eq!(report.repaired, 1);
        assert_eq!(inner.row_count(TableId::UserTimeline), 2);
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_index_rows() {
        let (backend, writer) = writer();
        writer
            .apply(Mutation::CreatePost { post: post(100, 7), project_id: None })
            .await
            .expect("apply");
        writer
            .apply(Mutation::DeletePost { user_id: UserId::new(7), post_id: PostId::new(100) })
            .await
            .expect("apply");

        assert_eq!(backend.row_count(TableId::Posts), 1);
        assert_eq!(backend.row_count(TableId::UserPosts), 1);
        assert_eq!(backend.row_count(TableId::UserTimeline), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_post_is_not_found() {
        let (_, writer) = writer();
        let err = writer
            .apply(Mutation::DeletePost { user_id: UserId::new(7), post_id: PostId::new(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::NotFound { entity: "post", .. }));
    }
}
