//! Read path over the denormalized indexes.
//!
//! Readers never see soft-deleted posts: deletion marks the primary row and
//! leaves every index row in place, so each query here filters on the
//! primary record after resolving the index. An index row whose primary has
//! not landed yet (fan-out lag) is skipped the same way; the read contract
//! is eventually consistent by design.
//!
//! All listings come back in key order, which for snowflake ids is
//! submission order, oldest first.

use std::sync::Arc;

use plaza_types::codec::{self, CodecError};
use plaza_types::{
    Channel, ChannelId, Discussion, DiscussionCounters, DiscussionId, Post, PostCounters,
    PostId, Project, ProjectId, Topic, TopicCounters, TopicId, User, UserCounters, UserId,
};
use snafu::{ResultExt, Snafu};

use crate::counters::{CounterError, CounterLedger};
use crate::edges::{EdgeError, EdgeKind, EdgeStore};
use crate::engine::{BackendError, StorageBackend};
use crate::keys::{clustering_of, encode_text_key, partition_prefix};
use crate::records::{RecordError, RecordStore};
use crate::tables::TableId;

/// Errors from read queries.
#[derive(Debug, Snafu)]
pub enum QueryError {
    /// The backend rejected or failed a scan or point read.
    #[snafu(display("query backend failure"))]
    Backend {
        /// Underlying backend error.
        source: BackendError,
    },

    /// A primary record failed to load.
    #[snafu(display("query record failure"))]
    Record {
        /// Underlying record error.
        source: RecordError,
    },

    /// An edge scan failed.
    #[snafu(display("query edge failure"))]
    Edge {
        /// Underlying edge error.
        source: EdgeError,
    },

    /// A counter read failed.
    #[snafu(display("query counter failure"))]
    Counter {
        /// Underlying ledger error.
        source: CounterError,
    },

    /// A unique-index row failed to decode.
    #[snafu(display("index codec failure in {table}", table = table.name()))]
    Codec {
        /// Table holding the offending row.
        table: TableId,
        /// Underlying codec error.
        source: CodecError,
    },
}

/// Read-side facade over the backend's tables.
#[derive(Clone)]
pub struct Queries {
    backend: Arc<dyn StorageBackend>,
    posts: RecordStore<Post>,
    users: RecordStore<User>,
    discussions: RecordStore<Discussion>,
    topics: RecordStore<Topic>,
    channels: RecordStore<Channel>,
    projects: RecordStore<Project>,
    edges: EdgeStore,
    ledger: CounterLedger,
}

impl Queries {
    /// Creates a query facade over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            posts: RecordStore::new(Arc::clone(&backend)),
            users: RecordStore::new(Arc::clone(&backend)),
            discussions: RecordStore::new(Arc::clone(&backend)),
            topics: RecordStore::new(Arc::clone(&backend)),
            channels: RecordStore::new(Arc::clone(&backend)),
            projects: RecordStore::new(Arc::clone(&backend)),
            edges: EdgeStore::new(Arc::clone(&backend)),
            ledger: CounterLedger::new(Arc::clone(&backend)),
            backend,
        }
    }

    // ------------------------------------------------------------------
    // Point reads
    // ------------------------------------------------------------------

    /// Reads a post. Soft-deleted posts read as absent.
    pub async fn post(
        &self,
        author: UserId,
        post_id: PostId,
    ) -> Result<Option<Post>, QueryError> {
        let post = self.posts.get((author, post_id)).await.context(RecordSnafu)?;
        Ok(post.filter(|post| !post.deleted))
    }

    /// Reads a user by id.
    pub async fn user(&self, id: UserId) -> Result<Option<User>, QueryError> {
        self.users.get(id).await.context(RecordSnafu)
    }

    /// Resolves a nick through the unique index.
    pub async fn user_by_nick(&self, nick: &str) -> Result<Option<User>, QueryError> {
        let Some(id) = self.lookup_index(TableId::NickIndex, nick).await? else {
            return Ok(None);
        };
        self.user(UserId::new(id)).await
    }

    /// Reads a discussion by id.
    pub async fn discussion(
        &self,
        id: DiscussionId,
    ) -> Result<Option<Discussion>, QueryError> {
        self.discussions.get(id).await.context(RecordSnafu)
    }

    /// Resolves a discussion slug through the unique index.
    pub async fn discussion_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<Discussion>, QueryError> {
        let Some(id) = self.lookup_index(TableId::DiscussionSlugIndex, slug).await? else {
            return Ok(None);
        };
        self.discussion(DiscussionId::new(id)).await
    }

    /// Reads a topic by id.
    pub async fn topic(&self, id: TopicId) -> Result<Option<Topic>, QueryError> {
        self.topics.get(id).await.context(RecordSnafu)
    }

    /// Resolves a topic slug through the unique index.
    pub async fn topic_by_slug(&self, slug: &str) -> Result<Option<Topic>, QueryError> {
        let Some(id) = self.lookup_index(TableId::TopicSlugIndex, slug).await? else {
            return Ok(None);
        };
        self.topic(TopicId::new(id)).await
    }

    /// Reads a channel by id.
    pub async fn channel(&self, id: ChannelId) -> Result<Option<Channel>, QueryError> {
        self.channels.get(id).await.context(RecordSnafu)
    }

    /// Resolves a channel slug through the unique index.
    pub async fn channel_by_slug(&self, slug: &str) -> Result<Option<Channel>, QueryError> {
        let Some(id) = self.lookup_index(TableId::ChannelSlugIndex, slug).await? else {
            return Ok(None);
        };
        self.channel(ChannelId::new(id)).await
    }

    /// Reads a project by id.
    pub async fn project(&self, id: ProjectId) -> Result<Option<Project>, QueryError> {
        self.projects.get(id).await.context(RecordSnafu)
    }

    // ------------------------------------------------------------------
    // Listings
    // ------------------------------------------------------------------

    /// Posts authored by a user, oldest first.
    pub async fn user_posts(
        &self,
        user: UserId,
        limit: usize,
    ) -> Result<Vec<Post>, QueryError> {
        // UserPosts partitions by the author, so the author id is the
        // partition itself and the row value is empty.
        let rows = self
            .backend
            .scan_prefix(TableId::UserPosts, &partition_prefix(user.value()))
            .await
            .context(BackendSnafu)?;

        let mut posts = Vec::new();
        for (key, _) in rows {
            if posts.len() >= limit {
                break;
            }
            let Some(post_id) = clustering_of(&key) else {
                continue;
            };
            if let Some(post) = self.post(user, PostId::new(post_id)).await? {
                posts.push(post);
            }
        }
        Ok(posts)
    }

    /// A user's timeline: their own posts plus posts fanned out from the
    /// users they follow, oldest first.
    pub async fn user_timeline(
        &self,
        user: UserId,
        limit: usize,
    ) -> Result<Vec<Post>, QueryError> {
        self.timeline(TableId::UserTimeline, user.value(), limit).await
    }

    /// Posts in a channel, oldest first.
    pub async fn channel_timeline(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> Result<Vec<Post>, QueryError> {
        self.timeline(TableId::ChannelTimeline, channel.value(), limit).await
    }

    /// Posts announced to a project, oldest first.
    pub async fn project_timeline(
        &self,
        project: ProjectId,
        limit: usize,
    ) -> Result<Vec<Post>, QueryError> {
        self.timeline(TableId::ProjectTimeline, project.value(), limit).await
    }

    /// Posts in a discussion thread, oldest first.
    pub async fn discussion_posts(
        &self,
        discussion: DiscussionId,
        limit: usize,
    ) -> Result<Vec<Post>, QueryError> {
        self.timeline(TableId::DiscussionPosts, discussion.value(), limit).await
    }

    /// Replies to a post, oldest first.
    pub async fn replies_to(
        &self,
        post: PostId,
        limit: usize,
    ) -> Result<Vec<Post>, QueryError> {
        self.timeline(TableId::PostReplies, post.value(), limit).await
    }

    /// Discussions filed under a topic, oldest first.
    pub async fn topic_discussions(
        &self,
        topic: TopicId,
        limit: usize,
    ) -> Result<Vec<Discussion>, QueryError> {
        let rows = self
            .backend
            .scan_prefix(TableId::TopicDiscussions, &partition_prefix(topic.value()))
            .await
            .context(BackendSnafu)?;

        let mut discussions = Vec::new();
        for (key, _) in rows {
            if discussions.len() >= limit {
                break;
            }
            let Some(id) = clustering_of(&key) else {
                continue;
            };
            if let Some(discussion) = self.discussion(DiscussionId::new(id)).await? {
                discussions.push(discussion);
            }
        }
        Ok(discussions)
    }

    // ------------------------------------------------------------------
    // Edges and counters
    // ------------------------------------------------------------------

    /// Users following `user`.
    pub async fn followers_of(&self, user: UserId) -> Result<Vec<UserId>, QueryError> {
        let edges =
            self.edges.list_to(EdgeKind::FollowUser, user.value()).await.context(EdgeSnafu)?;
        Ok(edges.into_iter().map(|(id, _)| UserId::new(id)).collect())
    }

    /// Users that `user` follows.
    pub async fn following_of(&self, user: UserId) -> Result<Vec<UserId>, QueryError> {
        let edges = self
            .edges
            .list_from(EdgeKind::FollowUser, user.value())
            .await
            .context(EdgeSnafu)?;
        Ok(edges.into_iter().map(|(id, _)| UserId::new(id)).collect())
    }

    /// Projects a user follows.
    pub async fn projects_of(&self, user: UserId) -> Result<Vec<ProjectId>, QueryError> {
        let edges = self
            .edges
            .list_from(EdgeKind::FollowProject, user.value())
            .await
            .context(EdgeSnafu)?;
        Ok(edges.into_iter().map(|(id, _)| ProjectId::new(id)).collect())
    }

    /// A user's vote on a post, if they cast one.
    pub async fn vote_of(
        &self,
        voter: UserId,
        post: PostId,
    ) -> Result<Option<bool>, QueryError> {
        let attrs = self
            .edges
            .get(EdgeKind::Vote, voter.value(), post.value())
            .await
            .context(EdgeSnafu)?;
        Ok(attrs.and_then(|attrs| attrs.positive))
    }

    /// A post's counter row.
    pub async fn post_counters(&self, post: PostId) -> Result<PostCounters, QueryError> {
        self.ledger.read(post.value()).await.context(CounterSnafu)
    }

    /// A user's counter row.
    pub async fn user_counters(&self, user: UserId) -> Result<UserCounters, QueryError> {
        self.ledger.read(user.value()).await.context(CounterSnafu)
    }

    /// A discussion's counter row.
    pub async fn discussion_counters(
        &self,
        discussion: DiscussionId,
    ) -> Result<DiscussionCounters, QueryError> {
        self.ledger.read(discussion.value()).await.context(CounterSnafu)
    }

    /// A topic's counter row.
    pub async fn topic_counters(&self, topic: TopicId) -> Result<TopicCounters, QueryError> {
        self.ledger.read(topic.value()).await.context(CounterSnafu)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn lookup_index(
        &self,
        table: TableId,
        text: &str,
    ) -> Result<Option<i64>, QueryError> {
        let row = self
            .backend
            .get_row(table, &encode_text_key(text))
            .await
            .context(BackendSnafu)?;
        row.map(|bytes| codec::decode(&bytes).context(CodecSnafu { table })).transpose()
    }

    /// Resolves an author-valued index partition into posts.
    async fn timeline(
        &self,
        table: TableId,
        partition: i64,
        limit: usize,
    ) -> Result<Vec<Post>, QueryError> {
        let rows = self
            .backend
            .scan_prefix(table, &partition_prefix(partition))
            .await
            .context(BackendSnafu)?;

        let mut posts = Vec::new();
        for (key, value) in rows {
            if posts.len() >= limit {
                break;
            }
            let Some(post_id) = clustering_of(&key) else {
                continue;
            };
            let author: UserId = match codec::decode(&value) {
                Ok(author) => author,
                Err(err) => {
                    tracing::warn!(
                        table = table.name(),
                        post = post_id,
                        error = %err,
                        "unreadable index row skipped"
                    );
                    continue;
                },
            };
            if let Some(post) = self.post(author, PostId::new(post_id)).await? {
                posts.push(post);
            }
        }
        Ok(posts)
    }
}
