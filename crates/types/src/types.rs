//! Core entity definitions for the plaza storage layer.
//!
//! These are the primary records of the platform — users, posts, discussions,
//! topics, channels, projects — plus their counter rows. Every denormalized
//! copy (timeline rows, junction rows, reverse edges) is derived from these
//! types by the fan-out writer; the copies themselves carry keys only and have
//! no payload types of their own.
//!
//! Builder defaults (flags, timestamps) are evaluated **per build call**, so
//! every record gets its own submission timestamp rather than a shared value
//! captured at type-definition time.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Identifier Types
// ============================================================================

/// Generates a newtype wrapper around `i64` for type-safe identifiers.
///
/// Each generated type provides:
/// - Standard derives: Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord
/// - Serde with `#[serde(transparent)]` for wire format compatibility
/// - `From<i64>` and `Into<i64>` conversions
/// - `Display` with a semantic prefix (e.g., `post:123`)
/// - `new()` constructor and `value()` accessor
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident, $prefix:expr
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Creates a new identifier from a raw value.
            #[inline]
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// Returns the raw numeric value.
            #[inline]
            pub const fn value(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            #[inline]
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}:{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = <i64 as std::str::FromStr>::Err;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                s.parse::<i64>().map(Self)
            }
        }
    };
}

define_id!(
    /// Unique identifier for a user.
    UserId, "user"
);

define_id!(
    /// Unique identifier for a post.
    ///
    /// Posts are partitioned by their author, so a `PostId` alone does not
    /// locate a row — reads require the `(UserId, PostId)` pair.
    PostId, "post"
);

define_id!(
    /// Unique identifier for a discussion (thread).
    DiscussionId, "disc"
);

define_id!(
    /// Unique identifier for a topic.
    TopicId, "topic"
);

define_id!(
    /// Unique identifier for a channel.
    ChannelId, "chan"
);

define_id!(
    /// Unique identifier for a project.
    ProjectId, "proj"
);

define_id!(
    /// Identifier for one logical event (a vote, a follow, a view).
    ///
    /// Counters are incremented exactly once per event; callers deduplicate
    /// by `EventId` before submitting a mutation that touches counters.
    EventId, "evt"
);

// ============================================================================
// Post
// ============================================================================

/// Association of a post to its containing context.
///
/// A post belongs to exactly one of a discussion or a channel, or stands
/// alone. The variant makes the mutual exclusion unrepresentable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostAnchor {
    /// Not attached to a discussion or channel.
    #[default]
    Standalone,
    /// Part of a discussion thread.
    Discussion(DiscussionId),
    /// Posted into a channel.
    Channel(ChannelId),
}

impl PostAnchor {
    /// Returns the discussion id if this post is anchored to a discussion.
    #[inline]
    pub fn discussion_id(self) -> Option<DiscussionId> {
        match self {
            Self::Discussion(id) => Some(id),
            _ => None,
        }
    }

    /// Returns the channel id if this post is anchored to a channel.
    #[inline]
    pub fn channel_id(self) -> Option<ChannelId> {
        match self {
            Self::Channel(id) => Some(id),
            _ => None,
        }
    }
}

/// Denormalized snapshot of the post a reply targets.
///
/// The nick is copied at reply time, not referenced live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTo {
    /// The post being replied to.
    pub post_id: PostId,
    /// Author of the target post (its partition key).
    pub user_id: UserId,
    /// Author nick at reply time.
    pub user_nick: String,
}

/// A post, partitioned by its author.
///
/// All of a user's posts are co-located under `user_id`. `user_nick` is a
/// denormalized snapshot of the author's nick at publish time. Deletion is
/// soft: `deleted` is set and the row stays in every index; readers filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Post {
    /// Post identifier (clustering key within the author's partition).
    #[builder(into)]
    pub id: PostId,
    /// Author (partition key).
    #[builder(into)]
    pub user_id: UserId,
    /// Author nick snapshot.
    #[builder(into)]
    pub user_nick: String,
    /// Raw post text.
    #[builder(into)]
    pub text: String,
    /// Rendered HTML, if the render pipeline has run.
    pub html: Option<String>,
    /// Reply target, if this post is a reply.
    pub reply_to: Option<ReplyTo>,
    /// Identifier in an external system, if imported.
    pub ext_id: Option<String>,
    /// Whether the text contains a URL.
    #[builder(default)]
    pub has_url: bool,
    /// Whether the text contains a channel reference.
    #[builder(default)]
    pub has_channel: bool,
    /// Marked as spam.
    #[builder(default)]
    pub spam: bool,
    /// Flagged for moderation.
    #[builder(default)]
    pub flagged: bool,
    /// Soft-delete marker. Index rows are retained; reads filter.
    #[builder(default)]
    pub deleted: bool,
    /// Containing discussion or channel, if any.
    #[builder(default)]
    pub anchor: PostAnchor,
    /// Publish time. Defaults to the build call's submission time.
    #[builder(default = Utc::now())]
    pub published_at: DateTime<Utc>,
}

// ============================================================================
// User
// ============================================================================

/// A registered user.
///
/// `nick` is unique and effectively immutable — changing it would require
/// reissuing the nick index entry, which no mutation currently does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct User {
    /// User identifier.
    #[builder(into)]
    pub id: UserId,
    /// Unique nick, indexed for lookup.
    #[builder(into)]
    pub nick: String,
    /// Free-form key-value extension map.
    #[builder(default)]
    pub extended: BTreeMap<String, String>,
    /// Registration time. Defaults to the build call's submission time.
    #[builder(default = Utc::now())]
    pub registered_at: DateTime<Utc>,
    /// Record creation time. Defaults to the build call's submission time.
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Discussion
// ============================================================================

/// A discussion thread.
///
/// `users` is append-only membership: once a user posts in the thread they
/// stay in the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Discussion {
    /// Discussion identifier.
    #[builder(into)]
    pub id: DiscussionId,
    /// Thread title.
    #[builder(into)]
    pub title: String,
    /// Unique slug, indexed for lookup.
    #[builder(into)]
    pub slug: String,
    /// User who opened the thread.
    #[builder(into)]
    pub user_id: UserId,
    /// Users who have posted in the thread. Only grows.
    #[builder(default)]
    pub users: BTreeSet<UserId>,
    /// The opening post, once written.
    pub post_id: Option<PostId>,
    /// Most recent post in the thread.
    pub last_message: Option<PostId>,
    /// Publish time. Defaults to the build call's submission time.
    #[builder(default = Utc::now())]
    pub published_at: DateTime<Utc>,
    /// Containing topic, if any.
    pub topic_id: Option<TopicId>,
}

// ============================================================================
// Topic
// ============================================================================

/// Pointer to the most recent message under a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    /// The post.
    pub post_id: PostId,
    /// When it was published.
    pub at: DateTime<Utc>,
}

/// A topic in the topic tree.
///
/// Parent/child links are redundant in both directions: if A lists B as a
/// subtopic, B's `parent_topic` is A. Storage does not enforce this
/// atomically; the fan-out writer maintains both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Topic {
    /// Topic identifier.
    #[builder(into)]
    pub id: TopicId,
    /// Unique slug, indexed for lookup.
    #[builder(into)]
    pub slug: String,
    /// Display name.
    #[builder(into)]
    pub name: String,
    /// Description text.
    #[builder(into, default)]
    pub description: String,
    /// Most recent message under this topic.
    pub last_message: Option<MessageRef>,
    /// Whether this is a top-level topic.
    #[builder(default)]
    pub main_topic: bool,
    /// Parent topic, if this is a subtopic.
    pub parent_topic: Option<TopicId>,
    /// Child topics.
    #[builder(default)]
    pub subtopics: BTreeSet<TopicId>,
}

// ============================================================================
// Channel / Project
// ============================================================================

/// A channel. Followers are tracked through the edge store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Channel {
    /// Channel identifier.
    #[builder(into)]
    pub id: ChannelId,
    /// Unique slug, indexed for lookup.
    #[builder(into)]
    pub slug: String,
    /// Display name.
    #[builder(into)]
    pub name: String,
}

/// A project. Followers are tracked through the edge store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Project {
    /// Project identifier.
    #[builder(into)]
    pub id: ProjectId,
    /// Display name.
    #[builder(into)]
    pub name: String,
}

// ============================================================================
// Counters
// ============================================================================

/// Generates a counter row struct plus its field-name enum.
///
/// Counter rows live in dedicated counter tables, never mixed with regular
/// columns. The field enum names the individual commutative counters for the
/// ledger's `increment` calls; `from_fields` materializes a typed row from
/// the backend's field map.
macro_rules! define_counters {
    (
        $(#[$meta:meta])*
        $row:ident, $field:ident { $($fname:ident => $variant:ident / $text:expr),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $row {
            $(
                #[allow(missing_docs)]
                pub $fname: i64,
            )+
        }

        impl $row {
            /// Builds a typed counter row from the backend's field map.
            /// Absent fields read as zero.
            pub fn from_fields(fields: &BTreeMap<String, i64>) -> Self {
                Self {
                    $($fname: fields.get($text).copied().unwrap_or(0),)+
                }
            }
        }

        /// Field names for the corresponding counter row.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $field {
            $(
                #[allow(missing_docs)]
                $variant,
            )+
        }

        impl $field {
            /// Returns the storage-level field name.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $field {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

define_counters!(
    /// Per-post counters, keyed by post id.
    PostCounters, PostCounterField {
        up_votes => UpVotes / "up_votes",
        down_votes => DownVotes / "down_votes",
        views => Views / "views",
        karma => Karma / "karma",
        replies => Replies / "replies",
    }
);

define_counters!(
    /// Per-user counters, keyed by user id.
    ///
    /// Eventually equal to the row counts of the corresponding edge
    /// partitions; may transiently diverge until reconciliation.
    UserCounters, UserCounterField {
        follower_count => FollowerCount / "follower_count",
        following_count => FollowingCount / "following_count",
        karma => Karma / "karma",
        up_vote_given => UpVoteGiven / "up_vote_given",
        up_vote_received => UpVoteReceived / "up_vote_received",
        down_vote_given => DownVoteGiven / "down_vote_given",
        down_vote_taken => DownVoteTaken / "down_vote_taken",
    }
);

define_counters!(
    /// Per-discussion counters, keyed by discussion id.
    DiscussionCounters, DiscussionCounterField {
        message_count => MessageCount / "message_count",
        user_count => UserCount / "user_count",
        view_count => ViewCount / "view_count",
    }
);

define_counters!(
    /// Per-topic counters, keyed by topic id.
    TopicCounters, TopicCounterField {
        views => Views / "views",
        discussions => Discussions / "discussions",
        messages => Messages / "messages",
    }
);
