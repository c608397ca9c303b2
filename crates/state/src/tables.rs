//! Fixed table definitions for the storage layer.
//!
//! Every physical access path is a table known at compile time: primary
//! entity tables, unique lookup indexes, junction/timeline tables, edge
//! tables (forward and inverse views of the same logical edge), counter
//! tables, and the repair queue. Counter tables are never mixed with regular
//! columns — they hold only commutative counter fields.

use serde::{Deserialize, Serialize};

/// Compile-time table identifier. All tables are statically defined; dynamic
/// creation is not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TableId {
    // ========================================================================
    // Entity Tables (primary records)
    // ========================================================================
    /// Posts: key = {user_id:8BE}{post_id:8BE} (partitioned by author).
    Posts = 0,

    /// Users: key = {user_id:8BE}.
    Users = 1,

    /// Discussions: key = {discussion_id:8BE}.
    Discussions = 2,

    /// Topics: key = {topic_id:8BE}.
    Topics = 3,

    /// Channels: key = {channel_id:8BE}.
    Channels = 4,

    /// Projects: key = {project_id:8BE}.
    Projects = 5,

    // ========================================================================
    // Unique Lookup Indexes
    // ========================================================================
    /// Nick → user id.
    NickIndex = 6,

    /// Discussion slug → discussion id.
    DiscussionSlugIndex = 7,

    /// Topic slug → topic id.
    TopicSlugIndex = 8,

    /// Channel slug → channel id.
    ChannelSlugIndex = 9,

    // ========================================================================
    // Junction / Timeline Tables (existence is the fact)
    // ========================================================================
    /// All posts of a user: {user_id:8BE}{post_id:8BE}.
    UserPosts = 10,

    /// Posts a user sees in their timeline: {user_id:8BE}{post_id:8BE} → author id.
    UserTimeline = 11,

    /// Posts in a channel: {channel_id:8BE}{post_id:8BE} → author id.
    ChannelTimeline = 12,

    /// Posts in a project: {project_id:8BE}{post_id:8BE} → author id.
    ProjectTimeline = 13,

    /// Posts in a discussion: {discussion_id:8BE}{post_id:8BE} → author id.
    DiscussionPosts = 14,

    /// Discussions under a topic: {topic_id:8BE}{discussion_id:8BE}.
    TopicDiscussions = 15,

    /// Projects a user follows: {user_id:8BE}{project_id:8BE}.
    UserProjects = 16,

    // ========================================================================
    // Edge Tables (forward partitioned by `from`, inverse by `to`)
    // ========================================================================
    /// Followers of a user (inverse view): {target:8BE}{follower:8BE}.
    UserFollowers = 17,

    /// Users a user follows (forward view): {follower:8BE}{target:8BE}.
    UserFollowing = 18,

    /// Followers of a project: {project_id:8BE}{user_id:8BE}.
    ProjectFollowers = 19,

    /// Followers of a channel: {channel_id:8BE}{user_id:8BE}.
    ChannelFollowers = 20,

    /// Followers of a post: {post_id:8BE}{user_id:8BE}.
    PostFollowers = 21,

    /// Votes on a post: {post_id:8BE}{user_id:8BE} → polarity + timestamp.
    PostVotes = 22,

    /// Votes a user has cast (forward view): {user_id:8BE}{post_id:8BE}.
    UserVotes = 23,

    /// Replies to a post: {post_id:8BE}{reply_post_id:8BE} → reply author id.
    PostReplies = 24,

    // ========================================================================
    // Counter Tables
    // ========================================================================
    /// Per-post counters keyed by post id.
    PostCounters = 25,

    /// Per-user counters keyed by user id.
    UserCounters = 26,

    /// Per-discussion counters keyed by discussion id.
    DiscussionCounters = 27,

    /// Per-topic counters keyed by topic id.
    TopicCounters = 28,

    // ========================================================================
    // Maintenance
    // ========================================================================
    /// Failure log of secondary writes awaiting repair.
    RepairQueue = 29,
}

impl TableId {
    /// Total number of tables.
    pub const COUNT: usize = 30;

    /// Returns the human-readable name for this table.
    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Posts => "posts",
            Self::Users => "users",
            Self::Discussions => "discussions",
            Self::Topics => "topics",
            Self::Channels => "channels",
            Self::Projects => "projects",
            Self::NickIndex => "nick_index",
            Self::DiscussionSlugIndex => "discussion_slug_index",
            Self::TopicSlugIndex => "topic_slug_index",
            Self::ChannelSlugIndex => "channel_slug_index",
            Self::UserPosts => "user_posts",
            Self::UserTimeline => "user_timeline",
            Self::ChannelTimeline => "channel_timeline",
            Self::ProjectTimeline => "project_timeline",
            Self::DiscussionPosts => "discussion_posts",
            Self::TopicDiscussions => "topic_discussions",
            Self::UserProjects => "user_projects",
            Self::UserFollowers => "user_followers",
            Self::UserFollowing => "user_following",
            Self::ProjectFollowers => "project_followers",
            Self::ChannelFollowers => "channel_followers",
            Self::PostFollowers => "post_followers",
            Self::PostVotes => "post_votes",
            Self::UserVotes => "user_votes",
            Self::PostReplies => "post_replies",
            Self::PostCounters => "post_counters",
            Self::UserCounters => "user_counters",
            Self::DiscussionCounters => "discussion_counters",
            Self::TopicCounters => "topic_counters",
            Self::RepairQueue => "repair_queue",
        }
    }

    /// Returns true for counter tables, which accept only commutative
    /// `merge_counter` writes.
    #[inline]
    pub const fn is_counter(self) -> bool {
        matches!(
            self,
            Self::PostCounters | Self::UserCounters | Self::DiscussionCounters | Self::TopicCounters
        )
    }

    /// Returns all table IDs.
    pub const fn all() -> [TableId; Self::COUNT] {
        [
            Self::Posts,
            Self::Users,
            Self::Discussions,
            Self::Topics,
            Self::Channels,
            Self::Projects,
            Self::NickIndex,
            Self::DiscussionSlugIndex,
            Self::TopicSlugIndex,
            Self::ChannelSlugIndex,
            Self::UserPosts,
            Self::UserTimeline,
            Self::ChannelTimeline,
            Self::ProjectTimeline,
            Self::DiscussionPosts,
            Self::TopicDiscussions,
            Self::UserProjects,
            Self::UserFollowers,
            Self::UserFollowing,
            Self::ProjectFollowers,
            Self::ChannelFollowers,
            Self::PostFollowers,
            Self::PostVotes,
            Self::UserVotes,
            Self::PostReplies,
            Self::PostCounters,
            Self::UserCounters,
            Self::DiscussionCounters,
            Self::TopicCounters,
            Self::RepairQueue,
        ]
    }

    /// Converts from u8 to TableId.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::all().into_iter().find(|t| *t as u8 == value)
    }
}
