//! Entity shape validation.
//!
//! Every mutation is validated here before any write is attempted; a failure
//! rejects the mutation with no side effects. Mutual-exclusion invariants
//! (discussion vs. channel anchoring) are enforced by the type system and
//! need no runtime check.
//!
//! ## Character Whitelists
//!
//! - Slugs: `[a-z0-9-]`, no leading or trailing hyphen — URL- and DNS-safe.
//! - Nicks: `[a-zA-Z0-9_-]` — safe for storage keys and log output.

use std::fmt;

use crate::config::ValidationConfig;
use crate::types::{Channel, Discussion, Post, Project, Topic, User};

/// Validation error with structured context.
///
/// Contains the specific constraint that was violated and the field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field that failed validation.
    pub field: String,
    /// Description of the violated constraint.
    pub constraint: String,
}

impl ValidationError {
    fn new(field: &str, constraint: impl Into<String>) -> Self {
        Self { field: field.to_string(), constraint: constraint.into() }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.constraint)
    }
}

impl std::error::Error for ValidationError {}

/// Validates a post before any write is attempted.
///
/// # Errors
///
/// Returns [`ValidationError`] if the text is empty or oversized, the
/// author-nick snapshot is empty, or a reply target carries an empty nick.
pub fn validate_post(post: &Post, config: &ValidationConfig) -> Result<(), ValidationError> {
    require_text("text", &post.text, config.max_text_bytes)?;
    if post.user_nick.is_empty() {
        return Err(ValidationError::new("user_nick", "must not be empty"));
    }
    if let Some(reply) = &post.reply_to
        && reply.user_nick.is_empty()
    {
        return Err(ValidationError::new("reply_to.user_nick", "must not be empty"));
    }
    Ok(())
}

/// Validates a user record.
///
/// # Errors
///
/// Returns [`ValidationError`] if the nick is empty, oversized, or contains
/// characters outside `[a-zA-Z0-9_-]`, or if the extension map exceeds its
/// entry limit.
pub fn validate_user(user: &User, config: &ValidationConfig) -> Result<(), ValidationError> {
    validate_nick(&user.nick, config)?;
    if user.extended.len() > config.max_extended_entries {
        return Err(ValidationError::new(
            "extended",
            format!(
                "{} entries exceeds maximum {}",
                user.extended.len(),
                config.max_extended_entries
            ),
        ));
    }
    Ok(())
}

/// Validates a discussion record.
///
/// # Errors
///
/// Returns [`ValidationError`] if the title is empty or oversized, or the
/// slug fails the slug rules.
pub fn validate_discussion(
    discussion: &Discussion,
    config: &ValidationConfig,
) -> Result<(), ValidationError> {
    require_text("title", &discussion.title, config.max_title_bytes)?;
    validate_slug(&discussion.slug, "slug", config)
}

/// Validates a topic record.
///
/// # Errors
///
/// Returns [`ValidationError`] if the slug fails the slug rules, the name is
/// empty or oversized, or the topic lists itself as parent or subtopic.
pub fn validate_topic(topic: &Topic, config: &ValidationConfig) -> Result<(), ValidationError> {
    validate_slug(&topic.slug, "slug", config)?;
    require_text("name", &topic.name, config.max_name_bytes)?;
    if topic.parent_topic == Some(topic.id) {
        return Err(ValidationError::new("parent_topic", "must not be the topic itself"));
    }
    if topic.subtopics.contains(&topic.id) {
        return Err(ValidationError::new("subtopics", "must not contain the topic itself"));
    }
    Ok(())
}

/// Validates a channel record.
///
/// # Errors
///
/// Returns [`ValidationError`] if the slug fails the slug rules or the name
/// is empty or oversized.
pub fn validate_channel(
    channel: &Channel,
    config: &ValidationConfig,
) -> Result<(), ValidationError> {
    validate_slug(&channel.slug, "slug", config)?;
    require_text("name", &channel.name, config.max_name_bytes)
}

/// Validates a project record.
///
/// # Errors
///
/// Returns [`ValidationError`] if the name is empty or oversized.
pub fn validate_project(
    project: &Project,
    config: &ValidationConfig,
) -> Result<(), ValidationError> {
    require_text("name", &project.name, config.max_name_bytes)
}

/// Validates a nick against length limits and the nick whitelist.
///
/// # Errors
///
/// Returns [`ValidationError`] if the nick is empty, exceeds
/// `max_nick_bytes`, or contains characters outside `[a-zA-Z0-9_-]`.
pub fn validate_nick(nick: &str, config: &ValidationConfig) -> Result<(), ValidationError> {
    if nick.is_empty() {
        return Err(ValidationError::new("nick", "must not be empty"));
    }
    if nick.len() > config.max_nick_bytes {
        return Err(ValidationError::new(
            "nick",
            format!("length {} bytes exceeds maximum {} bytes", nick.len(), config.max_nick_bytes),
        ));
    }
    if let Some(pos) = nick.find(|c: char| !is_nick_char(c)) {
        return Err(ValidationError::new(
            "nick",
            format!(
                "contains invalid character {:?} at byte offset {}; allowed: [a-zA-Z0-9_-]",
                nick[pos..].chars().next().unwrap_or('\0'),
                pos
            ),
        ));
    }
    Ok(())
}

/// Validates a slug against length limits and the slug whitelist.
///
/// # Errors
///
/// Returns [`ValidationError`] if the slug is empty, exceeds
/// `max_slug_bytes`, starts or ends with a hyphen, or contains characters
/// outside `[a-z0-9-]`.
pub fn validate_slug(
    slug: &str,
    field_name: &str,
    config: &ValidationConfig,
) -> Result<(), ValidationError> {
    if slug.is_empty() {
        return Err(ValidationError::new(field_name, "must not be empty"));
    }
    if slug.len() > config.max_slug_bytes {
        return Err(ValidationError::new(
            field_name,
            format!("length {} bytes exceeds maximum {} bytes", slug.len(), config.max_slug_bytes),
        ));
    }
    if slug.starts_with('-') || slug.ends_with('-') {
        return Err(ValidationError::new(field_name, "must not start or end with a hyphen"));
    }
    if let Some(pos) = slug.find(|c: char| !is_slug_char(c)) {
        return Err(ValidationError::new(
            field_name,
            format!(
                "contains invalid character {:?} at byte offset {}; allowed: [a-z0-9-]",
                slug[pos..].chars().next().unwrap_or('\0'),
                pos
            ),
        ));
    }
    Ok(())
}

fn require_text(field: &str, value: &str, max_bytes: usize) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    if value.len() > max_bytes {
        return Err(ValidationError::new(
            field,
            format!("length {} bytes exceeds maximum {} bytes", value.len(), max_bytes),
        ));
    }
    Ok(())
}

/// Checks if a character is allowed in slugs.
fn is_slug_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'
}

/// Checks if a character is allowed in nicks.
fn is_nick_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::types::{ReplyTo, UserId};

    fn default_config() -> ValidationConfig {
        ValidationConfig::default()
    }

    fn valid_post() -> Post {
        Post::builder().id(100).user_id(7).user_nick("alice").text("hi").build()
    }

    #[test]
    fn test_validate_post_ok() {
        assert!(validate_post(&valid_post(), &default_config()).is_ok());
    }

    #[test]
    fn test_validate_post_empty_text() {
        let mut post = valid_post();
        post.text = String::new();
        let err = validate_post(&post, &default_config()).unwrap_err();
        assert_eq!(err.field, "text");
        assert!(err.constraint.contains("empty"));
    }

    #[test]
    fn test_validate_post_text_over_limit() {
        let config = ValidationConfig { max_text_bytes: 4, ..ValidationConfig::default() };
        let err = validate_post(&valid_post(), &config).is_ok();
        assert!(err, "within limit at 2 bytes");

        let mut post = valid_post();
        post.text = "hello".to_string();
        let err = validate_post(&post, &config).unwrap_err();
        assert!(err.constraint.contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_post_reply_nick() {
        let mut post = valid_post();
        post.reply_to = Some(ReplyTo {
            post_id: 99.into(),
            user_id: UserId::new(3),
            user_nick: String::new(),
        });
        let err = validate_post(&post, &default_config()).unwrap_err();
        assert_eq!(err.field, "reply_to.user_nick");
    }

    #[test]
    fn test_validate_user_ok() {
        let user = User::builder().id(1).nick("alice_99").build();
        assert!(validate_user(&user, &default_config()).is_ok());
    }

    #[test]
    fn test_validate_user_bad_nick_chars() {
        let user = User::builder().id(1).nick("alice bob").build();
        let err = validate_user(&user, &default_config()).unwrap_err();
        assert_eq!(err.field, "nick");
        assert!(err.constraint.contains("invalid character"));
    }

    #[test]
    fn test_validate_user_extended_cap() {
        let config = ValidationConfig { max_extended_entries: 1, ..ValidationConfig::default() };
        let mut user = User::builder().id(1).nick("alice").build();
        user.extended.insert("a".to_string(), "1".to_string());
        user.extended.insert("b".to_string(), "2".to_string());
        let err = validate_user(&user, &config).unwrap_err();
        assert_eq!(err.field, "extended");
    }

    #[test]
    fn test_validate_discussion_slug_rules() {
        let config = default_config();
        let discussion =
            Discussion::builder().id(1).title("t").slug("rust-async").user_id(7).build();
        assert!(validate_discussion(&discussion, &config).is_ok());

        let discussion = Discussion::builder().id(1).title("t").slug("-bad").user_id(7).build();
        let err = validate_discussion(&discussion, &config).unwrap_err();
        assert!(err.constraint.contains("hyphen"));

        let discussion = Discussion::builder().id(1).title("t").slug("Bad").user_id(7).build();
        let err = validate_discussion(&discussion, &config).unwrap_err();
        assert!(err.constraint.contains("invalid character"));
    }

    #[test]
    fn test_validate_topic_self_links() {
        let config = default_config();
        let mut topic = Topic::builder().id(5).slug("general").name("General").build();
        topic.parent_topic = Some(5.into());
        let err = validate_topic(&topic, &config).unwrap_err();
        assert_eq!(err.field, "parent_topic");

        let mut topic = Topic::builder().id(5).slug("general").name("General").build();
        topic.subtopics.insert(5.into());
        let err = validate_topic(&topic, &config).unwrap_err();
        assert_eq!(err.field, "subtopics");
    }

    #[test]
    fn test_validate_channel_and_project() {
        let config = default_config();
        let channel = Channel::builder().id(2).slug("rust").name("Rust").build();
        assert!(validate_channel(&channel, &config).is_ok());

        let project = Project::builder().id(3).name("plaza").build();
        assert!(validate_project(&project, &config).is_ok());

        let project = Project::builder().id(3).name("").build();
        assert!(validate_project(&project, &config).is_err());
    }

    #[test]
    fn test_slug_exactly_at_limit() {
        let config = ValidationConfig { max_slug_bytes: 5, ..ValidationConfig::default() };
        assert!(validate_slug("a-b-c", "slug", &config).is_ok());
        assert!(validate_slug("a-b-c1", "slug", &config).is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_slugs_accepted(slug in "[a-z0-9](-?[a-z0-9]){0,20}") {
            prop_assert!(validate_slug(&slug, "slug", &default_config()).is_ok());
        }

        #[test]
        fn prop_nick_rejects_foreign_chars(
            c in any::<char>().prop_filter("outside nick whitelist", |c| !is_nick_char(*c))
        ) {
            let nick = format!("user{c}");
            prop_assert!(validate_nick(&nick, &default_config()).is_err());
        }
    }
}
