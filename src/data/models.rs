//! Data models for messages and repository targets

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Globally unique, monotonically orderable message identifier.
///
/// Ids are timestamp-prefixed (`20250108T184100-3f2a`) so lexicographic
/// ordering matches creation order and messages minted by different replicas
/// can be merged into one strict timeline without a central sequencer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Mint a new id for a message created at the given instant.
    pub fn generate(created_at: DateTime<Utc>) -> Self {
        let suffix: u16 = rand::rng().random();
        Self(format!(
            "{}-{:04x}",
            created_at.format("%Y%m%dT%H%M%S"),
            suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single chat message. Immutable once created; owned by the local store
/// and mirrored as a file into zero or more remote repositories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Unique, orderable identifier
    pub id: MessageId,
    /// Message body
    pub content: String,
    /// Author identifier
    pub author: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Repository the message was first observed in (None for local messages)
    pub origin: Option<TargetKey>,
}

impl Message {
    /// Create a new local message with a freshly minted id.
    pub fn new(content: impl Into<String>, author: impl Into<String>) -> Self {
        let created_at = Utc::now();
        Self {
            id: MessageId::generate(created_at),
            content: content.into(),
            author: author.into(),
            created_at,
            origin: None,
        }
    }

    /// True when two copies carry the same payload (origin excluded —
    /// the same message fetched from two replicas is still the same message).
    pub fn same_payload(&self, other: &Message) -> bool {
        self.id == other.id
            && self.content == other.content
            && self.author == other.author
            && self.created_at == other.created_at
    }
}

/// Identity of a remote repository target: `(owner, name, branch)` is unique
/// within the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetKey {
    pub owner: String,
    pub name: String,
    pub branch: String,
}

impl TargetKey {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            branch: branch.into(),
        }
    }
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.name, self.branch)
    }
}

/// Default branch for newly added targets
pub const DEFAULT_BRANCH: &str = "main";
/// Default repository path messages are stored under
pub const DEFAULT_MESSAGE_PATH: &str = "messages";

/// A configured remote repository this engine synchronizes against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryTarget {
    /// Unique `(owner, name, branch)` identity
    pub key: TargetKey,
    /// Directory inside the repository holding message files
    pub message_path: String,
    /// Last synced commit sha; None until the first successful fetch
    pub cursor: Option<String>,
    /// When the target was added
    pub created_at: DateTime<Utc>,
}

impl RepositoryTarget {
    /// Create a target with the default branch and message path.
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: TargetKey::new(owner, name, DEFAULT_BRANCH),
            message_path: DEFAULT_MESSAGE_PATH.to_string(),
            cursor: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.key.branch = branch.into();
        self
    }

    pub fn with_message_path(mut self, path: impl Into<String>) -> Self {
        self.message_path = path.into();
        self
    }
}

/// A commit observed on a target's branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRef {
    /// Commit sha
    pub sha: String,
    /// Commit message
    pub message: String,
    /// Message files added or updated by this commit (paths under the
    /// target's message path; empty when unknown)
    pub paths: Vec<String>,
}

/// A file listed from a target's message directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Path relative to the repository root
    pub path: String,
    /// File name (last path component)
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_order_by_creation_time() {
        let earlier = MessageId::generate("2025-01-08T18:41:00Z".parse().unwrap());
        let later = MessageId::generate("2025-01-08T18:42:00Z".parse().unwrap());
        assert!(earlier < later);
    }

    #[test]
    fn test_message_id_format() {
        let id = MessageId::generate("2025-01-08T18:41:00Z".parse().unwrap());
        assert!(id.as_str().starts_with("20250108T184100-"));
        assert_eq!(id.as_str().len(), "20250108T184100-".len() + 4);
    }

    #[test]
    fn test_same_payload_ignores_origin() {
        let msg = Message::new("hello", "alice");
        let mut fetched = msg.clone();
        fetched.origin = Some(TargetKey::new("u", "r", "main"));
        assert!(msg.same_payload(&fetched));

        let mut tampered = msg.clone();
        tampered.content = "bye".into();
        assert!(!msg.same_payload(&tampered));
    }

    #[test]
    fn test_target_key_display() {
        let key = TargetKey::new("octo", "chat", "main");
        assert_eq!(key.to_string(), "octo/chat@main");
    }

    #[test]
    fn test_target_defaults() {
        let target = RepositoryTarget::new("octo", "chat");
        assert_eq!(target.key.branch, "main");
        assert_eq!(target.message_path, "messages");
        assert!(target.cursor.is_none());
    }
}
