use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use feed::{FeedError, FeedLease, FeedRegistry, FeedSubscription};
pub use membership::MembershipResolver;
pub use merge::merge;
pub use message::{Message, MessageBody, MessageDraft, MessageId, MessageStatus};
pub use session::{
    ConversationSession, ConversationView, PartitionInfo, PartitionState, SessionEvent,
    SessionHandle, SessionOptions,
};

mod feed;
mod membership;
mod merge;
mod message;
mod session;

/// Identity of a participant, e.g. an email address or a handle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity an outbox is directed at: a user for direct chats, a group id
/// for group chats.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&UserId> for ConversationId {
    fn from(user: &UserId) -> Self {
        Self(user.0.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Conversation {
    Direct { peer: UserId },
    Group { group: ConversationId },
}

impl Conversation {
    pub fn direct(peer: impl Into<String>) -> Self {
        Self::Direct {
            peer: UserId::new(peer),
        }
    }

    pub fn group(group: impl Into<String>) -> Self {
        Self::Group {
            group: ConversationId::new(group),
        }
    }

    /// Where messages composed by the local user are written.
    pub fn outbox(&self, me: &UserId) -> PartitionKey {
        match self {
            Self::Direct { peer } => PartitionKey::new(ConversationId::from(peer), me.clone()),
            Self::Group { group } => PartitionKey::new(group.clone(), me.clone()),
        }
    }
}

impl fmt::Display for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct { peer } => write!(f, "@{}", peer),
            Self::Group { group } => write!(f, "#{}", group),
        }
    }
}

/// `(conversation, author)`: the author's outbox directed at `conversation`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub conversation: ConversationId,
    pub author: UserId,
}

impl PartitionKey {
    pub fn new(conversation: ConversationId, author: UserId) -> Self {
        Self {
            conversation,
            author,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.author, self.conversation)
    }
}

/// Full state of one partition. Replaces, never extends, the previous one.
pub type Snapshot = Arc<Vec<Message>>;

/// Deduplicated, time-ordered view over every active partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    messages: Arc<[Message]>,
}

impl Timeline {
    pub(crate) fn from_sorted(messages: Vec<Message>) -> Self {
        Self {
            messages: messages.into(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_outbox_points_at_the_peer() {
        let me = UserId::new("alice");
        let key = Conversation::direct("bob").outbox(&me);
        assert_eq!(key.conversation, ConversationId::new("bob"));
        assert_eq!(key.author, me);
    }

    #[test]
    fn group_outbox_points_at_the_group() {
        let me = UserId::new("alice");
        let key = Conversation::group("rustaceans").outbox(&me);
        assert_eq!(key.conversation, ConversationId::new("rustaceans"));
        assert_eq!(key.to_string(), "alice->rustaceans");
    }
}
