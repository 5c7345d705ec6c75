use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::conversation::{ConversationId, Message, MessageDraft, MessageId, PartitionKey, UserId};
use crate::error::StoreResult;

pub use memory::MemoryStore;

mod memory;

/// What a partition feed pushes: full state on every change, or a terminal
/// failure after which the feed is dead.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionUpdate {
    Snapshot(Vec<Message>),
    Failed(String),
}

pub type PartitionFeed = mpsc::UnboundedReceiver<PartitionUpdate>;

/// Each item is the complete member list; `None` means the record is gone.
pub type MembershipFeed = mpsc::UnboundedReceiver<Option<Vec<UserId>>>;

/// The document store the aggregation engine sits on.
///
/// Dropping a returned receiver is how a subscriber goes away; stores prune
/// senders whose receiver is gone.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Live feed of one partition. The first item is the current state.
    async fn subscribe_partition(&self, key: &PartitionKey) -> StoreResult<PartitionFeed>;

    /// One-shot read of a group's member list. `Ok(None)` when the group
    /// record does not exist.
    async fn read_membership(&self, group: &ConversationId) -> StoreResult<Option<Vec<UserId>>>;

    /// Live member list. Stores without change notifications for membership
    /// records return `Ok(None)`.
    async fn watch_membership(&self, _group: &ConversationId) -> StoreResult<Option<MembershipFeed>> {
        Ok(None)
    }

    /// Fire-and-forget write into `key`'s partition.
    async fn append_message(&self, key: &PartitionKey, draft: MessageDraft) -> StoreResult<MessageId>;
}
