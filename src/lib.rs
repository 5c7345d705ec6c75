//! Conversation aggregation for a chat client over a live document store.
//!
//! Each sender's outbox is a separately subscribed partition; a
//! [`conversation::ConversationSession`] keeps one feed per partition and
//! merges the latest snapshot of all of them into a single timeline.

pub mod config;
pub mod conversation;
pub mod error;
pub mod logging;
pub mod nostr;
pub mod store;

pub use conversation::{
    Conversation, ConversationId, ConversationSession, ConversationView, Message, MessageBody, MessageDraft,
    PartitionKey, SessionEvent, SessionHandle, SessionOptions, Timeline, UserId,
};
pub use error::{SessionError, StoreError};
pub use store::{DocumentStore, MemoryStore};
