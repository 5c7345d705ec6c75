use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{DocumentStore, MembershipFeed, PartitionFeed, PartitionUpdate};
use crate::conversation::{ConversationId, Message, MessageDraft, MessageId, PartitionKey, UserId};
use crate::error::StoreResult;

/// Process-local document store.
///
/// Behaves like a hosted document database with latency compensation: a new
/// message is visible to subscribers immediately without a timestamp, then
/// again once the "server" stamps it. Every change re-delivers the whole
/// partition.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    partitions: HashMap<PartitionKey, Partition>,
    groups: HashMap<ConversationId, Vec<UserId>>,
    membership_watchers: HashMap<ConversationId, Vec<mpsc::UnboundedSender<Option<Vec<UserId>>>>>,
}

#[derive(Default)]
struct Partition {
    messages: Vec<Message>,
    subscribers: Vec<mpsc::UnboundedSender<PartitionUpdate>>,
}

impl Partition {
    fn publish(&mut self) {
        let snapshot = self.messages.clone();
        self.subscribers
            .retain(|tx| tx.send(PartitionUpdate::Snapshot(snapshot.clone())).is_ok());
    }

    fn upsert(&mut self, message: Message) {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => self.messages.push(message),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `message` as-is (replacing any message with the same id) and
    /// notify subscribers.
    pub fn insert(&self, key: &PartitionKey, message: Message) {
        let mut inner = self.lock();
        let partition = inner.partitions.entry(key.clone()).or_default();
        partition.upsert(message);
        partition.publish();
    }

    /// First half of a write: the message becomes visible without a timestamp.
    pub fn append_pending(&self, key: &PartitionKey, draft: MessageDraft) -> MessageId {
        let id = MessageId::new(Uuid::new_v4().simple().to_string());
        self.insert(key, draft.into_message(id.clone(), None));
        id
    }

    /// Second half of a write: the server assigns the timestamp.
    pub fn acknowledge(&self, key: &PartitionKey, id: &MessageId) -> bool {
        self.acknowledge_at(key, id, Utc::now())
    }

    pub fn acknowledge_at(&self, key: &PartitionKey, id: &MessageId, at: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        let Some(partition) = inner.partitions.get_mut(key) else {
            return false;
        };
        let Some(message) = partition.messages.iter_mut().find(|m| &m.id == id) else {
            return false;
        };
        message.timestamp = Some(at);
        partition.publish();
        true
    }

    /// Push the current state again without any change, as an at-least-once
    /// transport may.
    pub fn redeliver(&self, key: &PartitionKey) {
        if let Some(partition) = self.lock().partitions.get_mut(key) {
            partition.publish();
        }
    }

    /// Simulate a transport failure: every live subscriber of `key` gets a
    /// terminal error and is dropped.
    pub fn fail_partition(&self, key: &PartitionKey, reason: &str) {
        if let Some(partition) = self.lock().partitions.get_mut(key) {
            for tx in partition.subscribers.drain(..) {
                let _ = tx.send(PartitionUpdate::Failed(reason.to_string()));
            }
        }
    }

    pub fn set_members(&self, group: &ConversationId, members: Vec<UserId>) {
        let mut inner = self.lock();
        inner.groups.insert(group.clone(), members.clone());
        if let Some(watchers) = inner.membership_watchers.get_mut(group) {
            watchers.retain(|tx| tx.send(Some(members.clone())).is_ok());
        }
    }

    pub fn remove_group(&self, group: &ConversationId) {
        let mut inner = self.lock();
        inner.groups.remove(group);
        if let Some(watchers) = inner.membership_watchers.get_mut(group) {
            watchers.retain(|tx| tx.send(None).is_ok());
        }
    }

    pub fn messages(&self, key: &PartitionKey) -> Vec<Message> {
        self.lock()
            .partitions
            .get(key)
            .map(|p| p.messages.clone())
            .unwrap_or_default()
    }

    /// Subscribers of `key` whose receiver is still alive.
    pub fn subscriber_count(&self, key: &PartitionKey) -> usize {
        self.lock()
            .partitions
            .get(key)
            .map(|p| p.subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn subscribe_partition(&self, key: &PartitionKey) -> StoreResult<PartitionFeed> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let partition = inner.partitions.entry(key.clone()).or_default();
        let _ = tx.send(PartitionUpdate::Snapshot(partition.messages.clone()));
        partition.subscribers.push(tx);
        debug!(partition = %key, "memory store subscription opened");
        Ok(rx)
    }

    async fn read_membership(&self, group: &ConversationId) -> StoreResult<Option<Vec<UserId>>> {
        Ok(self.lock().groups.get(group).cloned())
    }

    async fn watch_membership(&self, group: &ConversationId) -> StoreResult<Option<MembershipFeed>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let _ = tx.send(inner.groups.get(group).cloned());
        inner
            .membership_watchers
            .entry(group.clone())
            .or_default()
            .push(tx);
        Ok(Some(rx))
    }

    async fn append_message(&self, key: &PartitionKey, draft: MessageDraft) -> StoreResult<MessageId> {
        let id = self.append_pending(key, draft);
        self.acknowledge(key, &id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::MessageBody;

    fn key() -> PartitionKey {
        PartitionKey::new(ConversationId::new("bob"), UserId::new("alice"))
    }

    #[tokio::test]
    async fn subscribe_delivers_current_state_first() {
        let store = MemoryStore::new();
        store.insert(
            &key(),
            Message::new("1", UserId::new("alice"), MessageBody::text("hi"), Some(Utc::now())),
        );

        let mut feed = store.subscribe_partition(&key()).await.unwrap();

        match feed.recv().await {
            Some(PartitionUpdate::Snapshot(messages)) => assert_eq!(messages.len(), 1),
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[tokio::test]
    async fn append_is_visible_pending_then_stamped() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe_partition(&key()).await.unwrap();
        let _ = feed.recv().await;

        store
            .append_message(&key(), MessageDraft::text(UserId::new("alice"), "hello"))
            .await
            .unwrap();

        let Some(PartitionUpdate::Snapshot(pending)) = feed.recv().await else {
            panic!("expected pending snapshot");
        };
        assert!(pending[0].is_pending());
        let Some(PartitionUpdate::Snapshot(stamped)) = feed.recv().await else {
            panic!("expected stamped snapshot");
        };
        assert!(!stamped[0].is_pending());
        assert_eq!(pending[0].id, stamped[0].id);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned_on_next_publish() {
        let store = MemoryStore::new();
        let feed = store.subscribe_partition(&key()).await.unwrap();
        assert_eq!(store.subscriber_count(&key()), 1);

        drop(feed);
        assert_eq!(store.subscriber_count(&key()), 0);
        store.redeliver(&key());
        assert_eq!(store.lock().partitions[&key()].subscribers.len(), 0);
    }

    #[tokio::test]
    async fn membership_watchers_see_changes_and_removal() {
        let store = MemoryStore::new();
        let group = ConversationId::new("g");
        let mut watch = store.watch_membership(&group).await.unwrap().unwrap();
        assert_eq!(watch.recv().await, Some(None));

        store.set_members(&group, vec![UserId::new("x")]);
        assert_eq!(watch.recv().await, Some(Some(vec![UserId::new("x")])));

        store.remove_group(&group);
        assert_eq!(watch.recv().await, Some(None));
    }
}
