use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::Identity;
use crate::conversation::{
    ConversationId, Message, MessageBody, MessageDraft, MessageId, MessageStatus, PartitionKey,
    UserId,
};
use crate::error::{StoreError, StoreResult};
use crate::store::{DocumentStore, MembershipFeed, PartitionFeed, PartitionUpdate};

/// Regular event, tagged `c` (conversation) and `f` (author).
const MESSAGE_KIND: Kind = Kind::Regular(4242);
/// Addressable by `d` = group id, one `m` tag per member.
const MEMBERSHIP_KIND: Kind = Kind::ParameterizedReplaceable(34242);

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const HISTORY_LIMIT: usize = 1000;

/// Event content of a message event.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMessage {
    sender: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_name: Option<String>,
}

impl StoredMessage {
    fn from_draft(draft: &MessageDraft) -> Self {
        let (message, file, file_name) = match &draft.body {
            MessageBody::Text { text } => (text.clone(), None, None),
            MessageBody::Attachment { name, data } => {
                (String::new(), Some(data.clone()), Some(name.clone()))
            }
        };
        Self {
            sender: draft.sender.to_string(),
            message,
            status: MessageStatus::Unread,
            file,
            file_name,
        }
    }

    fn into_message(self, id: MessageId, timestamp: Option<DateTime<Utc>>) -> Message {
        let body = match self.file {
            Some(data) => MessageBody::Attachment {
                name: self.file_name.unwrap_or_else(|| "attachment".to_string()),
                data,
            },
            None => MessageBody::Text { text: self.message },
        };
        Message {
            id,
            sender: UserId::new(self.sender),
            body,
            timestamp,
            status: self.status,
        }
    }
}

fn decode_message(event: &Event) -> Option<Message> {
    if event.kind() != MESSAGE_KIND {
        return None;
    }
    match serde_json::from_str::<StoredMessage>(event.content()) {
        Ok(stored) => {
            let timestamp = DateTime::from_timestamp(event.created_at().as_u64() as i64, 0)
                .unwrap_or_else(Utc::now);
            Some(stored.into_message(MessageId::new(event.id.to_hex()), Some(timestamp)))
        }
        Err(e) => {
            debug!(event = %event.id.to_hex(), "skipping malformed message event: {}", e);
            None
        }
    }
}

fn members_of(event: &Event) -> Vec<UserId> {
    event
        .tags()
        .iter()
        .filter_map(|tag| match tag.as_vec() {
            vec if vec.len() >= 2 && vec[0] == "m" => Some(UserId::new(vec[1].to_string())),
            _ => None,
        })
        .collect()
}

fn tag(parts: &[&str]) -> StoreResult<Tag> {
    Tag::parse(parts.to_vec()).map_err(|e| StoreError::Malformed(e.to_string()))
}

fn partition_filter(key: &PartitionKey) -> Filter {
    Filter::new()
        .kind(MESSAGE_KIND)
        .custom_tag(SingleLetterTag::lowercase(Alphabet::C), vec![key.conversation.to_string()])
        .custom_tag(SingleLetterTag::lowercase(Alphabet::F), vec![key.author.to_string()])
        .limit(HISTORY_LIMIT)
}

fn membership_filter(group: &ConversationId) -> Filter {
    Filter::new()
        .kind(MEMBERSHIP_KIND)
        .custom_tag(SingleLetterTag::lowercase(Alphabet::D), vec![group.to_string()])
}

struct PartitionRoute {
    key: PartitionKey,
    messages: Vec<Message>,
    /// Set once the relays finished sending stored events.
    ready: bool,
    tx: mpsc::UnboundedSender<PartitionUpdate>,
}

impl PartitionRoute {
    fn new(key: PartitionKey, tx: mpsc::UnboundedSender<PartitionUpdate>) -> Self {
        Self {
            key,
            messages: Vec::new(),
            ready: false,
            tx,
        }
    }

    /// Relays may all deliver the same event. A relay copy replaces the local
    /// echo; any other repeat is ignored.
    fn upsert(&mut self, message: Message) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) if existing.is_pending() && !message.is_pending() => {
                *existing = message;
                true
            }
            Some(_) => false,
            None => {
                self.messages.push(message);
                true
            }
        }
    }

    fn retract(&mut self, id: &MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| !(m.is_pending() && &m.id == id));
        self.messages.len() != before
    }

    fn publish(&self) -> bool {
        self.tx
            .send(PartitionUpdate::Snapshot(self.messages.clone()))
            .is_ok()
    }
}

struct MembershipRoute {
    newest: Option<Timestamp>,
    tx: mpsc::UnboundedSender<Option<Vec<UserId>>>,
}

#[derive(Default)]
struct Routes {
    partitions: HashMap<SubscriptionId, PartitionRoute>,
    memberships: HashMap<SubscriptionId, MembershipRoute>,
}

impl Routes {
    /// Returns subscriptions whose receiver is gone.
    fn route(&mut self, notification: RelayPoolNotification) -> Vec<SubscriptionId> {
        match notification {
            RelayPoolNotification::Event {
                subscription_id,
                event,
                ..
            } => self.on_event(subscription_id, &event),
            RelayPoolNotification::Message {
                message: RelayMessage::EndOfStoredEvents(subscription_id),
                ..
            } => self.on_eose(subscription_id),
            _ => Vec::new(),
        }
    }

    fn on_event(&mut self, id: SubscriptionId, event: &Event) -> Vec<SubscriptionId> {
        let alive = if let Some(route) = self.partitions.get_mut(&id) {
            match decode_message(event) {
                Some(message) => !(route.upsert(message) && route.ready) || route.publish(),
                None => true,
            }
        } else if let Some(route) = self.memberships.get_mut(&id) {
            if event.kind() != MEMBERSHIP_KIND
                || route.newest.is_some_and(|newest| event.created_at() <= newest)
            {
                true
            } else {
                route.newest = Some(event.created_at());
                route.tx.send(Some(members_of(event))).is_ok()
            }
        } else {
            true
        };
        self.drop_if_dead(id, alive)
    }

    fn on_eose(&mut self, id: SubscriptionId) -> Vec<SubscriptionId> {
        let alive = match self.partitions.get_mut(&id) {
            Some(route) if !route.ready => {
                route.ready = true;
                route.publish()
            }
            _ => true,
        };
        self.drop_if_dead(id, alive)
    }

    fn drop_if_dead(&mut self, id: SubscriptionId, alive: bool) -> Vec<SubscriptionId> {
        if alive {
            return Vec::new();
        }
        self.partitions.remove(&id);
        self.memberships.remove(&id);
        vec![id]
    }

    fn echo(&mut self, key: &PartitionKey, message: &Message) -> Vec<SubscriptionId> {
        let mut dead = Vec::new();
        for (id, route) in self.partitions.iter_mut() {
            if &route.key == key && route.upsert(message.clone()) && route.ready && !route.publish() {
                dead.push(id.clone());
            }
        }
        self.remove_all(dead)
    }

    fn retract(&mut self, key: &PartitionKey, message: &MessageId) -> Vec<SubscriptionId> {
        let mut dead = Vec::new();
        for (id, route) in self.partitions.iter_mut() {
            if &route.key == key && route.retract(message) && route.ready && !route.publish() {
                dead.push(id.clone());
            }
        }
        self.remove_all(dead)
    }

    fn sweep(&mut self) -> Vec<SubscriptionId> {
        let dead: Vec<SubscriptionId> = self
            .partitions
            .iter()
            .filter(|(_, route)| route.tx.is_closed())
            .map(|(id, _)| id.clone())
            .chain(
                self.memberships
                    .iter()
                    .filter(|(_, route)| route.tx.is_closed())
                    .map(|(id, _)| id.clone()),
            )
            .collect();
        self.remove_all(dead)
    }

    /// Notifications were dropped, so state may be missing events. Every
    /// partition publishes what it holds, stored events or not.
    fn resync(&mut self) -> Vec<SubscriptionId> {
        let mut dead = Vec::new();
        for (id, route) in self.partitions.iter_mut() {
            route.ready = true;
            if !route.publish() {
                dead.push(id.clone());
            }
        }
        self.remove_all(dead)
    }

    fn remove_all(&mut self, dead: Vec<SubscriptionId>) -> Vec<SubscriptionId> {
        for id in &dead {
            self.partitions.remove(id);
            self.memberships.remove(id);
        }
        dead
    }

    /// Every partition feed ends with a failure; membership feeds just close.
    fn fail_all(&mut self, reason: &str) {
        for (_, route) in self.partitions.drain() {
            let _ = route.tx.send(PartitionUpdate::Failed(reason.to_string()));
        }
        self.memberships.clear();
    }
}

/// Document store backed by Nostr relays. Each partition is one relay
/// subscription; the relays' stored events plus live ones make up its state.
pub struct NostrStore {
    client: Client,
    identity: Identity,
    relays: Vec<String>,
    routes: Arc<Mutex<Routes>>,
    /// True while the notification listener runs.
    listening: Arc<AtomicBool>,
}

impl NostrStore {
    pub async fn new(identity: &Identity, relays: &[String]) -> Result<Self> {
        let client = Client::new(&identity.keys);

        for relay_url in relays {
            client.add_relay(relay_url.as_str()).await?;
        }

        Ok(Self {
            client,
            identity: identity.clone(),
            relays: relays.to_vec(),
            routes: Arc::new(Mutex::new(Routes::default())),
            listening: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn connect(&self, connect_timeout: Duration) {
        match timeout(connect_timeout, self.client.connect()).await {
            Ok(_) => info!(relays = self.relays.len(), "connected to nostr relays"),
            Err(_) => warn!("relay connection timeout, continuing with available relays"),
        }
        self.start_notification_listener();
    }

    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    fn start_notification_listener(&self) {
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(run_listener(
            self.client.clone(),
            self.routes.clone(),
            self.listening.clone(),
            self.client.notifications(),
        ));
    }

    fn ensure_listening(&self) -> StoreResult<()> {
        if self.listening.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Transport("relay listener not running".to_string()))
        }
    }

    async fn prune(&self) {
        let dead = self.routes.lock().await.sweep();
        unsubscribe_all(&self.client, dead).await;
    }
}

async fn run_listener(
    client: Client,
    routes: Arc<Mutex<Routes>>,
    listening: Arc<AtomicBool>,
    mut notifications: broadcast::Receiver<RelayPoolNotification>,
) {
    loop {
        match notifications.recv().await {
            Ok(notification) => {
                let shutdown = matches!(notification, RelayPoolNotification::Shutdown);
                let dead = routes.lock().await.route(notification);
                unsubscribe_all(&client, dead).await;
                if shutdown {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "relay notifications lagged, republishing partitions");
                let dead = routes.lock().await.resync();
                unsubscribe_all(&client, dead).await;
            }
            Err(RecvError::Closed) => break,
        }
    }
    warn!("relay notifications ended");
    listening.store(false, Ordering::SeqCst);
    routes.lock().await.fail_all("relay connection closed");
}

async fn unsubscribe_all(client: &Client, dead: Vec<SubscriptionId>) {
    for subscription_id in dead {
        debug!(subscription = ?subscription_id, "dropping subscription with no listener");
        client.unsubscribe(subscription_id).await;
    }
}

#[async_trait]
impl DocumentStore for NostrStore {
    async fn subscribe_partition(&self, key: &PartitionKey) -> StoreResult<PartitionFeed> {
        self.ensure_listening()?;
        self.prune().await;

        let (tx, rx) = mpsc::unbounded_channel();
        // Held across the REQ so the listener cannot see events for an
        // unregistered subscription.
        let mut routes = self.routes.lock().await;
        let subscription_id = self.client.subscribe(vec![partition_filter(key)], None).await;
        debug!(partition = %key, subscription = ?subscription_id, "subscribed to partition");
        routes
            .partitions
            .insert(subscription_id, PartitionRoute::new(key.clone(), tx));

        Ok(rx)
    }

    async fn read_membership(&self, group: &ConversationId) -> StoreResult<Option<Vec<UserId>>> {
        let events = self
            .client
            .get_events_of(vec![membership_filter(group)], Some(FETCH_TIMEOUT))
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        Ok(events
            .iter()
            .filter(|event| event.kind() == MEMBERSHIP_KIND)
            .max_by_key(|event| event.created_at())
            .map(members_of))
    }

    async fn watch_membership(&self, group: &ConversationId) -> StoreResult<Option<MembershipFeed>> {
        self.ensure_listening()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes.lock().await;
        let subscription_id = self.client.subscribe(vec![membership_filter(group)], None).await;
        routes
            .memberships
            .insert(subscription_id, MembershipRoute { newest: None, tx });

        Ok(Some(rx))
    }

    async fn append_message(&self, key: &PartitionKey, draft: MessageDraft) -> StoreResult<MessageId> {
        let content = serde_json::to_string(&StoredMessage::from_draft(&draft))?;
        let tags = vec![
            tag(&["c", key.conversation.as_str()])?,
            tag(&["f", key.author.as_str()])?,
            tag(&["client", "chatline"])?,
        ];

        let event = self
            .identity
            .sign_event(EventBuilder::new(MESSAGE_KIND, content, tags))
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        let id = MessageId::new(event.id.to_hex());

        // Local echo: visible right away, without a server timestamp.
        let echo = draft.into_message(id.clone(), None);
        let dead = self.routes.lock().await.echo(key, &echo);
        unsubscribe_all(&self.client, dead).await;

        let client = self.client.clone();
        let routes = self.routes.clone();
        let key = key.clone();
        let pending = id.clone();
        tokio::spawn(async move {
            let reason = match timeout(SEND_TIMEOUT, client.send_event(event)).await {
                Ok(Ok(_)) => return,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "timed out".to_string(),
            };
            warn!(partition = %key, message = %pending, "message send failed: {}", reason);
            let dead = routes.lock().await.retract(&key, &pending);
            unsubscribe_all(&client, dead).await;
        });

        Ok(id)
    }
}
