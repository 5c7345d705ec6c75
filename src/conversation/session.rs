use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::feed::{FeedError, FeedLease, FeedRegistry};
use super::membership::{group_partitions, MembershipResolver};
use super::{merge, Conversation, MessageBody, MessageDraft, MessageId, PartitionKey, Snapshot, Timeline, UserId};
use crate::error::SessionError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Follow group membership changes while the session is open instead of
    /// reading the member list once.
    pub live_membership: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// Subscribed, nothing delivered yet.
    Waiting,
    Live,
    /// The feed died; its last snapshot is still part of the timeline.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub key: PartitionKey,
    pub state: PartitionState,
    pub messages: usize,
}

/// Everything a session pushes to its consumer, in the order it happened.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Timeline(Timeline),
    Warning(String),
    PartitionsChanged(Vec<PartitionInfo>),
    Closed,
}

struct ActiveFeed {
    token: u64,
    lease: Option<FeedLease>,
    /// A snapshot arrived under `token`.
    delivered: bool,
}

impl ActiveFeed {
    fn new(token: u64) -> Self {
        Self {
            token,
            lease: None,
            delivered: false,
        }
    }
}

struct SessionState {
    open: bool,
    snapshots: BTreeMap<PartitionKey, Snapshot>,
    active: HashMap<PartitionKey, ActiveFeed>,
    failed: BTreeSet<PartitionKey>,
    timeline: Timeline,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    next_token: u64,
    /// Bumped on every partition-set change; a membership read that started
    /// under an older version is discarded.
    membership_version: u64,
    membership_task: Option<AbortHandle>,
}

impl SessionState {
    fn is_current(&self, key: &PartitionKey, token: u64) -> bool {
        self.open && self.active.get(key).is_some_and(|feed| feed.token == token)
    }

    fn issue_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn recompute(&mut self) {
        self.timeline = merge(&self.snapshots);
        debug!(entries = self.timeline.len(), partitions = self.snapshots.len(), "timeline merged");
        self.emit(SessionEvent::Timeline(self.timeline.clone()));
    }

    fn partition_infos(&self) -> Vec<PartitionInfo> {
        let keys: BTreeSet<&PartitionKey> = self.active.keys().chain(self.failed.iter()).collect();
        keys.into_iter()
            .map(|key| {
                let messages = self.snapshots.get(key).map(|s| s.len()).unwrap_or(0);
                let state = if self.failed.contains(key) {
                    PartitionState::Failed
                } else if self.active.get(key).is_some_and(|feed| feed.delivered) {
                    PartitionState::Live
                } else {
                    PartitionState::Waiting
                };
                PartitionInfo {
                    key: key.clone(),
                    state,
                    messages,
                }
            })
            .collect()
    }

    fn emit_partitions(&self) {
        self.emit(SessionEvent::PartitionsChanged(self.partition_infos()));
    }
}

/// The live orchestration unit behind one open conversation.
///
/// Owns the partition → snapshot mapping exclusively. Feed callbacks carry the
/// token that was current when their subscription was opened; anything
/// arriving with a stale token, or after close, is dropped.
pub struct ConversationSession {
    id: Uuid,
    me: UserId,
    conversation: Conversation,
    registry: FeedRegistry,
    resolver: MembershipResolver,
    state: Mutex<SessionState>,
}

impl ConversationSession {
    /// Resolve membership, subscribe every partition and start publishing to
    /// `events`. Resolution failures leave the session open with no
    /// partitions and a warning.
    pub async fn open(
        registry: FeedRegistry,
        me: UserId,
        conversation: Conversation,
        options: SessionOptions,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> SessionHandle {
        let resolver = MembershipResolver::new(registry.store().clone());
        let session = Arc::new(ConversationSession {
            id: Uuid::new_v4(),
            me,
            conversation,
            registry,
            resolver,
            state: Mutex::new(SessionState {
                open: true,
                snapshots: BTreeMap::new(),
                active: HashMap::new(),
                failed: BTreeSet::new(),
                timeline: Timeline::default(),
                events: Some(events),
                next_token: 0,
                membership_version: 0,
                membership_task: None,
            }),
        });
        let handle = SessionHandle { session };
        info!(session = %handle.session.id, conversation = %handle.session.conversation, "opening session");

        let partitions = match handle
            .session
            .resolver
            .resolve(&handle.session.me, &handle.session.conversation)
            .await
        {
            Ok(partitions) => partitions,
            Err(e) => {
                handle.session.warn(format!("membership lookup failed: {}", e));
                BTreeSet::new()
            }
        };
        handle.session.apply_partitions(partitions, true, None);

        if options.live_membership {
            handle.session.follow_membership().await;
        }

        handle
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn warn(&self, message: String) {
        warn!(session = %self.id, "{}", message);
        self.state().emit(SessionEvent::Warning(message));
    }

    /// Bring the active partition set in line with `target`: subscribe what is
    /// new, cancel and forget what is gone. `read_at` is the membership
    /// version `target` was read under, for reads that may have been
    /// overtaken while in flight.
    fn apply_partitions(
        self: &Arc<Self>,
        target: BTreeSet<PartitionKey>,
        force_publish: bool,
        read_at: Option<u64>,
    ) {
        let (added, removed) = {
            let mut state = self.state();
            if !state.open {
                return;
            }
            if read_at.is_some_and(|version| version != state.membership_version) {
                debug!(session = %self.id, "membership changed during read, discarding stale member list");
                return;
            }
            state.membership_version += 1;
            let current: BTreeSet<PartitionKey> =
                state.active.keys().chain(state.failed.iter()).cloned().collect();

            let gone: Vec<PartitionKey> = current.difference(&target).cloned().collect();
            let mut removed = Vec::new();
            for key in &gone {
                if let Some(feed) = state.active.remove(key) {
                    removed.extend(feed.lease);
                }
                state.failed.remove(key);
                state.snapshots.remove(key);
            }

            let mut added = Vec::new();
            for key in target.difference(&current) {
                let token = state.issue_token();
                state.active.insert(key.clone(), ActiveFeed::new(token));
                added.push((key.clone(), token));
            }

            if force_publish || !added.is_empty() || !gone.is_empty() {
                debug!(
                    session = %self.id,
                    added = added.len(),
                    removed = gone.len(),
                    "partition set changed"
                );
                state.emit_partitions();
                state.recompute();
            }
            (added, removed)
        };

        for lease in removed {
            lease.release();
        }
        for (key, token) in added {
            self.attach(key, token);
        }
    }

    fn attach(self: &Arc<Self>, key: PartitionKey, token: u64) {
        let on_snapshot = {
            let session: Weak<Self> = Arc::downgrade(self);
            let key = key.clone();
            move |snapshot: Snapshot| {
                if let Some(session) = session.upgrade() {
                    session.on_snapshot(&key, token, snapshot);
                }
            }
        };
        let on_error = {
            let session: Weak<Self> = Arc::downgrade(self);
            move |error: FeedError| {
                if let Some(session) = session.upgrade() {
                    session.on_feed_error(token, error);
                }
            }
        };

        let lease = self.registry.subscribe(key.clone(), on_snapshot, on_error);

        let mut state = self.state();
        if state.is_current(&key, token) {
            if let Some(feed) = state.active.get_mut(&key) {
                feed.lease = Some(lease);
            }
        } else {
            // closed, removed or failed while subscribing
            drop(state);
            lease.release();
        }
    }

    fn on_snapshot(&self, key: &PartitionKey, token: u64, snapshot: Snapshot) {
        let mut state = self.state();
        if !state.is_current(key, token) {
            debug!(session = %self.id, partition = %key, "discarding snapshot from inactive feed");
            return;
        }
        let first = match state.active.get_mut(key) {
            Some(feed) if !feed.delivered => {
                feed.delivered = true;
                true
            }
            _ => false,
        };
        state.snapshots.insert(key.clone(), snapshot);
        if first {
            state.emit_partitions();
        }
        state.recompute();
    }

    fn on_feed_error(&self, token: u64, error: FeedError) {
        let lease = {
            let mut state = self.state();
            if !state.is_current(&error.key, token) {
                return;
            }
            let lease = state.active.remove(&error.key).and_then(|feed| feed.lease);
            state.failed.insert(error.key.clone());
            let message = format!("lost feed {}: {}", error.key, error.reason);
            warn!(session = %self.id, "{}", message);
            state.emit(SessionEvent::Warning(message));
            state.emit_partitions();
            lease
        };
        if let Some(lease) = lease {
            lease.release();
        }
    }

    async fn follow_membership(self: &Arc<Self>) {
        let Conversation::Group { group } = &self.conversation else {
            return;
        };
        let mut feed = match self.resolver.watch(&self.conversation).await {
            Ok(Some(feed)) => feed,
            Ok(None) => {
                info!(session = %self.id, "store cannot push membership changes, membership fixed until refreshed");
                return;
            }
            Err(e) => {
                self.warn(format!("cannot follow membership of {}: {}", group, e));
                return;
            }
        };

        let weak = Arc::downgrade(self);
        let group = group.clone();
        let task = tokio::spawn(async move {
            while let Some(members) = feed.recv().await {
                let Some(session) = weak.upgrade() else {
                    return;
                };
                let target = match members {
                    Some(members) => group_partitions(&group, &members),
                    None => BTreeSet::new(),
                };
                debug!(session = %session.id, partitions = target.len(), "membership changed");
                session.apply_partitions(target, false, None);
            }
        });

        let mut state = self.state();
        if state.open {
            state.membership_task = Some(task.abort_handle());
        } else {
            task.abort();
        }
    }

    fn close(&self) {
        let (leases, membership_task) = {
            let mut state = self.state();
            if !state.open {
                return;
            }
            state.open = false;
            let leases: Vec<FeedLease> = state.active.drain().filter_map(|(_, feed)| feed.lease).collect();
            state.snapshots.clear();
            state.failed.clear();
            state.emit(SessionEvent::Closed);
            state.events = None;
            (leases, state.membership_task.take())
        };

        if let Some(task) = membership_task {
            task.abort();
        }
        for lease in &leases {
            lease.release();
        }
        info!(session = %self.id, conversation = %self.conversation, feeds = leases.len(), "session closed");
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = state.membership_task.take() {
            task.abort();
        }
    }
}

/// Cheap, cloneable access to an open session.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<ConversationSession>,
}

impl SessionHandle {
    pub fn conversation(&self) -> &Conversation {
        &self.session.conversation
    }

    pub fn me(&self) -> &UserId {
        &self.session.me
    }

    pub fn is_open(&self) -> bool {
        self.session.state().open
    }

    /// The most recently published timeline.
    pub fn timeline(&self) -> Timeline {
        self.session.state().timeline.clone()
    }

    pub fn partitions(&self) -> Vec<PartitionInfo> {
        self.session.state().partition_infos()
    }

    /// Cancel every feed and stop publishing. Idempotent; all feeds are
    /// cancelled by the time this returns.
    pub fn close(&self) {
        self.session.close();
    }

    /// Read the member list again and open/close partitions to match.
    pub async fn refresh_membership(&self) -> Result<(), SessionError> {
        let read_at = {
            let state = self.session.state();
            if !state.open {
                return Err(SessionError::Closed);
            }
            state.membership_version
        };
        let target = self
            .session
            .resolver
            .resolve(&self.session.me, &self.session.conversation)
            .await?;
        self.session.apply_partitions(target, false, Some(read_at));
        Ok(())
    }

    /// Re-subscribe partitions whose feeds failed. Returns how many.
    pub fn reopen_failed(&self) -> usize {
        let reopened: Vec<(PartitionKey, u64)> = {
            let mut state = self.session.state();
            if !state.open {
                return 0;
            }
            let failed = std::mem::take(&mut state.failed);
            let reopened: Vec<(PartitionKey, u64)> = failed
                .into_iter()
                .map(|key| {
                    let token = state.issue_token();
                    state.active.insert(key.clone(), ActiveFeed::new(token));
                    (key, token)
                })
                .collect();
            if !reopened.is_empty() {
                state.emit_partitions();
            }
            reopened
        };

        let count = reopened.len();
        for (key, token) in reopened {
            info!(session = %self.session.id, partition = %key, "reopening failed feed");
            self.session.attach(key, token);
        }
        count
    }

    pub async fn send_text(&self, text: &str) -> Result<MessageId, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        self.send(MessageBody::text(text)).await
    }

    pub async fn send_attachment(&self, name: &str, data: &str) -> Result<MessageId, SessionError> {
        self.send(MessageBody::attachment(name, data)).await
    }

    async fn send(&self, body: MessageBody) -> Result<MessageId, SessionError> {
        if !self.is_open() {
            return Err(SessionError::Closed);
        }
        let outbox = self.session.conversation.outbox(&self.session.me);
        let draft = MessageDraft {
            sender: self.session.me.clone(),
            body,
        };
        let id = self.session.registry.store().append_message(&outbox, draft).await?;
        debug!(session = %self.session.id, partition = %outbox, message = %id, "message appended");
        Ok(id)
    }

    #[cfg(test)]
    fn deliver_stale(&self, key: &PartitionKey, token: u64, snapshot: Snapshot) {
        self.session.on_snapshot(key, token, snapshot);
    }

    #[cfg(test)]
    fn token_of(&self, key: &PartitionKey) -> Option<u64> {
        self.session.state().active.get(key).map(|feed| feed.token)
    }
}

/// Hosts at most one open session, the way a chat pane shows one
/// conversation at a time.
pub struct ConversationView {
    registry: FeedRegistry,
    me: UserId,
    options: SessionOptions,
    session: Option<SessionHandle>,
}

impl ConversationView {
    pub fn new(registry: FeedRegistry, me: UserId, options: SessionOptions) -> Self {
        Self {
            registry,
            me,
            options,
            session: None,
        }
    }

    pub fn me(&self) -> &UserId {
        &self.me
    }

    /// Fails fast if this view still has an open session.
    pub async fn open(
        &mut self,
        conversation: Conversation,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<SessionHandle, SessionError> {
        if let Some(current) = self.session.as_ref().filter(|s| s.is_open()) {
            return Err(SessionError::AlreadyOpen {
                open: current.conversation().clone(),
            });
        }
        let handle = ConversationSession::open(
            self.registry.clone(),
            self.me.clone(),
            conversation,
            self.options.clone(),
            events,
        )
        .await;
        self.session = Some(handle.clone());
        Ok(handle)
    }

    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }

    pub fn current(&self) -> Option<&SessionHandle> {
        self.session.as_ref().filter(|s| s.is_open())
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationId, Message};
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tokio::time::timeout;

    fn key(conversation: &str, author: &str) -> PartitionKey {
        PartitionKey::new(ConversationId::new(conversation), UserId::new(author))
    }

    fn msg(id: &str, sender: &str, secs: i64) -> Message {
        Message::new(
            id,
            UserId::new(sender),
            MessageBody::text(id),
            Some(Utc.timestamp_opt(secs, 0).unwrap()),
        )
    }

    async fn timeline_matching(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        predicate: impl Fn(&Timeline) -> bool,
    ) -> Timeline {
        loop {
            let event = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for timeline")
                .expect("session stopped publishing");
            if let SessionEvent::Timeline(timeline) = event {
                if predicate(&timeline) {
                    return timeline;
                }
            }
        }
    }

    #[tokio::test]
    async fn stale_tokens_do_not_touch_state() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&key("b", "a"), msg("1", "a", 1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ConversationSession::open(
            FeedRegistry::new(store.clone()),
            UserId::new("a"),
            Conversation::direct("b"),
            SessionOptions::default(),
            tx,
        )
        .await;
        timeline_matching(&mut rx, |t| t.len() == 1).await;

        let token = handle.token_of(&key("b", "a")).unwrap();
        handle.deliver_stale(&key("b", "a"), token + 100, Arc::new(vec![msg("x", "a", 0)]));
        assert_eq!(handle.timeline().ids(), vec!["1"]);

        handle.close();
        handle.deliver_stale(&key("b", "a"), token, Arc::new(vec![msg("y", "a", 0)]));
        assert_eq!(handle.timeline().ids(), vec!["1"]);
        assert!(handle.partitions().is_empty());
    }

    #[tokio::test]
    async fn close_cancels_feeds_before_returning() {
        let store = Arc::new(MemoryStore::new());
        let registry = FeedRegistry::new(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ConversationSession::open(
            registry.clone(),
            UserId::new("a"),
            Conversation::direct("b"),
            SessionOptions::default(),
            tx,
        )
        .await;
        timeline_matching(&mut rx, |_| true).await;
        assert_eq!(registry.active_feeds(), 2);

        handle.close();
        handle.close();

        assert_eq!(registry.active_feeds(), 0);
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn view_rejects_a_second_open_session() {
        let store = Arc::new(MemoryStore::new());
        let mut view = ConversationView::new(
            FeedRegistry::new(store),
            UserId::new("a"),
            SessionOptions::default(),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        view.open(Conversation::direct("b"), tx.clone()).await.unwrap();

        let err = view.open(Conversation::direct("c"), tx.clone()).await.err().unwrap();
        assert!(matches!(err, SessionError::AlreadyOpen { open } if open == Conversation::direct("b")));

        view.close();
        let handle = view.open(Conversation::direct("c"), tx).await.unwrap();
        assert_eq!(handle.conversation(), &Conversation::direct("c"));
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = ConversationSession::open(
            FeedRegistry::new(store),
            UserId::new("a"),
            Conversation::direct("b"),
            SessionOptions::default(),
            tx,
        )
        .await;

        assert!(matches!(handle.send_text("   ").await, Err(SessionError::EmptyMessage)));
        handle.close();
        assert!(matches!(handle.send_text("hi").await, Err(SessionError::Closed)));
    }
}
