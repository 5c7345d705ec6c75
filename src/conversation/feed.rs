use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::{PartitionKey, Snapshot};
use crate::store::{DocumentStore, PartitionUpdate};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("feed {key} failed: {reason}")]
pub struct FeedError {
    pub key: PartitionKey,
    pub reason: String,
}

impl FeedError {
    pub fn new(key: PartitionKey, reason: impl Into<String>) -> Self {
        Self {
            key,
            reason: reason.into(),
        }
    }
}

/// One live subscription to one partition.
///
/// Callbacks run on a spawned task, so `open` must be called inside a tokio
/// runtime. After `cancel` no further callback is started, but one that is
/// already running may still complete.
pub struct FeedSubscription {
    key: PartitionKey,
    cancelled: Arc<AtomicBool>,
    task: AbortHandle,
}

impl FeedSubscription {
    pub fn open<S, E>(
        store: Arc<dyn DocumentStore>,
        key: PartitionKey,
        mut on_snapshot: S,
        on_error: E,
    ) -> Self
    where
        S: FnMut(Snapshot) + Send + 'static,
        E: FnOnce(FeedError) + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            let mut feed = match store.subscribe_partition(&task_key).await {
                Ok(feed) => feed,
                Err(e) => {
                    if !flag.load(Ordering::Acquire) {
                        on_error(FeedError::new(task_key, e.to_string()));
                    }
                    return;
                }
            };

            while let Some(update) = feed.recv().await {
                if flag.load(Ordering::Acquire) {
                    return;
                }
                match update {
                    PartitionUpdate::Snapshot(messages) => {
                        debug!(partition = %task_key, count = messages.len(), "snapshot received");
                        on_snapshot(Arc::new(messages));
                    }
                    PartitionUpdate::Failed(reason) => {
                        warn!(partition = %task_key, %reason, "feed failed");
                        on_error(FeedError::new(task_key, reason));
                        return;
                    }
                }
            }

            if !flag.load(Ordering::Acquire) {
                on_error(FeedError::new(task_key, "feed closed by store"));
            }
        });

        debug!(partition = %key, "feed opened");
        Self {
            key,
            cancelled,
            task: task.abort_handle(),
        }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.task.abort();
            debug!(partition = %self.key, "feed cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

type SnapshotCallback = Arc<dyn Fn(Snapshot) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(FeedError) + Send + Sync>;

#[derive(Clone)]
struct Listener {
    on_snapshot: SnapshotCallback,
    on_error: ErrorCallback,
}

struct SharedFeed {
    generation: u64,
    subscription: Option<FeedSubscription>,
    listeners: BTreeMap<u64, Listener>,
    latest: Option<Snapshot>,
    // Serializes callback delivery for this feed so a replayed snapshot can
    // never land after a newer live one.
    delivery: Arc<Mutex<()>>,
}

#[derive(Default)]
struct RegistryInner {
    feeds: HashMap<PartitionKey, SharedFeed>,
    next_id: u64,
}

fn lock(inner: &Mutex<RegistryInner>) -> MutexGuard<'_, RegistryInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn hold(delivery: &Mutex<()>) -> MutexGuard<'_, ()> {
    delivery.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reference-counted feeds keyed by partition.
///
/// Every partition has at most one underlying [`FeedSubscription`] no matter
/// how many sessions watch it. The feed is cancelled when its last lease is
/// released. A subscriber joining a feed that already delivered gets the
/// latest snapshot straight away.
#[derive(Clone)]
pub struct FeedRegistry {
    store: Arc<dyn DocumentStore>,
    inner: Arc<Mutex<RegistryInner>>,
}

impl FeedRegistry {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            inner: Arc::new(Mutex::new(RegistryInner::default())),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Must not be called while holding a lock that the callbacks take.
    pub fn subscribe<S, E>(&self, key: PartitionKey, on_snapshot: S, on_error: E) -> FeedLease
    where
        S: Fn(Snapshot) + Send + Sync + 'static,
        E: Fn(FeedError) + Send + Sync + 'static,
    {
        let listener = Listener {
            on_snapshot: Arc::new(on_snapshot),
            on_error: Arc::new(on_error),
        };

        let (listener_id, joined, fresh_generation) = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            match inner.feeds.get_mut(&key) {
                Some(feed) => {
                    feed.listeners.insert(id, listener.clone());
                    (id, Some(feed.delivery.clone()), None)
                }
                None => {
                    let mut listeners = BTreeMap::new();
                    listeners.insert(id, listener.clone());
                    inner.feeds.insert(
                        key.clone(),
                        SharedFeed {
                            generation: id,
                            subscription: None,
                            listeners,
                            latest: None,
                            delivery: Arc::new(Mutex::new(())),
                        },
                    );
                    (id, None, Some(id))
                }
            }
        };

        if let Some(generation) = fresh_generation {
            self.open_underlying(key.clone(), generation);
        }

        if let Some(delivery) = joined {
            let _guard = hold(&delivery);
            let latest = lock(&self.inner)
                .feeds
                .get(&key)
                .filter(|feed| feed.listeners.contains_key(&listener_id))
                .and_then(|feed| feed.latest.clone());
            if let Some(snapshot) = latest {
                debug!(partition = %key, "replaying cached snapshot to new subscriber");
                (listener.on_snapshot)(snapshot);
            }
        }

        FeedLease {
            registry: Arc::downgrade(&self.inner),
            key,
            listener_id,
            released: AtomicBool::new(false),
        }
    }

    fn open_underlying(&self, key: PartitionKey, generation: u64) {
        let on_snapshot = {
            let inner = Arc::downgrade(&self.inner);
            let key = key.clone();
            move |snapshot: Snapshot| dispatch_snapshot(&inner, &key, generation, snapshot)
        };
        let on_error = {
            let inner = Arc::downgrade(&self.inner);
            move |error: FeedError| dispatch_error(&inner, generation, error)
        };

        let subscription = FeedSubscription::open(self.store.clone(), key.clone(), on_snapshot, on_error);

        let mut inner = lock(&self.inner);
        match inner.feeds.get_mut(&key) {
            Some(feed) if feed.generation == generation => feed.subscription = Some(subscription),
            // every subscriber left (or the feed already failed) while opening
            _ => subscription.cancel(),
        }
    }

    /// Underlying feeds currently open.
    pub fn active_feeds(&self) -> usize {
        lock(&self.inner).feeds.len()
    }

    pub fn subscriber_count(&self, key: &PartitionKey) -> usize {
        lock(&self.inner)
            .feeds
            .get(key)
            .map(|feed| feed.listeners.len())
            .unwrap_or(0)
    }
}

fn dispatch_snapshot(
    inner: &Weak<Mutex<RegistryInner>>,
    key: &PartitionKey,
    generation: u64,
    snapshot: Snapshot,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let (listeners, delivery) = {
        let mut guard = lock(&inner);
        let Some(feed) = guard.feeds.get_mut(key) else {
            return;
        };
        if feed.generation != generation {
            return;
        }
        feed.latest = Some(snapshot.clone());
        let listeners: Vec<Listener> = feed.listeners.values().cloned().collect();
        (listeners, feed.delivery.clone())
    };

    let _guard = hold(&delivery);
    for listener in listeners {
        (listener.on_snapshot)(snapshot.clone());
    }
}

fn dispatch_error(inner: &Weak<Mutex<RegistryInner>>, generation: u64, error: FeedError) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let feed = {
        let mut guard = lock(&inner);
        let current = guard
            .feeds
            .get(&error.key)
            .is_some_and(|feed| feed.generation == generation);
        if current {
            guard.feeds.remove(&error.key)
        } else {
            None
        }
    };
    let Some(feed) = feed else {
        return;
    };

    // The feed is dead; the next subscriber for this key opens a new one.
    let _guard = hold(&feed.delivery);
    for listener in feed.listeners.values() {
        (listener.on_error)(error.clone());
    }
}

/// A subscriber's claim on a shared feed. Released on drop.
pub struct FeedLease {
    registry: Weak<Mutex<RegistryInner>>,
    key: PartitionKey,
    listener_id: u64,
    released: AtomicBool,
}

impl FeedLease {
    /// Idempotent. Cancels the underlying feed when this was the last lease.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let orphaned = {
            let mut guard = lock(&inner);
            let now_empty = match guard.feeds.get_mut(&self.key) {
                Some(feed) => feed.listeners.remove(&self.listener_id).is_some() && feed.listeners.is_empty(),
                None => false,
            };
            if now_empty {
                guard.feeds.remove(&self.key)
            } else {
                None
            }
        };
        if let Some(feed) = orphaned {
            if let Some(subscription) = &feed.subscription {
                subscription.cancel();
            }
            debug!(partition = %self.key, "last subscriber left, feed closed");
        }
    }
}

impl Drop for FeedLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationId, Message, MessageBody, UserId};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn key() -> PartitionKey {
        PartitionKey::new(ConversationId::new("g"), UserId::new("x"))
    }

    fn message(id: &str) -> Message {
        Message::new(id, UserId::new("x"), MessageBody::text(id), Some(Utc::now()))
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn subscription_delivers_initial_and_later_snapshots() {
        let store = Arc::new(MemoryStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = FeedSubscription::open(
            store.clone(),
            key(),
            move |snapshot| {
                let _ = tx.send(snapshot.len());
            },
            |_| {},
        );

        assert_eq!(next(&mut rx).await, 0);
        store.insert(&key(), message("1"));
        assert_eq!(next(&mut rx).await, 1);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_stops_delivery() {
        let store = Arc::new(MemoryStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = FeedSubscription::open(
            store.clone(),
            key(),
            move |snapshot| {
                let _ = tx.send(snapshot.len());
            },
            |_| {},
        );
        assert_eq!(next(&mut rx).await, 0);

        sub.cancel();
        sub.cancel();
        assert!(sub.is_cancelled());
        store.insert(&key(), message("1"));

        // the aborted task drops its callback, closing the channel
        assert_eq!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn transport_failure_reaches_on_error_with_the_key() {
        let store = Arc::new(MemoryStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        let _sub = FeedSubscription::open(
            store.clone(),
            key(),
            move |_| {
                let _ = ready_tx.send(());
            },
            move |error| {
                let _ = tx.send(error);
            },
        );
        next(&mut ready_rx).await;

        store.fail_partition(&key(), "connection reset");

        let error = next(&mut rx).await;
        assert_eq!(error.key, key());
        assert_eq!(error.reason, "connection reset");
    }

    #[tokio::test]
    async fn registry_shares_one_feed_and_replays_latest() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&key(), message("1"));
        let registry = FeedRegistry::new(store.clone());

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let lease_a = registry.subscribe(
            key(),
            move |snapshot: Snapshot| {
                let _ = tx_a.send(snapshot.len());
            },
            |_| {},
        );
        assert_eq!(next(&mut rx_a).await, 1);

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let lease_b = registry.subscribe(
            key(),
            move |snapshot: Snapshot| {
                let _ = tx_b.send(snapshot.len());
            },
            |_| {},
        );
        assert_eq!(next(&mut rx_b).await, 1, "late subscriber gets the cached snapshot");
        assert_eq!(registry.active_feeds(), 1);
        assert_eq!(registry.subscriber_count(&key()), 2);
        assert_eq!(store.subscriber_count(&key()), 1);

        lease_a.release();
        assert_eq!(registry.active_feeds(), 1);
        lease_b.release();
        lease_b.release();
        assert_eq!(registry.active_feeds(), 0);
    }

    #[tokio::test]
    async fn failed_feed_is_dropped_from_registry_and_reopens_on_demand() {
        let store = Arc::new(MemoryStore::new());
        let registry = FeedRegistry::new(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (snap_tx, mut snap_rx) = mpsc::unbounded_channel();
        let _lease = registry.subscribe(
            key(),
            move |_: Snapshot| {
                let _ = snap_tx.send(());
            },
            move |error: FeedError| {
                let _ = tx.send(error.reason);
            },
        );
        next(&mut snap_rx).await;

        store.fail_partition(&key(), "boom");
        assert_eq!(next(&mut rx).await, "boom");
        assert_eq!(registry.active_feeds(), 0);

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let _again = registry.subscribe(
            key(),
            move |snapshot: Snapshot| {
                let _ = tx2.send(snapshot.len());
            },
            |_| {},
        );
        assert_eq!(next(&mut rx2).await, 0);
        assert_eq!(registry.active_feeds(), 1);
    }
}
