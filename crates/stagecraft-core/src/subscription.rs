// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-document change feed and subscription-based continuation.
//!
//! The [`NotificationHub`] owns one broadcast channel per watched task
//! identity. The engine publishes every persisted version and every deletion
//! to it. The [`SubscriptionManager`] turns a hub channel into a listener
//! task that calls back into a workflow until the subscription is closed.
//!
//! Subscription lifecycle: `Unsubscribed -> Subscribed -> Unsubscribing ->
//! Unsubscribed`. Notifications are delivered at most once per listener;
//! there are no delivery retries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, warn};

use crate::persistence::{TaskRecord, TaskStore};
use crate::task::TaskId;

/// Default per-identity channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Change of a watched document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A version was persisted; carries the full state.
    Updated(TaskRecord),
    /// The document was deleted; carries its last state.
    Deleted(TaskRecord),
    /// The document does not exist (seen on replay or after a lagged feed).
    Missing(TaskId),
}

impl Notification {
    /// Identity of the document the notification is about.
    pub fn task_id(&self) -> &str {
        match self {
            Self::Updated(r) | Self::Deleted(r) => &r.task_id,
            Self::Missing(id) => id.as_str(),
        }
    }

    /// The carried record, if any.
    pub fn record(&self) -> Option<&TaskRecord> {
        match self {
            Self::Updated(r) | Self::Deleted(r) => Some(r),
            Self::Missing(_) => None,
        }
    }

    /// Whether the watched document will not change any more.
    pub fn is_final(&self) -> bool {
        match self {
            Self::Updated(r) => r.is_terminal(),
            Self::Deleted(_) | Self::Missing(_) => true,
        }
    }
}

/// Broadcast channels keyed by task identity.
pub struct NotificationHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Notification>>>,
    capacity: usize,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl NotificationHub {
    /// Create a hub whose channels buffer `capacity` notifications.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Receive every later notification for `task_id`.
    ///
    /// Opening a new channel also drops every channel whose receivers are
    /// all gone.
    pub async fn subscribe(&self, task_id: &str) -> broadcast::Receiver<Notification> {
        let mut channels = self.channels.lock().await;
        if let Some(sender) = channels.get(task_id) {
            return sender.subscribe();
        }

        channels.retain(|_, sender| sender.receiver_count() > 0);
        let (sender, receiver) = broadcast::channel(self.capacity);
        channels.insert(task_id.to_string(), sender);
        receiver
    }

    /// Drop the channel of `task_id` if nobody listens on it any more.
    pub async fn prune(&self, task_id: &str) -> bool {
        let mut channels = self.channels.lock().await;
        if channels
            .get(task_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(task_id);
            return true;
        }
        false
    }

    /// Publish a notification to the document's channel.
    ///
    /// Channels without receivers are dropped; a deletion closes the channel
    /// after delivery.
    pub async fn publish(&self, notification: Notification) {
        let mut channels = self.channels.lock().await;
        let task_id = notification.task_id().to_string();
        let deleted = matches!(notification, Notification::Deleted(_));

        let Some(sender) = channels.get(&task_id) else {
            return;
        };

        if sender.send(notification).is_err() || deleted {
            channels.remove(&task_id);
        }
    }

    /// Number of identities with an open channel.
    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }
}

/// State of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not listening.
    Unsubscribed,
    /// Listening for notifications.
    Subscribed,
    /// Close requested, listener still winding down.
    Unsubscribing,
}

struct HandleInner {
    id: String,
    watcher: TaskId,
    watched: TaskId,
    state: watch::Sender<SubscriptionState>,
}

/// Handle to one subscription. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.inner.id)
            .field("watcher", &self.inner.watcher)
            .field("watched", &self.inner.watched)
            .field("state", &self.state())
            .finish()
    }
}

impl SubscriptionHandle {
    fn new(watcher: TaskId, watched: TaskId) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Unsubscribed);
        Self {
            inner: Arc::new(HandleInner {
                id: uuid::Uuid::new_v4().to_string(),
                watcher,
                watched,
                state,
            }),
        }
    }

    /// Unique id of this subscription.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The task waiting.
    pub fn watcher(&self) -> &TaskId {
        &self.inner.watcher
    }

    /// The task being waited on.
    pub fn watched(&self) -> &TaskId {
        &self.inner.watched
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        *self.inner.state.borrow()
    }

    /// Request the subscription to stop.
    ///
    /// Returns `true` only for the call that moved it out of `Subscribed`, so
    /// callers can use it to act on a terminal notification exactly once.
    pub fn close(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == SubscriptionState::Subscribed {
                *state = SubscriptionState::Unsubscribing;
                true
            } else {
                false
            }
        })
    }

    /// Wait until the listener has stopped.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx
            .wait_for(|state| *state == SubscriptionState::Unsubscribed)
            .await;
    }

    fn set(&self, state: SubscriptionState) {
        self.inner.state.send_replace(state);
    }
}

/// Registry of open subscriptions, keyed by watcher.
#[derive(Clone)]
pub struct SubscriptionManager {
    store: Arc<dyn TaskStore>,
    hub: Arc<NotificationHub>,
    active: Arc<Mutex<HashMap<TaskId, Vec<SubscriptionHandle>>>>,
}

impl SubscriptionManager {
    /// Create a manager reading from `store` and listening on `hub`.
    pub fn new(store: Arc<dyn TaskStore>, hub: Arc<NotificationHub>) -> Self {
        Self {
            store,
            hub,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe `watcher` to changes of `watched`.
    ///
    /// The current state of `watched` is replayed first, so a task that
    /// already terminated is still observed. `on_notification` runs on a
    /// dedicated listener task, one notification at a time.
    pub async fn subscribe<F, Fut>(
        &self,
        watcher: &TaskId,
        watched: &TaskId,
        on_notification: F,
    ) -> SubscriptionHandle
    where
        F: Fn(SubscriptionHandle, Notification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = SubscriptionHandle::new(watcher.clone(), watched.clone());
        let feed = self.hub.subscribe(watched.as_str()).await;
        handle.set(SubscriptionState::Subscribed);

        self.active
            .lock()
            .await
            .entry(watcher.clone())
            .or_default()
            .push(handle.clone());

        debug!(
            subscription_id = %handle.id(),
            watcher = %watcher,
            watched = %watched,
            "Subscription opened"
        );

        let listener = Listener {
            store: self.store.clone(),
            hub: self.hub.clone(),
            active: self.active.clone(),
            handle: handle.clone(),
        };
        tokio::spawn(listener.run(feed, on_notification));

        handle
    }

    /// Close one subscription. Returns `false` if it was already closing.
    pub fn close(&self, handle: &SubscriptionHandle) -> bool {
        handle.close()
    }

    /// Close every subscription still open for `watcher`.
    pub async fn close_all_for(&self, watcher: &TaskId) -> usize {
        let handles = self.active.lock().await.remove(watcher).unwrap_or_default();
        let closed = handles.iter().filter(|h| h.close()).count();
        if closed > 0 {
            debug!(watcher = %watcher, closed, "Closed leftover subscriptions");
        }
        closed
    }

    /// Number of open subscriptions for `watcher`.
    pub async fn active_count(&self, watcher: &TaskId) -> usize {
        self.active
            .lock()
            .await
            .get(watcher)
            .map_or(0, |handles| handles.len())
    }
}

struct Listener {
    store: Arc<dyn TaskStore>,
    hub: Arc<NotificationHub>,
    active: Arc<Mutex<HashMap<TaskId, Vec<SubscriptionHandle>>>>,
    handle: SubscriptionHandle,
}

impl Listener {
    async fn run<F, Fut>(self, mut feed: broadcast::Receiver<Notification>, on_notification: F)
    where
        F: Fn(SubscriptionHandle, Notification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.handle.inner.state.subscribe();

        if let Some(current) = self.read_current().await {
            on_notification(self.handle.clone(), current).await;
        }

        loop {
            if self.handle.state() != SubscriptionState::Subscribed {
                break;
            }

            tokio::select! {
                biased;

                _ = state.changed() => {
                    continue;
                }

                received = feed.recv() => {
                    match received {
                        Ok(notification) => {
                            let deleted = matches!(notification, Notification::Deleted(_));
                            on_notification(self.handle.clone(), notification).await;
                            if deleted {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                subscription_id = %self.handle.id(),
                                watched = %self.handle.watched(),
                                skipped,
                                "Subscription feed lagged, re-reading watched task"
                            );
                            if let Some(current) = self.read_current().await {
                                on_notification(self.handle.clone(), current).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        drop(feed);
        self.hub.prune(self.handle.watched().as_str()).await;
        self.deregister().await;
        self.handle.set(SubscriptionState::Unsubscribed);

        debug!(
            subscription_id = %self.handle.id(),
            watcher = %self.handle.watcher(),
            "Subscription closed"
        );
    }

    async fn read_current(&self) -> Option<Notification> {
        let watched = self.handle.watched();
        match self.store.get_task(watched.as_str()).await {
            Ok(Some(record)) => Some(Notification::Updated(record)),
            Ok(None) => Some(Notification::Missing(watched.clone())),
            Err(e) => {
                warn!(
                    subscription_id = %self.handle.id(),
                    watched = %watched,
                    error = %e,
                    "Failed to read watched task"
                );
                None
            }
        }
    }

    async fn deregister(&self) {
        let mut active = self.active.lock().await;
        let watcher = self.handle.watcher();
        if let Some(handles) = active.get_mut(watcher) {
            handles.retain(|h| h.id() != self.handle.id());
            if handles.is_empty() {
                active.remove(watcher);
            }
        }
    }
}
