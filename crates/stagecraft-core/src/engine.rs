// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task state machine engine.
//!
//! [`TaskEngine`] owns the task store, the registered task services, the
//! change feed and the subscription manager. Every accepted transition is
//! committed with compare-and-swap on the document version, published to the
//! change feed, appended to the audit log and dispatched to the owning
//! service on a fresh tokio task.
//!
//! Writes to one document are serialized by a per-document lock inside the
//! process and by the version check across processes. Different documents
//! proceed fully concurrently.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use chrono::Utc;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, instrument, warn};

use crate::callback::{NotifyOutcome, ServiceTaskCallback, ServiceTaskCallbackResponse};
use crate::error::CoreError;
use crate::persistence::{
    ListTasksFilter, ScheduledTransitionRecord, TaskRecord, TaskStore, TransitionEventRecord,
};
use crate::service::{DocumentOf, RegisteredService, ServiceEntry, TaskService};
use crate::subscription::{
    DEFAULT_CHANNEL_CAPACITY, Notification, NotificationHub, SubscriptionManager,
};
use crate::task::{SubStage, TaskDocument, TaskFailure, TaskId, TaskInfo, TaskStage, TaskStatus};
use crate::transition::{IgnoreReason, Transition, TransitionOutcome, TransitionResult, apply_transition};

/// Default number of compare-and-swap attempts per transition.
pub const DEFAULT_TRANSITION_RETRIES: u32 = 3;

/// Default time a direct create waits for the first transition.
pub const DEFAULT_DIRECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size used when re-dispatching tasks on startup.
const RECOVERY_PAGE_SIZE: i64 = 100;

/// Request to create a task.
#[derive(Debug, Clone)]
pub struct CreateTask<F> {
    /// Identity to use; a random one is generated when absent.
    pub id: Option<TaskId>,
    /// Initial workflow fields.
    pub fields: F,
    /// Who to notify on terminal stage.
    pub callback: ServiceTaskCallback,
    /// Wait for the first transition before returning.
    pub direct: bool,
    /// Initial custom properties.
    pub custom_properties: BTreeMap<String, String>,
}

impl<F> CreateTask<F> {
    /// Create request with default options.
    pub fn new(fields: F) -> Self {
        Self {
            id: None,
            fields,
            callback: ServiceTaskCallback::create_empty(),
            direct: false,
            custom_properties: BTreeMap::new(),
        }
    }

    /// Use a fixed identity.
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Notify `callback` on terminal stage.
    pub fn with_callback(mut self, callback: ServiceTaskCallback) -> Self {
        self.callback = callback;
        self
    }

    /// Wait for the first transition before returning.
    pub fn direct(mut self) -> Self {
        self.direct = true;
        self
    }

    /// Add an initial custom property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
struct EngineSettings {
    transition_retries: u32,
    direct_timeout: Duration,
}

/// Builder for [`TaskEngine`].
pub struct TaskEngineBuilder {
    store: Option<Arc<dyn TaskStore>>,
    services: HashMap<&'static str, Arc<dyn RegisteredService>>,
    typed: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
    duplicate_kinds: Vec<&'static str>,
    settings: EngineSettings,
    notification_capacity: usize,
}

impl std::fmt::Debug for TaskEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngineBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("settings", &self.settings)
            .field("notification_capacity", &self.notification_capacity)
            .finish()
    }
}

impl Default for TaskEngineBuilder {
    fn default() -> Self {
        Self {
            store: None,
            services: HashMap::new(),
            typed: HashMap::new(),
            duplicate_kinds: Vec::new(),
            settings: EngineSettings {
                transition_retries: DEFAULT_TRANSITION_RETRIES,
                direct_timeout: DEFAULT_DIRECT_TIMEOUT,
            },
            notification_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl TaskEngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the task store (required).
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a task service under its [`TaskService::KIND`].
    pub fn register<S: TaskService>(mut self, service: S) -> Self {
        let service = Arc::new(service);
        if self.services.contains_key(S::KIND) {
            self.duplicate_kinds.push(S::KIND);
        }
        self.services
            .insert(S::KIND, Arc::new(ServiceEntry::new(service.clone())));
        self.typed.insert(S::KIND, service);
        self
    }

    /// Compare-and-swap attempts before a transition gives up with
    /// [`CoreError::Conflict`].
    ///
    /// Default: 3
    pub fn transition_retries(mut self, retries: u32) -> Self {
        self.settings.transition_retries = retries.max(1);
        self
    }

    /// How long a direct create waits for the first transition.
    ///
    /// Default: 30 seconds
    pub fn direct_timeout(mut self, timeout: Duration) -> Self {
        self.settings.direct_timeout = timeout;
        self
    }

    /// Buffer size of each per-document change feed.
    ///
    /// Default: 64
    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    /// Build the engine.
    ///
    /// Returns an error if the store is missing or a kind was registered twice.
    pub fn build(self) -> AnyResult<Arc<TaskEngine>> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;

        if !self.duplicate_kinds.is_empty() {
            anyhow::bail!(
                "task kinds registered more than once: {}",
                self.duplicate_kinds.join(", ")
            );
        }

        let hub = Arc::new(NotificationHub::new(self.notification_capacity));
        let subscriptions = SubscriptionManager::new(store.clone(), hub.clone());

        Ok(Arc::new(TaskEngine {
            store,
            hub,
            subscriptions,
            services: self.services,
            typed: self.typed,
            locks: Mutex::new(HashMap::new()),
            settings: self.settings,
        }))
    }
}

/// The task state machine engine.
pub struct TaskEngine {
    store: Arc<dyn TaskStore>,
    hub: Arc<NotificationHub>,
    subscriptions: SubscriptionManager,
    services: HashMap<&'static str, Arc<dyn RegisteredService>>,
    typed: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    settings: EngineSettings,
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("store", &"...")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("settings", &self.settings)
            .finish()
    }
}

impl TaskEngine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> TaskEngineBuilder {
        TaskEngineBuilder::new()
    }

    /// The task store.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// The subscription manager.
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Registered kinds.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.services.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Validate, persist and dispatch a new task.
    ///
    /// The task starts as CREATED with the CREATED substage at version 1.
    /// Validation failures are returned without persisting anything. A direct
    /// request returns only once the first transition after creation is
    /// persisted, the task is deleted, or the direct timeout elapses.
    #[instrument(skip(self, request), fields(kind = S::KIND))]
    pub async fn create<S: TaskService>(
        self: &Arc<Self>,
        request: CreateTask<S::Fields>,
    ) -> Result<DocumentOf<S>, CoreError> {
        let service = self.service::<S>()?;
        service.validate(&request.fields)?;

        let now = Utc::now();
        let doc: DocumentOf<S> = TaskDocument {
            id: request.id.unwrap_or_else(TaskId::generate),
            kind: S::KIND.to_string(),
            version: 1,
            task_info: TaskInfo::default(),
            sub_stage: S::SubStage::CREATED,
            direct: request.direct,
            callback: request.callback,
            fields: request.fields,
            custom_properties: request.custom_properties,
            accepted_deliveries: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let record = doc.to_record()?;

        let feed = if doc.direct {
            Some(self.hub.subscribe(doc.id.as_str()).await)
        } else {
            None
        };

        self.store.insert_task(&record).await?;
        info!(task_id = %doc.id, kind = S::KIND, direct = doc.direct, "Task created");
        self.after_commit(record).await;

        match feed {
            Some(feed) => {
                let task_id = doc.id.clone();
                let result = self.await_first_transition::<S>(doc, feed).await;
                self.hub.prune(task_id.as_str()).await;
                result
            }
            None => Ok(doc),
        }
    }

    async fn await_first_transition<S: TaskService>(
        &self,
        created: DocumentOf<S>,
        mut feed: broadcast::Receiver<Notification>,
    ) -> Result<DocumentOf<S>, CoreError> {
        let wait = async {
            loop {
                match feed.recv().await {
                    Ok(Notification::Updated(record)) if record.version > created.version => {
                        return Some(record);
                    }
                    Ok(Notification::Deleted(record)) => return Some(record),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        match self.store.get_task(created.id.as_str()).await {
                            Ok(Some(record)) if record.version > created.version => {
                                return Some(record);
                            }
                            Ok(Some(_)) => continue,
                            Ok(None) | Err(_) => return None,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        match tokio::time::timeout(self.settings.direct_timeout, wait).await {
            Ok(Some(record)) => DocumentOf::<S>::from_record(&record),
            Ok(None) => Ok(created),
            Err(_) => {
                warn!(
                    task_id = %created.id,
                    timeout_ms = self.settings.direct_timeout.as_millis() as u64,
                    "Direct task did not transition in time, returning created state"
                );
                Ok(self.get_task::<S>(&created.id).await?.unwrap_or(created))
            }
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Apply a transition to a task.
    ///
    /// Reads the current version, applies the transition, and commits it only
    /// if the version is unchanged; on conflict it re-reads and retries up to
    /// the configured number of attempts.
    #[instrument(skip(self, transition), fields(kind = S::KIND, to = %transition.position()))]
    pub async fn transition<S: TaskService>(
        self: &Arc<Self>,
        task_id: &TaskId,
        transition: Transition<S::SubStage, S::Fields>,
    ) -> Result<TransitionResult, CoreError> {
        let service = self.service::<S>()?;
        let lock = self.lock_for(task_id).await;
        let _guard = lock.lock().await;

        let attempts = self.settings.transition_retries;
        for attempt in 1..=attempts {
            let Some(record) = self.store.get_task(task_id.as_str()).await? else {
                self.release_lock(task_id).await;
                return Err(CoreError::TaskNotFound {
                    task_id: task_id.to_string(),
                });
            };

            if record.kind != S::KIND {
                return Err(CoreError::KindMismatch {
                    task_id: task_id.to_string(),
                    expected: S::KIND.to_string(),
                    actual: record.kind,
                });
            }

            let current = DocumentOf::<S>::from_record(&record)?;
            let next = match apply_transition(
                &current,
                &transition,
                service.transient_sub_stages(),
                Utc::now(),
            ) {
                Ok(TransitionOutcome::Applied(next)) => next,
                Ok(TransitionOutcome::Ignored(reason)) => {
                    if reason == IgnoreReason::AlreadyFailed {
                        warn!(task_id = %task_id, "Task is already failed, ignoring repeated failure");
                    } else {
                        debug!(task_id = %task_id, ?reason, "Transition ignored");
                    }
                    if current.is_terminal() {
                        self.release_lock(task_id).await;
                    }
                    return Ok(TransitionResult::Ignored(reason));
                }
                Err(e) => {
                    if current.is_terminal() {
                        self.release_lock(task_id).await;
                    }
                    return Err(e);
                }
            };

            let next_record = next.to_record()?;
            if self
                .store
                .update_task_if_version(&next_record, current.version)
                .await?
            {
                debug!(
                    task_id = %task_id,
                    from = %current.position(),
                    to = %next.position(),
                    version = next.version,
                    "Transition applied"
                );
                if next.is_terminal() {
                    self.release_lock(task_id).await;
                }
                self.after_commit(next_record).await;
                return Ok(TransitionResult::Applied {
                    version: next.version,
                });
            }

            debug!(task_id = %task_id, attempt, "Version conflict, retrying transition");
        }

        Err(CoreError::Conflict {
            task_id: task_id.to_string(),
            attempts,
        })
    }

    /// Move a task to FAILED, recording `failure`.
    pub async fn fail_task<S: TaskService>(
        self: &Arc<Self>,
        task_id: &TaskId,
        failure: TaskFailure,
    ) -> Result<TransitionResult, CoreError> {
        self.transition::<S>(task_id, Transition::fail(failure))
            .await
    }

    /// Move a task to FINISHED.
    pub async fn complete<S: TaskService>(
        self: &Arc<Self>,
        task_id: &TaskId,
    ) -> Result<TransitionResult, CoreError> {
        self.transition::<S>(task_id, Transition::complete()).await
    }

    /// Fail a task of any registered kind.
    pub async fn fail(
        self: &Arc<Self>,
        task_id: &TaskId,
        failure: TaskFailure,
    ) -> Result<TransitionResult, CoreError> {
        let entry = self.entry_for(task_id).await?;
        entry.fail(self, task_id, failure, None).await
    }

    /// Cancel a task of any registered kind.
    #[instrument(skip(self))]
    pub async fn cancel(
        self: &Arc<Self>,
        task_id: &TaskId,
        reason: &str,
    ) -> Result<TransitionResult, CoreError> {
        let entry = self.entry_for(task_id).await?;
        entry.cancel(self, task_id, reason).await
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Deliver a callback response to a task of any registered kind.
    pub async fn deliver_callback(
        self: &Arc<Self>,
        task_id: &TaskId,
        response: ServiceTaskCallbackResponse,
    ) -> Result<TransitionResult, CoreError> {
        let entry = self.entry_for(task_id).await?;
        entry.deliver_callback(self, task_id, response).await
    }

    /// Issue a transition against the callback target. No-op when the
    /// callback is empty.
    pub async fn notify(
        self: &Arc<Self>,
        callback: &ServiceTaskCallback,
        response: ServiceTaskCallbackResponse,
    ) -> Result<NotifyOutcome, CoreError> {
        let Some(target) = &callback.target else {
            return Ok(NotifyOutcome::Skipped);
        };
        let result = self.deliver_callback(target, response).await?;
        Ok(NotifyOutcome::Delivered(result))
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Delete a task.
    ///
    /// A task that is not terminal yet is first cancelled with
    /// "Task deleted in stage X", which notifies its callback target. Pending
    /// deadlines are dropped and subscribers receive a deletion notification.
    #[instrument(skip(self))]
    pub async fn delete_task(
        self: &Arc<Self>,
        task_id: &TaskId,
    ) -> Result<Option<TaskRecord>, CoreError> {
        let Some(record) = self.store.get_task(task_id.as_str()).await? else {
            return Ok(None);
        };

        if !record.is_terminal() {
            let reason = format!("Task deleted in stage {}", record.stage);
            match self.cancel(task_id, &reason).await {
                Ok(_) | Err(CoreError::TaskTerminal { .. }) => {}
                Err(e) => warn!(task_id = %task_id, error = %e, "Failed to cancel task before delete"),
            }
        }

        let deleted = {
            let lock = self.lock_for(task_id).await;
            let _guard = lock.lock().await;
            self.store.delete_task(task_id.as_str()).await?
        };
        self.store.delete_scheduled_transitions(task_id.as_str()).await?;
        self.release_lock(task_id).await;

        if let Some(record) = &deleted {
            info!(task_id = %task_id, stage = %record.stage, version = record.version, "Task deleted");
            self.hub.publish(Notification::Deleted(record.clone())).await;
        }
        self.subscriptions.close_all_for(task_id).await;

        Ok(deleted)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Get a typed task document.
    pub async fn get_task<S: TaskService>(
        &self,
        task_id: &TaskId,
    ) -> Result<Option<DocumentOf<S>>, CoreError> {
        match self.store.get_task(task_id.as_str()).await? {
            Some(record) if record.kind != S::KIND => Err(CoreError::KindMismatch {
                task_id: task_id.to_string(),
                expected: S::KIND.to_string(),
                actual: record.kind,
            }),
            Some(record) => DocumentOf::<S>::from_record(&record).map(Some),
            None => Ok(None),
        }
    }

    /// Get the raw stored record of a task.
    pub async fn get_record(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, CoreError> {
        self.store.get_task(task_id.as_str()).await
    }

    /// Progress view of a task.
    pub async fn task_status(&self, task_id: &TaskId) -> Result<Option<TaskStatus>, CoreError> {
        let Some(record) = self.store.get_task(task_id.as_str()).await? else {
            return Ok(None);
        };
        let entry = self.entry_for_kind(&record.kind)?;
        entry.status(&record).map(Some)
    }

    /// List tasks, newest first.
    pub async fn list_tasks(
        &self,
        filter: &ListTasksFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskRecord>, CoreError> {
        self.store.list_tasks(filter, limit, offset).await
    }

    /// Audit log of a task, oldest first.
    pub async fn list_transition_events(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<TransitionEventRecord>, CoreError> {
        self.store.list_transition_events(task_id.as_str()).await
    }

    /// Receive every later persisted version and the deletion of a task.
    ///
    /// The channel is released once every receiver of it is dropped.
    pub async fn subscribe_changes(&self, task_id: &TaskId) -> broadcast::Receiver<Notification> {
        self.hub.subscribe(task_id.as_str()).await
    }

    // ========================================================================
    // Deadlines
    // ========================================================================

    /// Fail the task after `delay` if it is still in `guard_sub_stage` then.
    pub async fn schedule_deadline(
        &self,
        task_id: &TaskId,
        guard_sub_stage: &str,
        delay: Duration,
        reason: &str,
    ) -> Result<String, CoreError> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| CoreError::validation("delay", e.to_string()))?;
        let now = Utc::now();
        let entry = ScheduledTransitionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            guard_sub_stage: guard_sub_stage.to_string(),
            reason: reason.to_string(),
            due_at: now + delay,
            created_at: now,
        };
        self.store.schedule_transition(&entry).await?;

        debug!(
            task_id = %task_id,
            guard_sub_stage,
            due_at = %entry.due_at,
            "Deadline scheduled"
        );
        Ok(entry.id)
    }

    /// Fire one due deadline. Returns whether the task was failed.
    pub async fn fire_deadline(
        self: &Arc<Self>,
        entry: &ScheduledTransitionRecord,
    ) -> Result<bool, CoreError> {
        let task_id = TaskId::new(entry.task_id.clone());
        let Some(record) = self.store.get_task(task_id.as_str()).await? else {
            return Ok(false);
        };
        if record.is_terminal() {
            return Ok(false);
        }

        let entry_service = self.entry_for_kind(&record.kind)?;
        let failure = TaskFailure {
            message: format!(
                "Task deadline exceeded in sub-stage {}",
                entry.guard_sub_stage
            ),
            cause: Some(entry.reason.clone()),
            error_code: None,
        };
        let result = entry_service
            .fail(self, &task_id, failure, Some(&entry.guard_sub_stage))
            .await?;

        if result.is_applied() {
            info!(task_id = %task_id, guard_sub_stage = %entry.guard_sub_stage, "Deadline exceeded, task failed");
        }
        Ok(result.is_applied())
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Re-dispatch every CREATED and STARTED task, so handlers resume after a
    /// restart, and every terminal task whose terminal protocol did not
    /// complete. Returns the number of dispatched tasks.
    ///
    /// Every page is read before anything is dispatched, since dispatching
    /// moves tasks between the listed sets.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, CoreError> {
        let mut pending = Vec::new();
        for stage in [TaskStage::Created, TaskStage::Started] {
            let filter = ListTasksFilter {
                kind: None,
                stage: Some(stage),
            };
            let mut offset = 0;
            loop {
                let page = self
                    .store
                    .list_tasks(&filter, RECOVERY_PAGE_SIZE, offset)
                    .await?;
                let count = page.len();
                pending.extend(page);
                if (count as i64) < RECOVERY_PAGE_SIZE {
                    break;
                }
                offset += RECOVERY_PAGE_SIZE;
            }
        }
        let in_flight = pending.len();

        let mut offset = 0;
        loop {
            let page = self
                .store
                .list_unfinalized_terminal(RECOVERY_PAGE_SIZE, offset)
                .await?;
            let count = page.len();
            pending.extend(page);
            if (count as i64) < RECOVERY_PAGE_SIZE {
                break;
            }
            offset += RECOVERY_PAGE_SIZE;
        }

        let dispatched = pending.len();
        for record in pending {
            self.spawn_dispatch(record);
        }

        if dispatched > 0 {
            info!(
                in_flight,
                terminal = dispatched - in_flight,
                "Recovered tasks"
            );
        }
        Ok(dispatched)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    pub(crate) async fn is_current(&self, task_id: &TaskId, version: i64) -> bool {
        matches!(
            self.store.get_task(task_id.as_str()).await,
            Ok(Some(record)) if record.version == version
        )
    }

    fn service<S: TaskService>(&self) -> Result<Arc<S>, CoreError> {
        self.typed
            .get(S::KIND)
            .cloned()
            .and_then(|any| any.downcast::<S>().ok())
            .ok_or_else(|| CoreError::UnknownTaskKind {
                kind: S::KIND.to_string(),
            })
    }

    fn entry_for_kind(&self, kind: &str) -> Result<Arc<dyn RegisteredService>, CoreError> {
        self.services
            .get(kind)
            .cloned()
            .ok_or_else(|| CoreError::UnknownTaskKind {
                kind: kind.to_string(),
            })
    }

    async fn entry_for(&self, task_id: &TaskId) -> Result<Arc<dyn RegisteredService>, CoreError> {
        let record = self
            .store
            .get_task(task_id.as_str())
            .await?
            .ok_or_else(|| CoreError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        self.entry_for_kind(&record.kind)
    }

    async fn lock_for(&self, task_id: &TaskId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(task_id.to_string())
            .or_default()
            .clone()
    }

    /// Forget the lock of a document that takes no more writes. Writers
    /// already holding a clone finish on it; later ones get a fresh lock.
    async fn release_lock(&self, task_id: &TaskId) {
        self.locks.lock().await.remove(task_id.as_str());
    }

    #[cfg(test)]
    pub(crate) async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }

    async fn after_commit(self: &Arc<Self>, record: TaskRecord) {
        if let Err(e) = self
            .store
            .insert_transition_event(&TransitionEventRecord::for_record(&record))
            .await
        {
            warn!(task_id = %record.task_id, error = %e, "Failed to append transition event");
        }
        self.hub.publish(Notification::Updated(record.clone())).await;
        self.spawn_dispatch(record);
    }

    fn spawn_dispatch(self: &Arc<Self>, record: TaskRecord) {
        let Some(entry) = self.services.get(record.kind.as_str()).cloned() else {
            warn!(task_id = %record.task_id, kind = %record.kind, "No service registered for task kind");
            return;
        };
        let engine = self.clone();
        tokio::spawn(async move {
            entry.dispatch(engine, record).await;
        });
    }
}
