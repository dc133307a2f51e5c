// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler-side view of the engine.
//!
//! Every handler invocation receives a [`TaskContext`] bound to the task
//! being dispatched. It is the only way a handler mutates its own document:
//! all methods issue self-transitions through the engine.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::callback::ServiceTaskCallback;
use crate::engine::{CreateTask, TaskEngine};
use crate::error::CoreError;
use crate::persistence::TaskRecord;
use crate::service::{DocumentOf, TaskService};
use crate::subscription::{Notification, SubscriptionHandle};
use crate::task::{SubStage, TaskFailure, TaskId, TaskStage};
use crate::transition::{Transition, TransitionResult};

/// Terminal state of a watched task, as seen by a waiting workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedOutcome {
    /// The watched task.
    pub task_id: TaskId,
    /// Terminal stage. A task deleted before terminating counts as CANCELLED.
    pub stage: TaskStage,
    /// Failure recorded on the watched task, if any.
    pub failure: Option<TaskFailure>,
    /// Whether the watched task no longer exists.
    pub deleted: bool,
}

impl WatchedOutcome {
    /// Build the outcome for a final notification, `None` otherwise.
    pub fn from_notification(notification: &Notification) -> Option<Self> {
        match notification {
            Notification::Updated(record) if record.is_terminal() => {
                Some(Self::from_record(record, false))
            }
            Notification::Updated(_) => None,
            Notification::Deleted(record) => Some(Self::from_record(record, true)),
            Notification::Missing(id) => Some(Self {
                task_id: id.clone(),
                stage: TaskStage::Cancelled,
                failure: Some(TaskFailure::new("Watched task does not exist")),
                deleted: true,
            }),
        }
    }

    fn from_record(record: &TaskRecord, deleted: bool) -> Self {
        let stage = record
            .task_stage()
            .filter(|stage| stage.is_terminal())
            .unwrap_or(TaskStage::Cancelled);
        Self {
            task_id: TaskId::new(record.task_id.clone()),
            stage,
            failure: recorded_failure(record),
            deleted,
        }
    }

    /// Whether the watched task finished successfully.
    pub fn is_success(&self) -> bool {
        self.stage == TaskStage::Finished
    }
}

fn recorded_failure(record: &TaskRecord) -> Option<TaskFailure> {
    let body: serde_json::Value = serde_json::from_str(&record.body).ok()?;
    let failure = body.get("task_info")?.get("failure")?.clone();
    serde_json::from_value(failure).ok()
}

/// Engine access for one dispatched task.
pub struct TaskContext<S: TaskService> {
    engine: Arc<TaskEngine>,
    task_id: TaskId,
    _service: PhantomData<fn() -> S>,
}

impl<S: TaskService> std::fmt::Debug for TaskContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("kind", &S::KIND)
            .field("task_id", &self.task_id)
            .finish()
    }
}

impl<S: TaskService> TaskContext<S> {
    /// Bind a context to `task_id`.
    pub fn new(engine: Arc<TaskEngine>, task_id: TaskId) -> Self {
        Self {
            engine,
            task_id,
            _service: PhantomData,
        }
    }

    /// The task this context belongs to.
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// The engine.
    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    /// Self-transition to STARTED with `sub_stage`.
    pub async fn proceed_to(&self, sub_stage: S::SubStage) -> Result<TransitionResult, CoreError> {
        self.transition(Transition::proceed(sub_stage)).await
    }

    /// Self-transition to STARTED with `sub_stage`, mutating the fields.
    pub async fn proceed_with(
        &self,
        sub_stage: S::SubStage,
        mutator: impl Fn(&mut S::Fields) + Send + Sync + 'static,
    ) -> Result<TransitionResult, CoreError> {
        self.transition(Transition::proceed(sub_stage).with_mutator(mutator))
            .await
    }

    /// Self-transition to FINISHED.
    pub async fn complete(&self) -> Result<TransitionResult, CoreError> {
        self.transition(Transition::complete()).await
    }

    /// Self-transition to FINISHED, mutating the fields.
    pub async fn complete_with(
        &self,
        mutator: impl Fn(&mut S::Fields) + Send + Sync + 'static,
    ) -> Result<TransitionResult, CoreError> {
        self.transition(Transition::complete().with_mutator(mutator))
            .await
    }

    /// Self-transition to FAILED with `message`.
    pub async fn fail_task(&self, message: impl Into<String>) -> Result<TransitionResult, CoreError> {
        self.fail_with(TaskFailure::new(message)).await
    }

    /// Self-transition to FAILED with a structured failure.
    pub async fn fail_with(&self, failure: TaskFailure) -> Result<TransitionResult, CoreError> {
        self.transition(Transition::fail(failure)).await
    }

    /// Self-transition to CANCELLED.
    pub async fn cancel(&self, reason: impl Into<String>) -> Result<TransitionResult, CoreError> {
        self.transition(Transition::cancel(reason)).await
    }

    /// Apply an arbitrary self-transition.
    pub async fn transition(
        &self,
        transition: Transition<S::SubStage, S::Fields>,
    ) -> Result<TransitionResult, CoreError> {
        self.engine.transition::<S>(&self.task_id, transition).await
    }

    /// Callback pointing back at this task.
    pub fn callback_to_self(&self) -> ServiceTaskCallback {
        ServiceTaskCallback::create(self.task_id.clone())
    }

    /// Create a child task of service `C`.
    pub async fn create_child<C: TaskService>(
        &self,
        request: CreateTask<C::Fields>,
    ) -> Result<DocumentOf<C>, CoreError> {
        self.engine.create::<C>(request).await
    }

    /// Return the child with identity `child_id`, creating it from `build`
    /// when it does not exist yet.
    ///
    /// Handlers re-run after a restart, so children are addressed by a
    /// deterministic identity and created only once.
    pub async fn ensure_child<C: TaskService>(
        &self,
        child_id: &TaskId,
        build: impl FnOnce() -> CreateTask<C::Fields> + Send,
    ) -> Result<DocumentOf<C>, CoreError> {
        if let Some(existing) = self.engine.get_task::<C>(child_id).await? {
            debug!(task_id = %self.task_id, child_id = %child_id, "Child task already exists");
            return Ok(existing);
        }

        let request = build().with_id(child_id.clone());
        match self.engine.create::<C>(request).await {
            Err(CoreError::TaskAlreadyExists { .. }) => self
                .engine
                .get_task::<C>(child_id)
                .await?
                .ok_or_else(|| CoreError::TaskNotFound {
                    task_id: child_id.to_string(),
                }),
            other => other,
        }
    }

    /// Fail this task after `delay` if it is still in `guard` then.
    pub async fn schedule_deadline(
        &self,
        delay: Duration,
        guard: S::SubStage,
        reason: &str,
    ) -> Result<String, CoreError> {
        self.engine
            .schedule_deadline(&self.task_id, guard.as_str(), delay, reason)
            .await
    }

    /// Suspend until `watched` reaches a terminal stage or disappears, then
    /// self-transition to STARTED with `resume_at`, letting `merge` record
    /// the outcome in the fields.
    ///
    /// Non-final notifications are ignored. The continuation fires at most
    /// once per subscription. A continuation that keeps conflicting fails
    /// this task.
    pub async fn await_terminal(
        &self,
        watched: &TaskId,
        resume_at: S::SubStage,
        merge: impl Fn(&mut S::Fields, &WatchedOutcome) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let engine = self.engine.clone();
        let watcher = self.task_id.clone();
        let merge = Arc::new(merge);

        self.engine
            .subscriptions()
            .subscribe(&self.task_id, watched, move |handle, notification| {
                let engine = engine.clone();
                let watcher = watcher.clone();
                let merge = merge.clone();
                async move {
                    let Some(outcome) = WatchedOutcome::from_notification(&notification) else {
                        return;
                    };
                    if !handle.close() {
                        return;
                    }

                    debug!(
                        watcher = %watcher,
                        watched = %outcome.task_id,
                        stage = %outcome.stage,
                        deleted = outcome.deleted,
                        "Watched task reached a final state, resuming"
                    );

                    let transition = Transition::proceed(resume_at)
                        .with_mutator(move |fields: &mut S::Fields| (*merge)(fields, &outcome));
                    match engine.transition::<S>(&watcher, transition).await {
                        Ok(_) => {}
                        Err(CoreError::Conflict { attempts, .. }) => {
                            warn!(watcher = %watcher, attempts, "Continuation kept conflicting, failing task");
                            let failure = TaskFailure {
                                message: "Continuation could not be applied".to_string(),
                                cause: None,
                                error_code: Some("CONFLICT".to_string()),
                            };
                            if let Err(e) = engine.fail_task::<S>(&watcher, failure).await {
                                warn!(watcher = %watcher, error = %e, "Task could not be failed");
                            }
                        }
                        Err(e) => debug!(watcher = %watcher, error = %e, "Continuation not applied"),
                    }
                }
            })
            .await
    }
}
