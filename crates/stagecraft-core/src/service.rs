// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task service contract.
//!
//! A workflow is a type implementing [`TaskService`]: it names its substage
//! enum and field type, and implements one handler with an exhaustive match
//! over its substages. The engine stores registered services behind the
//! type-erased [`RegisteredService`] so it can dispatch records of any kind.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::callback::ServiceTaskCallbackResponse;
use crate::context::TaskContext;
use crate::engine::TaskEngine;
use crate::error::{CoreError, WorkflowError};
use crate::persistence::TaskRecord;
use crate::task::{SubStage, TaskDocument, TaskFailure, TaskId, TaskStage, TaskStatus};
use crate::transition::{CANCELLATION_REASON, Transition, TransitionResult, UNEXPECTED_STATE};

/// Document type of a task service.
pub type DocumentOf<S> = TaskDocument<<S as TaskService>::SubStage, <S as TaskService>::Fields>;

/// Per-service behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskOptions {
    /// Delete the document once it reaches a terminal stage and its callback
    /// was notified.
    pub self_delete: bool,
}

/// A workflow plugged into the engine.
#[async_trait]
pub trait TaskService: Send + Sync + Sized + 'static {
    /// Ordered substages.
    type SubStage: SubStage;
    /// Workflow-specific document fields.
    type Fields: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static;

    /// Unique kind, stored with every document.
    const KIND: &'static str;

    /// Human-readable name, reported as the phase of a [`TaskStatus`].
    fn display_name(&self) -> &str {
        Self::KIND
    }

    /// Behaviour switches.
    fn options(&self) -> TaskOptions {
        TaskOptions::default()
    }

    /// Substages whose patches may arrive out of order.
    fn transient_sub_stages(&self) -> &'static [Self::SubStage] {
        &[]
    }

    /// Validate a create request. Runs before anything is persisted.
    fn validate(&self, _fields: &Self::Fields) -> Result<(), CoreError> {
        Ok(())
    }

    /// Run the handler for `state.sub_stage`.
    ///
    /// Called for every accepted change while the task is CREATED or STARTED,
    /// except STARTED(COMPLETED), which the engine moves to FINISHED itself.
    /// Handlers must be idempotent: after a restart the handler for the
    /// current substage runs again. Returning an error fails the task.
    async fn handle(
        &self,
        ctx: &TaskContext<Self>,
        state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError>;

    /// Merge a child's callback into this task's fields.
    fn merge_callback(&self, _fields: &mut Self::Fields, _response: &ServiceTaskCallbackResponse) {
    }

    /// Payload sent to the callback target when this task finishes.
    fn finished_payload(&self, _state: &DocumentOf<Self>) -> Option<serde_json::Value> {
        None
    }

    /// Properties sent to the callback target when this task finishes.
    fn callback_properties(&self, _state: &DocumentOf<Self>) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Type-erased view of a registered [`TaskService`].
#[async_trait]
pub(crate) trait RegisteredService: Send + Sync {
    /// Run the handler or the terminal-stage protocol for a persisted version.
    async fn dispatch(&self, engine: Arc<TaskEngine>, record: TaskRecord);

    /// Apply a callback response to a task of this kind.
    async fn deliver_callback(
        &self,
        engine: &Arc<TaskEngine>,
        task_id: &TaskId,
        response: ServiceTaskCallbackResponse,
    ) -> Result<TransitionResult, CoreError>;

    /// Fail a task of this kind, optionally only while it is in `guard`.
    async fn fail(
        &self,
        engine: &Arc<TaskEngine>,
        task_id: &TaskId,
        failure: TaskFailure,
        guard: Option<&str>,
    ) -> Result<TransitionResult, CoreError>;

    /// Cancel a task of this kind.
    async fn cancel(
        &self,
        engine: &Arc<TaskEngine>,
        task_id: &TaskId,
        reason: &str,
    ) -> Result<TransitionResult, CoreError>;

    /// Progress view of a record.
    fn status(&self, record: &TaskRecord) -> Result<TaskStatus, CoreError>;
}

pub(crate) struct ServiceEntry<S: TaskService> {
    service: Arc<S>,
}

impl<S: TaskService> ServiceEntry<S> {
    pub(crate) fn new(service: Arc<S>) -> Self {
        Self { service }
    }

    /// Notify the callback target of a terminal document. Returns `false`
    /// when the delivery failed and may succeed if repeated.
    async fn notify_callback(&self, engine: &Arc<TaskEngine>, doc: &DocumentOf<S>) -> bool {
        if doc.callback.is_empty() {
            return true;
        }

        let response = match doc.stage() {
            TaskStage::Finished => {
                let mut response = doc.callback.finished_response();
                response.payload = self.service.finished_payload(doc);
                response.custom_properties = self.service.callback_properties(doc);
                response
            }
            TaskStage::Failed => doc.callback.failed_response(
                doc.failure()
                    .cloned()
                    .unwrap_or_else(|| TaskFailure::new(UNEXPECTED_STATE)),
            ),
            TaskStage::Cancelled => {
                let reason = doc
                    .custom_property(CANCELLATION_REASON)
                    .unwrap_or("Task cancelled");
                doc.callback.failed_response(TaskFailure::new(reason))
            }
            TaskStage::Created | TaskStage::Started => return true,
        }
        .with_delivery_id(format!("{}:{}", doc.id, doc.version));

        match engine.notify(&doc.callback, response).await {
            Ok(outcome) => {
                debug!(
                    task_id = %doc.id,
                    target = ?doc.callback.target,
                    ?outcome,
                    "Callback target notified"
                );
                true
            }
            Err(e) => {
                warn!(
                    task_id = %doc.id,
                    target = ?doc.callback.target,
                    error = %e,
                    error_code = e.error_code(),
                    "Failed to notify callback target"
                );
                !e.is_retryable()
            }
        }
    }
}

#[async_trait]
impl<S: TaskService> RegisteredService for ServiceEntry<S> {
    async fn dispatch(&self, engine: Arc<TaskEngine>, record: TaskRecord) {
        let doc = match DocumentOf::<S>::from_record(&record) {
            Ok(doc) => doc,
            Err(e) => {
                error!(
                    task_id = %record.task_id,
                    kind = S::KIND,
                    version = record.version,
                    error = %e,
                    "Can't decode task document, leaving it for inspection"
                );
                return;
            }
        };

        match doc.stage() {
            TaskStage::Created | TaskStage::Started => {
                if !engine.is_current(&doc.id, doc.version).await {
                    debug!(
                        task_id = %doc.id,
                        version = doc.version,
                        "Skipping dispatch of superseded version"
                    );
                    return;
                }

                if doc.stage() == TaskStage::Started && doc.sub_stage == S::SubStage::COMPLETED {
                    debug!(task_id = %doc.id, version = doc.version, "Completing task in COMPLETED sub-stage");
                    let complete = Transition::complete().when_in(S::SubStage::COMPLETED);
                    if let Err(e) = engine.transition::<S>(&doc.id, complete).await {
                        warn!(task_id = %doc.id, error = %e, "Task could not be completed");
                    }
                    return;
                }

                debug!(
                    task_id = %doc.id,
                    kind = S::KIND,
                    stage = %doc.stage(),
                    sub_stage = doc.sub_stage.as_str(),
                    version = doc.version,
                    "Dispatching to sub-stage handler"
                );

                let ctx = TaskContext::<S>::new(engine.clone(), doc.id.clone());
                if let Err(err) = self.service.handle(&ctx, &doc).await {
                    warn!(
                        task_id = %doc.id,
                        sub_stage = doc.sub_stage.as_str(),
                        error = %err,
                        "Sub-stage handler failed, failing task"
                    );
                    if let Err(e) = engine.fail_task::<S>(&doc.id, err.to_failure()).await {
                        debug!(task_id = %doc.id, error = %e, "Task could not be failed");
                    }
                }
            }
            TaskStage::Finished | TaskStage::Failed | TaskStage::Cancelled => {
                engine.subscriptions().close_all_for(&doc.id).await;
                if !self.notify_callback(&engine, &doc).await {
                    // Left unfinalized, recovery repeats the protocol
                    return;
                }

                if self.service.options().self_delete {
                    match engine.delete_task(&doc.id).await {
                        Ok(_) => debug!(task_id = %doc.id, "Task self-deleted"),
                        Err(e) => warn!(task_id = %doc.id, error = %e, "Self-delete failed"),
                    }
                    return;
                }

                match engine.store().mark_finalized(doc.id.as_str(), doc.version).await {
                    Ok(_) => debug!(task_id = %doc.id, version = doc.version, "Task finalized"),
                    Err(e) => warn!(task_id = %doc.id, error = %e, "Failed to mark task finalized"),
                }
            }
        }
    }

    async fn deliver_callback(
        &self,
        engine: &Arc<TaskEngine>,
        task_id: &TaskId,
        response: ServiceTaskCallbackResponse,
    ) -> Result<TransitionResult, CoreError> {
        let sub_stage = S::SubStage::parse(&response.sub_stage).ok_or_else(|| {
            CoreError::InvalidTransition {
                task_id: task_id.to_string(),
                from: "-".to_string(),
                to: format!("{}({})", response.stage, response.sub_stage),
                reason: format!("'{}' has no such sub-stage", S::KIND),
            }
        })?;

        let service = self.service.clone();
        let properties = response.custom_properties.clone();
        let delivery_id = response.delivery_id.clone();
        let failure = response.failure.clone();
        let stage = response.stage;
        let response = Arc::new(response);

        let mut transition = Transition::to(stage, Some(sub_stage))
            .with_mutator(move |fields: &mut S::Fields| service.merge_callback(fields, &response))
            .with_properties(properties);
        transition.failure = failure;
        if let Some(delivery_id) = delivery_id {
            transition = transition.with_delivery_id(delivery_id);
        }

        engine.transition::<S>(task_id, transition).await
    }

    async fn fail(
        &self,
        engine: &Arc<TaskEngine>,
        task_id: &TaskId,
        failure: TaskFailure,
        guard: Option<&str>,
    ) -> Result<TransitionResult, CoreError> {
        let mut transition = Transition::fail(failure);
        if let Some(guard) = guard {
            let guard = S::SubStage::parse(guard)
                .ok_or_else(|| CoreError::validation("guard_sub_stage", guard.to_string()))?;
            transition = transition.when_in(guard);
        }
        engine.transition::<S>(task_id, transition).await
    }

    async fn cancel(
        &self,
        engine: &Arc<TaskEngine>,
        task_id: &TaskId,
        reason: &str,
    ) -> Result<TransitionResult, CoreError> {
        engine
            .transition::<S>(task_id, Transition::cancel(reason))
            .await
    }

    fn status(&self, record: &TaskRecord) -> Result<TaskStatus, CoreError> {
        let doc = DocumentOf::<S>::from_record(record)?;
        Ok(TaskStatus::from_document(
            &doc,
            self.service.display_name(),
        ))
    }
}
