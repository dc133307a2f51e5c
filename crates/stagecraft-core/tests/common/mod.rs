// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stagecraft-core integration tests.
//!
//! Provides small task services exercising the engine and helpers for
//! waiting on asynchronous dispatch.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use stagecraft_core::callback::ServiceTaskCallbackResponse;
use stagecraft_core::context::WatchedOutcome;
use stagecraft_core::engine::{CreateTask, TaskEngine};
use stagecraft_core::error::{CoreError, WorkflowError};
use stagecraft_core::persistence::{MemoryStore, TaskRecord, TaskStore};
use stagecraft_core::service::{DocumentOf, TaskService};
use stagecraft_core::task::{SubStage, TaskId, TaskStage};
use stagecraft_core::{TaskContext, sub_stages};

pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Manual: does nothing on its own, tests drive every transition
// ============================================================================

sub_stages! {
    pub enum ManualSubStage {
        Created => "CREATED",
        StepOne => "STEP_ONE",
        StepTwo => "STEP_TWO",
        Completed => "COMPLETED",
        Error => "ERROR",
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualFields {
    pub counter: u32,
    pub note: Option<String>,
}

pub struct ManualService;

#[async_trait]
impl TaskService for ManualService {
    type SubStage = ManualSubStage;
    type Fields = ManualFields;
    const KIND: &'static str = "manual";

    fn display_name(&self) -> &str {
        "Manual task"
    }

    async fn handle(
        &self,
        _ctx: &TaskContext<Self>,
        _state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError> {
        Ok(())
    }

    fn merge_callback(&self, fields: &mut ManualFields, response: &ServiceTaskCallbackResponse) {
        if let Some(note) = response.payload.as_ref().and_then(|p| p.as_str()) {
            fields.note = Some(note.to_string());
        }
    }
}

// ============================================================================
// Copy: runs CREATED -> COPYING -> VERIFYING -> FINISHED on its own
// ============================================================================

sub_stages! {
    pub enum CopySubStage {
        Created => "CREATED",
        Copying => "COPYING",
        Verifying => "VERIFYING",
        Completed => "COMPLETED",
        Error => "ERROR",
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CopyFields {
    pub items: u32,
    pub copied: u32,
    pub fail_in: Option<String>,
}

pub struct CopyService;

#[async_trait]
impl TaskService for CopyService {
    type SubStage = CopySubStage;
    type Fields = CopyFields;
    const KIND: &'static str = "copy";

    fn validate(&self, fields: &CopyFields) -> Result<(), CoreError> {
        if fields.items == 0 {
            return Err(CoreError::validation("items", "must be positive"));
        }
        Ok(())
    }

    async fn handle(
        &self,
        ctx: &TaskContext<Self>,
        state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError> {
        if state.fields.fail_in.as_deref() == Some(state.sub_stage.as_str()) {
            return Err(WorkflowError::with_cause("Copy failed", "disk full"));
        }

        match state.sub_stage {
            CopySubStage::Created => {
                ctx.proceed_to(CopySubStage::Copying).await?;
            }
            CopySubStage::Copying => {
                let items = state.fields.items;
                ctx.proceed_with(CopySubStage::Verifying, move |f| f.copied = items)
                    .await?;
            }
            CopySubStage::Verifying => {
                ctx.complete().await?;
            }
            CopySubStage::Completed | CopySubStage::Error => {}
        }
        Ok(())
    }

    fn finished_payload(&self, state: &DocumentOf<Self>) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "copied": state.fields.copied }))
    }
}

// ============================================================================
// Parent: delegates to a copy child and resumes through its callback
// ============================================================================

sub_stages! {
    pub enum ParentSubStage {
        Created => "CREATED",
        WaitingChild => "WAITING_CHILD",
        ChildDone => "CHILD_DONE",
        Completed => "COMPLETED",
        Error => "ERROR",
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParentFields {
    pub items: u32,
    pub child_fail_in: Option<String>,
    pub child_payload: Option<serde_json::Value>,
}

pub struct ParentService;

#[async_trait]
impl TaskService for ParentService {
    type SubStage = ParentSubStage;
    type Fields = ParentFields;
    const KIND: &'static str = "parent";

    async fn handle(
        &self,
        ctx: &TaskContext<Self>,
        state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError> {
        match state.sub_stage {
            ParentSubStage::Created => {
                ctx.proceed_to(ParentSubStage::WaitingChild).await?;
            }
            ParentSubStage::WaitingChild => {
                let fields = CopyFields {
                    items: state.fields.items,
                    copied: 0,
                    fail_in: state.fields.child_fail_in.clone(),
                };
                let callback = ctx.callback_to_self().on_success_to("CHILD_DONE");
                ctx.ensure_child::<CopyService>(&child_of(&state.id), move || {
                    CreateTask::new(fields).with_callback(callback)
                })
                .await?;
            }
            ParentSubStage::ChildDone => {
                ctx.complete().await?;
            }
            ParentSubStage::Completed | ParentSubStage::Error => {}
        }
        Ok(())
    }

    fn merge_callback(&self, fields: &mut ParentFields, response: &ServiceTaskCallbackResponse) {
        fields.child_payload = response.payload.clone();
    }
}

pub fn child_of(parent: &TaskId) -> TaskId {
    parent.child("copy")
}

// ============================================================================
// Watcher: waits for another task through a subscription
// ============================================================================

sub_stages! {
    pub enum WatcherSubStage {
        Created => "CREATED",
        Waiting => "WAITING",
        Resumed => "RESUMED",
        Completed => "COMPLETED",
        Error => "ERROR",
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatcherFields {
    pub watched: String,
    pub outcome: Option<TaskStage>,
    pub outcome_failure: Option<String>,
}

pub struct WatcherService;

#[async_trait]
impl TaskService for WatcherService {
    type SubStage = WatcherSubStage;
    type Fields = WatcherFields;
    const KIND: &'static str = "watcher";

    async fn handle(
        &self,
        ctx: &TaskContext<Self>,
        state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError> {
        match state.sub_stage {
            WatcherSubStage::Created => {
                ctx.proceed_to(WatcherSubStage::Waiting).await?;
            }
            WatcherSubStage::Waiting => {
                let watched = TaskId::new(state.fields.watched.clone());
                ctx.await_terminal(
                    &watched,
                    WatcherSubStage::Resumed,
                    |fields, outcome: &WatchedOutcome| {
                        fields.outcome = Some(outcome.stage);
                        fields.outcome_failure =
                            outcome.failure.as_ref().map(|f| f.message.clone());
                    },
                )
                .await;
            }
            WatcherSubStage::Resumed => {
                ctx.complete().await?;
            }
            WatcherSubStage::Completed | WatcherSubStage::Error => {}
        }
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Engine over a fresh memory store with every test service registered.
pub fn engine() -> (Arc<TaskEngine>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with_store(store.clone());
    (engine, store)
}

pub fn engine_with_store(store: Arc<dyn TaskStore>) -> Arc<TaskEngine> {
    TaskEngine::builder()
        .store(store)
        .register(ManualService)
        .register(CopyService)
        .register(ParentService)
        .register(WatcherService)
        .direct_timeout(WAIT)
        .build()
        .expect("engine should build")
}

/// Poll the store until `check` holds for the task record.
pub async fn wait_for(
    engine: &TaskEngine,
    task_id: &TaskId,
    check: impl Fn(Option<&TaskRecord>) -> bool,
) -> Option<TaskRecord> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let record = engine.get_record(task_id).await.expect("store read failed");
        if check(record.as_ref()) {
            return record;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting on task {task_id}, last state: {record:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the task reaches `stage`.
pub async fn wait_for_stage(engine: &TaskEngine, task_id: &TaskId, stage: TaskStage) -> TaskRecord {
    wait_for(engine, task_id, |r| {
        r.is_some_and(|r| r.task_stage() == Some(stage))
    })
    .await
    .expect("record present")
}

/// Wait until the task is gone.
pub async fn wait_for_deletion(engine: &TaskEngine, task_id: &TaskId) {
    wait_for(engine, task_id, |r| r.is_none()).await;
}
