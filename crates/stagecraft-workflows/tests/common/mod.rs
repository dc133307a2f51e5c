// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stagecraft-workflows integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use stagecraft_core::engine::TaskEngine;
use stagecraft_core::error::WorkflowError;
use stagecraft_core::persistence::{MemoryStore, TaskRecord, TransitionEventRecord};
use stagecraft_core::service::{DocumentOf, TaskService};
use stagecraft_core::task::{TaskId, TaskStage};
use stagecraft_core::{TaskContext, sub_stages};
use stagecraft_workflows::endpoint::{
    Endpoint, EndpointAdapter, EndpointRegistry, InMemoryEndpointRegistry, InMemoryRoleRegistry,
};
use stagecraft_workflows::{Collaborators, register};

pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Leaf: a child the tests finish or fail by hand
// ============================================================================

sub_stages! {
    pub enum LeafSubStage {
        Created => "CREATED",
        Completed => "COMPLETED",
        Error => "ERROR",
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeafFields {}

pub struct LeafService;

#[async_trait]
impl TaskService for LeafService {
    type SubStage = LeafSubStage;
    type Fields = LeafFields;
    const KIND: &'static str = "leaf";

    async fn handle(
        &self,
        _ctx: &TaskContext<Self>,
        _state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError> {
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub engine: Arc<TaskEngine>,
    pub store: Arc<MemoryStore>,
    pub endpoints: Arc<InMemoryEndpointRegistry>,
    pub roles: Arc<InMemoryRoleRegistry>,
}

/// Engine with every workflow registered over in-memory collaborators.
pub fn harness(adapter: impl EndpointAdapter + 'static) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let endpoints = Arc::new(InMemoryEndpointRegistry::new());
    let roles = Arc::new(InMemoryRoleRegistry::new());
    let collaborators = Collaborators {
        endpoints: endpoints.clone(),
        adapter: Arc::new(adapter),
        roles: roles.clone(),
    };

    let engine = register(TaskEngine::builder().store(store.clone()), &collaborators)
        .register(LeafService)
        .direct_timeout(WAIT)
        .build()
        .expect("engine should build");

    Harness {
        engine,
        store,
        endpoints,
        roles,
    }
}

impl Harness {
    /// Register an endpoint directly in the registry.
    pub async fn seed_endpoint(&self, id: &str) -> Endpoint {
        let mut properties = BTreeMap::new();
        properties.insert("access_key".to_string(), "AKIA".to_string());
        self.endpoints
            .upsert_endpoint(Endpoint {
                id: id.to_string(),
                endpoint_type: "aws".to_string(),
                name: format!("{id} endpoint"),
                properties,
                compute_id: format!("{id}-compute"),
            })
            .await
            .expect("seed endpoint")
    }

    pub async fn positions(&self, task_id: &TaskId) -> Vec<String> {
        positions(
            &self
                .engine
                .list_transition_events(task_id)
                .await
                .expect("events"),
        )
    }
}

pub fn positions(events: &[TransitionEventRecord]) -> Vec<String> {
    events
        .iter()
        .map(|e| format!("{}({})", e.stage, e.sub_stage))
        .collect()
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
