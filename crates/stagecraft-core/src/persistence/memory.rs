// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence, for tests and embedding without a database.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::CoreError;

use super::{
    ListTasksFilter, ScheduledTransitionRecord, TERMINAL_STAGES, TaskRecord, TaskStore,
    TransitionEventRecord,
};

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<String, TaskRecord>,
    finalized: HashSet<String>,
    events: Vec<TransitionEventRecord>,
    scheduled: Vec<ScheduledTransitionRecord>,
    next_event_id: i64,
}

/// Task store keeping everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, record: &TaskRecord) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&record.task_id) {
            return Err(CoreError::TaskAlreadyExists {
                task_id: record.task_id.clone(),
            });
        }
        state.finalized.remove(&record.task_id);
        state.tasks.insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError> {
        Ok(self.state.lock().await.tasks.get(task_id).cloned())
    }

    async fn update_task_if_version(
        &self,
        record: &TaskRecord,
        expected_version: i64,
    ) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(&record.task_id) {
            Some(stored) if stored.version == expected_version => {
                *stored = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError> {
        let mut state = self.state.lock().await;
        state.finalized.remove(task_id);
        Ok(state.tasks.remove(task_id))
    }

    async fn list_tasks(
        &self,
        filter: &ListTasksFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskRecord>, CoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|r| filter.kind.as_ref().is_none_or(|k| &r.kind == k))
            .filter(|r| filter.stage.is_none_or(|s| r.stage == s.as_str()))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });

        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        Ok(true)
    }

    async fn mark_finalized(&self, task_id: &str, version: i64) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        if !state.tasks.get(task_id).is_some_and(|r| r.version == version) {
            return Ok(false);
        }
        state.finalized.insert(task_id.to_string());
        Ok(true)
    }

    async fn list_unfinalized_terminal(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskRecord>, CoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|r| TERMINAL_STAGES.contains(&r.stage.as_str()))
            .filter(|r| !state.finalized.contains(&r.task_id))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });

        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn schedule_transition(
        &self,
        record: &ScheduledTransitionRecord,
    ) -> Result<(), CoreError> {
        self.state.lock().await.scheduled.push(record.clone());
        Ok(())
    }

    async fn due_transitions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledTransitionRecord>, CoreError> {
        let state = self.state.lock().await;
        let mut due: Vec<ScheduledTransitionRecord> = state
            .scheduled
            .iter()
            .filter(|s| s.due_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.due_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn complete_scheduled_transition(&self, id: &str) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        let before = state.scheduled.len();
        state.scheduled.retain(|s| s.id != id);
        Ok(state.scheduled.len() < before)
    }

    async fn reschedule_transition(
        &self,
        id: &str,
        due_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        match state.scheduled.iter_mut().find(|s| s.id == id) {
            Some(entry) => {
                entry.due_at = due_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_scheduled_transitions(&self, task_id: &str) -> Result<u64, CoreError> {
        let mut state = self.state.lock().await;
        let before = state.scheduled.len();
        state.scheduled.retain(|s| s.task_id != task_id);
        Ok((before - state.scheduled.len()) as u64)
    }

    async fn insert_transition_event(&self, event: &TransitionEventRecord) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        state.next_event_id += 1;
        let mut event = event.clone();
        event.id = Some(state.next_event_id);
        state.events.push(event);
        Ok(())
    }

    async fn list_transition_events(
        &self,
        task_id: &str,
    ) -> Result<Vec<TransitionEventRecord>, CoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn get_terminal_tasks_older_than(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, CoreError> {
        let state = self.state.lock().await;
        let mut candidates: Vec<&TaskRecord> = state
            .tasks
            .values()
            .filter(|r| TERMINAL_STAGES.contains(&r.stage.as_str()) && r.updated_at < older_than)
            .collect();
        candidates.sort_by_key(|r| r.updated_at);

        Ok(candidates
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|r| r.task_id.clone())
            .collect())
    }

    async fn delete_tasks_batch(&self, task_ids: &[String]) -> Result<u64, CoreError> {
        let mut state = self.state.lock().await;
        let mut deleted = 0;
        for id in task_ids {
            state.finalized.remove(id);
            if state.tasks.remove(id).is_some() {
                deleted += 1;
            }
        }
        state.events.retain(|e| !task_ids.contains(&e.task_id));
        state.scheduled.retain(|s| !task_ids.contains(&s.task_id));
        Ok(deleted)
    }
}
