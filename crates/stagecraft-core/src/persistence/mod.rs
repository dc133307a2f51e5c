// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for stagecraft-core.
//!
//! The engine only talks to a [`TaskStore`]. Two backends ship with the crate:
//! [`SqliteStore`] for durable deployments and [`MemoryStore`] for tests and
//! embedding. Both enforce compare-and-swap on the document version.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::task::TaskStage;

/// Task row from the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TaskRecord {
    /// Task identity.
    pub task_id: String,
    /// Kind of the owning task service.
    pub kind: String,
    /// Document version; the compare-and-swap key.
    pub version: i64,
    /// Stage string (CREATED, STARTED, ...).
    pub stage: String,
    /// Substage string.
    pub sub_stage: String,
    /// Full JSON document.
    pub body: String,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the last transition was applied.
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Parsed stage column.
    pub fn task_stage(&self) -> Option<TaskStage> {
        TaskStage::parse(&self.stage)
    }

    /// Whether the stored stage is terminal.
    pub fn is_terminal(&self) -> bool {
        self.task_stage().is_some_and(|s| s.is_terminal())
    }
}

/// One persisted version of a task, for auditing.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TransitionEventRecord {
    /// Database primary key (None when inserting).
    #[sqlx(default)]
    pub id: Option<i64>,
    /// Task identity.
    pub task_id: String,
    /// Version written.
    pub version: i64,
    /// Stage at that version.
    pub stage: String,
    /// Substage at that version.
    pub sub_stage: String,
    /// When the version was written.
    pub created_at: DateTime<Utc>,
}

impl TransitionEventRecord {
    /// Event describing `record` as just written.
    pub fn for_record(record: &TaskRecord) -> Self {
        Self {
            id: None,
            task_id: record.task_id.clone(),
            version: record.version,
            stage: record.stage.clone(),
            sub_stage: record.sub_stage.clone(),
            created_at: record.updated_at,
        }
    }
}

/// Delayed failing transition (a deadline).
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ScheduledTransitionRecord {
    /// Unique id of the scheduled entry.
    pub id: String,
    /// Task to fail.
    pub task_id: String,
    /// The task is failed only if it is still in this substage.
    pub guard_sub_stage: String,
    /// Why the deadline was set, for logs.
    pub reason: String,
    /// When the deadline fires.
    pub due_at: DateTime<Utc>,
    /// When the deadline was scheduled.
    pub created_at: DateTime<Utc>,
}

/// Filter options for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct ListTasksFilter {
    /// Only tasks of this kind.
    pub kind: Option<String>,
    /// Only tasks in this stage.
    pub stage: Option<TaskStage>,
}

/// Storage for task documents.
///
/// Implementations must make [`update_task_if_version`](Self::update_task_if_version)
/// atomic: the write happens only if the stored version still equals the
/// expected one.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ========================================================================
    // Task documents
    // ========================================================================

    /// Insert a new task. Fails with [`CoreError::TaskAlreadyExists`] on a
    /// duplicate identity.
    async fn insert_task(&self, record: &TaskRecord) -> Result<(), CoreError>;

    /// Get a task by identity.
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError>;

    /// Replace a task if its stored version is `expected_version`.
    ///
    /// Returns `false` when the version moved on (or the task is gone).
    async fn update_task_if_version(
        &self,
        record: &TaskRecord,
        expected_version: i64,
    ) -> Result<bool, CoreError>;

    /// Delete a task, returning the deleted row.
    async fn delete_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError>;

    /// List tasks, newest first.
    async fn list_tasks(
        &self,
        filter: &ListTasksFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskRecord>, CoreError>;

    /// Check database connectivity.
    async fn health_check_db(&self) -> Result<bool, CoreError>;

    // ========================================================================
    // Terminal protocol
    // ========================================================================

    /// Record that the terminal protocol (subscription close, callback
    /// notification) completed for `version` of a task.
    ///
    /// Returns `false` when the task is gone or at another version.
    async fn mark_finalized(&self, task_id: &str, version: i64) -> Result<bool, CoreError>;

    /// List terminal tasks whose terminal protocol has not completed yet,
    /// oldest first.
    async fn list_unfinalized_terminal(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskRecord>, CoreError>;

    // ========================================================================
    // Deadlines
    // ========================================================================

    /// Store a delayed failing transition.
    async fn schedule_transition(&self, record: &ScheduledTransitionRecord)
    -> Result<(), CoreError>;

    /// Return up to `limit` entries due at or before `now`, oldest first.
    ///
    /// Entries stay stored until [`TaskStore::complete_scheduled_transition`]
    /// or [`TaskStore::reschedule_transition`] is called for them.
    async fn due_transitions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledTransitionRecord>, CoreError>;

    /// Remove one scheduled entry after it fired.
    async fn complete_scheduled_transition(&self, id: &str) -> Result<bool, CoreError>;

    /// Move one scheduled entry to a later due time.
    async fn reschedule_transition(
        &self,
        id: &str,
        due_at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Remove every scheduled entry of a task.
    async fn delete_scheduled_transitions(&self, task_id: &str) -> Result<u64, CoreError>;

    // ========================================================================
    // Transition audit log (optional - default implementations no-op)
    // ========================================================================

    /// Append an audit entry for a persisted version.
    async fn insert_transition_event(
        &self,
        _event: &TransitionEventRecord,
    ) -> Result<(), CoreError> {
        // Default: no-op
        Ok(())
    }

    /// List audit entries for a task, oldest first.
    async fn list_transition_events(
        &self,
        _task_id: &str,
    ) -> Result<Vec<TransitionEventRecord>, CoreError> {
        // Default: empty list
        Ok(vec![])
    }

    // ========================================================================
    // Data Retention / Cleanup (optional - default implementations no-op)
    // ========================================================================

    /// Get terminal task ids last updated before `older_than`, oldest first.
    async fn get_terminal_tasks_older_than(
        &self,
        _older_than: DateTime<Utc>,
        _limit: i64,
    ) -> Result<Vec<String>, CoreError> {
        // Default: empty list (no cleanup supported)
        Ok(vec![])
    }

    /// Delete tasks with their audit entries and deadlines.
    ///
    /// Returns the count of deleted tasks.
    async fn delete_tasks_batch(&self, _task_ids: &[String]) -> Result<u64, CoreError> {
        // Default: no-op (no deletion supported)
        Ok(0)
    }
}

/// Stage strings considered terminal by retention queries.
pub(crate) const TERMINAL_STAGES: [&str; 3] = ["FINISHED", "FAILED", "CANCELLED"];
