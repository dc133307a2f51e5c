// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::CoreError;

use super::{
    ListTasksFilter, ScheduledTransitionRecord, TERMINAL_STAGES, TaskRecord, TaskStore,
    TransitionEventRecord,
};

/// SQLite-backed task store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Create a store from an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a sqlite URL (`sqlite:...`), creating the file if missing,
    /// and run migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Invalid SQLite URL {}: {}", url, e),
            })?
            .create_if_missing(true);

        // Every connection to an in-memory database is a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl TaskStore for SqliteStore {
    async fn insert_task(&self, record: &TaskRecord) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (task_id, kind, version, stage, sub_stage, body, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.task_id)
        .bind(&record.kind)
        .bind(record.version)
        .bind(&record.stage)
        .bind(&record.sub_stage)
        .bind(&record.body)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(CoreError::TaskAlreadyExists {
                    task_id: record.task_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError> {
        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT task_id, kind, version, stage, sub_stage, body, created_at, updated_at
            FROM tasks
            WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_task_if_version(
        &self,
        record: &TaskRecord,
        expected_version: i64,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET version = ?, stage = ?, sub_stage = ?, body = ?, updated_at = ?
            WHERE task_id = ? AND version = ?
            "#,
        )
        .bind(record.version)
        .bind(&record.stage)
        .bind(&record.sub_stage)
        .bind(&record.body)
        .bind(record.updated_at)
        .bind(&record.task_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError> {
        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            DELETE FROM tasks
            WHERE task_id = ?
            RETURNING task_id, kind, version, stage, sub_stage, body, created_at, updated_at
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_tasks(
        &self,
        filter: &ListTasksFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskRecord>, CoreError> {
        let records = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT task_id, kind, version, stage, sub_stage, body, created_at, updated_at
            FROM tasks
            WHERE (?1 IS NULL OR kind = ?1)
              AND (?2 IS NULL OR stage = ?2)
            ORDER BY created_at DESC, task_id ASC
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(filter.kind.as_deref())
        .bind(filter.stage.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }

    async fn mark_finalized(&self, task_id: &str, version: i64) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE tasks SET finalized = 1 WHERE task_id = ? AND version = ?")
            .bind(task_id)
            .bind(version)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_unfinalized_terminal(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskRecord>, CoreError> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT task_id, kind, version, stage, sub_stage, body, created_at, updated_at \
             FROM tasks WHERE finalized = 0 AND stage IN (",
        );
        let mut stages = query.separated(", ");
        for stage in TERMINAL_STAGES {
            stages.push_bind(stage);
        }
        stages.push_unseparated(") ORDER BY updated_at ASC, task_id ASC LIMIT ");
        query.push_bind(limit);
        query.push(" OFFSET ");
        query.push_bind(offset);

        let records = query
            .build_query_as::<TaskRecord>()
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn schedule_transition(
        &self,
        record: &ScheduledTransitionRecord,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_transitions (id, task_id, guard_sub_stage, reason, due_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.task_id)
        .bind(&record.guard_sub_stage)
        .bind(&record.reason)
        .bind(record.due_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn due_transitions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledTransitionRecord>, CoreError> {
        let due = sqlx::query_as::<_, ScheduledTransitionRecord>(
            r#"
            SELECT id, task_id, guard_sub_stage, reason, due_at, created_at
            FROM scheduled_transitions
            WHERE due_at <= ?
            ORDER BY due_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(due)
    }

    async fn complete_scheduled_transition(&self, id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM scheduled_transitions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reschedule_transition(
        &self,
        id: &str,
        due_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE scheduled_transitions SET due_at = ? WHERE id = ?")
            .bind(due_at)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_scheduled_transitions(&self, task_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM scheduled_transitions WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn insert_transition_event(&self, event: &TransitionEventRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO task_transition_events (task_id, version, stage, sub_stage, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.task_id)
        .bind(event.version)
        .bind(&event.stage)
        .bind(&event.sub_stage)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_transition_events(
        &self,
        task_id: &str,
    ) -> Result<Vec<TransitionEventRecord>, CoreError> {
        let events = sqlx::query_as::<_, TransitionEventRecord>(
            r#"
            SELECT id, task_id, version, stage, sub_stage, created_at
            FROM task_transition_events
            WHERE task_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn get_terminal_tasks_older_than(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT task_id
            FROM tasks
            WHERE stage IN (?, ?, ?)
              AND updated_at < ?
            ORDER BY updated_at ASC
            LIMIT ?
            "#,
        )
        .bind(TERMINAL_STAGES[0])
        .bind(TERMINAL_STAGES[1])
        .bind(TERMINAL_STAGES[2])
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn delete_tasks_batch(&self, task_ids: &[String]) -> Result<u64, CoreError> {
        if task_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        for table in ["task_transition_events", "scheduled_transitions"] {
            let mut query: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("DELETE FROM {} WHERE task_id IN (", table));
            let mut ids = query.separated(", ");
            for id in task_ids {
                ids.push_bind(id.as_str());
            }
            ids.push_unseparated(")");
            query.build().execute(&mut *tx).await?;
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM tasks WHERE task_id IN (");
        let mut ids = query.separated(", ");
        for id in task_ids {
            ids.push_bind(id.as_str());
        }
        ids.push_unseparated(")");
        let deleted = query.build().execute(&mut *tx).await?.rows_affected();

        tx.commit().await?;

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStage;
    use chrono::Duration;
    use uuid::Uuid;

    /// Create an in-memory SQLite pool for testing.
    async fn test_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        crate::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        SqliteStore::new(pool)
    }

    fn record(task_id: &str, stage: TaskStage, version: i64) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            task_id: task_id.to_string(),
            kind: "test-kind".to_string(),
            version,
            stage: stage.as_str().to_string(),
            sub_stage: "CREATED".to_string(),
            body: format!("{{\"id\":\"{}\"}}", task_id),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_task() {
        let store = test_store().await;
        let task_id = Uuid::new_v4().to_string();

        store
            .insert_task(&record(&task_id, TaskStage::Created, 1))
            .await
            .expect("Failed to insert task");

        let task = store
            .get_task(&task_id)
            .await
            .expect("Failed to get task")
            .expect("Task should exist");

        assert_eq!(task.task_id, task_id);
        assert_eq!(task.kind, "test-kind");
        assert_eq!(task.version, 1);
        assert_eq!(task.task_stage(), Some(TaskStage::Created));
    }

    #[tokio::test]
    async fn test_get_task_not_found() {
        let store = test_store().await;
        let result = store
            .get_task("nonexistent")
            .await
            .expect("Query should succeed");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_insert_duplicate_task() {
        let store = test_store().await;
        store
            .insert_task(&record("dup", TaskStage::Created, 1))
            .await
            .unwrap();

        let err = store
            .insert_task(&record("dup", TaskStage::Created, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TaskAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_update_task_if_version() {
        let store = test_store().await;
        store
            .insert_task(&record("cas", TaskStage::Created, 1))
            .await
            .unwrap();

        let mut next = record("cas", TaskStage::Started, 2);
        next.sub_stage = "RUNNING".to_string();

        assert!(store.update_task_if_version(&next, 1).await.unwrap());
        // Second writer with the same expected version loses.
        assert!(!store.update_task_if_version(&next, 1).await.unwrap());

        let stored = store.get_task("cas").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.stage, "STARTED");
        assert_eq!(stored.sub_stage, "RUNNING");
    }

    #[tokio::test]
    async fn test_delete_task_returns_row() {
        let store = test_store().await;
        store
            .insert_task(&record("gone", TaskStage::Finished, 4))
            .await
            .unwrap();

        let deleted = store.delete_task("gone").await.unwrap().unwrap();
        assert_eq!(deleted.version, 4);
        assert!(store.get_task("gone").await.unwrap().is_none());
        assert!(store.delete_task("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_tasks() {
        let store = test_store().await;
        store
            .insert_task(&record("a", TaskStage::Started, 2))
            .await
            .unwrap();
        store
            .insert_task(&record("b", TaskStage::Finished, 4))
            .await
            .unwrap();
        let mut other = record("c", TaskStage::Started, 2);
        other.kind = "other-kind".to_string();
        store.insert_task(&other).await.unwrap();

        let started = store
            .list_tasks(
                &ListTasksFilter {
                    kind: Some("test-kind".to_string()),
                    stage: Some(TaskStage::Started),
                },
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].task_id, "a");

        let all = store
            .list_tasks(&ListTasksFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let page = store
            .list_tasks(&ListTasksFilter::default(), 2, 2)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_health_check_db() {
        let store = test_store().await;
        assert!(store.health_check_db().await.unwrap());
    }

    #[tokio::test]
    async fn test_transition_events() {
        let store = test_store().await;
        for version in 1..=3 {
            store
                .insert_transition_event(&TransitionEventRecord::for_record(&record(
                    "audited",
                    TaskStage::Started,
                    version,
                )))
                .await
                .unwrap();
        }

        let events = store.list_transition_events("audited").await.unwrap();
        let versions: Vec<i64> = events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert!(events.iter().all(|e| e.id.is_some()));
    }

    #[tokio::test]
    async fn test_scheduled_transitions() {
        let store = test_store().await;
        let now = Utc::now();

        for (id, offset_secs) in [("soon", -5), ("later", 300)] {
            store
                .schedule_transition(&ScheduledTransitionRecord {
                    id: id.to_string(),
                    task_id: "deadline-task".to_string(),
                    guard_sub_stage: "WAITING".to_string(),
                    reason: "connectivity check".to_string(),
                    due_at: now + Duration::seconds(offset_secs),
                    created_at: now,
                })
                .await
                .unwrap();
        }

        let due = store.due_transitions(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "soon");

        // Unfired entries stay due until completed or moved
        assert_eq!(store.due_transitions(now, 10).await.unwrap().len(), 1);
        assert!(
            store
                .reschedule_transition("soon", now + Duration::seconds(60))
                .await
                .unwrap()
        );
        assert!(store.due_transitions(now, 10).await.unwrap().is_empty());
        let due = store
            .due_transitions(now + Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert!(store.complete_scheduled_transition("soon").await.unwrap());
        assert!(!store.complete_scheduled_transition("soon").await.unwrap());

        assert_eq!(
            store
                .delete_scheduled_transitions("deadline-task")
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_unfinalized_terminal_tasks() {
        let store = test_store().await;
        store
            .insert_task(&record("running", TaskStage::Started, 2))
            .await
            .unwrap();
        store
            .insert_task(&record("done", TaskStage::Finished, 4))
            .await
            .unwrap();
        store
            .insert_task(&record("failed", TaskStage::Failed, 3))
            .await
            .unwrap();

        let pending: Vec<String> = store
            .list_unfinalized_terminal(10, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.task_id)
            .collect();
        assert_eq!(pending.len(), 2);
        assert!(!pending.contains(&"running".to_string()));

        // Only the terminal version is marked
        assert!(!store.mark_finalized("done", 3).await.unwrap());
        assert!(store.mark_finalized("done", 4).await.unwrap());

        let pending = store.list_unfinalized_terminal(10, 0).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, "failed");
    }

    #[tokio::test]
    async fn test_retention_batch_delete() {
        let store = test_store().await;
        let old = Utc::now() - Duration::days(2);

        let mut finished = record("old-finished", TaskStage::Finished, 4);
        finished.updated_at = old;
        let mut cancelled = record("old-cancelled", TaskStage::Cancelled, 3);
        cancelled.updated_at = old;
        let mut running = record("old-running", TaskStage::Started, 2);
        running.updated_at = old;
        let recent = record("recent-failed", TaskStage::Failed, 3);

        for r in [&finished, &cancelled, &running, &recent] {
            store.insert_task(r).await.unwrap();
            store
                .insert_transition_event(&TransitionEventRecord::for_record(r))
                .await
                .unwrap();
        }

        let cutoff = Utc::now() - Duration::days(1);
        let mut ids = store
            .get_terminal_tasks_older_than(cutoff, 10)
            .await
            .unwrap();
        ids.sort();
        assert_eq!(
            ids,
            vec!["old-cancelled".to_string(), "old-finished".to_string()]
        );

        let deleted = store.delete_tasks_batch(&ids).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get_task("old-finished").await.unwrap().is_none());
        assert!(store.get_task("old-running").await.unwrap().is_some());
        assert!(
            store
                .list_transition_events("old-finished")
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(store.delete_tasks_batch(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tasks.db");

        let store = SqliteStore::from_path(&path).await.unwrap();
        store
            .insert_task(&record("persisted", TaskStage::Created, 1))
            .await
            .unwrap();
        drop(store);

        let reopened = SqliteStore::from_path(&path).await.unwrap();
        assert!(reopened.get_task("persisted").await.unwrap().is_some());
    }
}
