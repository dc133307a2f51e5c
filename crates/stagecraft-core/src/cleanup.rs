// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker deleting old terminal tasks.
//!
//! Tasks that are FINISHED, FAILED or CANCELLED and were last updated before
//! the retention period are deleted in batches, together with their
//! transition events and scheduled deadlines. Self-deleting services never
//! leave documents behind, so this only affects tasks kept for inspection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::{CoreError, Result};
use crate::persistence::TaskStore;

/// Configuration for the retention worker.
#[derive(Debug, Clone)]
pub struct RetentionWorkerConfig {
    /// Whether retention is enabled.
    pub enabled: bool,
    /// How often to run retention.
    pub poll_interval: Duration,
    /// Maximum age of terminal tasks before deletion.
    pub max_age: Duration,
    /// Maximum tasks to delete per batch.
    pub batch_size: i64,
}

impl Default for RetentionWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(24 * 3600),
            batch_size: 100,
        }
    }
}

impl RetentionWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STAGECRAFT_RETENTION_ENABLED`: "true" or "1" to enable (default: false)
    /// - `STAGECRAFT_RETENTION_POLL_INTERVAL_SECS`: seconds between runs (default: 3600)
    /// - `STAGECRAFT_RETENTION_MAX_AGE_SECS`: age before terminal tasks are deleted (default: 86400)
    /// - `STAGECRAFT_RETENTION_BATCH_SIZE`: max tasks per batch (default: 100)
    pub fn from_env() -> Self {
        let enabled = std::env::var("STAGECRAFT_RETENTION_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let poll_interval_secs = std::env::var("STAGECRAFT_RETENTION_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let max_age_secs = std::env::var("STAGECRAFT_RETENTION_MAX_AGE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(24 * 3600);

        let batch_size = std::env::var("STAGECRAFT_RETENTION_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_age: Duration::from_secs(max_age_secs),
            batch_size,
        }
    }
}

/// Background worker that deletes old terminal tasks.
pub struct RetentionWorker {
    store: Arc<dyn TaskStore>,
    config: RetentionWorkerConfig,
    shutdown: Arc<Notify>,
}

impl RetentionWorker {
    /// Create a new retention worker.
    pub fn new(store: Arc<dyn TaskStore>, config: RetentionWorkerConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the retention loop until shutdown is signalled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Retention worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_secs = self.config.max_age.as_secs(),
            batch_size = self.config.batch_size,
            "Retention worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Retention worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.cleanup_old_tasks().await {
                        error!(error = %e, "Failed to clean up old tasks");
                    }
                }
            }
        }

        info!("Retention worker stopped");
    }

    /// Delete terminal tasks older than the retention period.
    /// Returns the number of deleted tasks.
    pub async fn cleanup_old_tasks(&self) -> Result<u64> {
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .map_err(|e| CoreError::validation("max_age", e.to_string()))?;
        let cutoff = Utc::now() - max_age;

        let mut total_deleted = 0u64;

        loop {
            let task_ids = self
                .store
                .get_terminal_tasks_older_than(cutoff, self.config.batch_size)
                .await?;

            if task_ids.is_empty() {
                break;
            }

            let batch_size = task_ids.len();
            let deleted = self.store.delete_tasks_batch(&task_ids).await?;
            total_deleted += deleted;

            debug!(
                batch_size,
                deleted,
                total_deleted,
                "Deleted batch of terminal tasks"
            );

            // A store without batch deletion would return the same ids forever
            if deleted == 0 || batch_size < self.config.batch_size as usize {
                break;
            }
        }

        if total_deleted > 0 {
            info!(total_deleted, cutoff = %cutoff, "Retention cycle completed");
        } else {
            debug!("Retention cycle completed, no old tasks found");
        }

        Ok(total_deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryStore, TaskRecord};

    fn record(id: &str, stage: &str, age: chrono::Duration) -> TaskRecord {
        let at = Utc::now() - age;
        TaskRecord {
            task_id: id.to_string(),
            kind: "test".to_string(),
            version: 2,
            stage: stage.to_string(),
            sub_stage: "COMPLETED".to_string(),
            body: "{}".to_string(),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_config_default() {
        let config = RetentionWorkerConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.poll_interval, Duration::from_secs(3600));
        assert_eq!(config.max_age, Duration::from_secs(86400));
        assert_eq!(config.batch_size, 100);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_only_old_terminal_tasks() {
        let store = Arc::new(MemoryStore::new());
        let old = chrono::Duration::hours(2);
        store.insert_task(&record("old-finished", "FINISHED", old)).await.unwrap();
        store.insert_task(&record("old-failed", "FAILED", old)).await.unwrap();
        store.insert_task(&record("old-running", "STARTED", old)).await.unwrap();
        store
            .insert_task(&record("new-finished", "FINISHED", chrono::Duration::zero()))
            .await
            .unwrap();

        let worker = RetentionWorker::new(
            store.clone(),
            RetentionWorkerConfig {
                enabled: true,
                max_age: Duration::from_secs(3600),
                batch_size: 1,
                ..Default::default()
            },
        );

        let deleted = worker.cleanup_old_tasks().await.unwrap();
        assert_eq!(deleted, 2);

        assert!(store.get_task("old-finished").await.unwrap().is_none());
        assert!(store.get_task("old-failed").await.unwrap().is_none());
        assert!(store.get_task("old-running").await.unwrap().is_some());
        assert!(store.get_task("new-finished").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_disabled_worker_returns_immediately() {
        let worker = RetentionWorker::new(Arc::new(MemoryStore::new()), RetentionWorkerConfig::default());
        tokio::time::timeout(Duration::from_secs(1), worker.run())
            .await
            .expect("disabled worker should not loop");
    }
}
