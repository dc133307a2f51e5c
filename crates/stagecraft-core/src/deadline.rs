// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deadline scheduler.
//!
//! Periodically reads due scheduled transitions from the store and fails the
//! tasks that are still in the guarded substage. An entry is removed only
//! once it fired or no longer applies; an entry whose firing failed is moved
//! `retry_delay` into the future and tried again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::engine::TaskEngine;
use crate::error::Result;

/// Deadline scheduler configuration.
#[derive(Debug, Clone)]
pub struct DeadlineSchedulerConfig {
    /// How often to poll for due deadlines
    pub poll_interval: Duration,
    /// Maximum deadlines to process per poll
    pub batch_size: i64,
    /// Delay before a deadline whose firing failed is tried again
    pub retry_delay: Duration,
}

impl Default for DeadlineSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 50,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl DeadlineSchedulerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STAGECRAFT_DEADLINE_POLL_INTERVAL_MS`: milliseconds between polls (default: 1000)
    /// - `STAGECRAFT_DEADLINE_BATCH_SIZE`: max deadlines per poll (default: 50)
    /// - `STAGECRAFT_DEADLINE_RETRY_DELAY_MS`: delay before a failed firing is
    ///   retried (default: 5000)
    pub fn from_env() -> Self {
        let poll_interval_ms = std::env::var("STAGECRAFT_DEADLINE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);

        let batch_size = std::env::var("STAGECRAFT_DEADLINE_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);

        let retry_delay_ms = std::env::var("STAGECRAFT_DEADLINE_RETRY_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5000);

        Self {
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size,
            retry_delay: Duration::from_millis(retry_delay_ms),
        }
    }
}

/// Deadline scheduler that runs as a background task.
pub struct DeadlineScheduler {
    engine: Arc<TaskEngine>,
    config: DeadlineSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl DeadlineScheduler {
    /// Create a new deadline scheduler.
    pub fn new(engine: Arc<TaskEngine>, config: DeadlineSchedulerConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Deadline scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Deadline scheduler shutting down");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.process_due().await {
                        error!(error = %e, "Failed to process due deadlines");
                    }
                }
            }
        }
    }

    /// Fire every deadline due now. Returns the number of tasks failed.
    pub async fn process_due(&self) -> Result<usize> {
        let store = self.engine.store();
        let due = store
            .due_transitions(Utc::now(), self.config.batch_size)
            .await?;

        if due.is_empty() {
            return Ok(0);
        }

        debug!(count = due.len(), "Processing due deadlines");

        let mut failed = 0;
        for entry in &due {
            match self.engine.fire_deadline(entry).await {
                Ok(fired) => {
                    if fired {
                        failed += 1;
                    } else {
                        debug!(
                            task_id = %entry.task_id,
                            guard_sub_stage = %entry.guard_sub_stage,
                            "Deadline no longer applies"
                        );
                    }
                    store.complete_scheduled_transition(&entry.id).await?;
                }
                Err(e) if e.is_fatal() => {
                    error!(
                        task_id = %entry.task_id,
                        error = %e,
                        "Dropping deadline of a task that can't be decoded"
                    );
                    store.complete_scheduled_transition(&entry.id).await?;
                }
                Err(e) => {
                    let retry_at = Utc::now()
                        + chrono::Duration::from_std(self.config.retry_delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(5));
                    warn!(
                        task_id = %entry.task_id,
                        error = %e,
                        error_code = e.error_code(),
                        %retry_at,
                        "Failed to fire deadline, retrying later"
                    );
                    store.reschedule_transition(&entry.id, retry_at).await?;
                }
            }
        }

        Ok(failed)
    }
}
