// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for stagecraft-core.
//!
//! [`EngineRuntime`] runs a [`TaskEngine`] together with its background
//! workers inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stagecraft_core::engine::TaskEngine;
//! use stagecraft_core::persistence::SqliteStore;
//! use stagecraft_core::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::connect("sqlite:tasks.db").await?);
//!     let engine = TaskEngine::builder()
//!         .store(store)
//!         .register(MyTaskService)
//!         .build()?;
//!
//!     let runtime = EngineRuntime::builder()
//!         .engine(engine)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cleanup::{RetentionWorker, RetentionWorkerConfig};
use crate::deadline::{DeadlineScheduler, DeadlineSchedulerConfig};
use crate::engine::TaskEngine;

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    engine: Option<Arc<TaskEngine>>,
    deadline: DeadlineSchedulerConfig,
    retention: RetentionWorkerConfig,
    recover_on_start: bool,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("engine", &self.engine.as_ref().map(|_| "..."))
            .field("deadline", &self.deadline)
            .field("retention", &self.retention)
            .field("recover_on_start", &self.recover_on_start)
            .finish()
    }
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            engine: None,
            deadline: DeadlineSchedulerConfig::default(),
            retention: RetentionWorkerConfig::default(),
            recover_on_start: true,
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine (required).
    pub fn engine(mut self, engine: Arc<TaskEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Configure the deadline scheduler.
    pub fn deadline(mut self, config: DeadlineSchedulerConfig) -> Self {
        self.deadline = config;
        self
    }

    /// Configure the retention worker.
    pub fn retention(mut self, config: RetentionWorkerConfig) -> Self {
        self.retention = config;
        self
    }

    /// Re-dispatch in-flight tasks on start.
    ///
    /// Default: true
    pub fn recover_on_start(mut self, recover: bool) -> Self {
        self.recover_on_start = recover;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("engine is required"))?;

        Ok(EngineRuntimeConfig {
            engine,
            deadline: self.deadline,
            retention: self.retention,
            recover_on_start: self.recover_on_start,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    engine: Arc<TaskEngine>,
    deadline: DeadlineSchedulerConfig,
    retention: RetentionWorkerConfig,
    recover_on_start: bool,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("engine", &"...")
            .field("deadline", &self.deadline)
            .field("retention", &self.retention)
            .field("recover_on_start", &self.recover_on_start)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning the background workers.
    pub async fn start(self) -> Result<EngineRuntime> {
        let scheduler = DeadlineScheduler::new(self.engine.clone(), self.deadline);
        let retention = RetentionWorker::new(self.engine.store().clone(), self.retention);

        let shutdown = vec![scheduler.shutdown_handle(), retention.shutdown_handle()];
        let workers = vec![
            tokio::spawn(async move { scheduler.run().await }),
            tokio::spawn(async move { retention.run().await }),
        ];

        if self.recover_on_start {
            self.engine.recover().await?;
        }

        info!(kinds = ?self.engine.kinds(), "EngineRuntime started");

        Ok(EngineRuntime {
            engine: self.engine,
            shutdown,
            workers,
        })
    }
}

/// A running engine with its background workers.
///
/// The runtime manages:
/// - the deadline scheduler firing delayed failing transitions
/// - the retention worker deleting old terminal tasks
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    engine: Arc<TaskEngine>,
    shutdown: Vec<Arc<Notify>>,
    workers: Vec<JoinHandle<()>>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// The engine.
    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals every worker to stop and waits for them to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        for handle in &self.shutdown {
            handle.notify_one();
        }

        let mut panicked = 0;
        for result in join_all(self.workers).await {
            if let Err(e) = result {
                error!("EngineRuntime worker panicked: {}", e);
                panicked += 1;
            }
        }

        if panicked > 0 {
            return Err(anyhow::anyhow!("{} worker task(s) panicked", panicked));
        }

        info!("EngineRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        self.workers.iter().any(|w| !w.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use std::time::Duration;

    fn engine() -> Arc<TaskEngine> {
        TaskEngine::builder()
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_engine() {
        let err = EngineRuntime::builder().build().unwrap_err();
        assert!(err.to_string().contains("engine is required"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let runtime = EngineRuntime::builder()
            .engine(engine())
            .deadline(DeadlineSchedulerConfig {
                poll_interval: Duration::from_millis(10),
                batch_size: 10,
                ..Default::default()
            })
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        tokio::time::timeout(Duration::from_secs(2), runtime.shutdown())
            .await
            .expect("shutdown timed out")
            .unwrap();
    }
}
