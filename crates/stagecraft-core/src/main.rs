// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stagecraft Core daemon.
//!
//! Opens the task store, runs migrations and keeps the deadline and
//! retention workers running until Ctrl-C. Workflows are registered by the
//! products embedding the engine; the daemon maintains the shared store.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use stagecraft_core::config::Config;
use stagecraft_core::engine::TaskEngine;
use stagecraft_core::persistence::{SqliteStore, TaskStore};
use stagecraft_core::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stagecraft_core=info".parse()?),
        )
        .init();

    info!("Starting Stagecraft Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        transition_retries = config.transition_retries,
        direct_timeout_ms = config.direct_timeout.as_millis() as u64,
        retention_enabled = config.retention.enabled,
        "Configuration loaded"
    );

    info!("Opening task store...");
    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    store.health_check_db().await?;
    info!("Task store ready");

    let engine = TaskEngine::builder()
        .store(store.clone())
        .transition_retries(config.transition_retries)
        .direct_timeout(config.direct_timeout)
        .build()?;

    let runtime = EngineRuntime::builder()
        .engine(engine)
        .deadline(config.deadline)
        .retention(config.retention)
        .build()?
        .start()
        .await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    store.pool().close().await;
    info!("Shutdown complete");

    Ok(())
}
