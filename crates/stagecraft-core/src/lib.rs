// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stagecraft Core - Durable Task State Machine
//!
//! This crate runs multi-step asynchronous workflows as a sequence of
//! idempotent, persisted state transitions. Each workflow instance is a task
//! document with a coarse stage and a workflow-specific substage; every
//! accepted transition is committed with compare-and-swap on the document
//! version and then dispatched to the handler for the new substage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Task services (workflows)                         │
//! │           handle(ctx, state) -> match on the current substage            │
//! └─────────────────────────────────────────────────────────────────────────┘
//!            │ self-transitions                 ▲ dispatch
//!            ▼                                  │
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              TaskEngine                                  │
//! │   validate -> apply -> CAS commit -> audit -> change feed -> dispatch    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!            │                    │                         │
//!            ▼                    ▼                         ▼
//! ┌───────────────────┐ ┌────────────────────┐ ┌─────────────────────────┐
//! │     TaskStore     │ │  NotificationHub   │ │  Parent callback target  │
//! │ (SQLite / memory) │ │ + subscriptions    │ │  (ServiceTaskCallback)   │
//! └───────────────────┘ └────────────────────┘ └─────────────────────────┘
//! ```
//!
//! # Task Lifecycle
//!
//! ```text
//!   ┌─────────┐  handler   ┌─────────┐  complete   ┌──────────┐
//!   │ CREATED │──────────▶│ STARTED │────────────▶│ FINISHED │
//!   └────┬────┘            └────┬────┘             └──────────┘
//!        │                      │ fail / cancel / delete
//!        │                      ▼
//!        │           ┌──────────────────────┐
//!        └──────────▶│ FAILED / CANCELLED   │
//!                    └──────────────────────┘
//! ```
//!
//! Substages only move forward within a stage. FAILED and CANCELLED always
//! carry the `ERROR` substage, FINISHED defaults to `COMPLETED`. Terminal
//! documents accept no further field mutation; a repeated failure is a no-op.
//!
//! On a terminal stage the engine closes the task's open subscriptions,
//! notifies the callback target (success for FINISHED, failure otherwise) and
//! deletes the document when the service is self-deleting.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STAGECRAFT_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `STAGECRAFT_TRANSITION_RETRIES` | No | `3` | CAS attempts per transition |
//! | `STAGECRAFT_DIRECT_TIMEOUT_MS` | No | `30000` | Direct create wait |
//! | `STAGECRAFT_DEADLINE_POLL_INTERVAL_MS` | No | `1000` | Deadline poll period |
//! | `STAGECRAFT_DEADLINE_BATCH_SIZE` | No | `50` | Deadlines per poll |
//! | `STAGECRAFT_DEADLINE_RETRY_DELAY_MS` | No | `5000` | Delay before a failed deadline is retried |
//! | `STAGECRAFT_RETENTION_ENABLED` | No | `false` | Enable retention |
//! | `STAGECRAFT_RETENTION_MAX_AGE_SECS` | No | `86400` | Terminal task max age |
//! | `STAGECRAFT_RETENTION_POLL_INTERVAL_SECS` | No | `3600` | Retention period |
//! | `STAGECRAFT_RETENTION_BATCH_SIZE` | No | `100` | Deletions per batch |

#![warn(missing_docs)]

/// Parent callback references and responses.
pub mod callback;

/// Retention worker deleting old terminal tasks.
pub mod cleanup;

/// Configuration loaded from environment variables.
pub mod config;

/// Handler-side engine access.
pub mod context;

/// Deadline scheduler firing delayed failing transitions.
pub mod deadline;

/// The task state machine engine.
pub mod engine;

/// Error types with error code mapping.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Task stores.
pub mod persistence;

/// Embeddable runtime with background workers.
pub mod runtime;

/// Task service contract.
pub mod service;

/// Change feed and subscription-based continuation.
pub mod subscription;

/// Task document model.
pub mod task;

/// Pure transition validation and merge.
pub mod transition;

pub use callback::{ServiceTaskCallback, ServiceTaskCallbackResponse};
pub use context::{TaskContext, WatchedOutcome};
pub use engine::{CreateTask, TaskEngine};
pub use error::{CoreError, WorkflowError};
pub use service::{DocumentOf, TaskOptions, TaskService};
pub use task::{SubStage, TaskDocument, TaskFailure, TaskId, TaskStage, TaskStatus};
pub use transition::{Transition, TransitionResult};
