// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parent callback protocol.
//!
//! A [`ServiceTaskCallback`] is stored on a child task at creation. When the
//! child reaches a terminal stage the engine turns it into a transition
//! request against the target, carrying a [`ServiceTaskCallbackResponse`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::task::{TaskFailure, TaskId, TaskStage};
use crate::transition::TransitionResult;

/// Substage the target moves to on success unless overridden.
pub const DEFAULT_SUB_STAGE_COMPLETE: &str = "COMPLETED";
/// Substage the target moves to on failure unless overridden.
pub const DEFAULT_SUB_STAGE_FAILED: &str = "ERROR";

/// Reference from a child task to the task that wants to hear about its outcome.
///
/// An empty callback (no target) means nobody is notified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTaskCallback {
    /// Task to notify, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TaskId>,
    /// Stage requested on the target when the child finishes.
    pub stage_complete: TaskStage,
    /// Substage requested on the target when the child finishes.
    pub sub_stage_complete: String,
    /// Stage requested on the target when the child fails or is cancelled.
    pub stage_failed: TaskStage,
    /// Substage requested on the target when the child fails or is cancelled.
    pub sub_stage_failed: String,
}

impl Default for ServiceTaskCallback {
    fn default() -> Self {
        Self::create_empty()
    }
}

impl ServiceTaskCallback {
    /// Callback to `target`: on success move it to STARTED(COMPLETED), from
    /// where the engine finishes it; on failure fail it.
    pub fn create(target: impl Into<TaskId>) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::create_empty()
        }
    }

    /// Callback that notifies nobody.
    pub fn create_empty() -> Self {
        Self {
            target: None,
            stage_complete: TaskStage::Started,
            sub_stage_complete: DEFAULT_SUB_STAGE_COMPLETE.to_string(),
            stage_failed: TaskStage::Failed,
            sub_stage_failed: DEFAULT_SUB_STAGE_FAILED.to_string(),
        }
    }

    /// Whether there is nobody to notify.
    pub fn is_empty(&self) -> bool {
        self.target.is_none()
    }

    /// On success, move the target to STARTED(`sub_stage`).
    pub fn on_success_to(mut self, sub_stage: impl AsRef<str>) -> Self {
        self.stage_complete = TaskStage::Started;
        self.sub_stage_complete = sub_stage.as_ref().to_string();
        self
    }

    /// On failure, move the target to STARTED(`sub_stage`) so it can handle
    /// the failure itself.
    pub fn on_error_to(mut self, sub_stage: impl AsRef<str>) -> Self {
        self.stage_failed = TaskStage::Started;
        self.sub_stage_failed = sub_stage.as_ref().to_string();
        self
    }

    /// On failure, fail the target.
    pub fn on_error_fail_task(mut self) -> Self {
        self.stage_failed = TaskStage::Failed;
        self.sub_stage_failed = DEFAULT_SUB_STAGE_FAILED.to_string();
        self
    }

    /// Response for a child that finished.
    pub fn finished_response(&self) -> ServiceTaskCallbackResponse {
        ServiceTaskCallbackResponse {
            status: CallbackStatus::Success,
            stage: self.stage_complete,
            sub_stage: self.sub_stage_complete.clone(),
            failure: None,
            payload: None,
            custom_properties: BTreeMap::new(),
            delivery_id: None,
        }
    }

    /// Response for a child that failed or was cancelled.
    pub fn failed_response(&self, failure: TaskFailure) -> ServiceTaskCallbackResponse {
        ServiceTaskCallbackResponse {
            status: CallbackStatus::Failure,
            stage: self.stage_failed,
            sub_stage: self.sub_stage_failed.clone(),
            failure: Some(failure),
            payload: None,
            custom_properties: BTreeMap::new(),
            delivery_id: None,
        }
    }
}

/// Outcome reported to a callback target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackStatus {
    /// The child finished.
    Success,
    /// The child failed or was cancelled.
    Failure,
}

/// Reply delivered to a callback target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTaskCallbackResponse {
    /// Success or failure.
    pub status: CallbackStatus,
    /// Stage the target should move to.
    pub stage: TaskStage,
    /// Substage the target should move to.
    pub sub_stage: String,
    /// Child failure, on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    /// Optional result data for the target workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Properties merged into the target's custom properties.
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
    /// `<child id>:<child version>`; the target ignores a repeated id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
}

impl ServiceTaskCallbackResponse {
    /// Attach a payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attach a custom property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }

    /// Attach the deduplication token.
    pub fn with_delivery_id(mut self, delivery_id: impl Into<String>) -> Self {
        self.delivery_id = Some(delivery_id.into());
        self
    }

    /// Whether the child succeeded.
    pub fn is_success(&self) -> bool {
        self.status == CallbackStatus::Success
    }
}

/// Result of [`TaskEngine::notify`](crate::engine::TaskEngine::notify).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// The callback had no target.
    Skipped,
    /// The target accepted or ignored the transition.
    Delivered(TransitionResult),
}
