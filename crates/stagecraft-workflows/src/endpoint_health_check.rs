// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoint health check.
//!
//! Probes an endpoint by running a validate-only [`EndpointAllocationTaskService`]
//! task against its current configuration, waits for that task through a
//! subscription and records the result as the power state of the endpoint's
//! compute. The health check deletes itself once finished.
//!
//! ```text
//! CREATED -> CHECKING_CONNECTIVITY -> UPDATING_ENDPOINT -> COMPLETED
//!                  │ waits on <id>-validation
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use stagecraft_core::context::WatchedOutcome;
use stagecraft_core::engine::CreateTask;
use stagecraft_core::error::{CoreError, WorkflowError};
use stagecraft_core::service::{DocumentOf, TaskOptions, TaskService};
use stagecraft_core::task::{TaskId, TaskStage};
use stagecraft_core::{TaskContext, sub_stages};

use crate::endpoint::{Endpoint, EndpointRegistry, PowerState};
use crate::endpoint_allocation::{EndpointAllocationFields, EndpointAllocationTaskService};

sub_stages! {
    /// Substages of an endpoint health check.
    pub enum EndpointHealthCheckSubStage {
        Created => "CREATED",
        CheckingConnectivity => "CHECKING_CONNECTIVITY",
        UpdatingEndpoint => "UPDATING_ENDPOINT",
        Completed => "COMPLETED",
        Error => "ERROR",
    }
}

/// Fields of an endpoint health check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointHealthCheckFields {
    /// Endpoint to check.
    pub endpoint_id: String,
    /// Fail the check when connectivity is not established in time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Terminal stage of the validation task.
    #[serde(default)]
    pub validation_outcome: Option<TaskStage>,
    /// Failure message of the validation task.
    #[serde(default)]
    pub validation_failure: Option<String>,
}

impl EndpointHealthCheckFields {
    /// Check `endpoint_id`.
    pub fn new(endpoint_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            ..Self::default()
        }
    }

    /// Fail the check after `timeout` in CHECKING_CONNECTIVITY.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Identity of the validation task of a health check.
pub fn validation_task_id(health_check: &TaskId) -> TaskId {
    health_check.child("validation")
}

/// Task service checking endpoint connectivity.
pub struct EndpointHealthCheckTaskService {
    endpoints: Arc<dyn EndpointRegistry>,
}

impl EndpointHealthCheckTaskService {
    /// Service over the endpoint registry.
    pub fn new(endpoints: Arc<dyn EndpointRegistry>) -> Self {
        Self { endpoints }
    }

    async fn endpoint(&self, endpoint_id: &str) -> Result<Endpoint, WorkflowError> {
        self.endpoints
            .get_endpoint(endpoint_id)
            .await
            .map_err(|e| WorkflowError::with_cause("Can't read endpoint", e))?
            .ok_or_else(|| WorkflowError::failed(format!("Endpoint '{endpoint_id}' not found")))
    }

    async fn check_connectivity(
        &self,
        ctx: &TaskContext<Self>,
        state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError> {
        let endpoint = self.endpoint(&state.fields.endpoint_id).await?;
        let validation_id = validation_task_id(&state.id);

        let spec = endpoint.to_spec();
        ctx.ensure_child::<EndpointAllocationTaskService>(&validation_id, move || {
            CreateTask::new(EndpointAllocationFields::validate(spec))
        })
        .await?;

        if let Some(timeout_ms) = state.fields.timeout_ms {
            ctx.schedule_deadline(
                Duration::from_millis(timeout_ms),
                EndpointHealthCheckSubStage::CheckingConnectivity,
                "Connectivity check timed out",
            )
            .await?;
        }

        ctx.await_terminal(
            &validation_id,
            EndpointHealthCheckSubStage::UpdatingEndpoint,
            |fields, outcome: &WatchedOutcome| {
                fields.validation_outcome = Some(outcome.stage);
                fields.validation_failure = outcome.failure.as_ref().map(|f| f.message.clone());
            },
        )
        .await;

        debug!(task_id = %state.id, validation_id = %validation_id, "Waiting for connectivity validation");
        Ok(())
    }

    async fn update_endpoint(
        &self,
        ctx: &TaskContext<Self>,
        state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError> {
        let endpoint = self.endpoint(&state.fields.endpoint_id).await?;
        let power = if state.fields.validation_outcome == Some(TaskStage::Finished) {
            PowerState::On
        } else {
            PowerState::Off
        };

        self.endpoints
            .set_power_state(&endpoint.compute_id, power)
            .await
            .map_err(|e| WorkflowError::with_cause("Can't update power state", e))?;

        info!(
            task_id = %state.id,
            endpoint_id = %endpoint.id,
            compute_id = %endpoint.compute_id,
            power = ?power,
            validation_failure = ?state.fields.validation_failure,
            "Endpoint health recorded"
        );

        ctx.engine()
            .delete_task(&validation_task_id(&state.id))
            .await?;
        ctx.complete().await?;
        Ok(())
    }
}

#[async_trait]
impl TaskService for EndpointHealthCheckTaskService {
    type SubStage = EndpointHealthCheckSubStage;
    type Fields = EndpointHealthCheckFields;
    const KIND: &'static str = "endpoint-health-check";

    fn display_name(&self) -> &str {
        "Endpoint health check"
    }

    fn options(&self) -> TaskOptions {
        TaskOptions { self_delete: true }
    }

    fn validate(&self, fields: &EndpointHealthCheckFields) -> Result<(), CoreError> {
        if fields.endpoint_id.trim().is_empty() {
            return Err(CoreError::validation("endpoint_id", "must not be empty"));
        }
        if fields.timeout_ms == Some(0) {
            return Err(CoreError::validation("timeout_ms", "must be positive"));
        }
        Ok(())
    }

    async fn handle(
        &self,
        ctx: &TaskContext<Self>,
        state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError> {
        match state.sub_stage {
            EndpointHealthCheckSubStage::Created => {
                ctx.proceed_to(EndpointHealthCheckSubStage::CheckingConnectivity)
                    .await?;
            }
            EndpointHealthCheckSubStage::CheckingConnectivity => {
                self.check_connectivity(ctx, state).await?;
            }
            EndpointHealthCheckSubStage::UpdatingEndpoint => {
                self.update_endpoint(ctx, state).await?;
            }
            EndpointHealthCheckSubStage::Completed | EndpointHealthCheckSubStage::Error => {}
        }
        Ok(())
    }

    fn finished_payload(&self, state: &DocumentOf<Self>) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "endpoint_id": state.fields.endpoint_id,
            "validation_outcome": state.fields.validation_outcome,
        }))
    }
}
