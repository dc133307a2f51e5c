// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoint allocation.
//!
//! Validates the credentials of an endpoint spec, creates or updates the
//! endpoint and lets the adapter enhance it. A validate-only request finishes
//! right after the credential check, which is how health checks test
//! connectivity. An adapter failure after the endpoint was created rolls the
//! creation back before failing the task.
//!
//! ```text
//! CREATED -> VALIDATE_CREDENTIALS -> CREATE_UPDATE_ENDPOINT -> INVOKE_ADAPTER -> COMPLETED
//!                  │ validate_only                                   │ adapter failure
//!                  ▼                                                 ▼
//!              COMPLETED                                     ROLLBACK_CREATION -> ERROR
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use stagecraft_core::error::{CoreError, WorkflowError};
use stagecraft_core::service::{DocumentOf, TaskService};
use stagecraft_core::task::TaskFailure;
use stagecraft_core::{TaskContext, sub_stages};

use crate::endpoint::{Endpoint, EndpointAdapter, EndpointRegistry, EndpointSpec};

/// Error code recorded when the adapter fails after creation.
pub const ADAPTER_FAILED: &str = "ADAPTER_FAILED";

sub_stages! {
    /// Substages of an endpoint allocation.
    pub enum EndpointAllocationSubStage {
        Created => "CREATED",
        ValidateCredentials => "VALIDATE_CREDENTIALS",
        CreateUpdateEndpoint => "CREATE_UPDATE_ENDPOINT",
        InvokeAdapter => "INVOKE_ADAPTER",
        RollbackCreation => "ROLLBACK_CREATION",
        Completed => "COMPLETED",
        Error => "ERROR",
    }
}

/// Fields of an endpoint allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAllocationFields {
    /// Requested endpoint.
    pub endpoint: EndpointSpec,
    /// Stop after the credential check.
    #[serde(default)]
    pub validate_only: bool,
    /// Endpoint created or updated by this task.
    #[serde(default)]
    pub endpoint_id: Option<String>,
    /// Endpoints this task created, in creation order.
    #[serde(default)]
    pub created_documents: Vec<String>,
    /// Adapter error that triggered the rollback.
    #[serde(default)]
    pub adapter_failure: Option<String>,
}

impl EndpointAllocationFields {
    /// Allocate `endpoint`.
    pub fn allocate(endpoint: EndpointSpec) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }

    /// Only check the credentials of `endpoint`.
    pub fn validate(endpoint: EndpointSpec) -> Self {
        Self {
            endpoint,
            validate_only: true,
            ..Self::default()
        }
    }
}

/// Task service allocating endpoints.
pub struct EndpointAllocationTaskService {
    endpoints: Arc<dyn EndpointRegistry>,
    adapter: Arc<dyn EndpointAdapter>,
}

impl EndpointAllocationTaskService {
    /// Service over the given collaborators.
    pub fn new(endpoints: Arc<dyn EndpointRegistry>, adapter: Arc<dyn EndpointAdapter>) -> Self {
        Self { endpoints, adapter }
    }

    async fn create_or_update(
        &self,
        ctx: &TaskContext<Self>,
        state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError> {
        let spec = &state.fields.endpoint;
        let existing = match &spec.id {
            Some(id) => self
                .endpoints
                .get_endpoint(id)
                .await
                .map_err(|e| WorkflowError::with_cause("Can't read endpoint", e))?,
            None => None,
        };

        let endpoint_id = spec
            .id
            .clone()
            .unwrap_or_else(|| state.id.child("endpoint").to_string());
        let created = existing.is_none();
        let compute_id = existing
            .as_ref()
            .map(|e| e.compute_id.clone())
            .unwrap_or_else(|| format!("{endpoint_id}-compute"));

        let endpoint = Endpoint {
            id: endpoint_id.clone(),
            endpoint_type: spec.endpoint_type.clone(),
            name: spec.name.clone(),
            properties: spec.properties.clone(),
            compute_id,
        };
        self.endpoints
            .upsert_endpoint(endpoint)
            .await
            .map_err(|e| WorkflowError::with_cause("Can't store endpoint", e))?;

        info!(task_id = %state.id, endpoint_id = %endpoint_id, created, "Endpoint stored");

        ctx.proceed_with(EndpointAllocationSubStage::InvokeAdapter, move |fields| {
            fields.endpoint_id = Some(endpoint_id.clone());
            if created && !fields.created_documents.contains(&endpoint_id) {
                fields.created_documents.push(endpoint_id.clone());
            }
        })
        .await?;
        Ok(())
    }

    async fn invoke_adapter(
        &self,
        ctx: &TaskContext<Self>,
        state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError> {
        let endpoint_id = state
            .fields
            .endpoint_id
            .as_deref()
            .ok_or_else(|| WorkflowError::failed("Endpoint id missing after creation"))?;
        let mut endpoint = self
            .endpoints
            .get_endpoint(endpoint_id)
            .await
            .map_err(|e| WorkflowError::with_cause("Can't read endpoint", e))?
            .ok_or_else(|| WorkflowError::failed(format!("Endpoint '{endpoint_id}' disappeared")))?;

        match self.adapter.enhance(&endpoint).await {
            Ok(discovered) => {
                endpoint.properties.extend(discovered);
                self.endpoints
                    .upsert_endpoint(endpoint)
                    .await
                    .map_err(|e| WorkflowError::with_cause("Can't store endpoint", e))?;
                ctx.complete().await?;
            }
            Err(e) => {
                warn!(task_id = %state.id, endpoint_id, error = %e, "Endpoint adapter failed, rolling back");
                let failure = e.to_string();
                ctx.proceed_with(EndpointAllocationSubStage::RollbackCreation, move |fields| {
                    fields.adapter_failure = Some(failure.clone());
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn rollback(
        &self,
        ctx: &TaskContext<Self>,
        state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError> {
        for id in state.fields.created_documents.iter().rev() {
            match self.endpoints.delete_endpoint(id).await {
                Ok(existed) => debug!(task_id = %state.id, endpoint_id = %id, existed, "Rolled back endpoint"),
                Err(e) => warn!(task_id = %state.id, endpoint_id = %id, error = %e, "Endpoint rollback failed"),
            }
        }

        ctx.fail_with(TaskFailure {
            message: "Endpoint adapter failed".to_string(),
            cause: state.fields.adapter_failure.clone(),
            error_code: Some(ADAPTER_FAILED.to_string()),
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskService for EndpointAllocationTaskService {
    type SubStage = EndpointAllocationSubStage;
    type Fields = EndpointAllocationFields;
    const KIND: &'static str = "endpoint-allocation";

    fn display_name(&self) -> &str {
        "Endpoint allocation"
    }

    fn validate(&self, fields: &EndpointAllocationFields) -> Result<(), CoreError> {
        if fields.endpoint.endpoint_type.trim().is_empty() {
            return Err(CoreError::validation("endpoint.endpoint_type", "must not be empty"));
        }
        if !fields.validate_only && fields.endpoint.name.trim().is_empty() {
            return Err(CoreError::validation("endpoint.name", "must not be empty"));
        }
        Ok(())
    }

    async fn handle(
        &self,
        ctx: &TaskContext<Self>,
        state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError> {
        match state.sub_stage {
            EndpointAllocationSubStage::Created => {
                ctx.proceed_to(EndpointAllocationSubStage::ValidateCredentials)
                    .await?;
            }
            EndpointAllocationSubStage::ValidateCredentials => {
                self.adapter
                    .validate_credentials(&state.fields.endpoint)
                    .await
                    .map_err(|e| WorkflowError::with_cause("Credentials validation failed", e))?;

                if state.fields.validate_only {
                    ctx.complete().await?;
                } else {
                    ctx.proceed_to(EndpointAllocationSubStage::CreateUpdateEndpoint)
                        .await?;
                }
            }
            EndpointAllocationSubStage::CreateUpdateEndpoint => {
                self.create_or_update(ctx, state).await?;
            }
            EndpointAllocationSubStage::InvokeAdapter => {
                self.invoke_adapter(ctx, state).await?;
            }
            EndpointAllocationSubStage::RollbackCreation => {
                self.rollback(ctx, state).await?;
            }
            EndpointAllocationSubStage::Completed | EndpointAllocationSubStage::Error => {}
        }
        Ok(())
    }

    fn finished_payload(&self, state: &DocumentOf<Self>) -> Option<serde_json::Value> {
        state
            .fields
            .endpoint_id
            .as_ref()
            .map(|id| serde_json::json!({ "endpoint_id": id }))
    }

    fn callback_properties(&self, state: &DocumentOf<Self>) -> BTreeMap<String, String> {
        state
            .fields
            .endpoint_id
            .iter()
            .map(|id| ("endpoint_id".to_string(), id.clone()))
            .collect()
    }
}
