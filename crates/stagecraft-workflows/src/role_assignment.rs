// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Role assignment.
//!
//! Adds and then removes roles of principals. Both steps are idempotent, so a
//! step re-run after a restart leaves the registry unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::info;

use stagecraft_core::error::{CoreError, WorkflowError};
use stagecraft_core::service::{DocumentOf, TaskService};
use stagecraft_core::{TaskContext, sub_stages};

use crate::endpoint::RoleRegistry;

sub_stages! {
    /// Substages of a role assignment.
    pub enum RoleAssignmentSubStage {
        Created => "CREATED",
        AssigningRoles => "ASSIGNING_ROLES",
        UnassigningRoles => "UNASSIGNING_ROLES",
        Completed => "COMPLETED",
        Error => "ERROR",
    }
}

/// One principal/role pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleChange {
    /// User or group.
    pub principal: String,
    /// Role name.
    pub role: String,
}

impl RoleChange {
    /// Pair `principal` with `role`.
    pub fn new(principal: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            role: role.into(),
        }
    }
}

/// Fields of a role assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignmentFields {
    /// Roles to add.
    #[serde(default)]
    pub assign: Vec<RoleChange>,
    /// Roles to remove.
    #[serde(default)]
    pub unassign: Vec<RoleChange>,
    /// Roles that were not assigned before this task.
    #[serde(default)]
    pub newly_assigned: usize,
    /// Roles that were actually removed by this task.
    #[serde(default)]
    pub removed: usize,
}

/// Task service assigning roles.
pub struct RoleAssignmentTaskService {
    roles: Arc<dyn RoleRegistry>,
}

impl RoleAssignmentTaskService {
    /// Service over the role registry.
    pub fn new(roles: Arc<dyn RoleRegistry>) -> Self {
        Self { roles }
    }
}

#[async_trait]
impl TaskService for RoleAssignmentTaskService {
    type SubStage = RoleAssignmentSubStage;
    type Fields = RoleAssignmentFields;
    const KIND: &'static str = "role-assignment";

    fn display_name(&self) -> &str {
        "Role assignment"
    }

    fn validate(&self, fields: &RoleAssignmentFields) -> Result<(), CoreError> {
        if fields.assign.is_empty() && fields.unassign.is_empty() {
            return Err(CoreError::validation(
                "assign",
                "at least one role must be assigned or unassigned",
            ));
        }
        let blank = fields
            .assign
            .iter()
            .chain(&fields.unassign)
            .any(|c| c.principal.trim().is_empty() || c.role.trim().is_empty());
        if blank {
            return Err(CoreError::validation("principal", "principal and role are required"));
        }
        Ok(())
    }

    async fn handle(
        &self,
        ctx: &TaskContext<Self>,
        state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError> {
        match state.sub_stage {
            RoleAssignmentSubStage::Created => {
                ctx.proceed_to(RoleAssignmentSubStage::AssigningRoles).await?;
            }
            RoleAssignmentSubStage::AssigningRoles => {
                let added = try_join_all(
                    state
                        .fields
                        .assign
                        .iter()
                        .map(|c| self.roles.assign(&c.principal, &c.role)),
                )
                .await
                .map_err(|e| WorkflowError::with_cause("Role assignment failed", e))?;

                let newly_assigned = added.into_iter().filter(|added| *added).count();
                info!(task_id = %state.id, newly_assigned, "Roles assigned");
                ctx.proceed_with(RoleAssignmentSubStage::UnassigningRoles, move |fields| {
                    fields.newly_assigned = newly_assigned;
                })
                .await?;
            }
            RoleAssignmentSubStage::UnassigningRoles => {
                let removed = try_join_all(
                    state
                        .fields
                        .unassign
                        .iter()
                        .map(|c| self.roles.unassign(&c.principal, &c.role)),
                )
                .await
                .map_err(|e| WorkflowError::with_cause("Role removal failed", e))?;

                let removed = removed.into_iter().filter(|removed| *removed).count();
                info!(task_id = %state.id, removed, "Roles unassigned");
                ctx.complete_with(move |fields| fields.removed = removed)
                    .await?;
            }
            RoleAssignmentSubStage::Completed | RoleAssignmentSubStage::Error => {}
        }
        Ok(())
    }

    fn finished_payload(&self, state: &DocumentOf<Self>) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "newly_assigned": state.fields.newly_assigned,
            "removed": state.fields.removed,
        }))
    }
}
