// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stagecraft Workflows
//!
//! Task services running on the [`stagecraft_core`] engine:
//!
//! | Kind | Service | Substages |
//! |------|---------|-----------|
//! | `endpoint-allocation` | [`EndpointAllocationTaskService`] | VALIDATE_CREDENTIALS, CREATE_UPDATE_ENDPOINT, INVOKE_ADAPTER, ROLLBACK_CREATION |
//! | `endpoint-health-check` | [`EndpointHealthCheckTaskService`] | CHECKING_CONNECTIVITY, UPDATING_ENDPOINT |
//! | `role-assignment` | [`RoleAssignmentTaskService`] | ASSIGNING_ROLES, UNASSIGNING_ROLES |
//! | `counter` | [`CounterSubTaskService`] | COUNTING |
//!
//! The services reach the outside world only through the collaborator traits
//! in [`endpoint`]. Wire them up with [`register`]:
//!
//! ```ignore
//! let collaborators = Collaborators::in_memory(MockEndpointAdapter::accepting());
//! let engine = register(TaskEngine::builder().store(store), &collaborators).build()?;
//! ```

#![warn(missing_docs)]

use std::sync::Arc;

use stagecraft_core::engine::TaskEngineBuilder;

/// Counter fan-in over child callbacks.
pub mod counter;

/// Collaborator traits and in-memory implementations.
pub mod endpoint;

/// Endpoint allocation workflow.
pub mod endpoint_allocation;

/// Endpoint health check workflow.
pub mod endpoint_health_check;

/// Role assignment workflow.
pub mod role_assignment;

pub use counter::{CounterSubTaskService, counter_callback};
pub use endpoint::{
    CollaboratorError, Endpoint, EndpointAdapter, EndpointRegistry, EndpointSpec, PowerState,
    RoleRegistry,
};
pub use endpoint_allocation::EndpointAllocationTaskService;
pub use endpoint_health_check::EndpointHealthCheckTaskService;
pub use role_assignment::RoleAssignmentTaskService;

/// Collaborators shared by the workflows.
#[derive(Clone)]
pub struct Collaborators {
    /// Endpoint documents and power state.
    pub endpoints: Arc<dyn EndpointRegistry>,
    /// Endpoint-type adapter.
    pub adapter: Arc<dyn EndpointAdapter>,
    /// Role assignments.
    pub roles: Arc<dyn RoleRegistry>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("endpoints", &"...")
            .field("adapter", &"...")
            .field("roles", &"...")
            .finish()
    }
}

impl Collaborators {
    /// In-memory registries with the given adapter.
    pub fn in_memory(adapter: impl EndpointAdapter + 'static) -> Self {
        Self {
            endpoints: Arc::new(endpoint::InMemoryEndpointRegistry::new()),
            adapter: Arc::new(adapter),
            roles: Arc::new(endpoint::InMemoryRoleRegistry::new()),
        }
    }
}

/// Register every workflow of this crate.
pub fn register(builder: TaskEngineBuilder, collaborators: &Collaborators) -> TaskEngineBuilder {
    builder
        .register(EndpointAllocationTaskService::new(
            collaborators.endpoints.clone(),
            collaborators.adapter.clone(),
        ))
        .register(EndpointHealthCheckTaskService::new(
            collaborators.endpoints.clone(),
        ))
        .register(RoleAssignmentTaskService::new(collaborators.roles.clone()))
        .register(CounterSubTaskService)
}
