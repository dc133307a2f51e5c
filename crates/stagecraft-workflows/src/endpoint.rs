// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External collaborators of the endpoint and role workflows.
//!
//! The workflows only see these traits. In-memory implementations back the
//! tests and local embedding.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// The referenced document does not exist.
    #[error("'{0}' not found")]
    NotFound(String),

    /// The collaborator refused the request.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The collaborator could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Power state of the compute behind an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    /// Reachable.
    On,
    /// Not reachable.
    Off,
    /// Never checked.
    Unknown,
}

/// Requested endpoint configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Existing endpoint to update; a new one is created when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Endpoint type, e.g. "aws" or "vsphere".
    pub endpoint_type: String,
    /// Display name.
    pub name: String,
    /// Connection properties, including credentials.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// A registered endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Endpoint identity.
    pub id: String,
    /// Endpoint type.
    pub endpoint_type: String,
    /// Display name.
    pub name: String,
    /// Connection properties.
    pub properties: BTreeMap<String, String>,
    /// Compute document representing the endpoint's host.
    pub compute_id: String,
}

impl Endpoint {
    /// Spec that reproduces this endpoint.
    pub fn to_spec(&self) -> EndpointSpec {
        EndpointSpec {
            id: Some(self.id.clone()),
            endpoint_type: self.endpoint_type.clone(),
            name: self.name.clone(),
            properties: self.properties.clone(),
        }
    }
}

/// Endpoint documents and compute power state.
#[async_trait]
pub trait EndpointRegistry: Send + Sync {
    /// Create or replace an endpoint.
    async fn upsert_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint, CollaboratorError>;

    /// Get an endpoint by id.
    async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>, CollaboratorError>;

    /// Delete an endpoint. Returns whether it existed.
    async fn delete_endpoint(&self, id: &str) -> Result<bool, CollaboratorError>;

    /// Record the power state of a compute.
    async fn set_power_state(
        &self,
        compute_id: &str,
        state: PowerState,
    ) -> Result<(), CollaboratorError>;

    /// Power state of a compute, if recorded.
    async fn get_power_state(&self, compute_id: &str)
    -> Result<Option<PowerState>, CollaboratorError>;
}

/// Endpoint-type specific adapter.
#[async_trait]
pub trait EndpointAdapter: Send + Sync {
    /// Check the credentials of a spec against the remote system.
    async fn validate_credentials(&self, spec: &EndpointSpec) -> Result<(), CollaboratorError>;

    /// Discover extra properties of a registered endpoint.
    async fn enhance(
        &self,
        endpoint: &Endpoint,
    ) -> Result<BTreeMap<String, String>, CollaboratorError>;
}

/// Role assignments of principals.
#[async_trait]
pub trait RoleRegistry: Send + Sync {
    /// Assign a role. Returns `false` if it was already assigned.
    async fn assign(&self, principal: &str, role: &str) -> Result<bool, CollaboratorError>;

    /// Remove a role. Returns `false` if it was not assigned.
    async fn unassign(&self, principal: &str, role: &str) -> Result<bool, CollaboratorError>;

    /// Roles of a principal.
    async fn roles_of(&self, principal: &str) -> Result<BTreeSet<String>, CollaboratorError>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// In-memory [`EndpointRegistry`].
#[derive(Debug, Default)]
pub struct InMemoryEndpointRegistry {
    endpoints: Mutex<HashMap<String, Endpoint>>,
    power: Mutex<HashMap<String, PowerState>>,
}

impl InMemoryEndpointRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered endpoints.
    pub async fn endpoint_count(&self) -> usize {
        self.endpoints.lock().await.len()
    }
}

#[async_trait]
impl EndpointRegistry for InMemoryEndpointRegistry {
    async fn upsert_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint, CollaboratorError> {
        self.power
            .lock()
            .await
            .entry(endpoint.compute_id.clone())
            .or_insert(PowerState::Unknown);
        self.endpoints
            .lock()
            .await
            .insert(endpoint.id.clone(), endpoint.clone());
        Ok(endpoint)
    }

    async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>, CollaboratorError> {
        Ok(self.endpoints.lock().await.get(id).cloned())
    }

    async fn delete_endpoint(&self, id: &str) -> Result<bool, CollaboratorError> {
        let removed = self.endpoints.lock().await.remove(id);
        if let Some(endpoint) = &removed {
            self.power.lock().await.remove(&endpoint.compute_id);
        }
        Ok(removed.is_some())
    }

    async fn set_power_state(
        &self,
        compute_id: &str,
        state: PowerState,
    ) -> Result<(), CollaboratorError> {
        self.power
            .lock()
            .await
            .insert(compute_id.to_string(), state);
        Ok(())
    }

    async fn get_power_state(
        &self,
        compute_id: &str,
    ) -> Result<Option<PowerState>, CollaboratorError> {
        Ok(self.power.lock().await.get(compute_id).copied())
    }
}

/// Scripted [`EndpointAdapter`] for tests and mock deployments.
#[derive(Debug, Clone, Default)]
pub struct MockEndpointAdapter {
    reject_credentials: Option<String>,
    fail_enhance: Option<String>,
    discovered: BTreeMap<String, String>,
}

impl MockEndpointAdapter {
    /// Adapter accepting everything.
    pub fn accepting() -> Self {
        Self::default()
    }

    /// Reject every credential validation with `reason`.
    pub fn rejecting_credentials(mut self, reason: impl Into<String>) -> Self {
        self.reject_credentials = Some(reason.into());
        self
    }

    /// Fail every enhance call with `reason`.
    pub fn failing_enhance(mut self, reason: impl Into<String>) -> Self {
        self.fail_enhance = Some(reason.into());
        self
    }

    /// Property reported by enhance.
    pub fn discovering(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.discovered.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl EndpointAdapter for MockEndpointAdapter {
    async fn validate_credentials(&self, _spec: &EndpointSpec) -> Result<(), CollaboratorError> {
        match &self.reject_credentials {
            Some(reason) => Err(CollaboratorError::Rejected(reason.clone())),
            None => Ok(()),
        }
    }

    async fn enhance(
        &self,
        _endpoint: &Endpoint,
    ) -> Result<BTreeMap<String, String>, CollaboratorError> {
        match &self.fail_enhance {
            Some(reason) => Err(CollaboratorError::Unavailable(reason.clone())),
            None => Ok(self.discovered.clone()),
        }
    }
}

/// In-memory [`RoleRegistry`].
#[derive(Debug, Default)]
pub struct InMemoryRoleRegistry {
    roles: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl InMemoryRoleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoleRegistry for InMemoryRoleRegistry {
    async fn assign(&self, principal: &str, role: &str) -> Result<bool, CollaboratorError> {
        Ok(self
            .roles
            .lock()
            .await
            .entry(principal.to_string())
            .or_default()
            .insert(role.to_string()))
    }

    async fn unassign(&self, principal: &str, role: &str) -> Result<bool, CollaboratorError> {
        let mut roles = self.roles.lock().await;
        let removed = roles
            .get_mut(principal)
            .is_some_and(|assigned| assigned.remove(role));
        if roles.get(principal).is_some_and(|assigned| assigned.is_empty()) {
            roles.remove(principal);
        }
        Ok(removed)
    }

    async fn roles_of(&self, principal: &str) -> Result<BTreeSet<String>, CollaboratorError> {
        Ok(self
            .roles
            .lock()
            .await
            .get(principal)
            .cloned()
            .unwrap_or_default())
    }
}
