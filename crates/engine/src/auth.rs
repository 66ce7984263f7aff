//! Authorization seam. The engine asks before every mutating operation.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>, roles: &[&str]) -> Self {
        Self { id: id.into(), roles: roles.iter().map(|r| r.to_string()).collect() }
    }

    /// Internal callers (workers, CLI tooling).
    pub fn system() -> Self {
        Self::new("system", &["admin"])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "workflow:register")]
    WorkflowRegister,
    #[serde(rename = "workflow:execute")]
    WorkflowExecute,
    #[serde(rename = "workflow:read")]
    WorkflowRead,
    #[serde(rename = "execution:cancel")]
    ExecutionCancel,
}

impl Permission {
    pub const ALL: [Permission; 4] =
        [Self::WorkflowRegister, Self::WorkflowExecute, Self::WorkflowRead, Self::ExecutionCancel];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowRegister => "workflow:register",
            Self::WorkflowExecute => "workflow:execute",
            Self::WorkflowRead => "workflow:read",
            Self::ExecutionCancel => "execution:cancel",
        }
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `Err(EngineError::Unauthorized)` on denial.
    async fn require_permission(&self, actor: &Actor, permission: Permission, resource: &str) -> Result<(), EngineError>;
}

/// Grants everything. Single-tenant deployments and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn require_permission(&self, _actor: &Actor, _permission: Permission, _resource: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Static role to permission table.
#[derive(Debug, Clone, Default)]
pub struct RoleAuthorizer {
    grants: HashMap<String, HashSet<Permission>>,
}

impl RoleAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `admin` gets everything, `operator` runs and cancels, `viewer` reads.
    pub fn with_default_roles() -> Self {
        Self::new()
            .grant("admin", &Permission::ALL)
            .grant("operator", &[Permission::WorkflowExecute, Permission::ExecutionCancel, Permission::WorkflowRead])
            .grant("viewer", &[Permission::WorkflowRead])
    }

    pub fn grant(mut self, role: &str, permissions: &[Permission]) -> Self {
        self.grants.entry(role.to_string()).or_default().extend(permissions.iter().copied());
        self
    }

    pub fn allows(&self, actor: &Actor, permission: Permission) -> bool {
        actor
            .roles
            .iter()
            .any(|role| self.grants.get(role).is_some_and(|perms| perms.contains(&permission)))
    }
}

#[async_trait]
impl Authorizer for RoleAuthorizer {
    async fn require_permission(&self, actor: &Actor, permission: Permission, resource: &str) -> Result<(), EngineError> {
        if self.allows(actor, permission) {
            return Ok(());
        }
        tracing::warn!(target: "audit", actor = %actor.id, permission = permission.as_str(), resource, "permission denied");
        Err(EngineError::Unauthorized { actor: actor.id.clone(), permission: permission.as_str().to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roles_map_to_permissions() {
        let auth = RoleAuthorizer::with_default_roles();
        let viewer = Actor::new("v", &["viewer"]);
        let operator = Actor::new("o", &["operator"]);

        assert!(auth.require_permission(&viewer, Permission::WorkflowRead, "wf").await.is_ok());
        let err = auth.require_permission(&viewer, Permission::WorkflowExecute, "wf").await.unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized { ref permission, .. } if permission == "workflow:execute"));

        assert!(auth.allows(&operator, Permission::ExecutionCancel));
        assert!(!auth.allows(&operator, Permission::WorkflowRegister));
        assert!(auth.allows(&Actor::system(), Permission::WorkflowRegister));
        assert!(!auth.allows(&Actor::new("nobody", &[]), Permission::WorkflowRead));
    }
}
