//! Permission gate and the identity/membership collaborators it consults.
//!
//! ```text
//! handshake token ──► Authenticator ──► UserIdentity
//!                                            │
//! (project, action) ─────────────────────────┤
//!                                            ▼
//!                     ProjectDirectory::role(project, user)
//!                                            │
//!                                            ▼
//!                     PermissionGate::authorize ──► Ok(role) | Err(denied)
//! ```
//!
//! Roles are totally ordered: owner > editor > viewer. `Edit` needs at
//! least editor, `View` needs any role. An unknown project and a project
//! the caller cannot see are indistinguishable to the caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::protocol::{ProjectId, UserId};

/// Role of a user within a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Owner,
}

impl Role {
    /// Whether this role may perform `action`.
    pub fn permits(self, action: Action) -> bool {
        match action {
            Action::View => true,
            Action::Edit => self >= Role::Editor,
        }
    }
}

/// Operation classes checked by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    View,
    Edit,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::View => f.write_str("view"),
            Action::Edit => f.write_str("edit"),
        }
    }
}

/// Authenticated user, resolved from the handshake token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            display_name: display_name.into(),
            avatar: None,
        }
    }
}

/// Resolves a channel handshake token to a user identity.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<UserIdentity>;
}

/// Project membership lookup.
///
/// Returns `None` when the project does not exist or the user has no
/// access. Public projects grant at least `Viewer` to everyone.
pub trait ProjectDirectory: Send + Sync {
    fn role(&self, project: &ProjectId, user: &UserId) -> Option<Role>;
}

/// Reasons an authorization check fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// No role for this project, or the project does not exist.
    NoAccess,
    /// Role is known but too weak for the action.
    Insufficient { role: Role, action: Action },
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessError::NoAccess => write!(f, "no access to project"),
            AccessError::Insufficient { role, action } => {
                write!(f, "role {role:?} cannot {action}")
            }
        }
    }
}

impl std::error::Error for AccessError {}

/// Authorizes state-mutating and state-reading operations.
#[derive(Clone)]
pub struct PermissionGate {
    directory: Arc<dyn ProjectDirectory>,
}

impl PermissionGate {
    pub fn new(directory: Arc<dyn ProjectDirectory>) -> Self {
        Self { directory }
    }

    /// Check `action` for `user` on `project`, returning the resolved role.
    pub fn authorize(
        &self,
        user: &UserId,
        project: &ProjectId,
        action: Action,
    ) -> Result<Role, AccessError> {
        let role = self
            .directory
            .role(project, user)
            .ok_or(AccessError::NoAccess)?;
        if role.permits(action) {
            Ok(role)
        } else {
            Err(AccessError::Insufficient { role, action })
        }
    }
}
