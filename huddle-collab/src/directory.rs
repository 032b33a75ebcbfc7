//! Static identity and membership directory.
//!
//! Stands in for the external account and project services: tokens map
//! to identities, projects map users to roles. Loaded from a JSON file:
//!
//! ```json
//! {
//!   "users": [
//!     { "token": "t-alice", "user_id": "alice", "display_name": "Alice" }
//!   ],
//!   "projects": [
//!     { "id": "p1", "public": false, "members": { "alice": "owner" } }
//!   ]
//! }
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::access::{Authenticator, ProjectDirectory, Role, UserIdentity};
use crate::protocol::{ProjectId, UserId};

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    users: Vec<UserEntry>,
    #[serde(default)]
    projects: Vec<ProjectEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    token: String,
    #[serde(flatten)]
    identity: UserIdentity,
}

#[derive(Debug, Clone, Deserialize)]
struct ProjectEntry {
    id: ProjectId,
    #[serde(default)]
    public: bool,
    #[serde(default)]
    members: HashMap<UserId, Role>,
}

impl ProjectEntry {
    fn new(id: ProjectId) -> Self {
        Self {
            id,
            public: false,
            members: HashMap::new(),
        }
    }
}

/// In-memory token table and project membership.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    tokens: HashMap<String, UserIdentity>,
    projects: HashMap<ProjectId, ProjectEntry>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON directory file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DirectoryError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, DirectoryError> {
        let file: DirectoryFile =
            serde_json::from_str(text).map_err(|e| DirectoryError::Parse(e.to_string()))?;

        let mut directory = Self::new();
        for user in file.users {
            directory.tokens.insert(user.token, user.identity);
        }
        for project in file.projects {
            directory.projects.insert(project.id.clone(), project);
        }
        log::info!(
            "Loaded directory: {} tokens, {} projects",
            directory.tokens.len(),
            directory.projects.len()
        );
        Ok(directory)
    }

    /// Register a token for `identity`.
    pub fn with_user(mut self, token: impl Into<String>, identity: UserIdentity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    /// Register a project. Public projects admit every user as a viewer.
    pub fn with_project(mut self, project: impl Into<ProjectId>, public: bool) -> Self {
        let id = project.into();
        let entry = self
            .projects
            .entry(id.clone())
            .or_insert_with(|| ProjectEntry::new(id));
        entry.public = public;
        self
    }

    /// Grant `role` on `project`, creating a private project if needed.
    pub fn with_member(
        mut self,
        project: impl Into<ProjectId>,
        user: impl Into<String>,
        role: Role,
    ) -> Self {
        let id = project.into();
        self.projects
            .entry(id.clone())
            .or_insert_with(|| ProjectEntry::new(id))
            .members
            .insert(UserId::new(user), role);
        self
    }
}

impl Authenticator for StaticDirectory {
    fn authenticate(&self, token: &str) -> Option<UserIdentity> {
        self.tokens.get(token).cloned()
    }
}

impl ProjectDirectory for StaticDirectory {
    fn role(&self, project: &ProjectId, user: &UserId) -> Option<Role> {
        let entry = self.projects.get(project)?;
        match entry.members.get(user) {
            Some(role) => Some(*role),
            None if entry.public => Some(Role::Viewer),
            None => None,
        }
    }
}

/// Directory loading errors.
#[derive(Debug, Clone)]
pub enum DirectoryError {
    Io(String),
    Parse(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::Io(e) => write!(f, "Directory I/O error: {e}"),
            DirectoryError::Parse(e) => write!(f, "Directory parse error: {e}"),
        }
    }
}

impl std::error::Error for DirectoryError {}
