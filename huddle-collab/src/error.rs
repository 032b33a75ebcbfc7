//! Errors surfaced to a client as events.
//!
//! Every failure while handling a client event is reported to that client
//! only. Nothing here is fatal to the connection or to other sessions.

use std::fmt;

use crate::access::{AccessError, Action};
use crate::protocol::{ConnectionId, DocumentKey, ErrorCode, ProjectId, ServerEvent};
use crate::storage::StoreError;

#[derive(Debug, Clone)]
pub enum CollabError {
    /// The caller's role does not permit the action.
    PermissionDenied { project_id: ProjectId, action: Action },
    /// The project is unknown or invisible to the caller. Reported exactly
    /// like `PermissionDenied` so a project's existence is not revealed.
    ResourceNotFound { project_id: ProjectId, action: Action },
    /// Frame could not be decoded into a known event.
    MalformedEvent(String),
    /// Update bytes were rejected by the CRDT decoder or exceed the limit.
    MalformedUpdate(String),
    /// Document operation on a document the connection has not attached.
    NotAttached(DocumentKey),
    /// Signaling target is not a live connection.
    UnknownDestination(ConnectionId),
    Storage(StoreError),
}

impl CollabError {
    /// Map a gate refusal for `action` on `project_id`.
    pub fn from_access(err: AccessError, project_id: ProjectId, action: Action) -> Self {
        match err {
            AccessError::NoAccess => CollabError::ResourceNotFound { project_id, action },
            AccessError::Insufficient { .. } => CollabError::PermissionDenied { project_id, action },
        }
    }

    /// The event reported to the offending connection.
    pub fn to_event(&self) -> ServerEvent {
        match self {
            CollabError::PermissionDenied { project_id, action }
            | CollabError::ResourceNotFound { project_id, action } => ServerEvent::PermissionDenied {
                project_id: project_id.clone(),
                action: *action,
            },
            CollabError::MalformedEvent(e) => ServerEvent::error(ErrorCode::MalformedEvent, e),
            CollabError::MalformedUpdate(e) => ServerEvent::error(ErrorCode::MalformedUpdate, e),
            CollabError::NotAttached(key) => {
                ServerEvent::error(ErrorCode::NotAttached, format!("not attached to {key}"))
            }
            CollabError::UnknownDestination(id) => {
                ServerEvent::error(ErrorCode::UnknownDestination, format!("no connection {id}"))
            }
            CollabError::Storage(_) => {
                ServerEvent::error(ErrorCode::StorageFailure, "file could not be saved")
            }
        }
    }
}

impl fmt::Display for CollabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollabError::PermissionDenied { project_id, action } => {
                write!(f, "Permission denied: cannot {action} project {project_id}")
            }
            CollabError::ResourceNotFound { project_id, action } => {
                write!(f, "No access to project {project_id} for {action}")
            }
            CollabError::MalformedEvent(e) => write!(f, "Malformed event: {e}"),
            CollabError::MalformedUpdate(e) => write!(f, "Malformed update: {e}"),
            CollabError::NotAttached(key) => write!(f, "Not attached to {key}"),
            CollabError::UnknownDestination(id) => write!(f, "Unknown destination {id}"),
            CollabError::Storage(e) => write!(f, "Storage failure: {e}"),
        }
    }
}

impl std::error::Error for CollabError {}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        CollabError::Storage(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Role;

    #[test]
    fn test_hidden_project_reported_as_denied() {
        let p = ProjectId::new("secret");
        let hidden = CollabError::from_access(AccessError::NoAccess, p.clone(), Action::View);
        let weak = CollabError::from_access(
            AccessError::Insufficient {
                role: Role::Viewer,
                action: Action::Edit,
            },
            p.clone(),
            Action::View,
        );
        assert!(matches!(hidden, CollabError::ResourceNotFound { .. }));
        assert!(matches!(weak, CollabError::PermissionDenied { .. }));
        assert_eq!(hidden.to_event(), weak.to_event());
    }

    #[test]
    fn test_storage_detail_not_leaked() {
        let err = CollabError::from(StoreError::DatabaseError("/var/lib/huddle: EIO".into()));
        match err.to_event() {
            ServerEvent::Error { code, message } => {
                assert_eq!(code, ErrorCode::StorageFailure);
                assert!(!message.contains("/var/lib"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
