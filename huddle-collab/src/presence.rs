//! Presence tracker: who is in which project room.
//!
//! ```text
//! join(project, conn)
//!   │  PermissionGate::authorize(view)
//!   ▼
//! get_or_create(Room) ──► admit ──► roster-snapshot ──► joiner (ahead of any later delta)
//!                            └──► participant-joined ──► other members
//!
//! leave(project, conn)
//!   └──► dismiss ──► participant-left ──► other members
//!          └──► last one out: close room, drop it
//! ```
//!
//! Rooms exist only while they have members. A disconnect is a leave of
//! every room the connection joined.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::access::{Action, PermissionGate};
use crate::broadcast::{BroadcastGroup, GroupClosed};
use crate::connection::ConnectionHandle;
use crate::error::CollabError;
use crate::protocol::{ConnectionId, Participant, ProjectId, ServerEvent};

/// Live participants of one project.
pub struct Room {
    project_id: ProjectId,
    members: BroadcastGroup,
}

impl Room {
    fn new(project_id: ProjectId) -> Self {
        Self {
            project_id,
            members: BroadcastGroup::new(),
        }
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn members(&self) -> &BroadcastGroup {
        &self.members
    }
}

pub struct PresenceTracker {
    rooms: RwLock<HashMap<ProjectId, Arc<Room>>>,
    gate: PermissionGate,
}

impl PresenceTracker {
    pub fn new(gate: PermissionGate) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            gate,
        }
    }

    async fn get_or_create(&self, project_id: &ProjectId) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(project_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(project_id) {
            return room.clone();
        }
        let room = Arc::new(Room::new(project_id.clone()));
        rooms.insert(project_id.clone(), room.clone());
        room
    }

    /// Add `conn` to the project's room and return the full roster.
    /// The roster is also queued to `conn` as a `roster-snapshot`.
    pub async fn join(
        &self,
        project_id: &ProjectId,
        conn: &Arc<ConnectionHandle>,
    ) -> Result<Vec<Participant>, CollabError> {
        self.gate
            .authorize(conn.user_id(), project_id, Action::View)
            .map_err(|e| CollabError::from_access(e, project_id.clone(), Action::View))?;

        loop {
            let room = self.get_or_create(project_id).await;
            let joined = ServerEvent::ParticipantJoined {
                project_id: project_id.clone(),
                participant: conn.participant().clone(),
            };
            let admitted = room
                .members
                .admit_with_greeting(conn.clone(), Some(joined), |roster| {
                    Some(ServerEvent::RosterSnapshot {
                        project_id: project_id.clone(),
                        participants: roster.to_vec(),
                    })
                })
                .await;
            match admitted {
                Ok(admission) => {
                    if admission.newly_added {
                        log::info!(
                            "{} joined room {project_id} ({} present)",
                            conn.participant().display_name,
                            admission.roster.len()
                        );
                    }
                    return Ok(admission.roster);
                }
                // Emptied and closed under us; the next lookup makes a new room.
                Err(GroupClosed) => tokio::task::yield_now().await,
            }
        }
    }

    /// Remove `conn` from the project's room. False if it was not present.
    pub async fn leave(&self, project_id: &ProjectId, conn: &ConnectionId) -> bool {
        let Some(room) = self.rooms.read().await.get(project_id).cloned() else {
            return false;
        };
        let dismissal = room
            .members
            .dismiss(conn, |participant| {
                Some(ServerEvent::ParticipantLeft {
                    project_id: project_id.clone(),
                    participant: participant.clone(),
                })
            })
            .await;
        let Some(dismissal) = dismissal else {
            return false;
        };
        log::info!(
            "{} left room {project_id} ({} remain)",
            dismissal.participant.display_name,
            dismissal.remaining
        );

        if dismissal.remaining == 0 && room.members.close_if_empty().await {
            let mut rooms = self.rooms.write().await;
            if rooms
                .get(project_id)
                .is_some_and(|current| Arc::ptr_eq(current, &room))
            {
                rooms.remove(project_id);
                log::debug!("Closed empty room {project_id}");
            }
        }
        true
    }

    /// Current participants, empty if the room does not exist.
    pub async fn roster(&self, project_id: &ProjectId) -> Vec<Participant> {
        let room = self.rooms.read().await.get(project_id).cloned();
        match room {
            Some(room) => room.members.members().await,
            None => Vec::new(),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
