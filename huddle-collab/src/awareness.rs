//! Awareness broadcaster: ephemeral cursor and selection state.
//!
//! Awareness is last-write-wins per (document, connection), never
//! persisted, and relayed to the other members of the document session.
//! A newly attached member receives the current table in its snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::broadcast::{BroadcastGroup, GroupClosed};
use crate::connection::ConnectionHandle;
use crate::document::DocumentSession;
use crate::error::CollabError;
use crate::protocol::{AwarenessState, ConnectionId, DocumentKey, PeerAwareness, ServerEvent};

/// Latest awareness state of each member of one document session.
#[derive(Default)]
pub struct AwarenessTable {
    entries: Mutex<HashMap<ConnectionId, PeerAwareness>>,
}

impl AwarenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `state` for `conn` and relay it to the rest of `group`.
    pub async fn publish(
        &self,
        key: &DocumentKey,
        group: &BroadcastGroup,
        conn: &ConnectionHandle,
        state: AwarenessState,
    ) -> usize {
        let peer = PeerAwareness {
            participant: conn.participant().clone(),
            state,
        };
        let mut entries = self.entries.lock().await;
        entries.insert(conn.id(), peer.clone());
        let event = ServerEvent::AwarenessUpdate {
            project_id: key.project_id.clone(),
            file_path: key.file_path.clone(),
            peer,
        };
        // Relay while holding the table so relays follow store order.
        group.broadcast(event, Some(conn.id())).await
    }

    /// Drop `conn`'s state and tell the rest of `group`, if there was any.
    pub async fn clear(&self, key: &DocumentKey, group: &BroadcastGroup, conn: &ConnectionId) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.remove(conn).is_none() {
            return false;
        }
        let event = ServerEvent::AwarenessCleared {
            project_id: key.project_id.clone(),
            file_path: key.file_path.clone(),
            connection_id: *conn,
        };
        group.broadcast(event, Some(*conn)).await;
        true
    }

    /// Admit `conn` to `group` and queue it the event `greeting` builds
    /// from the other members' states. No publish or clear can land
    /// between the states it sees and its admission.
    pub async fn admit(
        &self,
        group: &BroadcastGroup,
        conn: &Arc<ConnectionHandle>,
        greeting: impl FnOnce(Vec<PeerAwareness>) -> ServerEvent,
    ) -> Result<Vec<PeerAwareness>, GroupClosed> {
        let entries = self.entries.lock().await;
        let peers = sorted_peers(&entries, Some(conn.id()));
        let event = greeting(peers.clone());
        group
            .admit_with_greeting(conn.clone(), None, |_| Some(event))
            .await?;
        Ok(peers)
    }

    /// Current states, omitting `excluding`.
    pub async fn snapshot(&self, excluding: Option<ConnectionId>) -> Vec<PeerAwareness> {
        sorted_peers(&*self.entries.lock().await, excluding)
    }

    /// Hold the table, stalling publishes and admissions until dropped.
    #[cfg(test)]
    pub(crate) async fn hold(&self) -> tokio::sync::MutexGuard<'_, HashMap<ConnectionId, PeerAwareness>> {
        self.entries.lock().await
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn sorted_peers(
    entries: &HashMap<ConnectionId, PeerAwareness>,
    excluding: Option<ConnectionId>,
) -> Vec<PeerAwareness> {
    let mut peers: Vec<PeerAwareness> = entries
        .iter()
        .filter(|(id, _)| Some(**id) != excluding)
        .map(|(_, peer)| peer.clone())
        .collect();
    peers.sort_by_key(|p| p.participant.connection_id);
    peers
}

/// Publish `conn`'s awareness in `session`. The connection must be attached.
pub async fn publish(
    session: &DocumentSession,
    conn: &ConnectionHandle,
    state: AwarenessState,
) -> Result<usize, CollabError> {
    if !session.members().contains(&conn.id()).await {
        return Err(CollabError::NotAttached(session.key().clone()));
    }
    let delivered = session
        .awareness()
        .publish(session.key(), session.members(), conn, state)
        .await;
    log::trace!("Awareness from {} in {} relayed to {delivered}", conn.id(), session.key());
    Ok(delivered)
}

/// Clear `conn`'s awareness in `session`.
pub async fn clear(session: &DocumentSession, conn: &ConnectionId) -> bool {
    session
        .awareness()
        .clear(session.key(), session.members(), conn)
        .await
}
