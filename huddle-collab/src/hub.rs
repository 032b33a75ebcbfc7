//! Connection-level dispatch over the collaboration components.
//!
//! ```text
//! ClientEvent ──► CollabHub::handle ──┬─ join-room / leave-room ──────► PresenceTracker
//!                                     ├─ attach / detach / update /
//!                                     │  sync-request / save ─────────► DocumentRegistry
//!                                     ├─ awareness-update ────────────► awareness::publish
//!                                     ├─ signal-* ────────────────────► SignalingRelay
//!                                     └─ ping ────────────────────────► pong
//! ```
//!
//! Errors are reported to the originating connection only. On disconnect
//! the hub leaves every room and detaches every document the connection
//! still holds, then forgets the connection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::access::{Action, PermissionGate, ProjectDirectory, UserIdentity};
use crate::awareness;
use crate::config::ServerConfig;
use crate::connection::{ConnectionHandle, ConnectionRegistry};
use crate::document::{DocumentRegistry, DocumentSession};
use crate::error::CollabError;
use crate::presence::PresenceTracker;
use crate::protocol::{
    ClientEvent, ConnectionId, DocumentKey, Participant, ProjectId, ServerEvent,
};
use crate::signaling::{SignalEnvelope, SignalingRelay};
use crate::storage::FileStore;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub active_sessions: usize,
    pub updates_applied: u64,
    pub duplicate_updates: u64,
    pub rejected_updates: u64,
    pub slow_peers_disconnected: u64,
    pub files_persisted: u64,
    pub persist_failures: u64,
}

/// Per-connection state owned by the connection task.
pub struct Connection {
    handle: Arc<ConnectionHandle>,
    rooms: HashSet<ProjectId>,
    documents: HashMap<DocumentKey, Arc<DocumentSession>>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub fn participant(&self) -> &Participant {
        self.handle.participant()
    }

    pub fn is_in_room(&self, project_id: &ProjectId) -> bool {
        self.rooms.contains(project_id)
    }

    pub fn is_attached(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }

    fn attached(&self, key: &DocumentKey) -> Result<&Arc<DocumentSession>, CollabError> {
        self.documents
            .get(key)
            .ok_or_else(|| CollabError::NotAttached(key.clone()))
    }
}

pub struct CollabHub {
    gate: PermissionGate,
    connections: Arc<ConnectionRegistry>,
    documents: Arc<DocumentRegistry>,
    presence: PresenceTracker,
    signaling: SignalingRelay,
    outbound_queue_capacity: usize,
    report_unknown_signal_target: bool,
    total_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    slow_peers: Arc<AtomicU64>,
}

impl CollabHub {
    pub fn new(
        config: &ServerConfig,
        directory: Arc<dyn ProjectDirectory>,
        store: Arc<dyn FileStore>,
    ) -> Self {
        let gate = PermissionGate::new(directory);
        let connections = Arc::new(ConnectionRegistry::new());
        Self {
            presence: PresenceTracker::new(gate.clone()),
            signaling: SignalingRelay::new(connections.clone()),
            documents: Arc::new(DocumentRegistry::new(
                store,
                config.idle_grace_period,
                config.max_update_bytes,
            )),
            gate,
            connections,
            outbound_queue_capacity: config.outbound_queue_capacity,
            report_unknown_signal_target: config.report_unknown_signal_target,
            total_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            slow_peers: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register an authenticated connection. The returned receiver carries
    /// its outbound events, starting with `welcome`.
    pub async fn connect(
        &self,
        identity: UserIdentity,
    ) -> (Connection, mpsc::Receiver<Arc<ServerEvent>>) {
        let participant = Participant {
            connection_id: ConnectionId::new(),
            user_id: identity.user_id,
            display_name: identity.display_name,
            avatar: identity.avatar,
        };
        let (handle, rx) = ConnectionHandle::new(
            participant.clone(),
            self.outbound_queue_capacity,
            self.slow_peers.clone(),
        );
        self.connections.register(handle.clone()).await;
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        handle.send(Arc::new(ServerEvent::Welcome { participant }));

        log::info!(
            "Connection {} opened for {}",
            handle.id(),
            handle.participant().user_id
        );
        let conn = Connection {
            handle,
            rooms: HashSet::new(),
            documents: HashMap::new(),
        };
        (conn, rx)
    }

    /// Count an inbound frame of `bytes` bytes.
    pub fn record_inbound(&self, bytes: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Handle one event from `conn`. Failures become events for `conn`.
    pub async fn handle(&self, conn: &mut Connection, event: ClientEvent) {
        let name = event.name();
        log::trace!("{} -> {name}", conn.id());
        if let Err(err) = self.dispatch(conn, event).await {
            self.report(conn, name, err);
        }
    }

    /// Report a failure to `conn` alone.
    pub fn report(&self, conn: &Connection, event_name: &str, err: CollabError) {
        match &err {
            CollabError::UnknownDestination(_) if !self.report_unknown_signal_target => {
                log::debug!("{} {event_name}: {err}", conn.id());
                return;
            }
            CollabError::Storage(_) => log::error!("{} {event_name}: {err}", conn.id()),
            _ => log::warn!("{} {event_name}: {err}", conn.id()),
        }
        conn.handle.send(Arc::new(err.to_event()));
    }

    async fn dispatch(&self, conn: &mut Connection, event: ClientEvent) -> Result<(), CollabError> {
        match event {
            ClientEvent::JoinRoom { project_id } => {
                // The tracker queues the roster-snapshot during admission.
                self.presence.join(&project_id, &conn.handle).await?;
                conn.rooms.insert(project_id);
            }
            ClientEvent::LeaveRoom { project_id } => {
                if conn.rooms.remove(&project_id) {
                    self.presence.leave(&project_id, &conn.id()).await;
                }
            }
            ClientEvent::AttachDocument {
                project_id,
                file_path,
            } => {
                self.authorize(conn, &project_id, Action::View)?;
                let key = DocumentKey::new(project_id, file_path);
                // The registry queues the document-snapshot during admission.
                let attachment = self.documents.attach(&key, &conn.handle).await?;
                conn.documents.insert(key, attachment.session);
            }
            ClientEvent::DetachDocument {
                project_id,
                file_path,
            } => {
                let key = DocumentKey::new(project_id, file_path);
                if let Some(session) = conn.documents.remove(&key) {
                    self.documents.detach(&session, &conn.id()).await;
                }
            }
            ClientEvent::DocumentUpdate {
                project_id,
                file_path,
                update,
            } => {
                self.authorize(conn, &project_id, Action::Edit)?;
                let key = DocumentKey::new(project_id, file_path);
                let session = conn.attached(&key)?;
                self.documents
                    .apply_update(session, &conn.id(), &update)
                    .await?;
            }
            ClientEvent::SyncRequest {
                project_id,
                file_path,
                state_vector,
            } => {
                self.authorize(conn, &project_id, Action::View)?;
                let key = DocumentKey::new(project_id, file_path);
                let update = self.documents.diff(conn.attached(&key)?, &state_vector).await?;
                conn.handle.send(Arc::new(ServerEvent::DocumentDiff {
                    project_id: key.project_id,
                    file_path: key.file_path,
                    update,
                }));
            }
            ClientEvent::AwarenessUpdate {
                project_id,
                file_path,
                state,
            } => {
                let key = DocumentKey::new(project_id, file_path);
                awareness::publish(conn.attached(&key)?, &conn.handle, state).await?;
            }
            ClientEvent::SaveDocument {
                project_id,
                file_path,
            } => {
                self.authorize(conn, &project_id, Action::Edit)?;
                let key = DocumentKey::new(project_id, file_path);
                self.documents.persist(conn.attached(&key)?).await?;
                log::info!("{} saved {key}", conn.id());
                conn.handle.send(Arc::new(ServerEvent::DocumentSaved {
                    project_id: key.project_id,
                    file_path: key.file_path,
                }));
            }
            event @ (ClientEvent::SignalOffer { .. }
            | ClientEvent::SignalAnswer { .. }
            | ClientEvent::SignalIce { .. }) => {
                if let Some(envelope) = SignalEnvelope::from_event(conn.id(), event) {
                    self.signaling.route(envelope).await?;
                }
            }
            ClientEvent::Ping => {
                conn.handle.send(Arc::new(ServerEvent::Pong));
            }
        }
        Ok(())
    }

    fn authorize(
        &self,
        conn: &Connection,
        project_id: &ProjectId,
        action: Action,
    ) -> Result<(), CollabError> {
        self.gate
            .authorize(conn.handle.user_id(), project_id, action)
            .map(|_| ())
            .map_err(|e| CollabError::from_access(e, project_id.clone(), action))
    }

    /// Release everything `conn` holds and forget it.
    pub async fn disconnect(&self, conn: Connection) {
        let id = conn.id();
        conn.handle.close();
        for project_id in &conn.rooms {
            self.presence.leave(project_id, &id).await;
        }
        for session in conn.documents.values() {
            self.documents.detach(session, &id).await;
        }
        self.connections.unregister(&id).await;
        log::info!(
            "Connection {id} closed ({} rooms, {} documents released)",
            conn.rooms.len(),
            conn.documents.len()
        );
    }

    /// Persist every changed document. Called periodically by the server.
    pub async fn flush_dirty(&self) -> usize {
        self.documents.flush_dirty().await
    }

    pub fn documents(&self) -> &Arc<DocumentRegistry> {
        &self.documents
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub async fn stats(&self) -> ServerStats {
        let documents = self.documents.stats().await;
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.connections.len().await as u64,
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.presence.room_count().await,
            active_sessions: documents.active_sessions,
            updates_applied: documents.updates_applied,
            duplicate_updates: documents.duplicate_updates,
            rejected_updates: documents.rejected_updates,
            slow_peers_disconnected: self.slow_peers.load(Ordering::Relaxed),
            files_persisted: documents.files_persisted,
            persist_failures: documents.persist_failures,
        }
    }
}
