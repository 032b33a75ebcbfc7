//! Per-connection outbound queues and the live-connection registry.
//!
//! Every fan-out path delivers through [`ConnectionHandle::send`], which
//! never waits: events go into a bounded queue drained by the connection's
//! writer task. A full queue means the peer cannot keep up, so the peer is
//! told to shut down instead of stalling the sender.
//!
//! ```text
//! DocumentSession ─┐                       ┌──────────────┐
//! Room ────────────┼─ try_send ──► [queue] ─► writer task  ─► socket
//! SignalingRelay ──┘      │                └──────────────┘
//!                         └─ full ──► close() ──► reader loop exits ──► cascade cleanup
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::protocol::{ConnectionId, Participant, ServerEvent, UserId};

/// Result of queueing one event for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full; the peer has been asked to disconnect.
    Overflowed,
    /// Peer already gone or shutting down.
    Closed,
}

/// Server-side half of one live connection.
pub struct ConnectionHandle {
    participant: Participant,
    outbound: mpsc::Sender<Arc<ServerEvent>>,
    closing: AtomicBool,
    shutdown: Notify,
    /// Shared counter of peers dropped for overflowing.
    slow_peers: Arc<AtomicU64>,
}

impl ConnectionHandle {
    /// Create a handle with an outbound queue of `capacity` events.
    pub fn new(
        participant: Participant,
        capacity: usize,
        slow_peers: Arc<AtomicU64>,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<ServerEvent>>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Arc::new(Self {
            participant,
            outbound,
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
            slow_peers,
        });
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.participant.connection_id
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn user_id(&self) -> &UserId {
        &self.participant.user_id
    }

    /// Queue an event without waiting.
    pub fn send(&self, event: Arc<ServerEvent>) -> Delivery {
        if self.is_closing() {
            return Delivery::Closed;
        }
        match self.outbound.try_send(event) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "Outbound queue full for {} ({}), disconnecting",
                    self.participant.display_name,
                    self.id()
                );
                self.slow_peers.fetch_add(1, Ordering::Relaxed);
                self.close();
                Delivery::Overflowed
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Ask the connection task to shut down.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_waiters();
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        loop {
            let notified = self.shutdown.notified();
            if self.is_closing() {
                return;
            }
            notified.await;
        }
    }
}

/// Live connections by id, used for point-to-point addressing.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: Arc<ConnectionHandle>) {
        self.connections.write().await.insert(handle.id(), handle);
    }

    pub async fn unregister(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.write().await.remove(id)
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
