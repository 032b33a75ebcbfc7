//! Point-to-point relay for voice negotiation.
//!
//! Offer, answer and ICE candidate payloads are opaque strings addressed
//! to a connection id. The relay forwards them to exactly that connection,
//! stamped with the sender's id. It keeps no state of its own; a message
//! for a connection that is gone has nowhere to go.

use std::sync::Arc;

use crate::connection::{ConnectionRegistry, Delivery};
use crate::error::CollabError;
use crate::protocol::{ClientEvent, ConnectionId, ServerEvent, SignalKind};

/// One signaling message in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub from: ConnectionId,
    pub to: ConnectionId,
    pub kind: SignalKind,
    pub payload: String,
}

impl SignalEnvelope {
    /// Wrap a client signaling event; `None` for any other event.
    pub fn from_event(from: ConnectionId, event: ClientEvent) -> Option<Self> {
        let (kind, to, payload) = match event {
            ClientEvent::SignalOffer { to, payload } => (SignalKind::Offer, to, payload),
            ClientEvent::SignalAnswer { to, payload } => (SignalKind::Answer, to, payload),
            ClientEvent::SignalIce { to, payload } => (SignalKind::IceCandidate, to, payload),
            _ => return None,
        };
        Some(Self {
            from,
            to,
            kind,
            payload,
        })
    }
}

pub struct SignalingRelay {
    connections: Arc<ConnectionRegistry>,
}

impl SignalingRelay {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self { connections }
    }

    /// Forward to the addressed connection.
    pub async fn route(&self, envelope: SignalEnvelope) -> Result<(), CollabError> {
        let Some(target) = self.connections.get(&envelope.to).await else {
            log::debug!(
                "Dropping {:?} from {} to unknown {}",
                envelope.kind,
                envelope.from,
                envelope.to
            );
            return Err(CollabError::UnknownDestination(envelope.to));
        };
        let event = ServerEvent::signal(envelope.kind, envelope.from, envelope.payload);
        match target.send(Arc::new(event)) {
            Delivery::Queued | Delivery::Overflowed => Ok(()),
            Delivery::Closed => Err(CollabError::UnknownDestination(envelope.to)),
        }
    }
}
