//! Member sets with ordered fan-out.
//!
//! A [`BroadcastGroup`] is the membership of one room or one document
//! session. Membership changes and fan-out happen under the same lock, so
//! every member observes events in the order the group applied them, and
//! a member admitted after an event never receives it.
//!
//! A group can be closed once it is empty. A closed group admits nobody;
//! the owner then drops it and a later admission creates a fresh group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::connection::{ConnectionHandle, Delivery};
use crate::protocol::{ConnectionId, Participant, ServerEvent};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub peers_dropped: u64,
    pub active_peers: usize,
}

/// Counters updated on the fan-out path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    peers_dropped: AtomicU64,
}

#[derive(Default)]
struct GroupInner {
    members: HashMap<ConnectionId, Arc<ConnectionHandle>>,
    closed: bool,
}

impl GroupInner {
    fn roster(&self) -> Vec<Participant> {
        let mut roster: Vec<Participant> =
            self.members.values().map(|m| m.participant().clone()).collect();
        roster.sort_by_key(|p| p.connection_id);
        roster
    }
}

/// Returned by [`BroadcastGroup::admit`] when the group was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupClosed;

/// Outcome of a successful admission.
#[derive(Debug, Clone)]
pub struct Admission {
    /// Members after the admission, including the new one.
    pub roster: Vec<Participant>,
    /// False when the connection was already a member.
    pub newly_added: bool,
}

/// Outcome of removing a member.
#[derive(Debug, Clone)]
pub struct Dismissal {
    pub participant: Participant,
    pub remaining: usize,
}

pub struct BroadcastGroup {
    inner: Mutex<GroupInner>,
    stats: AtomicBroadcastStats,
}

impl Default for BroadcastGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GroupInner::default()),
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a member. `announce` goes to the existing members only, and only
    /// if the connection was not already present.
    pub async fn admit(
        &self,
        handle: Arc<ConnectionHandle>,
        announce: Option<ServerEvent>,
    ) -> Result<Admission, GroupClosed> {
        self.admit_with_greeting(handle, announce, |_| None).await
    }

    /// Like [`admit`](Self::admit), and also queue the event built by
    /// `greeting` for the member itself. The greeting sees the roster after
    /// admission and precedes every event fanned out later, so a member can
    /// use it as its starting view.
    pub async fn admit_with_greeting(
        &self,
        handle: Arc<ConnectionHandle>,
        announce: Option<ServerEvent>,
        greeting: impl FnOnce(&[Participant]) -> Option<ServerEvent>,
    ) -> Result<Admission, GroupClosed> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(GroupClosed);
        }
        let id = handle.id();
        let newly_added = inner.members.insert(id, handle.clone()).is_none();
        let roster = inner.roster();
        if let Some(event) = greeting(&roster) {
            handle.send(Arc::new(event));
        }
        if newly_added {
            if let Some(event) = announce {
                self.fan_out(&inner, Arc::new(event), Some(id));
            }
        }
        Ok(Admission {
            roster,
            newly_added,
        })
    }

    /// Remove a member and tell the rest with the event built by `announce`.
    pub async fn dismiss(
        &self,
        id: &ConnectionId,
        announce: impl FnOnce(&Participant) -> Option<ServerEvent>,
    ) -> Option<Dismissal> {
        let mut inner = self.inner.lock().await;
        let handle = inner.members.remove(id)?;
        let participant = handle.participant().clone();
        if let Some(event) = announce(&participant) {
            self.fan_out(&inner, Arc::new(event), None);
        }
        Some(Dismissal {
            participant,
            remaining: inner.members.len(),
        })
    }

    /// Close the group if it has no members. Returns true if the group is
    /// (now or already) closed.
    pub async fn close_if_empty(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.members.is_empty() {
            inner.closed = true;
        }
        inner.closed
    }

    /// Deliver `event` to every member except `excluding`.
    /// Returns the number of members it was queued for.
    pub async fn broadcast(&self, event: ServerEvent, excluding: Option<ConnectionId>) -> usize {
        let inner = self.inner.lock().await;
        self.fan_out(&inner, Arc::new(event), excluding)
    }

    fn fan_out(
        &self,
        inner: &GroupInner,
        event: Arc<ServerEvent>,
        excluding: Option<ConnectionId>,
    ) -> usize {
        let mut delivered = 0;
        for (id, member) in &inner.members {
            if Some(*id) == excluding {
                continue;
            }
            match member.send(event.clone()) {
                Delivery::Queued => delivered += 1,
                Delivery::Overflowed => {
                    self.stats.peers_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Delivery::Closed => {}
            }
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub async fn members(&self) -> Vec<Participant> {
        self.inner.lock().await.roster()
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.lock().await.members.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.members.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> BroadcastStats {
        let active_peers = self.len().await;
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            peers_dropped: self.stats.peers_dropped.load(Ordering::Relaxed),
            active_peers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::{drain, handle};

    #[tokio::test]
    async fn test_admit_and_dismiss() {
        let group = BroadcastGroup::new();
        let (alice, _rx) = handle("Alice", 8);

        let admission = group.admit(alice.clone(), None).await.unwrap();
        assert!(admission.newly_added);
        assert_eq!(admission.roster.len(), 1);
        assert!(group.contains(&alice.id()).await);

        let dismissal = group.dismiss(&alice.id(), |_| None).await.unwrap();
        assert_eq!(dismissal.participant.display_name, "Alice");
        assert_eq!(dismissal.remaining, 0);
        assert!(group.dismiss(&alice.id(), |_| None).await.is_none());
    }

    #[tokio::test]
    async fn test_announce_reaches_others_only() {
        let group = BroadcastGroup::new();
        let (alice, mut rx_a) = handle("Alice", 8);
        let (bob, mut rx_b) = handle("Bob", 8);

        group.admit(alice.clone(), None).await.unwrap();
        group.admit(bob.clone(), Some(ServerEvent::Pong)).await.unwrap();

        assert_eq!(drain(&mut rx_a), vec![ServerEvent::Pong]);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_readmit_is_silent() {
        let group = BroadcastGroup::new();
        let (alice, mut rx_a) = handle("Alice", 8);
        let (bob, _rx_b) = handle("Bob", 8);

        group.admit(alice.clone(), None).await.unwrap();
        group.admit(bob.clone(), Some(ServerEvent::Pong)).await.unwrap();
        let again = group.admit(bob.clone(), Some(ServerEvent::Pong)).await.unwrap();

        assert!(!again.newly_added);
        assert_eq!(again.roster.len(), 2);
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[tokio::test]
    async fn test_greeting_precedes_later_fan_out() {
        let group = BroadcastGroup::new();
        let (alice, _rx_a) = handle("Alice", 8);
        let (bob, mut rx_b) = handle("Bob", 8);
        let project_id = crate::protocol::ProjectId::new("p1");
        group.admit(alice.clone(), None).await.unwrap();

        let admission = group
            .admit_with_greeting(bob.clone(), None, |roster| {
                Some(ServerEvent::RosterSnapshot {
                    project_id: project_id.clone(),
                    participants: roster.to_vec(),
                })
            })
            .await
            .unwrap();
        group
            .dismiss(&alice.id(), |p| {
                Some(ServerEvent::ParticipantLeft {
                    project_id: project_id.clone(),
                    participant: p.clone(),
                })
            })
            .await;

        let events = drain(&mut rx_b);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            ServerEvent::RosterSnapshot {
                project_id: project_id.clone(),
                participants: admission.roster,
            }
        );
        assert!(matches!(&events[1], ServerEvent::ParticipantLeft { participant, .. }
            if participant.connection_id == alice.id()));
    }

    #[tokio::test]
    async fn test_broadcast_excludes_origin() {
        let group = BroadcastGroup::new();
        let (alice, mut rx_a) = handle("Alice", 8);
        let (bob, mut rx_b) = handle("Bob", 8);
        let (carol, mut rx_c) = handle("Carol", 8);
        for h in [&alice, &bob, &carol] {
            group.admit(h.clone(), None).await.unwrap();
        }

        let delivered = group.broadcast(ServerEvent::Pong, Some(alice.id())).await;
        assert_eq!(delivered, 2);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert_eq!(drain(&mut rx_c).len(), 1);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.active_peers, 3);
    }

    #[tokio::test]
    async fn test_slow_member_is_dropped_not_awaited() {
        let group = BroadcastGroup::new();
        let (fast, mut rx_fast) = handle("Fast", 64);
        let (slow, _rx_slow) = handle("Slow", 1);
        group.admit(fast.clone(), None).await.unwrap();
        group.admit(slow.clone(), None).await.unwrap();

        for _ in 0..10 {
            group.broadcast(ServerEvent::Pong, None).await;
        }

        assert_eq!(drain(&mut rx_fast).len(), 10);
        assert!(slow.is_closing());
        assert_eq!(group.stats().await.peers_dropped, 1);
    }

    #[tokio::test]
    async fn test_closed_group_refuses_admission() {
        let group = BroadcastGroup::new();
        let (alice, _rx) = handle("Alice", 8);
        group.admit(alice.clone(), None).await.unwrap();

        assert!(!group.close_if_empty().await);
        group.dismiss(&alice.id(), |_| None).await;
        assert!(group.close_if_empty().await);
        assert_eq!(group.admit(alice, None).await.unwrap_err(), GroupClosed);
    }

    #[tokio::test]
    async fn test_dismiss_announcement() {
        let group = BroadcastGroup::new();
        let (alice, _rx_a) = handle("Alice", 8);
        let (bob, mut rx_b) = handle("Bob", 8);
        group.admit(alice.clone(), None).await.unwrap();
        group.admit(bob.clone(), None).await.unwrap();

        group
            .dismiss(&alice.id(), |p| {
                Some(ServerEvent::error(crate::protocol::ErrorCode::NotAttached, &p.display_name))
            })
            .await;

        let events = drain(&mut rx_b);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ServerEvent::Error { message, .. } if message == "Alice"));
    }
}
