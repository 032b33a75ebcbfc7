//! Integration tests for project rooms and cursor awareness.
//!
//! These tests start a real server and connect several clients,
//! verifying roster snapshots, join/leave announcements, awareness
//! relay, and the cleanup that follows an abrupt disconnect.

use huddle_collab::protocol::{
    AwarenessState, ClientEvent, ConnectionId, CursorPosition, DocumentKey, Participant, ProjectId,
    SelectionRange, ServerEvent, WireEncoding,
};
use huddle_collab::{
    Action, CollabClient, CollabHub, CollabServer, MemoryFileStore, Role, ServerConfig,
    StaticDirectory, UserIdentity,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Start a server on a free port, return its URL and hub.
async fn start_test_server() -> (String, Arc<CollabHub>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let directory = Arc::new(
        StaticDirectory::new()
            .with_user("t-alice", UserIdentity::new("alice", "Alice"))
            .with_user("t-bob", UserIdentity::new("bob", "Bob"))
            .with_user("t-carol", UserIdentity::new("carol", "Carol"))
            .with_user("t-mallory", UserIdentity::new("mallory", "Mallory"))
            .with_member("p1", "alice", Role::Owner)
            .with_member("p1", "bob", Role::Viewer)
            .with_member("p1", "carol", Role::Editor),
    );
    let store = Arc::new(MemoryFileStore::new().with_file(DocumentKey::new("p1", "/app.ts"), "let x = 1;\n"));
    let server = CollabServer::new(ServerConfig::default(), directory.clone(), directory, store);
    let hub = server.hub().clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (format!("ws://{addr}"), hub)
}

async fn connect(
    url: &str,
    token: &str,
) -> (CollabClient, mpsc::Receiver<ServerEvent>, Participant) {
    let mut client = CollabClient::new(url, token).with_encoding(WireEncoding::Json);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    match next_event(&mut events).await {
        ServerEvent::Welcome { participant } => (client, events, participant),
        other => panic!("expected welcome, got {other:?}"),
    }
}

async fn next_event(events: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn assert_quiet(events: &mut mpsc::Receiver<ServerEvent>) {
    if let Ok(Some(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        panic!("unexpected event {event:?}");
    }
}

async fn join(client: &CollabClient, events: &mut mpsc::Receiver<ServerEvent>) -> Vec<Participant> {
    client
        .send(&ClientEvent::JoinRoom {
            project_id: ProjectId::new("p1"),
        })
        .await
        .unwrap();
    match next_event(events).await {
        ServerEvent::RosterSnapshot { participants, .. } => participants,
        other => panic!("expected roster, got {other:?}"),
    }
}

async fn attach(client: &CollabClient, events: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    client
        .send(&ClientEvent::AttachDocument {
            project_id: ProjectId::new("p1"),
            file_path: "/app.ts".into(),
        })
        .await
        .unwrap();
    next_event(events).await
}

fn cursor(line: u32, column: u32) -> ClientEvent {
    ClientEvent::AwarenessUpdate {
        project_id: ProjectId::new("p1"),
        file_path: "/app.ts".into(),
        state: AwarenessState {
            cursor: CursorPosition::new(line, column),
            selection: None,
        },
    }
}

fn ids(participants: &[Participant]) -> Vec<ConnectionId> {
    let mut ids: Vec<_> = participants.iter().map(|p| p.connection_id).collect();
    ids.sort();
    ids
}

// ─── Rooms ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_join_announces_and_returns_roster() {
    let (url, hub) = start_test_server().await;
    let (alice, mut rx_a, alice_p) = connect(&url, "t-alice").await;
    let (bob, mut rx_b, bob_p) = connect(&url, "t-bob").await;

    let roster = join(&alice, &mut rx_a).await;
    assert_eq!(roster, vec![alice_p.clone()]);

    let roster = join(&bob, &mut rx_b).await;
    assert_eq!(ids(&roster), ids(&[alice_p.clone(), bob_p.clone()]));

    assert_eq!(
        next_event(&mut rx_a).await,
        ServerEvent::ParticipantJoined {
            project_id: ProjectId::new("p1"),
            participant: bob_p,
        }
    );
    // The joiner is not told about itself
    assert_quiet(&mut rx_b).await;
    assert_eq!(hub.presence().roster(&ProjectId::new("p1")).await.len(), 2);
}

#[tokio::test]
async fn test_rejoin_is_idempotent() {
    let (url, hub) = start_test_server().await;
    let (alice, mut rx_a, _) = connect(&url, "t-alice").await;
    let (bob, mut rx_b, _) = connect(&url, "t-bob").await;

    join(&alice, &mut rx_a).await;
    join(&bob, &mut rx_b).await;
    let _ = next_event(&mut rx_a).await;

    let roster = join(&bob, &mut rx_b).await;
    assert_eq!(roster.len(), 2);
    assert_quiet(&mut rx_a).await;
    assert_eq!(hub.presence().roster(&ProjectId::new("p1")).await.len(), 2);
}

#[tokio::test]
async fn test_outsider_cannot_join() {
    let (url, hub) = start_test_server().await;
    let (mallory, mut rx_m, _) = connect(&url, "t-mallory").await;

    mallory
        .send(&ClientEvent::JoinRoom {
            project_id: ProjectId::new("p1"),
        })
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut rx_m).await,
        ServerEvent::PermissionDenied {
            project_id: ProjectId::new("p1"),
            action: Action::View,
        }
    );
    assert_eq!(hub.presence().room_count().await, 0);
}

#[tokio::test]
async fn test_abrupt_disconnect_announces_leave() {
    let (url, hub) = start_test_server().await;
    let (alice, mut rx_a, _) = connect(&url, "t-alice").await;
    let (bob, mut rx_b, bob_p) = connect(&url, "t-bob").await;

    join(&alice, &mut rx_a).await;
    join(&bob, &mut rx_b).await;
    let _ = next_event(&mut rx_a).await;

    // No close frame: the socket just goes away
    drop(bob);

    assert_eq!(
        next_event(&mut rx_a).await,
        ServerEvent::ParticipantLeft {
            project_id: ProjectId::new("p1"),
            participant: bob_p,
        }
    );
    assert_eq!(hub.presence().roster(&ProjectId::new("p1")).await.len(), 1);

    drop(alice);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hub.presence().room_count().await, 0);
    assert_eq!(hub.stats().await.active_connections, 0);
}

// ─── Awareness ──────────────────────────────────────────────────

#[tokio::test]
async fn test_awareness_relayed_to_other_members() {
    let (url, _hub) = start_test_server().await;
    let (alice, mut rx_a, alice_p) = connect(&url, "t-alice").await;
    let (bob, mut rx_b, _) = connect(&url, "t-bob").await;
    attach(&alice, &mut rx_a).await;
    attach(&bob, &mut rx_b).await;

    let state = AwarenessState {
        cursor: CursorPosition::new(0, 4),
        selection: Some(SelectionRange {
            anchor: CursorPosition::new(0, 4),
            head: CursorPosition::new(0, 9),
        }),
    };
    alice
        .send(&ClientEvent::AwarenessUpdate {
            project_id: ProjectId::new("p1"),
            file_path: "/app.ts".into(),
            state,
        })
        .await
        .unwrap();

    match next_event(&mut rx_b).await {
        ServerEvent::AwarenessUpdate { peer, .. } => {
            assert_eq!(peer.participant, alice_p);
            assert_eq!(peer.state, state);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_quiet(&mut rx_a).await;
}

#[tokio::test]
async fn test_viewer_may_publish_awareness() {
    let (url, _hub) = start_test_server().await;
    let (alice, mut rx_a, _) = connect(&url, "t-alice").await;
    let (bob, mut rx_b, bob_p) = connect(&url, "t-bob").await;
    attach(&alice, &mut rx_a).await;
    attach(&bob, &mut rx_b).await;

    bob.send(&cursor(3, 1)).await.unwrap();
    match next_event(&mut rx_a).await {
        ServerEvent::AwarenessUpdate { peer, .. } => assert_eq!(peer.participant, bob_p),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_late_attach_receives_awareness_snapshot() {
    let (url, _hub) = start_test_server().await;
    let (alice, mut rx_a, alice_p) = connect(&url, "t-alice").await;
    let (carol, mut rx_c, _) = connect(&url, "t-carol").await;

    attach(&alice, &mut rx_a).await;
    alice.send(&cursor(0, 1)).await.unwrap();
    alice.send(&cursor(0, 7)).await.unwrap();
    // Ping round-trip orders the awareness updates before carol's attach
    alice.send(&ClientEvent::Ping).await.unwrap();
    assert_eq!(next_event(&mut rx_a).await, ServerEvent::Pong);

    match attach(&carol, &mut rx_c).await {
        ServerEvent::DocumentSnapshot { awareness, .. } => {
            assert_eq!(awareness.len(), 1);
            assert_eq!(awareness[0].participant, alice_p);
            assert_eq!(awareness[0].state.cursor, CursorPosition::new(0, 7));
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_awareness_cleared_on_detach_and_disconnect() {
    let (url, _hub) = start_test_server().await;
    let (alice, mut rx_a, alice_p) = connect(&url, "t-alice").await;
    let (bob, mut rx_b, bob_p) = connect(&url, "t-bob").await;
    let (carol, mut rx_c, _) = connect(&url, "t-carol").await;
    attach(&alice, &mut rx_a).await;
    attach(&bob, &mut rx_b).await;
    attach(&carol, &mut rx_c).await;

    alice.send(&cursor(1, 1)).await.unwrap();
    let _ = next_event(&mut rx_b).await;
    let _ = next_event(&mut rx_c).await;

    alice
        .send(&ClientEvent::DetachDocument {
            project_id: ProjectId::new("p1"),
            file_path: "/app.ts".into(),
        })
        .await
        .unwrap();
    for rx in [&mut rx_b, &mut rx_c] {
        assert_eq!(
            next_event(rx).await,
            ServerEvent::AwarenessCleared {
                project_id: ProjectId::new("p1"),
                file_path: "/app.ts".into(),
                connection_id: alice_p.connection_id,
            }
        );
    }

    bob.send(&cursor(2, 0)).await.unwrap();
    let _ = next_event(&mut rx_c).await;
    drop(bob);
    assert_eq!(
        next_event(&mut rx_c).await,
        ServerEvent::AwarenessCleared {
            project_id: ProjectId::new("p1"),
            file_path: "/app.ts".into(),
            connection_id: bob_p.connection_id,
        }
    );
}

#[tokio::test]
async fn test_awareness_without_attach_is_rejected() {
    let (url, _hub) = start_test_server().await;
    let (alice, mut rx_a, _) = connect(&url, "t-alice").await;

    alice.send(&cursor(0, 0)).await.unwrap();
    match next_event(&mut rx_a).await {
        ServerEvent::Error { code, .. } => {
            assert_eq!(code, huddle_collab::ErrorCode::NotAttached)
        }
        other => panic!("unexpected {other:?}"),
    }
}
