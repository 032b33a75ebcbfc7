//! Event protocol for the collaboration channel.
//!
//! Every frame carries exactly one event. Each event name maps to exactly
//! one payload shape (externally tagged enums), so handlers match
//! exhaustively and the compiler rejects unknown shapes.
//!
//! Wire format, chosen per connection at handshake (`?encoding=`):
//! ```text
//! ┌──────────────┬──────────┬────────────────────────────────────────┐
//! │ encoding     │ frame    │ example                                │
//! ├──────────────┼──────────┼────────────────────────────────────────┤
//! │ json (def.)  │ text     │ {"join-room":{"project_id":"p1"}}      │
//! │ bincode      │ binary   │ [variant idx][fields, standard config] │
//! └──────────────┴──────────┴────────────────────────────────────────┘
//! ```
//!
//! Document state and updates travel as opaque Yjs v1 update bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::access::Action;

// ───────────────────────────────────────────────────────────────────
// Identifiers
// ───────────────────────────────────────────────────────────────────

/// Server-assigned identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Project (room) identifier, opaque to this layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProjectId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable user identity resolved by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies exactly one replicated document: (project, file path).
///
/// The path is used verbatim; `/a.js` and `a.js` are different documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub project_id: ProjectId,
    pub file_path: String,
}

impl DocumentKey {
    pub fn new(project_id: impl Into<ProjectId>, file_path: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            file_path: file_path.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project_id, self.file_path)
    }
}

// ───────────────────────────────────────────────────────────────────
// Payload types
// ───────────────────────────────────────────────────────────────────

/// Label for a connection, fixed when the connection is admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
}

/// Zero-based position in a text document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub anchor: CursorPosition,
    pub head: CursorPosition,
}

/// Ephemeral cursor/selection state of one participant in one document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub cursor: CursorPosition,
    pub selection: Option<SelectionRange>,
}

/// A participant's most recent awareness state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAwareness {
    pub participant: Participant,
    pub state: AwarenessState,
}

/// Voice negotiation payload kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Recoverable error categories reported in `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    MalformedEvent,
    MalformedUpdate,
    NotAttached,
    UnknownDestination,
    StorageFailure,
}

// ───────────────────────────────────────────────────────────────────
// Events
// ───────────────────────────────────────────────────────────────────

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom {
        project_id: ProjectId,
    },
    LeaveRoom {
        project_id: ProjectId,
    },
    AttachDocument {
        project_id: ProjectId,
        file_path: String,
    },
    DetachDocument {
        project_id: ProjectId,
        file_path: String,
    },
    DocumentUpdate {
        project_id: ProjectId,
        file_path: String,
        update: Vec<u8>,
    },
    /// Request the diff between the server state and `state_vector`.
    SyncRequest {
        project_id: ProjectId,
        file_path: String,
        state_vector: Vec<u8>,
    },
    AwarenessUpdate {
        project_id: ProjectId,
        file_path: String,
        state: AwarenessState,
    },
    SaveDocument {
        project_id: ProjectId,
        file_path: String,
    },
    SignalOffer {
        to: ConnectionId,
        payload: String,
    },
    SignalAnswer {
        to: ConnectionId,
        payload: String,
    },
    SignalIce {
        to: ConnectionId,
        payload: String,
    },
    Ping,
}

impl ClientEvent {
    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom { .. } => "join-room",
            ClientEvent::LeaveRoom { .. } => "leave-room",
            ClientEvent::AttachDocument { .. } => "attach-document",
            ClientEvent::DetachDocument { .. } => "detach-document",
            ClientEvent::DocumentUpdate { .. } => "document-update",
            ClientEvent::SyncRequest { .. } => "sync-request",
            ClientEvent::AwarenessUpdate { .. } => "awareness-update",
            ClientEvent::SaveDocument { .. } => "save-document",
            ClientEvent::SignalOffer { .. } => "signal-offer",
            ClientEvent::SignalAnswer { .. } => "signal-answer",
            ClientEvent::SignalIce { .. } => "signal-ice",
            ClientEvent::Ping => "ping",
        }
    }

    pub fn signal(kind: SignalKind, to: ConnectionId, payload: impl Into<String>) -> Self {
        let payload = payload.into();
        match kind {
            SignalKind::Offer => ClientEvent::SignalOffer { to, payload },
            SignalKind::Answer => ClientEvent::SignalAnswer { to, payload },
            SignalKind::IceCandidate => ClientEvent::SignalIce { to, payload },
        }
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerEvent {
    /// First event on every connection.
    Welcome {
        participant: Participant,
    },
    RosterSnapshot {
        project_id: ProjectId,
        participants: Vec<Participant>,
    },
    ParticipantJoined {
        project_id: ProjectId,
        participant: Participant,
    },
    ParticipantLeft {
        project_id: ProjectId,
        participant: Participant,
    },
    DocumentSnapshot {
        project_id: ProjectId,
        file_path: String,
        state: Vec<u8>,
        awareness: Vec<PeerAwareness>,
    },
    DocumentUpdate {
        project_id: ProjectId,
        file_path: String,
        origin: ConnectionId,
        update: Vec<u8>,
    },
    DocumentDiff {
        project_id: ProjectId,
        file_path: String,
        update: Vec<u8>,
    },
    DocumentSaved {
        project_id: ProjectId,
        file_path: String,
    },
    AwarenessUpdate {
        project_id: ProjectId,
        file_path: String,
        peer: PeerAwareness,
    },
    AwarenessCleared {
        project_id: ProjectId,
        file_path: String,
        connection_id: ConnectionId,
    },
    SignalOffer {
        from: ConnectionId,
        payload: String,
    },
    SignalAnswer {
        from: ConnectionId,
        payload: String,
    },
    SignalIce {
        from: ConnectionId,
        payload: String,
    },
    PermissionDenied {
        project_id: ProjectId,
        action: Action,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Pong,
}

impl ServerEvent {
    pub fn signal(kind: SignalKind, from: ConnectionId, payload: String) -> Self {
        match kind {
            SignalKind::Offer => ServerEvent::SignalOffer { from, payload },
            SignalKind::Answer => ServerEvent::SignalAnswer { from, payload },
            SignalKind::IceCandidate => ServerEvent::SignalIce { from, payload },
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Codec
// ───────────────────────────────────────────────────────────────────

/// Per-connection encoding of outbound events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireEncoding {
    #[default]
    Json,
    Bincode,
}

impl WireEncoding {
    /// Parse the `encoding` parameter of a handshake query string.
    pub fn from_query(query: Option<&str>) -> Self {
        match query_param(query, "encoding").as_deref() {
            Some("bincode") => WireEncoding::Bincode,
            _ => WireEncoding::Json,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WireEncoding::Json => "json",
            WireEncoding::Bincode => "bincode",
        }
    }

    /// Serialize to a frame of this encoding.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Frame, ProtocolError> {
        match self {
            WireEncoding::Json => serde_json::to_string(value)
                .map(Frame::Text)
                .map_err(|e| ProtocolError::SerializationError(e.to_string())),
            WireEncoding::Bincode => {
                bincode::serde::encode_to_vec(value, bincode::config::standard())
                    .map(Frame::Binary)
                    .map_err(|e| ProtocolError::SerializationError(e.to_string()))
            }
        }
    }
}

/// One encoded event, ready for a WebSocket text or binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Deserialize, picking the decoder from the frame type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        match self {
            Frame::Text(text) => decode_json(text),
            Frame::Binary(bytes) => decode_bincode(bytes),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

pub fn decode_bincode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Look up `name` in a `a=1&b=2` query string and percent-decode its value.
pub fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (key == name).then(|| percent_decode(value))
    })
}

/// Escape everything outside the RFC 3986 unreserved set.
pub fn percent_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Malformed escapes are kept literally.
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = (bytes[i] == b'%')
            .then(|| value.get(i + 1..i + 3))
            .flatten()
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match escaped {
            Some(byte) => {
                decoded.push(byte);
                i += 3;
            }
            None => {
                decoded.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// The server refused the WebSocket handshake (e.g. bad token).
    HandshakeRejected(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::HandshakeRejected(e) => write!(f, "Handshake rejected: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_participant() -> Participant {
        Participant {
            connection_id: ConnectionId::new(),
            user_id: UserId::new("u-alice"),
            display_name: "Alice".into(),
            avatar: Some("https://example.test/a.png".into()),
        }
    }

    #[test]
    fn test_json_event_names_are_kebab_case() {
        let event = ClientEvent::JoinRoom {
            project_id: ProjectId::new("p1"),
        };
        let frame = WireEncoding::Json.encode(&event).unwrap();
        assert_eq!(frame, Frame::Text(r#"{"join-room":{"project_id":"p1"}}"#.into()));

        let ping = WireEncoding::Json.encode(&ClientEvent::Ping).unwrap();
        assert_eq!(ping, Frame::Text(r#""ping""#.into()));
    }

    #[test]
    fn test_json_decodes_handwritten_event() {
        let text = r#"{"document-update":{"project_id":"p1","file_path":"/index.js","update":[1,2,3]}}"#;
        let event: ClientEvent = decode_json(text).unwrap();
        assert_eq!(
            event,
            ClientEvent::DocumentUpdate {
                project_id: ProjectId::new("p1"),
                file_path: "/index.js".into(),
                update: vec![1, 2, 3],
            }
        );
        assert_eq!(event.name(), "document-update");
    }

    #[test]
    fn test_bincode_frame_is_binary() {
        let event = ServerEvent::AwarenessUpdate {
            project_id: ProjectId::new("p1"),
            file_path: "/main.rs".into(),
            peer: PeerAwareness {
                participant: sample_participant(),
                state: AwarenessState {
                    cursor: CursorPosition::new(3, 7),
                    selection: Some(SelectionRange {
                        anchor: CursorPosition::new(3, 0),
                        head: CursorPosition::new(3, 7),
                    }),
                },
            },
        };
        let frame = WireEncoding::Bincode.encode(&event).unwrap();
        assert!(matches!(frame, Frame::Binary(_)));
        let decoded: ServerEvent = frame.decode().unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_frame_type_selects_decoder() {
        let event = ClientEvent::signal(SignalKind::IceCandidate, ConnectionId::new(), "cand");
        let json = WireEncoding::Json.encode(&event).unwrap();
        let bin = WireEncoding::Bincode.encode(&event).unwrap();
        assert_eq!(json.decode::<ClientEvent>().unwrap(), event);
        assert_eq!(bin.decode::<ClientEvent>().unwrap(), event);
    }

    #[test]
    fn test_unknown_event_name_rejected() {
        let result: Result<ClientEvent, _> = decode_json(r#"{"drop-table":{}}"#);
        assert!(matches!(result, Err(ProtocolError::DeserializationError(_))));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(decode_bincode::<ClientEvent>(&garbage).is_err());
    }

    #[test]
    fn test_query_param() {
        let query = Some("token=abc&encoding=bincode");
        assert_eq!(query_param(query, "token").as_deref(), Some("abc"));
        assert_eq!(query_param(query, "encoding").as_deref(), Some("bincode"));
        assert_eq!(query_param(Some("flag"), "flag").as_deref(), Some(""));
        assert_eq!(query_param(Some("token=abc"), "encoding"), None);
        assert_eq!(query_param(None, "token"), None);
    }

    #[test]
    fn test_token_with_reserved_characters_survives_query() {
        let token = "a&b=c#d e/f%g+h";
        let encoded = percent_encode(token);
        assert_eq!(encoded, "a%26b%3Dc%23d%20e%2Ff%25g%2Bh");
        let query = format!("token={encoded}&encoding=json");
        assert_eq!(query_param(Some(&query), "token").as_deref(), Some(token));
        assert_eq!(WireEncoding::from_query(Some(&query)), WireEncoding::Json);
        assert_eq!(percent_encode("t-alice_1.x~"), "t-alice_1.x~");
    }

    #[test]
    fn test_malformed_escape_kept_literally() {
        assert_eq!(query_param(Some("token=50%"), "token").as_deref(), Some("50%"));
        assert_eq!(query_param(Some("token=%zz1"), "token").as_deref(), Some("%zz1"));
        assert_eq!(query_param(Some("token=caf%C3%A9"), "token").as_deref(), Some("caf\u{e9}"));
    }

    #[test]
    fn test_encoding_from_query() {
        assert_eq!(WireEncoding::from_query(None), WireEncoding::Json);
        assert_eq!(WireEncoding::from_query(Some("encoding=bincode")), WireEncoding::Bincode);
        assert_eq!(WireEncoding::from_query(Some("encoding=xml")), WireEncoding::Json);
    }

    #[test]
    fn test_document_key_identity() {
        let a = DocumentKey::new("p1", "/index.js");
        let b = DocumentKey::new("p1", "index.js");
        let c = DocumentKey::new("p2", "/index.js");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, DocumentKey::new(ProjectId::new("p1"), "/index.js"));
        assert_eq!(a.to_string(), "p1:/index.js");
    }

    #[test]
    fn test_signal_constructors_match_kind() {
        let from = ConnectionId::new();
        assert!(matches!(
            ServerEvent::signal(SignalKind::Offer, from, "sdp".into()),
            ServerEvent::SignalOffer { .. }
        ));
        assert!(matches!(
            ServerEvent::signal(SignalKind::Answer, from, "sdp".into()),
            ServerEvent::SignalAnswer { .. }
        ));
        assert!(matches!(
            ServerEvent::signal(SignalKind::IceCandidate, from, "c".into()),
            ServerEvent::SignalIce { .. }
        ));
    }
}
