//! WebSocket client for the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect with token and encoding, disconnect)
//! - Sending `ClientEvent`s through a writer task
//! - Receiving `ServerEvent`s on an mpsc channel
//!
//! Dropping the client aborts both tasks, which closes the socket without
//! a close frame.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::protocol::{percent_encode, ClientEvent, Frame, ProtocolError, ServerEvent, WireEncoding};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct CollabClient {
    server_url: String,
    token: String,
    encoding: WireEncoding,

    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Frame>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ServerEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ServerEvent>,

    tasks: Vec<JoinHandle<()>>,
}

impl CollabClient {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            token: token.into(),
            encoding: WireEncoding::Json,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            tasks: Vec::new(),
        }
    }

    /// Use `encoding` for this connection.
    pub fn with_encoding(mut self, encoding: WireEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!(
            "{}/?token={}&encoding={}",
            self.server_url.trim_end_matches('/'),
            percent_encode(&self.token),
            self.encoding.as_str()
        );
        let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(match e {
                    tungstenite::Error::Http(response) => {
                        ProtocolError::HandshakeRejected(response.status().to_string())
                    }
                    _ => ProtocolError::ConnectionClosed,
                });
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);
        self.outgoing_tx = Some(out_tx);

        // Writer task: forward outgoing frames to the socket
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let message = match frame {
                    Frame::Text(text) => Message::Text(text.into()),
                    Frame::Binary(bytes) => Message::Binary(bytes.into()),
                };
                if ws_writer.send(message).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode server events by frame type
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
                    Ok(Message::Binary(data)) => Frame::Binary(data.into()),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match frame.decode::<ServerEvent>() {
                    Ok(event) => {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                }
            }
            *state.write().await = ConnectionState::Disconnected;
        });

        self.tasks = vec![writer, reader];
        *self.state.write().await = ConnectionState::Connected;
        log::debug!("Connected to {} ({})", self.server_url, self.encoding.as_str());
        Ok(())
    }

    /// Send one event.
    pub async fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        let frame = self.encoding.encode(event)?;
        tx.send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Send a raw frame, bypassing the encoder.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection gracefully.
    pub async fn disconnect(&mut self) {
        // Dropping the sender lets the writer send a close frame.
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
