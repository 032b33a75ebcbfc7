//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! TCP accept ──► handshake (token → UserIdentity, ?encoding=) ──► 401 on failure
//!                    │
//!                    ▼
//!             per-connection task
//!             ┌─────────────────────────────────────────────────┐
//!             │ select!                                         │
//!             │   socket frame ──► decode ──► CollabHub::handle │
//!             │   outbound queue ──► encode ──► socket          │
//!             │   close requested (slow peer) ──► exit          │
//!             └─────────────────────────────────────────────────┘
//!                    │ exit
//!                    ▼
//!             CollabHub::disconnect (leave rooms, detach documents)
//!
//! background: every persist_interval ──► CollabHub::flush_dirty
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::Message;

use crate::access::{Authenticator, ProjectDirectory, UserIdentity};
use crate::config::ServerConfig;
use crate::error::CollabError;
use crate::hub::{CollabHub, ServerStats};
use crate::protocol::{query_param, ClientEvent, Frame, WireEncoding};
use crate::storage::FileStore;

pub struct CollabServer {
    config: ServerConfig,
    hub: Arc<CollabHub>,
    authenticator: Arc<dyn Authenticator>,
}

/// Shortest period between background saves.
pub const MIN_PERSIST_INTERVAL: Duration = Duration::from_secs(1);

impl CollabServer {
    pub fn new(
        mut config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        directory: Arc<dyn ProjectDirectory>,
        store: Arc<dyn FileStore>,
    ) -> Self {
        if config.persist_interval < MIN_PERSIST_INTERVAL {
            log::warn!(
                "Persist interval {:?} too short, using {MIN_PERSIST_INTERVAL:?}",
                config.persist_interval
            );
            config.persist_interval = MIN_PERSIST_INTERVAL;
        }
        let hub = Arc::new(CollabHub::new(&config, directory, store));
        Self {
            config,
            hub,
            authenticator,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<CollabHub> {
        &self.hub
    }

    pub async fn stats(&self) -> ServerStats {
        self.hub.stats().await
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);

        let flusher = {
            let hub = self.hub.clone();
            let period = self.config.persist_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    hub.flush_dirty().await;
                }
            })
        };

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let authenticator = self.authenticator.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, authenticator).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        flusher.abort();
        result
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<CollabHub>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut admitted: Option<(UserIdentity, WireEncoding)> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match authenticate(authenticator.as_ref(), request) {
                Some(identity) => {
                    admitted = Some((identity, WireEncoding::from_query(request.uri().query())));
                    Ok(response)
                }
                None => Err(unauthorized()),
            }
        };
        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("Handshake from {addr} rejected: {e}");
                return Ok(());
            }
        };
        let Some((identity, encoding)) = admitted else {
            return Ok(());
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (mut conn, mut outbound) = hub.connect(identity).await;
        let handle = conn.handle().clone();
        log::info!(
            "WebSocket connection {} established from {addr} ({})",
            conn.id(),
            encoding.as_str()
        );

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let frame = match msg {
                        Some(Ok(Message::Text(text))) => Frame::Text(text.as_str().to_owned()),
                        Some(Ok(Message::Binary(data))) => Frame::Binary(data.into()),
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {} closed by {addr}", conn.id());
                            break Ok(());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                    };
                    hub.record_inbound(frame.len());
                    match frame.decode::<ClientEvent>() {
                        Ok(event) => hub.handle(&mut conn, event).await,
                        Err(e) => hub.report(&conn, "frame", CollabError::MalformedEvent(e.to_string())),
                    }
                }

                event = outbound.recv() => {
                    let Some(event) = event else {
                        break Ok(());
                    };
                    let message = match encoding.encode(event.as_ref()) {
                        Ok(Frame::Text(text)) => Message::Text(text.into()),
                        Ok(Frame::Binary(bytes)) => Message::Binary(bytes.into()),
                        Err(e) => {
                            log::error!("Failed to encode event for {}: {e}", conn.id());
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(message).await {
                        break Err(e.into());
                    }
                }

                _ = handle.closed() => {
                    log::warn!("Disconnecting {} ({addr}): outbound queue overflowed", conn.id());
                    break Ok(());
                }
            }
        };

        hub.disconnect(conn).await;
        let _ = ws_sender.close().await;
        result
    }
}

/// Resolve the handshake token from `?token=` or `Authorization: Bearer`.
fn authenticate(authenticator: &dyn Authenticator, request: &Request) -> Option<UserIdentity> {
    let from_query = query_param(request.uri().query(), "token").filter(|t| !t.is_empty());
    let from_header = || {
        request
            .headers()
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
            .map(str::trim)
    };
    let token = from_query.or_else(|| from_header().map(str::to_string))?;
    authenticator.authenticate(&token)
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("invalid or missing token".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use tokio_tungstenite::tungstenite::http::Request as HttpRequest;

    fn directory() -> StaticDirectory {
        StaticDirectory::new().with_user("t-alice", UserIdentity::new("alice", "Alice"))
    }

    fn request(uri: &str, bearer: Option<&str>) -> Request {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_token_from_query() {
        let dir = directory();
        let identity = authenticate(&dir, &request("/?token=t-alice&encoding=json", None));
        assert_eq!(identity.unwrap().display_name, "Alice");
    }

    #[test]
    fn test_escaped_token_from_query() {
        let dir = StaticDirectory::new().with_user("k&y=1", UserIdentity::new("kay", "Kay"));
        let uri = format!("/?token={}&encoding=json", crate::protocol::percent_encode("k&y=1"));
        assert_eq!(authenticate(&dir, &request(&uri, None)).unwrap().display_name, "Kay");
        assert!(authenticate(&dir, &request("/?token=k&y=1", None)).is_none());
    }

    #[test]
    fn test_token_from_bearer_header() {
        let dir = directory();
        assert!(authenticate(&dir, &request("/", Some("t-alice"))).is_some());
    }

    #[test]
    fn test_missing_or_forged_token() {
        let dir = directory();
        assert!(authenticate(&dir, &request("/", None)).is_none());
        assert!(authenticate(&dir, &request("/?token=", None)).is_none());
        assert!(authenticate(&dir, &request("/?token=forged", None)).is_none());
        assert!(authenticate(&dir, &request("/", Some("forged"))).is_none());
    }

    #[tokio::test]
    async fn test_persist_interval_has_floor() {
        let dir = Arc::new(directory());
        let config = ServerConfig {
            persist_interval: Duration::ZERO,
            ..ServerConfig::default()
        };
        let server = CollabServer::new(
            config,
            dir.clone(),
            dir,
            Arc::new(crate::storage::MemoryFileStore::new()),
        );
        assert_eq!(server.config().persist_interval, MIN_PERSIST_INTERVAL);
    }

    #[test]
    fn test_unauthorized_response() {
        assert_eq!(unauthorized().status(), StatusCode::UNAUTHORIZED);
    }
}
