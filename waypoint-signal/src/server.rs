//! WebSocket signaling server with per-connection lifecycle management.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── writer task A (socket sink)
//!             ├── accept loop        │
//! Client B ──┘        │              ├── writer task B
//!                     ▼              │
//!              reader task per conn  │ (mpsc, unbounded)
//!                     │              │
//!                     ▼              │
//!               MessageRouter ───────┘
//!                ConnectionRegistry + PresenceStore
//! ```
//!
//! Each connection gets:
//! - a server-generated UUID identity, sent as the first frame
//! - a reader task processing its frames strictly in arrival order
//! - a writer task draining an unbounded channel into the socket with a
//!   bounded write timeout
//!
//! Cleanup (unregister + presence removal + roster broadcast) runs exactly
//! once per connection no matter whether the close came from the client,
//! a transport error, or a write failure in the writer task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::PresenceStore;
use crate::protocol::{ClientId, ServerEvent};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::router::MessageRouter;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Upper bound for a single socket write; a timed-out write marks the
    /// connection dead so a hung peer cannot pin resources
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
}

/// The presence-and-signaling server.
pub struct SignalServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceStore>,
    router: Arc<MessageRouter>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SignalServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = Arc::new(PresenceStore::new());
        let router = Arc::new(MessageRouter::new(registry.clone(), presence.clone()));
        Self {
            config,
            registry,
            presence,
            router,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and run the accept loop.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Signaling server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Run the accept loop on an already-bound listener.
    ///
    /// Split out from [`run`](Self::run) so callers can bind to an
    /// OS-assigned port first and learn the address.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("New TCP connection from {addr}");

            let router = self.router.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, router, stats, config).await
                {
                    error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle one connection: `Connecting -> Open -> Closed`.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        router: Arc<MessageRouter>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let id: ClientId = Uuid::new_v4();
        info!("WebSocket connection established from {addr}, assigned identity {id}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Writer task: drains the outbound channel into the socket. Every
        // send to this connection goes through the channel, so nothing in
        // the router ever blocks on this peer's socket.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let write_timeout = config.write_timeout;
        let mut send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Write to {addr} failed: {e}");
                        break;
                    }
                    Err(_) => {
                        warn!("Write to {addr} timed out after {write_timeout:?}");
                        break;
                    }
                }
            }
        });

        let handle = ConnectionHandle::new(tx);
        if let Err(e) = router.registry().register(id, handle.clone()).await {
            // Unreachable with v4 identities; fails this connection only.
            error!("Registration failed for {addr}: {e}");
            send_task.abort();
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            return Ok(());
        }

        // The client needs its identity before it can address anyone.
        let _ = handle.send(&ServerEvent::UserId { id });

        // Open: process frames strictly in arrival order.
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                            }
                            router.dispatch(id, text.as_str()).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = handle.send_raw(Message::Pong(data));
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Client {addr} closed connection");
                            break;
                        }
                        Some(Ok(_)) => {} // Binary frames are not part of the protocol.
                        Some(Err(e)) => {
                            error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                    }
                }
                _ = &mut send_task => {
                    // Writer died (send failure or timeout): transport dead.
                    break;
                }
            }
        }

        // Closed: exactly-once cleanup (idempotent against the send-failure
        // path having already removed this identity).
        router.disconnect(id).await;
        send_task.abort();

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn presence(&self) -> &Arc<PresenceStore> {
        &self.presence
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RelayKind, ServerFrame};
    use serde_json::json;
    use tokio_tungstenite::MaybeTlsStream;
    use tokio_tungstenite::WebSocketStream;

    type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:5000");
        assert_eq!(config.write_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SignalServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
    }

    async fn start_server() -> (Arc<SignalServer>, String) {
        let server = Arc::new(SignalServer::with_defaults());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = server.clone();
        tokio::spawn(async move {
            let _ = srv.serve(listener).await;
        });
        (server, format!("ws://{addr}"))
    }

    async fn recv_frame(ws: &mut WsStream) -> ServerFrame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    /// Read frames until one matches, skipping interleaved broadcasts.
    async fn wait_for(ws: &mut WsStream, pred: impl Fn(&ServerFrame) -> bool) -> ServerFrame {
        loop {
            let frame = recv_frame(ws).await;
            if pred(&frame) {
                return frame;
            }
        }
    }

    /// Connect and consume the initial identity frame.
    async fn connect(url: &str) -> (WsStream, ClientId) {
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        match recv_frame(&mut ws).await {
            ServerFrame::Event(ServerEvent::UserId { id }) => (ws, id),
            other => panic!("Expected userID frame first, got {other:?}"),
        }
    }

    async fn send_json(ws: &mut WsStream, value: serde_json::Value) {
        ws.send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    async fn announce(ws: &mut WsStream, name: &str, lat: f64, lng: f64) {
        send_json(
            ws,
            json!({
                "type": "connection",
                "name": name,
                "coordinates": { "lat": lat, "lng": lng },
            }),
        )
        .await;
    }

    #[tokio::test]
    async fn test_assigns_distinct_identities_on_connect() {
        let (server, url) = start_server().await;

        let (_ws_a, a) = connect(&url).await;
        let (_ws_b, b) = connect(&url).await;

        assert_ne!(a, b);
        assert!(server.registry().contains(a).await);
        assert!(server.registry().contains(b).await);
        assert_eq!(server.stats().await.total_connections, 2);
    }

    #[tokio::test]
    async fn test_announce_is_broadcast_back_with_roster() {
        let (_server, url) = start_server().await;
        let (mut ws, id) = connect(&url).await;

        announce(&mut ws, "Alice", 1.0, 2.0).await;

        let frame = wait_for(&mut ws, |f| {
            matches!(f, ServerFrame::Event(ServerEvent::NewUser { .. }))
        })
        .await;
        match frame {
            ServerFrame::Event(ServerEvent::NewUser { users }) => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].id, id);
                assert_eq!(users[0].name, "Alice");
                assert_eq!(users[0].coordinates.lat, 1.0);
                assert_eq!(users[0].coordinates.lng, 2.0);
            }
            other => panic!("Expected roster, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_full_call_flow_between_two_clients() {
        let (_server, url) = start_server().await;
        let (mut ws_a, a) = connect(&url).await;
        let (mut ws_b, b) = connect(&url).await;
        announce(&mut ws_a, "Alice", 1.0, 2.0).await;
        announce(&mut ws_b, "Bob", 3.0, 4.0).await;

        // Invite: A → B.
        send_json(
            &mut ws_a,
            json!({
                "action": "call-invitation",
                "callerId": a,
                "recieverId": b,
                "callerName": "Alice",
            }),
        )
        .await;
        let invite = wait_for(&mut ws_b, |f| {
            matches!(f, ServerFrame::Event(ServerEvent::CallInvitation { .. }))
        })
        .await;
        match invite {
            ServerFrame::Event(ServerEvent::CallInvitation {
                caller_id,
                caller_name,
            }) => {
                assert_eq!(caller_id, a);
                assert_eq!(caller_name, "Alice");
            }
            _ => unreachable!(),
        }

        // Accept: B → A.
        send_json(&mut ws_b, json!({ "action": "connect", "userId": a, "myID": b })).await;
        let accepted = wait_for(&mut ws_a, |f| {
            matches!(f, ServerFrame::Event(ServerEvent::CallAccepted { .. }))
        })
        .await;
        assert_eq!(
            accepted,
            ServerFrame::Event(ServerEvent::CallAccepted { from: b })
        );

        // Negotiation: the offer payload must arrive untouched, stamped
        // with the sender identity.
        let offer = json!({ "type": "offer", "sdp": "v=0\r\ns=-\r\n" });
        send_json(
            &mut ws_a,
            json!({ "action": "webrtc-offer", "target": b, "offer": offer.clone() }),
        )
        .await;
        let relayed = wait_for(&mut ws_b, |f| matches!(f, ServerFrame::Relay(_))).await;
        match relayed {
            ServerFrame::Relay(relay) => {
                assert_eq!(relay.action, RelayKind::Offer);
                assert_eq!(relay.source, Some(a));
                assert_eq!(relay.payload_field("offer"), Some(&offer));
            }
            _ => unreachable!(),
        }

        // Hangup: A → B.
        send_json(&mut ws_a, json!({ "action": "hangup", "target": b })).await;
        let ended = wait_for(&mut ws_b, |f| {
            matches!(f, ServerFrame::Event(ServerEvent::CallEnded { .. }))
        })
        .await;
        assert_eq!(
            ended,
            ServerFrame::Event(ServerEvent::CallEnded { from: a })
        );
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer_from_roster() {
        let (server, url) = start_server().await;
        let (mut ws_a, a) = connect(&url).await;
        let (mut ws_b, b) = connect(&url).await;
        announce(&mut ws_a, "Alice", 0.0, 0.0).await;
        announce(&mut ws_b, "Bob", 0.0, 0.0).await;

        // Wait until Alice has seen Bob in a roster.
        wait_for(&mut ws_a, |f| match f {
            ServerFrame::Event(ServerEvent::NewUser { users }) => users.len() == 2,
            _ => false,
        })
        .await;

        ws_b.close(None).await.unwrap();

        // Alice receives a roster without Bob once cleanup has run.
        let frame = wait_for(&mut ws_a, |f| match f {
            ServerFrame::Event(ServerEvent::NewUser { users }) => users.len() == 1,
            _ => false,
        })
        .await;
        match frame {
            ServerFrame::Event(ServerEvent::NewUser { users }) => {
                assert_eq!(users[0].id, a);
            }
            _ => unreachable!(),
        }
        assert!(!server.registry().contains(b).await);
        assert!(!server.presence().contains(b).await);
    }

    #[tokio::test]
    async fn test_get_users_returns_current_roster() {
        let (_server, url) = start_server().await;
        let (mut ws_a, _a) = connect(&url).await;
        let (mut ws_b, b) = connect(&url).await;
        announce(&mut ws_b, "Bob", 9.0, 9.0).await;

        send_json(&mut ws_a, json!({ "action": "get-users" })).await;

        let frame = wait_for(&mut ws_a, |f| {
            matches!(f, ServerFrame::Event(ServerEvent::Users { .. }))
        })
        .await;
        match frame {
            ServerFrame::Event(ServerEvent::Users { users }) => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].id, b);
                assert_eq!(users[0].name, "Bob");
            }
            _ => unreachable!(),
        }
    }
}
