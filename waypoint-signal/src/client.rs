//! WebSocket client for the signaling protocol.
//!
//! Wraps the wire frames in typed calls and an event stream:
//! - Connection lifecycle (connect, identity assignment, disconnect)
//! - Presence announces and motion updates
//! - Call setup (invite, accept, deny, hangup)
//! - Opaque WebRTC negotiation relays
//!
//! The identity arrives from the server as the first frame; wait for
//! [`SignalEvent::IdAssigned`] before sending frames that carry the own
//! identity (invites, acceptances).

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    to_text, ClientAction, ClientId, Coordinates, PresenceEvent, PresenceRecord, ProtocolError,
    RelayFrame, RelayKind, ServerEvent, ServerFrame,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the signal client.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// The server assigned this client its identity
    IdAssigned(ClientId),
    /// A roster update (broadcast or reply to a roster request)
    Roster(Vec<PresenceRecord>),
    /// Incoming call invitation
    CallInvitation {
        caller_id: ClientId,
        caller_name: String,
    },
    /// The callee accepted; `from` is the peer to negotiate with
    CallAccepted { from: ClientId },
    /// The peer hung up
    CallEnded { from: ClientId },
    /// A relayed WebRTC negotiation frame
    Negotiation(RelayFrame),
}

/// The signaling client.
pub struct SignalClient {
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,
    /// Identity assigned by the server on connect
    client_id: Arc<RwLock<Option<ClientId>>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SignalEvent>>,
    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SignalEvent>,
    /// Server URL
    server_url: String,
}

impl SignalClient {
    /// Create a new client for the given server URL.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            client_id: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SignalEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;
        let (ws_stream, _) = match ws_result {
            Ok(ok) => ok,
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the WebSocket.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SignalEvent::Connected).await;

        // Reader task: translate incoming frames into events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let frame: ServerFrame = match serde_json::from_str(text.as_str()) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Ignoring unparseable server frame: {e}");
                                continue;
                            }
                        };

                        let event = match frame {
                            ServerFrame::Event(ServerEvent::UserId { id }) => {
                                *client_id.write().await = Some(id);
                                SignalEvent::IdAssigned(id)
                            }
                            ServerFrame::Event(ServerEvent::NewUser { users })
                            | ServerFrame::Event(ServerEvent::Users { users }) => {
                                SignalEvent::Roster(users)
                            }
                            ServerFrame::Event(ServerEvent::CallInvitation {
                                caller_id,
                                caller_name,
                            }) => SignalEvent::CallInvitation {
                                caller_id,
                                caller_name,
                            },
                            ServerFrame::Event(ServerEvent::CallAccepted { from }) => {
                                SignalEvent::CallAccepted { from }
                            }
                            ServerFrame::Event(ServerEvent::CallEnded { from }) => {
                                SignalEvent::CallEnded { from }
                            }
                            ServerFrame::Relay(relay) => SignalEvent::Negotiation(relay),
                        };

                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost.
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SignalEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Announce presence with a display name and position.
    pub async fn announce(
        &self,
        name: impl Into<String>,
        coordinates: Coordinates,
    ) -> Result<(), ProtocolError> {
        self.send_frame(&PresenceEvent::Connection {
            name: name.into(),
            coordinates,
        })
        .await
    }

    /// Report a motion-speed update, optionally with capability flags.
    pub async fn update_speed(
        &self,
        speed: f64,
        is_supported: Option<bool>,
        permission_status: Option<String>,
    ) -> Result<(), ProtocolError> {
        self.send_frame(&ClientAction::UpdateSpeed {
            speed,
            is_supported,
            permission_status,
        })
        .await
    }

    /// Ask the server for the current roster.
    pub async fn request_roster(&self) -> Result<(), ProtocolError> {
        self.send_frame(&ClientAction::GetUsers).await
    }

    /// Invite `receiver_id` to a call, announcing ourselves as `caller_name`.
    pub async fn invite(
        &self,
        receiver_id: ClientId,
        caller_name: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        let caller_id = self.require_id().await?;
        self.send_frame(&ClientAction::CallInvitation {
            caller_id,
            receiver_id,
            caller_name: caller_name.into(),
        })
        .await
    }

    /// Accept a call from `caller_id`.
    pub async fn accept_call(&self, caller_id: ClientId) -> Result<(), ProtocolError> {
        let my_id = self.require_id().await?;
        self.send_frame(&ClientAction::Connect {
            user_id: caller_id,
            my_id,
        })
        .await
    }

    /// Decline a pending invitation. The server does not relay this.
    pub async fn deny(&self) -> Result<(), ProtocolError> {
        self.send_frame(&ClientAction::Deny).await
    }

    /// End the call with `target`.
    pub async fn hangup(&self, target: ClientId) -> Result<(), ProtocolError> {
        self.send_frame(&ClientAction::Hangup { target }).await
    }

    /// Send an SDP offer to `target`.
    pub async fn send_offer(&self, target: ClientId, offer: Value) -> Result<(), ProtocolError> {
        self.send_negotiation(RelayKind::Offer, target, "offer", offer)
            .await
    }

    /// Send an SDP answer to `target`.
    pub async fn send_answer(&self, target: ClientId, answer: Value) -> Result<(), ProtocolError> {
        self.send_negotiation(RelayKind::Answer, target, "answer", answer)
            .await
    }

    /// Send an ICE candidate to `target`.
    pub async fn send_ice(&self, target: ClientId, candidate: Value) -> Result<(), ProtocolError> {
        self.send_negotiation(RelayKind::Ice, target, "candidate", candidate)
            .await
    }

    async fn send_negotiation(
        &self,
        kind: RelayKind,
        target: ClientId,
        field: &str,
        value: Value,
    ) -> Result<(), ProtocolError> {
        self.send_frame(&RelayFrame::with_field(kind, target, field, value))
            .await
    }

    async fn send_frame<T: Serialize>(&self, frame: &T) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let text = to_text(frame)?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(Message::Text(text.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn require_id(&self) -> Result<ClientId, ProtocolError> {
        self.client_id
            .read()
            .await
            .ok_or(ProtocolError::ConnectionClosed)
    }

    /// Identity assigned by the server, once received.
    pub async fn client_id(&self) -> Option<ClientId> {
        *self.client_id.read().await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
