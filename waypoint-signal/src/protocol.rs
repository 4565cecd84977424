//! JSON wire protocol for presence and call signaling.
//!
//! Every frame is a single JSON object carrying one discriminator field:
//! `type` for presence announces and server-originated events, `action` for
//! client-originated control frames. WebRTC negotiation payloads are opaque
//! to the server: it stamps the sender identity into `source` and forwards
//! the frame without parsing the SDP/ICE contents.
//!
//! ```text
//! client A                     server                     client B
//!    │ {action:"call-invitation"} │                          │
//!    │ ──────────────────────────►│ {type:"call-invitation"} │
//!    │                            │ ────────────────────────►│
//!    │                            │    {action:"connect"}    │
//!    │   {type:"call-accepted"}   │◄──────────────────────── │
//!    │◄────────────────────────── │                          │
//!    │      {action:"webrtc-*"} relayed, source-stamped      │
//!    │◄──────────────────────────┼────────────────────────►│
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Opaque per-connection identity. Generated server-side (UUID v4),
/// serialized as its canonical string form on the wire.
pub type ClientId = Uuid;

/// Geographic position reported by a client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Last-known display/location/motion state for one identity.
///
/// Roster broadcasts serialize these directly; optional fields are omitted
/// from the JSON until a client has reported them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub id: ClientId,
    pub name: String,
    pub coordinates: Coordinates,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(rename = "isSupported", skip_serializing_if = "Option::is_none")]
    pub is_supported: Option<bool>,
    #[serde(rename = "permissionStatus", skip_serializing_if = "Option::is_none")]
    pub permission_status: Option<String>,
}

impl PresenceRecord {
    pub fn new(id: ClientId, name: impl Into<String>, coordinates: Coordinates) -> Self {
        Self {
            id,
            name: name.into(),
            coordinates,
            speed: None,
            is_supported: None,
            permission_status: None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Client → server frames
// ───────────────────────────────────────────────────────────────────

/// Presence frames, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PresenceEvent {
    /// Initial announce: the client introduces itself with a display name
    /// and its current position.
    #[serde(rename = "connection")]
    Connection {
        name: String,
        coordinates: Coordinates,
    },

    /// Partial presence mutation; only supplied fields change.
    #[serde(rename = "connection-update")]
    ConnectionUpdate {
        #[serde(skip_serializing_if = "Option::is_none")]
        coordinates: Option<Coordinates>,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        #[serde(rename = "isSupported", skip_serializing_if = "Option::is_none")]
        is_supported: Option<bool>,
        #[serde(rename = "permissionStatus", skip_serializing_if = "Option::is_none")]
        permission_status: Option<String>,
    },
}

/// Control frames, discriminated by `action`.
///
/// Field names match the deployed browser clients, including the
/// `recieverId` spelling, which is load-bearing wire compatibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action")]
pub enum ClientAction {
    /// Ask for the current roster (clients poll this periodically).
    #[serde(rename = "get-users")]
    GetUsers,

    /// Invite another identity to a call.
    #[serde(rename = "call-invitation")]
    CallInvitation {
        #[serde(rename = "callerId")]
        caller_id: ClientId,
        #[serde(rename = "recieverId")]
        receiver_id: ClientId,
        #[serde(rename = "callerName")]
        caller_name: String,
    },

    /// Callee accepts: notify the caller (`userId`) that `myID` is the peer.
    #[serde(rename = "connect")]
    Connect {
        #[serde(rename = "userId")]
        user_id: ClientId,
        #[serde(rename = "myID")]
        my_id: ClientId,
    },

    /// Callee declines. The server does not relay this.
    #[serde(rename = "deny")]
    Deny,

    /// Motion update from the accelerometer sampler.
    #[serde(rename = "update-speed")]
    UpdateSpeed {
        speed: f64,
        #[serde(rename = "isSupported", skip_serializing_if = "Option::is_none")]
        is_supported: Option<bool>,
        #[serde(rename = "permissionStatus", skip_serializing_if = "Option::is_none")]
        permission_status: Option<String>,
    },

    /// End-of-call notice for the peer at `target`.
    #[serde(rename = "hangup")]
    Hangup { target: ClientId },
}

// ───────────────────────────────────────────────────────────────────
// WebRTC negotiation relay
// ───────────────────────────────────────────────────────────────────

/// The three negotiation frame kinds the server relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayKind {
    #[serde(rename = "webrtc-offer")]
    Offer,
    #[serde(rename = "webrtc-answer")]
    Answer,
    #[serde(rename = "webrtc-ice")]
    Ice,
}

impl RelayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "webrtc-offer",
            Self::Answer => "webrtc-answer",
            Self::Ice => "webrtc-ice",
        }
    }
}

/// A negotiation frame addressed to `target`.
///
/// Everything except `action`, `target` and `source` is captured verbatim
/// into `payload` and re-emitted unchanged on forward, so the offer/answer/
/// candidate contents survive the relay untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayFrame {
    pub action: RelayKind,
    pub target: ClientId,
    /// Stamped by the server with the sender identity before forwarding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ClientId>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl RelayFrame {
    pub fn new(action: RelayKind, target: ClientId, payload: Map<String, Value>) -> Self {
        Self {
            action,
            target,
            source: None,
            payload,
        }
    }

    /// Build a frame whose payload is a single named field, e.g.
    /// `offer`, `answer` or `candidate`.
    pub fn with_field(
        action: RelayKind,
        target: ClientId,
        field: impl Into<String>,
        value: Value,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert(field.into(), value);
        Self::new(action, target, payload)
    }

    pub fn payload_field(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }
}

/// Any frame a client may send, classified by its discriminator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ClientFrame {
    Announce(PresenceEvent),
    Relay(RelayFrame),
    Control(ClientAction),
}

// ───────────────────────────────────────────────────────────────────
// Server → client frames
// ───────────────────────────────────────────────────────────────────

/// Server-originated frames, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Sent immediately on connect with the assigned identity.
    #[serde(rename = "userID")]
    UserId { id: ClientId },

    /// Full roster broadcast after any presence change.
    #[serde(rename = "newUser")]
    NewUser { users: Vec<PresenceRecord> },

    /// Roster sent to one requester in response to `get-users`.
    #[serde(rename = "users")]
    Users { users: Vec<PresenceRecord> },

    /// Delivered to the callee of a call invitation.
    #[serde(rename = "call-invitation")]
    CallInvitation {
        #[serde(rename = "callerId")]
        caller_id: ClientId,
        #[serde(rename = "callerName")]
        caller_name: String,
    },

    /// Delivered to the caller; `from` is the callee's identity.
    #[serde(rename = "call-accepted")]
    CallAccepted { from: ClientId },

    /// Delivered to the peer of whoever hung up.
    #[serde(rename = "call-ended")]
    CallEnded { from: ClientId },
}

/// Any frame a client may receive: a server event or a relayed
/// negotiation frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ServerFrame {
    Event(ServerEvent),
    Relay(RelayFrame),
}

/// Serialize a frame to its wire text.
pub fn to_text<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
