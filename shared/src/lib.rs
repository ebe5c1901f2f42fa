//! Wire protocol shared between the sync server and its browser clients.
//!
//! Every WebSocket text frame carries exactly one JSON object tagged by a
//! `type` field. Clients may attach a `session_id` to any message to identify
//! themselves when no session cookie was presented during the handshake.

use serde::{Deserialize, Serialize};

/// Position deltas below this threshold (in degrees / altitude units) are
/// treated as floating point jitter and never applied or broadcast.
pub const POSITION_EPSILON: f64 = 0.0001;

/// Coarser threshold used when reconciling positions pulled from the
/// datastore against live in-memory state.
pub const PULL_EPSILON: f64 = 0.001;

/// Envelope around every client message: the tagged message itself plus an
/// optional session identifier overriding the handshake cookie.
#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub msg: ClientMessage,
}

/// Messages a client may send, tagged by the JSON `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Introduce the connection and bind it to a user via its session.
    Hello,
    /// Report a new position for the connection's user. The coordinates are
    /// optional at the parse level so the server can answer an incomplete
    /// update with a descriptive error instead of dropping it silently.
    UpdateUserPos {
        #[serde(default)]
        lat: Option<f64>,
        #[serde(default)]
        lon: Option<f64>,
        #[serde(default)]
        alt: Option<f64>,
    },
    /// Say something to everyone. The optional camera blob is relayed
    /// verbatim so other clients can point at the speaker.
    ChatMessage {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        camera: Option<serde_json::Value>,
    },
    /// Forget everything this session has seen; the next broadcast tick
    /// resends the full world.
    Refresh,
    /// Orderly goodbye.
    Disconnect,
    /// Liveness response to a server `ping`.
    Pong,
}

/// Messages the server sends, tagged by the JSON `type` field.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Liveness probe; clients answer with `pong`.
    Ping,
    /// Differential state push: one user's current position and version.
    UserData {
        user_id: i64,
        lat: f64,
        lon: f64,
        alt: f64,
        version: u64,
    },
    /// Chat fanout to every connected client.
    ChatMessage {
        user_id: i64,
        nick: String,
        message: String,
        camera: Option<serde_json::Value>,
        timestamp: u64,
    },
    /// Something about the last message was unacceptable.
    Error { message: String },
}

impl ClientEnvelope {
    /// Parses a decoded text frame. Returns `None` for anything that is not
    /// a JSON object with a recognizable `type`; such frames are ignored by
    /// contract rather than closing the connection.
    pub fn parse(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}
