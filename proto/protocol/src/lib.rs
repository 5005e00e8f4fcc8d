//! Wire protocol of the signaling broker's WebSocket surface.
//!
//! Everything here is deliberately dumb: the broker never interprets
//! `offer`/`answer`/`candidate`/`relay-data` payloads, so they are carried as
//! opaque [`serde_json::Value`]s all the way through.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::private_intra_doc_links)]
#![forbid(non_ascii_idents)]

use broker_macro::dispatchable;
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identity of a room.
#[derive(
    Clone, Debug, Display, Eq, PartialEq, Hash, From, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RoomId(pub String);

/// Opaque identity of a peer (an already-authenticated client endpoint).
#[derive(
    Clone, Debug, Display, Eq, PartialEq, Hash, From, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub String);

/// Rules governing a room's membership and relay behavior.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRules {
    /// Maximum number of members allowed to join the room at once.
    pub max_players: u32,

    /// Whether members of this room may fall back to broker-mediated relay.
    pub allow_relay: bool,

    /// Target end-to-end latency the room was provisioned for, in
    /// milliseconds. Opaque to the broker; forwarded to clients as-is.
    pub latency_target_ms: u32,

    /// Target Opus codec bitrate, in bits per second. Opaque to the broker.
    pub opus_bitrate: u32,
}

/// State of a directed pairwise peer-connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Broker-mediated relay mode of a pairwise connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Direct peer-to-peer connection is assumed to work.
    None,

    /// Data is relayed over the existing client-to-broker WebSocket.
    Websocket,
}

/// Message sent by a client to the broker over its WebSocket connection.
///
/// `#[dispatchable]` generates a [`ClientEventHandler`] trait (one
/// `on_<variant>` method per variant) and a `dispatch_with` method so the
/// gateway can route an incoming event without a hand-written `match`.
#[dispatchable]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Client asks to join `room_id` as `peer_id`.
    #[serde(rename = "join")]
    Join { room_id: RoomId, peer_id: PeerId },

    /// Client asks to leave `room_id`.
    #[serde(rename = "leave")]
    Leave { room_id: RoomId, peer_id: PeerId },

    /// Client forwards an SDP offer to `to`.
    #[serde(rename = "offer")]
    Offer {
        room_id: RoomId,
        from: PeerId,
        to: PeerId,
        offer: Value,
    },

    /// Client forwards an SDP answer to `to`.
    #[serde(rename = "answer")]
    Answer {
        room_id: RoomId,
        from: PeerId,
        to: PeerId,
        answer: Value,
    },

    /// Client forwards an ICE candidate to `to`.
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        room_id: RoomId,
        from: PeerId,
        to: PeerId,
        candidate: Value,
    },

    /// Client asks the broker to nudge `to` into reconnecting with `from`.
    #[serde(rename = "reconnect-request")]
    ReconnectRequest {
        room_id: RoomId,
        from: PeerId,
        to: PeerId,
    },

    /// Client reports the state of its RTCPeerConnection.
    #[serde(rename = "connection-state")]
    ConnectionStateReport {
        room_id: RoomId,
        peer_id: PeerId,
        state: ConnectionState,
    },

    /// Client proposes activating broker-mediated relay with `to`.
    #[serde(rename = "webrtc-fallback-activate")]
    WebrtcFallbackActivate {
        room_id: RoomId,
        from: PeerId,
        to: PeerId,
    },

    /// Client asks the broker to relay an opaque data frame to `to`.
    #[serde(rename = "relay-data")]
    RelayData {
        room_id: RoomId,
        from: PeerId,
        to: PeerId,
        payload: Value,
    },
}

/// Message sent by the broker to a client over its WebSocket connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Full room snapshot, unicast to a peer right after it joins.
    #[serde(rename = "room-state")]
    RoomState {
        room_id: RoomId,
        owner_id: PeerId,
        players: Vec<PeerId>,
        rules: RoomRules,
    },

    /// Broadcast to a room whenever a peer joins.
    #[serde(rename = "player-joined")]
    PlayerJoined {
        peer_id: PeerId,
        room_id: RoomId,
        total_players: u32,
        is_room_owner: bool,
    },

    /// Broadcast to a room whenever a peer leaves.
    #[serde(rename = "player-left")]
    PlayerLeft { peer_id: PeerId, room_id: RoomId },

    /// Unicast to the recipient of an SDP offer.
    #[serde(rename = "offer")]
    Offer { from: PeerId, offer: Value },

    /// Unicast to the recipient of an SDP answer.
    #[serde(rename = "answer")]
    Answer { from: PeerId, answer: Value },

    /// Unicast to the recipient of an ICE candidate.
    #[serde(rename = "ice-candidate")]
    IceCandidate { from: PeerId, candidate: Value },

    /// Unicast asking a peer to attempt reconnection with `from`.
    #[serde(rename = "reconnect-needed")]
    ReconnectNeeded { from: PeerId },

    /// Unicast notifying the counterpart of a peer-connection state change.
    #[serde(rename = "peer-connection-state")]
    PeerConnectionState {
        peer_id: PeerId,
        state: ConnectionState,
    },

    /// Unicast to both endpoints when fallback relay is suggested.
    #[serde(rename = "webrtc-fallback-suggested")]
    WebrtcFallbackSuggested {
        from: PeerId,
        room_id: RoomId,
        reason: String,
    },

    /// Unicast notifying the counterpart that relay is now expected.
    #[serde(rename = "webrtc-fallback-needed")]
    WebrtcFallbackNeeded { from: PeerId, room_id: RoomId },

    /// Acknowledges a `webrtc-fallback-activate` request to its sender.
    #[serde(rename = "webrtc-fallback-activated")]
    WebrtcFallbackActivated { to: PeerId, success: bool },

    /// Unicast forwarding an opaque relay data frame.
    #[serde(rename = "relay-data")]
    RelayData { from: PeerId, payload: Value },

    /// Reports a rejected operation back to the triggering socket.
    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },
}
