//! Relay control-plane message types and serialization.
//!
//! All relay WebSocket messages are single JSON text frames with a top-level
//! `message_type` field used as the deserialization tag. UUID fields are
//! canonical strings on the wire and native [`Uuid`] values in memory; the
//! conversion happens entirely inside serde at this boundary.
//!
//! ```json
//! { "message_type": "server_registration", "name": "ep1", "uuid": "..." }
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Client -> relay messages
// ---------------------------------------------------------------------------

/// Registration request, sent as the first message on a fresh socket.
///
/// The UUID is client-generated; the relay never mints identities. A second
/// registration for a UUID that is already connected evicts the older socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRegistration {
    /// Human-readable endpoint name, used in relay logs.
    pub name: String,
    pub uuid: Uuid,
}

// ---------------------------------------------------------------------------
// Relay -> client messages
// ---------------------------------------------------------------------------

/// Reply to a [`ServerRegistration`], and the error envelope for protocol
/// violations (e.g. traffic from a socket that has not registered).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
}

// ---------------------------------------------------------------------------
// Peer connection signaling (client -> relay -> client)
// ---------------------------------------------------------------------------

/// Which half of the WebRTC session negotiation a description carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionType {
    Offer,
    Answer,
}

/// A WebRTC session description in transit between two endpoints.
///
/// Forwarded verbatim by the relay to the socket registered under
/// `peer_uuid`. If the target is unknown the relay echoes the message back
/// to the sender with `error` populated; `error` is always a plain string at
/// the wire boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConnectionMessage {
    pub source_uuid: Uuid,
    pub source_name: String,
    pub peer_uuid: Uuid,
    pub description_type: DescriptionType,
    /// Opaque session description (SDP plus type, JSON-encoded).
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// The closed set of control messages understood by the relay and its
/// clients.
///
/// Serializes/deserializes using the `message_type` field as a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message_type")]
#[serde(rename_all = "snake_case")]
pub enum RelayMessage {
    ServerRegistration(ServerRegistration),
    ServerResponse(ServerResponse),
    PeerConnection(PeerConnectionMessage),
}

// ---------------------------------------------------------------------------
// Codec entry points
// ---------------------------------------------------------------------------

/// Error raised when a [`RelayMessage`] cannot be encoded to JSON.
#[derive(Debug, thiserror::Error)]
#[error("failed to encode relay message: {0}")]
pub struct MessageEncodeError(#[from] serde_json::Error);

/// Error raised when a text frame cannot be decoded into a [`RelayMessage`].
///
/// Covers malformed JSON, an absent or unknown `message_type`, malformed
/// UUID strings, and missing required fields.
#[derive(Debug, thiserror::Error)]
#[error("failed to decode relay message: {0}")]
pub struct MessageDecodeError(#[from] serde_json::Error);

/// Encode a message to its wire representation.
pub fn encode(message: &RelayMessage) -> Result<String, MessageEncodeError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode one wire frame into a message.
pub fn decode(text: &str) -> Result<RelayMessage, MessageDecodeError> {
    Ok(serde_json::from_str(text)?)
}
