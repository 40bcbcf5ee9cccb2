//! Message construction and parsing
//!
//! Application-facing [`Message`] values and the helpers that turn protocol
//! bodies into envelopes ready for the transport.

use crate::error::ProtocolError;
use crate::identity::{MessageId, PeerId};
use crate::protocol::{ChatPayload, Envelope, WirePayload, PROTOCOL_VERSION};

/// An application message as delivered to the local user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique identifier
    pub id: MessageId,
    /// Peer that created the message
    pub origin_id: PeerId,
    /// Addressee, or the broadcast sentinel
    pub recipient_id: PeerId,
    /// Application bytes
    pub payload: Vec<u8>,
    /// Links traversed on arrival
    pub hop_count: u32,
    /// Hop budget the origin granted
    pub ttl: u32,
    /// Every peer traversed, origin first and the local peer last
    pub route_path: Vec<PeerId>,
    /// Whether the origin asked for an acknowledgment
    pub requires_ack: bool,
    /// Application priority
    pub priority: i32,
}

impl Message {
    /// Build a delivered message from a chat envelope
    pub fn from_envelope(envelope: &Envelope, chat: ChatPayload) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: envelope.id()?,
            origin_id: envelope.origin(),
            recipient_id: envelope.recipient(),
            payload: chat.content,
            hop_count: envelope.hop_count,
            ttl: envelope.ttl,
            route_path: envelope
                .route_path
                .iter()
                .map(|p| PeerId::from(p.as_str()))
                .collect(),
            requires_ack: envelope.requires_ack,
            priority: envelope.priority,
        })
    }

    /// Whether the message was addressed to every peer
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_broadcast()
    }
}

/// Per-send options for [`crate::Node::send_message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOptions {
    /// Track the send and retry until acknowledged
    pub requires_ack: bool,
    /// Hop budget; `None` uses the configured default
    pub ttl: Option<u32>,
    /// Application priority carried in the envelope
    pub priority: i32,
}

impl SendOptions {
    /// Options for an acknowledged send
    pub fn reliable() -> Self {
        Self {
            requires_ack: true,
            ..Self::default()
        }
    }

    /// Override the hop budget
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Create a fresh envelope originated by `local`
///
/// The origin transmits with `hop_count = 0` and a route path holding only itself.
pub fn originate(
    local: &PeerId,
    recipient: &PeerId,
    message_id: MessageId,
    ttl: u32,
    body: &WirePayload,
) -> Result<Envelope, ProtocolError> {
    Ok(Envelope {
        version: PROTOCOL_VERSION,
        sender_id: local.to_string(),
        recipient_id: recipient.to_string(),
        origin_id: local.to_string(),
        message_id: message_id.as_bytes().to_vec(),
        hop_count: 0,
        ttl,
        route_path: vec![local.to_string()],
        payload_kind: body.kind() as i32,
        payload: body.encode()?,
        requires_ack: false,
        priority: 0,
        attempt: 0,
    })
}

/// Milliseconds since the Unix epoch, for protocol timestamps
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
