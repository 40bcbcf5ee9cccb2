//! Protocol module
//!
//! Wire definitions for every frame exchanged between mesh peers. All frames share
//! one [`Envelope`]; the body is a separately encoded payload selected by
//! [`PayloadKind`]. Messages are Protocol Buffers encoded with `prost`, which gives
//! compact frames and forward-compatible field evolution.

pub mod messages;

use crate::error::ProtocolError;
use crate::identity::{MessageId, PeerId};
use prost::Message as ProstMessage;
use std::fmt;

pub use messages::{Message, SendOptions};

/// Maximum encoded frame size (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound accepted for a frame's hop budget
pub const MAX_TTL: u32 = 32;

/// Common envelope carried by every frame
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// Protocol version
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Immediate transmitter of this copy
    #[prost(string, tag = "2")]
    pub sender_id: String,
    /// Final recipient, or the broadcast sentinel
    #[prost(string, tag = "3")]
    pub recipient_id: String,
    /// Peer that created the message
    #[prost(string, tag = "4")]
    pub origin_id: String,
    /// 16-byte UUID of the message
    #[prost(bytes = "vec", tag = "5")]
    pub message_id: Vec<u8>,
    /// Links traversed so far
    #[prost(uint32, tag = "6")]
    pub hop_count: u32,
    /// Hop budget
    #[prost(uint32, tag = "7")]
    pub ttl: u32,
    /// Peers traversed so far, origin first
    #[prost(string, repeated, tag = "8")]
    pub route_path: Vec<String>,
    /// Body discriminator
    #[prost(enumeration = "PayloadKind", tag = "9")]
    pub payload_kind: i32,
    /// Encoded body
    #[prost(bytes = "vec", tag = "10")]
    pub payload: Vec<u8>,
    /// Whether the recipient must acknowledge
    #[prost(bool, tag = "11")]
    pub requires_ack: bool,
    /// Application priority
    #[prost(int32, tag = "12")]
    pub priority: i32,
    /// Transmission attempt, 0 for the first send
    #[prost(uint32, tag = "13")]
    pub attempt: u32,
}

/// Body discriminator of an [`Envelope`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PayloadKind {
    /// Application data
    Chat = 0,
    /// Direct-neighbor announcement
    TopologyBroadcast = 1,
    /// Route request (RREQ)
    RouteRequest = 2,
    /// Route reply (RREP)
    RouteReply = 3,
    /// Broken link notification
    RouteError = 4,
    /// Delivery acknowledgment
    Ack = 5,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Chat => "chat",
            Self::TopologyBroadcast => "topology",
            Self::RouteRequest => "rreq",
            Self::RouteReply => "rrep",
            Self::RouteError => "rerr",
            Self::Ack => "ack",
        };
        f.write_str(name)
    }
}

/// Application data body
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatPayload {
    /// Opaque application bytes
    #[prost(bytes = "vec", tag = "1")]
    pub content: Vec<u8>,
}

/// Periodic announcement of an announcer's direct neighbors
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TopologyBroadcast {
    /// Peer whose neighbors are listed
    #[prost(string, tag = "1")]
    pub announcer: String,
    /// Direct neighbors of the announcer
    #[prost(string, repeated, tag = "2")]
    pub neighbors: Vec<String>,
    /// Monotonic per-announcer sequence number
    #[prost(uint64, tag = "3")]
    pub sequence: u64,
}

/// Route request (RREQ)
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouteRequest {
    /// Discovery identifier
    #[prost(bytes = "vec", tag = "1")]
    pub request_id: Vec<u8>,
    /// Requesting peer
    #[prost(string, tag = "2")]
    pub origin: String,
    /// Sought destination
    #[prost(string, tag = "3")]
    pub destination: String,
    /// Relays traversed so far
    #[prost(uint32, tag = "4")]
    pub hop_count: u32,
    /// Peers traversed so far, origin first
    #[prost(string, repeated, tag = "5")]
    pub path: Vec<String>,
    /// Creation time, milliseconds since the Unix epoch
    #[prost(uint64, tag = "6")]
    pub timestamp_ms: u64,
}

/// Route reply (RREP)
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouteReply {
    /// Identifier of the answered request
    #[prost(bytes = "vec", tag = "1")]
    pub request_id: Vec<u8>,
    /// Destination the route leads to
    #[prost(string, tag = "2")]
    pub destination: String,
    /// Full path, requester first, destination last
    #[prost(string, repeated, tag = "3")]
    pub path: Vec<String>,
    /// Links between requester and destination
    #[prost(uint32, tag = "4")]
    pub hop_count: u32,
    /// Creation time, milliseconds since the Unix epoch
    #[prost(uint64, tag = "5")]
    pub timestamp_ms: u64,
}

/// Notification that a next hop toward a destination is gone
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouteError {
    /// Destination that became unreachable through the reporter
    #[prost(string, tag = "1")]
    pub destination: String,
    /// The next hop that was lost
    #[prost(string, tag = "2")]
    pub broken_next_hop: String,
    /// Peer that detected the break
    #[prost(string, tag = "3")]
    pub reporter: String,
}

/// Delivery acknowledgment
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
    /// Acknowledged message
    #[prost(bytes = "vec", tag = "1")]
    pub message_id: Vec<u8>,
    /// Attempt that reached the recipient
    #[prost(uint32, tag = "2")]
    pub attempt: u32,
}

/// Decoded frame body
#[derive(Debug, Clone, PartialEq)]
pub enum WirePayload {
    /// Application data
    Chat(ChatPayload),
    /// Neighbor announcement
    TopologyBroadcast(TopologyBroadcast),
    /// Route request
    RouteRequest(RouteRequest),
    /// Route reply
    RouteReply(RouteReply),
    /// Broken link notification
    RouteError(RouteError),
    /// Delivery acknowledgment
    Ack(Ack),
}

impl WirePayload {
    /// Discriminator of this body
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Chat(_) => PayloadKind::Chat,
            Self::TopologyBroadcast(_) => PayloadKind::TopologyBroadcast,
            Self::RouteRequest(_) => PayloadKind::RouteRequest,
            Self::RouteReply(_) => PayloadKind::RouteReply,
            Self::RouteError(_) => PayloadKind::RouteError,
            Self::Ack(_) => PayloadKind::Ack,
        }
    }

    /// Encode the body
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::Chat(p) => serialize_message(p),
            Self::TopologyBroadcast(p) => serialize_message(p),
            Self::RouteRequest(p) => serialize_message(p),
            Self::RouteReply(p) => serialize_message(p),
            Self::RouteError(p) => serialize_message(p),
            Self::Ack(p) => serialize_message(p),
        }
    }

    /// Decode a body given its discriminator
    pub fn decode(kind: i32, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let kind = PayloadKind::try_from(kind).map_err(|_| ProtocolError::UnknownPayloadKind(kind))?;
        Ok(match kind {
            PayloadKind::Chat => Self::Chat(deserialize_message(bytes)?),
            PayloadKind::TopologyBroadcast => Self::TopologyBroadcast(deserialize_message(bytes)?),
            PayloadKind::RouteRequest => Self::RouteRequest(deserialize_message(bytes)?),
            PayloadKind::RouteReply => Self::RouteReply(deserialize_message(bytes)?),
            PayloadKind::RouteError => Self::RouteError(deserialize_message(bytes)?),
            PayloadKind::Ack => Self::Ack(deserialize_message(bytes)?),
        })
    }
}

/// Serialize a Protocol Buffer message to bytes
///
/// # Example
/// ```
/// use relaymesh::protocol::{serialize_message, ChatPayload};
///
/// let body = ChatPayload { content: b"hi".to_vec() };
/// let bytes = serialize_message(&body).unwrap();
/// assert!(!bytes.is_empty());
/// ```
pub fn serialize_message<T: ProstMessage>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(message.encoded_len());

    message
        .encode(&mut buf)
        .map_err(|e| ProtocolError::SerializationFailed {
            message_type: std::any::type_name::<T>()
                .rsplit("::")
                .next()
                .unwrap_or("message")
                .to_string(),
            reason: e.to_string(),
        })?;

    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: buf.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    Ok(buf)
}

/// Deserialize bytes to a Protocol Buffer message
pub fn deserialize_message<T: ProstMessage + Default>(bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    // Empty input is valid protobuf and decodes to defaults
    T::decode(bytes).map_err(|e| ProtocolError::DeserializationFailed {
        reason: e.to_string(),
    })
}

/// Validate the structural fields of an envelope
///
/// Routing-level consistency (hop count against budget and path) is checked by
/// [`crate::routing::validate_routing_info`].
pub fn validate_envelope(envelope: &Envelope) -> Result<(), ProtocolError> {
    if envelope.version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(envelope.version));
    }

    if envelope.message_id.len() != 16 {
        return Err(ProtocolError::InvalidField {
            field: "message_id".to_string(),
            reason: format!("must be 16 bytes, got {}", envelope.message_id.len()),
        });
    }

    for (field, value) in [
        ("sender_id", &envelope.sender_id),
        ("recipient_id", &envelope.recipient_id),
        ("origin_id", &envelope.origin_id),
    ] {
        if value.is_empty() {
            return Err(ProtocolError::InvalidField {
                field: field.to_string(),
                reason: "must not be empty".to_string(),
            });
        }
    }

    PayloadKind::try_from(envelope.payload_kind)
        .map_err(|_| ProtocolError::UnknownPayloadKind(envelope.payload_kind))?;

    Ok(())
}

impl Envelope {
    /// Payload discriminator, if valid
    pub fn kind(&self) -> Result<PayloadKind, ProtocolError> {
        PayloadKind::try_from(self.payload_kind)
            .map_err(|_| ProtocolError::UnknownPayloadKind(self.payload_kind))
    }

    /// Parsed message id
    pub fn id(&self) -> Result<MessageId, ProtocolError> {
        MessageId::from_slice(&self.message_id)
    }

    /// Creator of the message
    pub fn origin(&self) -> PeerId {
        PeerId::from(self.origin_id.as_str())
    }

    /// Final recipient of the message
    pub fn recipient(&self) -> PeerId {
        PeerId::from(self.recipient_id.as_str())
    }

    /// Immediate transmitter of this copy
    pub fn sender(&self) -> PeerId {
        PeerId::from(self.sender_id.as_str())
    }

    /// Whether the message is addressed to every peer
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id == crate::identity::BROADCAST
    }

    /// Decode the body
    pub fn body(&self) -> Result<WirePayload, ProtocolError> {
        WirePayload::decode(self.payload_kind, &self.payload)
    }
}

/// Encode an envelope as a transport frame
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    serialize_message(envelope)
}

/// Decode and validate a transport frame
pub fn decode_frame(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    let envelope: Envelope = deserialize_message(bytes)?;
    validate_envelope(&envelope)?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        Envelope {
            version: PROTOCOL_VERSION,
            sender_id: "alice".to_string(),
            recipient_id: "bob".to_string(),
            origin_id: "alice".to_string(),
            message_id: MessageId::generate().as_bytes().to_vec(),
            hop_count: 0,
            ttl: 8,
            route_path: vec!["alice".to_string()],
            payload_kind: PayloadKind::Chat as i32,
            payload: serialize_message(&ChatPayload {
                content: b"hello".to_vec(),
            })
            .unwrap(),
            requires_ack: true,
            priority: 1,
            attempt: 0,
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let envelope = sample_envelope();
        let bytes = encode_frame(&envelope).unwrap();
        let decoded = decode_frame(&bytes).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.kind().unwrap(), PayloadKind::Chat);
        match decoded.body().unwrap() {
            WirePayload::Chat(chat) => assert_eq!(chat.content, b"hello"),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = decode_frame(&[0xff, 0xff, 0xff, 0xff]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_wrong_version() {
        let mut envelope = sample_envelope();
        envelope.version = 99;
        assert_eq!(
            validate_envelope(&envelope),
            Err(ProtocolError::UnsupportedVersion(99))
        );
    }

    #[test]
    fn test_validate_rejects_short_message_id() {
        let mut envelope = sample_envelope();
        envelope.message_id = vec![1, 2, 3];
        assert!(matches!(
            validate_envelope(&envelope),
            Err(ProtocolError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_origin() {
        let mut envelope = sample_envelope();
        envelope.origin_id.clear();
        assert!(validate_envelope(&envelope).is_err());
    }

    #[test]
    fn test_unknown_payload_kind() {
        let mut envelope = sample_envelope();
        envelope.payload_kind = 42;
        assert_eq!(
            validate_envelope(&envelope),
            Err(ProtocolError::UnknownPayloadKind(42))
        );
        assert!(envelope.body().is_err());
    }

    #[test]
    fn test_payload_kind_matches_body() {
        let body = WirePayload::RouteError(RouteError {
            destination: "carol".to_string(),
            broken_next_hop: "bob".to_string(),
            reporter: "alice".to_string(),
        });
        let bytes = body.encode().unwrap();
        let decoded = WirePayload::decode(body.kind() as i32, &bytes).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let chat = ChatPayload {
            content: vec![0u8; MAX_MESSAGE_SIZE + 1],
        };
        assert!(matches!(
            serialize_message(&chat),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }
}
