//! Error types for relaymesh
//!
//! Every failure in the routing core degrades delivery rather than the process.
//! Only caller misuse (self-addressed sends, invalid configuration) and frames
//! that cannot be decoded are surfaced as errors; admission rejection, discovery
//! timeouts and ack exhaustion are reported as values and events.

use crate::identity::PeerId;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for relaymesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// Transport-level errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Routing decisions that could not be carried out
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Wire format errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not allowed in the node's current lifecycle state
    #[error("Invalid node state: {0}")]
    InvalidState(String),
}

/// Errors raised while talking to the transport adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// The peer has no live link to us
    #[error("Peer {peer} is not connected")]
    PeerNotConnected {
        /// The unreachable peer
        peer: PeerId,
    },

    /// The transport accepted the peer but failed to push the payload
    #[error("Send to {peer} failed: {reason}")]
    SendFailed {
        /// Target peer
        peer: PeerId,
        /// Underlying reason reported by the transport
        reason: String,
    },

    /// A connection attempt failed
    #[error("Connection to {peer} failed: {reason}")]
    ConnectionFailed {
        /// Target peer
        peer: PeerId,
        /// Underlying reason reported by the transport
        reason: String,
    },

    /// No connected peers to carry the message
    #[error("No peers available")]
    NoPeersAvailable,

    /// The transport has been shut down
    #[error("Transport closed")]
    Closed,
}

/// Errors raised by the dispatcher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Attempted to send a message to the local identity
    #[error("Cannot route message to self")]
    SelfAddressed,

    /// No route could be found and no fallback was possible
    #[error("No route to {destination}")]
    RouteNotFound {
        /// Unreachable destination
        destination: PeerId,
    },

    /// Route discovery window closed without a reply
    #[error("Route discovery for {destination} timed out")]
    DiscoveryTimedOut {
        /// Destination that was being discovered
        destination: PeerId,
    },

    /// Hop budget exhausted
    #[error("Hop limit exceeded ({hop_count}/{ttl})")]
    HopLimitExceeded {
        /// Hops already traversed
        hop_count: u32,
        /// Hop budget
        ttl: u32,
    },

    /// Routing fields of a frame are inconsistent
    #[error("Invalid routing info: {reason}")]
    InvalidRoutingInfo {
        /// What was wrong
        reason: String,
    },
}

/// Errors raised while encoding or decoding wire frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to serialize a message to bytes
    #[error("Failed to serialize {message_type}: {reason}")]
    SerializationFailed {
        /// Message type being serialized
        message_type: String,
        /// Encoder error
        reason: String,
    },

    /// Failed to deserialize bytes into a message
    #[error("Failed to deserialize message: {reason}")]
    DeserializationFailed {
        /// Decoder error
        reason: String,
    },

    /// Payload kind tag not understood
    #[error("Unknown payload kind: {0}")]
    UnknownPayloadKind(i32),

    /// Envelope version not supported
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    /// A field holds a value outside its domain
    #[error("Invalid field {field}: {reason}")]
    InvalidField {
        /// Field name
        field: String,
        /// What was wrong
        reason: String,
    },

    /// Frame exceeds the size ceiling
    #[error("Message too large: {size} bytes (max: {max} bytes)")]
    MessageTooLarge {
        /// Frame size
        size: usize,
        /// Ceiling
        max: usize,
    },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field holds an unusable value
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: String,
        /// What was wrong
        reason: String,
    },

    /// Configuration text could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Configuration file could not be read or written
    #[error("Configuration file {path}: {source}")]
    File {
        /// Offending path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MeshError>;
