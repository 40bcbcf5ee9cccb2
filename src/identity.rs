//! Peer and message identifiers
//!
//! A [`PeerId`] is an opaque, stable string naming one mesh participant. Its
//! ordering is plain lexicographic string ordering, which every device computes
//! identically, so it doubles as the deterministic tie-breaker for connection races.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Recipient sentinel meaning "every peer"
pub const BROADCAST: &str = "broadcast";

/// Identity of a mesh participant
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identity from any string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The broadcast sentinel as a recipient
    pub fn broadcast() -> Self {
        Self(BROADCAST.to_string())
    }

    /// Whether this identity is the broadcast sentinel
    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST
    }

    /// Borrow the raw identity string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the raw identity string
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique identifier of an application message or protocol request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse the 16-byte wire form
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Uuid::from_slice(bytes)
            .map(Self)
            .map_err(|e| ProtocolError::InvalidField {
                field: "message_id".to_string(),
                reason: e.to_string(),
            })
    }

    /// The 16-byte wire form
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// The underlying UUID
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
