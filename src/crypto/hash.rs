//! Message fingerprints using Blake3
//!
//! A fingerprint is the stable key the message cache uses to recognise a frame it
//! has already processed. It covers the origin, the message id, the payload kind
//! and the transmission attempt, so an ack-driven retransmission is a new frame for
//! relays while the destination still recognises the message itself.

use crate::identity::{MessageId, PeerId};
use crate::protocol::PayloadKind;

/// Domain separator for frame fingerprints
const FRAME_DOMAIN: &[u8] = b"relaymesh/frame/v1";

/// Domain separator for delivery fingerprints
const DELIVERY_DOMAIN: &[u8] = b"relaymesh/delivery/v1";

/// A 32-byte Blake3 fingerprint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Create a fingerprint from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is enough to correlate log lines
        write!(f, "{}", &self.to_hex()[..16])
    }
}

fn update_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Fingerprint of one transmission of a frame
///
/// Two frames collide only if they share origin, id, kind and attempt.
pub fn frame_fingerprint(
    origin: &PeerId,
    message_id: &MessageId,
    kind: PayloadKind,
    attempt: u32,
) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(FRAME_DOMAIN);
    update_str(&mut hasher, origin.as_str());
    hasher.update(message_id.as_bytes());
    hasher.update(&(kind as i32).to_le_bytes());
    hasher.update(&attempt.to_le_bytes());
    Fingerprint(*hasher.finalize().as_bytes())
}

/// Fingerprint of an application message regardless of retransmission attempt
pub fn delivery_fingerprint(origin: &PeerId, message_id: &MessageId) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(DELIVERY_DOMAIN);
    update_str(&mut hasher, origin.as_str());
    hasher.update(message_id.as_bytes());
    Fingerprint(*hasher.finalize().as_bytes())
}
