//! Transport adapter seam
//!
//! The physical link (radio discovery, byte delivery) lives outside this crate.
//! The core consumes discovery and connection events from it and pushes encoded
//! frames through the [`Transport`] trait.

use crate::error::Result;
use crate::identity::PeerId;
use async_trait::async_trait;

/// Delivery mode requested from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendMode {
    /// Fire and forget; used for floods and periodic announcements
    BestEffort,
    /// Link-level retransmission if the transport supports it
    Reliable,
}

/// State of a link as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Link is being established (outbound attempt or inbound invitation)
    Connecting,
    /// Link is live
    Connected,
    /// Link is gone
    Disconnected,
}

/// Primitives the core needs from the transport adapter
///
/// Implementations must be cheap to call concurrently; the core never holds its
/// own locks across these calls.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Push one encoded frame to a directly connected peer
    async fn send(&self, peer: &PeerId, frame: Vec<u8>, mode: SendMode) -> Result<()>;

    /// Start (or invite) a connection to a discovered peer
    async fn connect(&self, peer: &PeerId) -> Result<()>;

    /// Gracefully tear down the link to a peer
    async fn disconnect(&self, peer: &PeerId) -> Result<()>;

    /// Discard any transport-level session state for a peer before a fresh attempt
    ///
    /// The default tears the link down, which is enough for transports without
    /// per-peer session objects.
    async fn reset_session(&self, peer: &PeerId) -> Result<()> {
        self.disconnect(peer).await
    }
}
