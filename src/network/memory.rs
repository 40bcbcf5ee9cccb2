//! In-process transport
//!
//! [`MemoryNetwork`] simulates a shared medium: peers register to get a
//! [`MemoryTransport`] plus an inbox of [`LinkEvent`]s, links are created and cut
//! explicitly, and every frame pushed through the medium is logged so
//! simulations can count exactly what went over the air.

use crate::error::{NetworkError, Result};
use crate::identity::PeerId;
use crate::network::transport::{ConnectionState, SendMode, Transport};
use crate::protocol::{decode_frame, Envelope, PayloadKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something the medium delivers to a registered peer
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A frame arrived from a directly linked peer
    Data {
        /// Transmitting neighbor
        from: PeerId,
        /// Encoded frame
        frame: Vec<u8>,
    },
    /// The link to a peer changed state
    State {
        /// Remote end of the link
        peer: PeerId,
        /// New state
        state: ConnectionState,
    },
}

/// One frame observed on the medium
#[derive(Debug, Clone)]
pub struct SentFrame {
    /// Transmitter
    pub from: PeerId,
    /// Receiver
    pub to: PeerId,
    /// Requested delivery mode
    pub mode: SendMode,
    /// Decoded envelope, if the frame was well formed
    pub envelope: Option<Envelope>,
}

impl SentFrame {
    /// Payload kind of the frame, if it decoded
    pub fn kind(&self) -> Option<PayloadKind> {
        self.envelope.as_ref().and_then(|e| e.kind().ok())
    }
}

#[derive(Default)]
struct MediumState {
    inboxes: HashMap<PeerId, mpsc::UnboundedSender<LinkEvent>>,
    links: HashSet<(PeerId, PeerId)>,
    refusing: HashSet<PeerId>,
    log: Vec<SentFrame>,
}

fn link_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl MediumState {
    fn notify(&self, peer: &PeerId, event: LinkEvent) {
        if let Some(inbox) = self.inboxes.get(peer) {
            // A dropped receiver means the peer went away
            let _ = inbox.send(event);
        }
    }
}

/// Simulated shared medium
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<MediumState>>,
}

impl MemoryNetwork {
    /// Create an empty medium
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer to the medium
    pub fn register(
        &self,
        peer: impl Into<PeerId>,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<LinkEvent>) {
        let peer = peer.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().inboxes.insert(peer.clone(), tx);

        (
            MemoryTransport {
                local: peer,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Establish a link and notify both ends
    ///
    /// Fails if either end refuses connections.
    pub fn link(&self, a: &PeerId, b: &PeerId) -> Result<()> {
        let mut state = self.state.lock();
        for (from, to) in [(a, b), (b, a)] {
            if state.refusing.contains(to) || !state.inboxes.contains_key(to) {
                return Err(NetworkError::ConnectionFailed {
                    peer: to.clone(),
                    reason: format!("{} is not accepting connections from {}", to, from),
                }
                .into());
            }
        }

        if state.links.insert(link_key(a, b)) {
            for (local, remote) in [(a, b), (b, a)] {
                state.notify(
                    local,
                    LinkEvent::State {
                        peer: remote.clone(),
                        state: ConnectionState::Connected,
                    },
                );
            }
        }
        Ok(())
    }

    /// Cut a link and notify both ends
    pub fn unlink(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.lock();
        if state.links.remove(&link_key(a, b)) {
            for (local, remote) in [(a, b), (b, a)] {
                state.notify(
                    local,
                    LinkEvent::State {
                        peer: remote.clone(),
                        state: ConnectionState::Disconnected,
                    },
                );
            }
        }
    }

    /// Whether two peers share a live link
    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state.lock().links.contains(&link_key(a, b))
    }

    /// Make a peer refuse (or accept again) new links
    pub fn set_refusing(&self, peer: &PeerId, refusing: bool) {
        let mut state = self.state.lock();
        if refusing {
            state.refusing.insert(peer.clone());
        } else {
            state.refusing.remove(peer);
        }
    }

    /// Every frame pushed through the medium so far
    pub fn sent_frames(&self) -> Vec<SentFrame> {
        self.state.lock().log.clone()
    }

    /// Frames of one payload kind
    pub fn frames_of_kind(&self, kind: PayloadKind) -> Vec<SentFrame> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|f| f.kind() == Some(kind))
            .cloned()
            .collect()
    }

    /// Forget the frame log
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    fn deliver(&self, from: &PeerId, to: &PeerId, frame: Vec<u8>, mode: SendMode) -> Result<()> {
        let mut state = self.state.lock();
        if !state.links.contains(&link_key(from, to)) {
            return Err(NetworkError::PeerNotConnected { peer: to.clone() }.into());
        }

        state.log.push(SentFrame {
            from: from.clone(),
            to: to.clone(),
            mode,
            envelope: decode_frame(&frame).ok(),
        });
        state.notify(
            to,
            LinkEvent::Data {
                from: from.clone(),
                frame,
            },
        );
        Ok(())
    }
}

/// A peer's handle on the [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    local: PeerId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// Identity this transport sends as
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer: &PeerId, frame: Vec<u8>, mode: SendMode) -> Result<()> {
        self.network.deliver(&self.local, peer, frame, mode)
    }

    async fn connect(&self, peer: &PeerId) -> Result<()> {
        self.network.link(&self.local, peer)
    }

    async fn disconnect(&self, peer: &PeerId) -> Result<()> {
        self.network.unlink(&self.local, peer);
        Ok(())
    }
}
