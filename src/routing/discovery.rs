//! Route discovery bookkeeping
//!
//! Tracks the discoveries this peer started (one per destination, with every
//! waiting callback) and the requests it relayed for others. The protocol logic
//! that floods requests and walks replies back lives in the router; this module
//! only holds state and guarantees every callback fires exactly once.

use crate::identity::{MessageId, PeerId};
use crate::routing::route_cache::RouteInfo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// How a discovery ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// A route was learned
    Found(RouteInfo),
    /// No reply arrived before the deadline
    NoRoute,
}

impl DiscoveryOutcome {
    /// The learned route, if any
    pub fn route(&self) -> Option<&RouteInfo> {
        match self {
            Self::Found(route) => Some(route),
            Self::NoRoute => None,
        }
    }
}

/// Completion callback of a discovery
pub type DiscoveryCallback = Box<dyn FnOnce(DiscoveryOutcome) + Send + 'static>;

/// Whether [`RouteDiscovery::begin`] started a new flood
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStart {
    /// A new request must be flooded
    New(MessageId),
    /// A discovery for the same destination is already running
    Joined(MessageId),
}

impl DiscoveryStart {
    /// Identifier of the request carrying this discovery
    pub fn request_id(&self) -> MessageId {
        match self {
            Self::New(id) | Self::Joined(id) => *id,
        }
    }
}

struct PendingDiscovery {
    request_id: MessageId,
    deadline: Instant,
    callbacks: Vec<DiscoveryCallback>,
}

/// A request relayed on behalf of another peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRecord {
    /// Neighbor the request came from
    pub upstream: PeerId,
    /// Peer that started the discovery
    pub origin: PeerId,
    /// Sought destination
    pub destination: PeerId,
    /// When the request was relayed
    pub relayed_at: Instant,
}

/// Pending discoveries and relayed requests
pub struct RouteDiscovery {
    pending: Mutex<HashMap<PeerId, PendingDiscovery>>,
    relays: Mutex<HashMap<MessageId, RelayRecord>>,
    relay_ttl: Duration,
}

impl RouteDiscovery {
    /// Create an empty tracker; relay records are kept for `relay_ttl`
    pub fn new(relay_ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            relays: Mutex::new(HashMap::new()),
            relay_ttl,
        }
    }

    /// Register interest in a route to `destination`
    ///
    /// Concurrent discoveries for one destination share a single request; the
    /// deadline of the first one applies.
    pub fn begin(
        &self,
        destination: &PeerId,
        timeout: Duration,
        callback: DiscoveryCallback,
        now: Instant,
    ) -> DiscoveryStart {
        let mut pending = self.pending.lock();
        if let Some(existing) = pending.get_mut(destination) {
            existing.callbacks.push(callback);
            return DiscoveryStart::Joined(existing.request_id);
        }

        let request_id = MessageId::generate();
        pending.insert(
            destination.clone(),
            PendingDiscovery {
                request_id,
                deadline: now + timeout,
                callbacks: vec![callback],
            },
        );
        DiscoveryStart::New(request_id)
    }

    /// Finish the discovery answered by `request_id`
    ///
    /// Returns `false` if it already finished (late or duplicate reply).
    pub fn complete(&self, request_id: &MessageId, route: RouteInfo) -> bool {
        let finished = {
            let mut pending = self.pending.lock();
            let destination = pending
                .iter()
                .find(|(_, p)| &p.request_id == request_id)
                .map(|(d, _)| d.clone());
            destination.and_then(|d| pending.remove(&d))
        };

        match finished {
            Some(discovery) => {
                debug!(
                    destination = %route.destination,
                    hop_count = route.hop_count,
                    waiters = discovery.callbacks.len(),
                    "Route discovery completed"
                );
                fire(discovery.callbacks, DiscoveryOutcome::Found(route));
                true
            },
            None => false,
        }
    }

    /// Finish any discovery for `route.destination` with a route learned some
    /// other way
    pub fn resolve(&self, route: &RouteInfo) -> bool {
        let finished = self.pending.lock().remove(&route.destination);
        match finished {
            Some(discovery) => {
                fire(discovery.callbacks, DiscoveryOutcome::Found(route.clone()));
                true
            },
            None => false,
        }
    }

    /// Fail the discovery carried by `request_id`
    pub fn time_out(&self, request_id: &MessageId) -> bool {
        let finished = {
            let mut pending = self.pending.lock();
            let destination = pending
                .iter()
                .find(|(_, p)| &p.request_id == request_id)
                .map(|(d, _)| d.clone());
            destination.and_then(|d| pending.remove(&d).map(|p| (d, p)))
        };

        match finished {
            Some((destination, discovery)) => {
                debug!(destination = %destination, "Route discovery timed out");
                fire(discovery.callbacks, DiscoveryOutcome::NoRoute);
                true
            },
            None => false,
        }
    }

    /// Fail overdue discoveries and drop old relay records
    ///
    /// Returns the destinations whose discovery timed out.
    pub fn expire(&self, now: Instant) -> Vec<PeerId> {
        let overdue: Vec<(PeerId, PendingDiscovery)> = {
            let mut pending = self.pending.lock();
            let destinations: Vec<PeerId> = pending
                .iter()
                .filter(|(_, p)| now >= p.deadline)
                .map(|(d, _)| d.clone())
                .collect();
            destinations
                .into_iter()
                .filter_map(|d| pending.remove(&d).map(|p| (d, p)))
                .collect()
        };

        let ttl = self.relay_ttl;
        self.relays
            .lock()
            .retain(|_, r| now.saturating_duration_since(r.relayed_at) < ttl);

        let mut expired = Vec::with_capacity(overdue.len());
        for (destination, discovery) in overdue {
            debug!(destination = %destination, "Route discovery timed out");
            fire(discovery.callbacks, DiscoveryOutcome::NoRoute);
            expired.push(destination);
        }
        expired
    }

    /// Whether a discovery for `destination` is running
    pub fn is_pending(&self, destination: &PeerId) -> bool {
        self.pending.lock().contains_key(destination)
    }

    /// Whether `request_id` belongs to a discovery this peer started
    pub fn owns(&self, request_id: &MessageId) -> bool {
        self.pending
            .lock()
            .values()
            .any(|p| &p.request_id == request_id)
    }

    /// Number of running discoveries
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Remember that a request was relayed for another peer
    pub fn record_relay(&self, request_id: MessageId, record: RelayRecord) {
        self.relays.lock().insert(request_id, record);
    }

    /// Neighbor a relayed request came from
    pub fn upstream_of(&self, request_id: &MessageId) -> Option<PeerId> {
        self.relays.lock().get(request_id).map(|r| r.upstream.clone())
    }

    /// Drop relay state whose upstream is `peer`
    pub fn forget_peer(&self, peer: &PeerId) -> usize {
        let mut relays = self.relays.lock();
        let before = relays.len();
        relays.retain(|_, r| &r.upstream != peer);
        before - relays.len()
    }
}

impl std::fmt::Debug for RouteDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteDiscovery")
            .field("pending", &self.pending.lock().len())
            .field("relays", &self.relays.lock().len())
            .finish()
    }
}

fn fire(callbacks: Vec<DiscoveryCallback>, outcome: DiscoveryOutcome) {
    for callback in callbacks {
        callback(outcome.clone());
    }
}
