//! On-demand route cache
//!
//! Holds what route discovery learned: for each destination, the direct neighbor
//! to hand a message to, the hop count and, when known, the full path. Entries
//! live for a fixed TTL and are purged on access once expired. Losing a next hop
//! removes every entry through it at once.

use crate::identity::PeerId;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// A cached route to one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    /// Destination peer
    pub destination: PeerId,
    /// Direct neighbor to send to
    pub next_hop: PeerId,
    /// Links from the local peer to the destination
    pub hop_count: u32,
    /// Full path, local peer first and destination last, when known
    pub path: Option<Vec<PeerId>>,
    /// When the route was installed
    pub installed_at: Instant,
}

impl RouteInfo {
    /// Create a route installed now
    pub fn new(destination: PeerId, next_hop: PeerId, hop_count: u32) -> Self {
        Self {
            destination,
            next_hop,
            hop_count,
            path: None,
            installed_at: Instant::now(),
        }
    }

    /// Attach the full path
    pub fn with_path(mut self, path: Vec<PeerId>) -> Self {
        self.path = Some(path);
        self
    }

    /// Override the installation time
    pub fn installed(mut self, at: Instant) -> Self {
        self.installed_at = at;
        self
    }

    /// Whether the route outlived `ttl`
    pub fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.installed_at) >= ttl
    }

    /// Whether the path passes through `from` immediately followed by `to`
    pub fn uses_link(&self, from: &PeerId, to: &PeerId) -> bool {
        self.path
            .as_ref()
            .is_some_and(|path| path.windows(2).any(|w| &w[0] == from && &w[1] == to))
    }
}

/// Destination-keyed route cache
#[derive(Debug)]
pub struct RouteCache {
    routes: DashMap<PeerId, RouteInfo>,
    ttl: Duration,
}

impl RouteCache {
    /// Create an empty cache whose entries live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            routes: DashMap::new(),
            ttl,
        }
    }

    /// Route lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Valid route to `destination`, purging it if expired
    pub fn lookup(&self, destination: &PeerId) -> Option<RouteInfo> {
        self.lookup_at(destination, Instant::now())
    }

    pub(crate) fn lookup_at(&self, destination: &PeerId, now: Instant) -> Option<RouteInfo> {
        let ttl = self.ttl;
        if self
            .routes
            .remove_if(destination, |_, route| route.is_expired(ttl, now))
            .is_some()
        {
            return None;
        }
        self.routes.get(destination).map(|r| r.value().clone())
    }

    /// Install a route, replacing any existing entry
    pub fn insert(&self, route: RouteInfo) {
        self.routes.insert(route.destination.clone(), route);
    }

    /// Install a route only if it improves on what is held
    ///
    /// Used for routes learned in passing from traffic. An existing entry is kept
    /// unless it expired or the new route is strictly shorter. Returns whether the
    /// route was installed.
    pub fn learn(&self, route: RouteInfo, now: Instant) -> bool {
        let ttl = self.ttl;
        let mut installed = false;
        self.routes
            .entry(route.destination.clone())
            .and_modify(|existing| {
                if existing.is_expired(ttl, now) || route.hop_count < existing.hop_count {
                    *existing = route.clone();
                    installed = true;
                }
            })
            .or_insert_with(|| {
                installed = true;
                route.clone()
            });
        installed
    }

    /// Remove every route whose next hop is `peer`; returns the affected destinations
    pub fn invalidate_next_hop(&self, peer: &PeerId) -> Vec<PeerId> {
        let mut removed = Vec::new();
        self.routes.retain(|destination, route| {
            let keep = &route.next_hop != peer;
            if !keep {
                removed.push(destination.clone());
            }
            keep
        });
        removed.sort();
        removed
    }

    /// Remove routes broken by a reported link failure
    ///
    /// `reporter` lost its link to `broken` while forwarding toward `destination`.
    /// Drops the route to `destination` (or to `broken`) through `reporter`, and
    /// any route whose known path crosses the `reporter -> broken` link.
    pub fn invalidate_broken_link(
        &self,
        reporter: &PeerId,
        broken: &PeerId,
        destination: &PeerId,
    ) -> Vec<PeerId> {
        let mut removed = Vec::new();
        self.routes.retain(|dest, route| {
            let via_reporter =
                &route.next_hop == reporter && (dest == destination || dest == broken);
            let keep = !via_reporter && !route.uses_link(reporter, broken);
            if !keep {
                removed.push(dest.clone());
            }
            keep
        });
        removed.sort();
        removed
    }

    /// Remove the route to one destination
    pub fn remove(&self, destination: &PeerId) -> Option<RouteInfo> {
        self.routes.remove(destination).map(|(_, route)| route)
    }

    /// Drop expired routes, returning how many were removed
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.routes.len();
        let ttl = self.ttl;
        self.routes.retain(|_, route| !route.is_expired(ttl, now));
        before.saturating_sub(self.routes.len())
    }

    /// Snapshot of held routes, sorted by destination
    pub fn routes(&self) -> Vec<RouteInfo> {
        let mut routes: Vec<_> = self.routes.iter().map(|e| e.value().clone()).collect();
        routes.sort_by(|a, b| a.destination.cmp(&b.destination));
        routes
    }

    /// Number of held routes, expired ones included until purged
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no route is held
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
