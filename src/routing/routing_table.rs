//! Topology routing table
//!
//! Every peer periodically announces its direct neighbors. The table merges those
//! announcements into one adjacency map and answers next-hop queries with a
//! breadth-first search from the local peer. Links are treated as symmetric: an
//! edge reported by either end is usable in both directions.
//!
//! Announcements not refreshed within the liveness window are pruned lazily when
//! the table is queried.

use crate::identity::PeerId;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

/// One announcer's reported neighbor set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adjacency {
    /// Direct neighbors of the announcer
    pub neighbors: BTreeSet<PeerId>,
    /// When the announcement was merged
    pub heard_at: Instant,
    /// Announcer's sequence number
    pub sequence: u64,
}

/// Adjacency graph built from topology announcements
#[derive(Debug)]
pub struct RoutingTable {
    local: PeerId,
    liveness: Duration,
    graph: RwLock<HashMap<PeerId, Adjacency>>,
}

impl RoutingTable {
    /// Create a table for the local peer
    pub fn new(local: PeerId, liveness: Duration) -> Self {
        let mut graph = HashMap::new();
        graph.insert(
            local.clone(),
            Adjacency {
                neighbors: BTreeSet::new(),
                heard_at: Instant::now(),
                sequence: 0,
            },
        );

        Self {
            local,
            liveness,
            graph: RwLock::new(graph),
        }
    }

    /// Local peer identity
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    /// Add a direct neighbor of the local peer; returns whether the set changed
    pub fn add_local_neighbor(&self, peer: &PeerId) -> bool {
        if peer == &self.local {
            return false;
        }
        let mut graph = self.graph.write();
        graph
            .get_mut(&self.local)
            .is_some_and(|adj| adj.neighbors.insert(peer.clone()))
    }

    /// Remove a direct neighbor of the local peer; returns whether the set changed
    pub fn remove_local_neighbor(&self, peer: &PeerId) -> bool {
        let mut graph = self.graph.write();
        graph
            .get_mut(&self.local)
            .is_some_and(|adj| adj.neighbors.remove(peer))
    }

    /// Direct neighbors of the local peer, sorted
    pub fn local_neighbors(&self) -> Vec<PeerId> {
        self.graph
            .read()
            .get(&self.local)
            .map(|adj| adj.neighbors.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Merge a neighbor announcement
    ///
    /// An announcement whose sequence is not newer than the one already held is
    /// ignored. Announcements claiming to come from the local peer are ignored.
    /// Returns whether the table changed.
    pub fn merge_announcement(
        &self,
        announcer: &PeerId,
        neighbors: impl IntoIterator<Item = PeerId>,
        sequence: u64,
        now: Instant,
    ) -> bool {
        if announcer == &self.local || announcer.is_broadcast() {
            return false;
        }

        let mut graph = self.graph.write();
        if let Some(existing) = graph.get(announcer) {
            let live = now.saturating_duration_since(existing.heard_at) < self.liveness;
            if live && existing.sequence >= sequence {
                return false;
            }
        }

        let neighbors = neighbors
            .into_iter()
            .filter(|p| p != announcer && !p.is_broadcast())
            .collect();
        graph.insert(
            announcer.clone(),
            Adjacency {
                neighbors,
                heard_at: now,
                sequence,
            },
        );
        true
    }

    /// Forget a peer's announcement and any local edge to it
    pub fn remove_peer(&self, peer: &PeerId) {
        let mut graph = self.graph.write();
        if peer != &self.local {
            graph.remove(peer);
        }
        if let Some(local) = graph.get_mut(&self.local) {
            local.neighbors.remove(peer);
        }
    }

    /// Drop announcements older than the liveness window
    pub fn prune_stale(&self, now: Instant) -> usize {
        let mut graph = self.graph.write();
        let before = graph.len();
        let local = &self.local;
        let liveness = self.liveness;
        graph.retain(|peer, adj| {
            peer == local || now.saturating_duration_since(adj.heard_at) < liveness
        });
        before - graph.len()
    }

    /// Direct neighbors lying on a shortest path to `destination`
    ///
    /// All equal-length alternatives are returned, sorted. Empty when the
    /// destination is the local peer or not reachable in the known graph.
    pub fn next_hops_to(&self, destination: &PeerId) -> Vec<PeerId> {
        self.next_hops_to_at(destination, Instant::now())
    }

    pub(crate) fn next_hops_to_at(&self, destination: &PeerId, now: Instant) -> Vec<PeerId> {
        self.prune_stale(now);
        self.search(destination)
            .map(|(_, hops)| hops.into_iter().collect())
            .unwrap_or_default()
    }

    /// Shortest known distance, in links, to `destination`
    pub fn distance_to(&self, destination: &PeerId) -> Option<u32> {
        self.prune_stale(Instant::now());
        self.search(destination).map(|(distance, _)| distance)
    }

    /// Every peer present in the graph, sorted
    pub fn known_peers(&self) -> Vec<PeerId> {
        let graph = self.graph.read();
        let mut peers: BTreeSet<PeerId> = BTreeSet::new();
        for (peer, adj) in graph.iter() {
            peers.insert(peer.clone());
            peers.extend(adj.neighbors.iter().cloned());
        }
        peers.remove(&self.local);
        peers.into_iter().collect()
    }

    /// Number of announcements held, the local one included
    pub fn len(&self) -> usize {
        self.graph.read().len()
    }

    /// Whether only the local entry is held
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// BFS from the local peer, tracking for every reached node the set of
    /// first hops on its shortest paths
    fn search(&self, destination: &PeerId) -> Option<(u32, BTreeSet<PeerId>)> {
        if destination == &self.local {
            return None;
        }

        let graph = self.graph.read();
        let mut edges: HashMap<&PeerId, BTreeSet<&PeerId>> = HashMap::new();
        for (peer, adj) in graph.iter() {
            for neighbor in &adj.neighbors {
                // Only our own entry decides which links we have
                if peer != &self.local && neighbor == &self.local {
                    continue;
                }
                edges.entry(peer).or_default().insert(neighbor);
                edges.entry(neighbor).or_default().insert(peer);
            }
        }

        let mut distance: HashMap<&PeerId, u32> = HashMap::new();
        let mut first_hops: HashMap<&PeerId, BTreeSet<PeerId>> = HashMap::new();
        let mut queue = VecDeque::new();

        distance.insert(&self.local, 0);
        for &neighbor in edges.get(&self.local).into_iter().flatten() {
            distance.insert(neighbor, 1);
            first_hops
                .entry(neighbor)
                .or_default()
                .insert(neighbor.clone());
            queue.push_back(neighbor);
        }

        while let Some(node) = queue.pop_front() {
            let depth = distance[node];
            if node == destination {
                // Every shorter node is already expanded
                continue;
            }
            let inherited = first_hops.get(node).cloned().unwrap_or_default();

            for &next in edges.get(node).into_iter().flatten() {
                match distance.get(next).copied() {
                    None => {
                        distance.insert(next, depth + 1);
                        first_hops.insert(next, inherited.clone());
                        queue.push_back(next);
                    },
                    Some(d) if d == depth + 1 => {
                        first_hops
                            .entry(next)
                            .or_default()
                            .extend(inherited.iter().cloned());
                    },
                    Some(_) => {},
                }
            }
        }

        let hops = first_hops.remove(destination)?;
        Some((distance[destination], hops))
    }
}
