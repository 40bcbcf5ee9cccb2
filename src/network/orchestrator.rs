//! Admission control
//!
//! The [`Orchestrator`] is the only caller of the pool's mutating operations. It
//! scores peers through a [`PriorityPolicy`], remembers rejected peers as
//! candidates for opportunistic re-admission, and drives the per-peer
//! `Active -> PendingDisconnect -> released` state machine.

use crate::identity::PeerId;
use crate::network::pool::{ConnectionPool, LinkIntent, SlotDecision, SlotOccupant};
use crate::network::priority::{PeerProfile, PoolContext, PriorityPolicy};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Result of an admission request
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    /// A free slot was granted
    Admitted {
        /// Slot index
        slot: usize,
    },
    /// The peer already held a slot
    AlreadyAdmitted {
        /// Slot index
        slot: usize,
    },
    /// The peer displaced an occupant, which must now be disconnected
    Replaced {
        /// Slot index
        slot: usize,
        /// Displaced peer
        evicted: PeerId,
    },
    /// Pool full and the peer's priority too low; kept as a candidate
    Rejected {
        /// Score the peer was evaluated with
        score: f64,
    },
}

impl AdmissionDecision {
    /// Whether the peer holds a slot after this decision
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    /// Peer that must be disconnected as a consequence, if any
    pub fn evicted(&self) -> Option<&PeerId> {
        match self {
            Self::Replaced { evicted, .. } => Some(evicted),
            _ => None,
        }
    }
}

/// Result of [`Orchestrator::request_disconnect`]
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectDecision {
    /// The peer holds no slot
    NotAdmitted,
    /// Disconnect now; the slot went to `replacement` if one was waiting
    Disconnect {
        /// Candidate admitted into the freed slot
        replacement: Option<PeerId>,
    },
    /// No alternative is available; the peer stays until one shows up or it
    /// leaves on its own
    Deferred,
}

/// Changes made by a rebalancing pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebalanceOutcome {
    /// Candidates that received a slot
    pub admitted: Vec<PeerId>,
    /// Occupants displaced to make room
    pub evicted: Vec<PeerId>,
}

impl RebalanceOutcome {
    /// Whether the pass changed nothing
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty() && self.evicted.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f64,
    seen_at: Instant,
}

/// Admission and eviction decisions over a [`ConnectionPool`]
pub struct Orchestrator {
    pool: ConnectionPool,
    policy: Arc<dyn PriorityPolicy>,
    profiles: DashMap<PeerId, PeerProfile>,
    candidates: Mutex<HashMap<PeerId, Candidate>>,
    candidate_ttl: Duration,
}

impl Orchestrator {
    /// Create an orchestrator over `capacity` eagerly initialised slots
    pub fn new(capacity: usize, policy: Arc<dyn PriorityPolicy>, candidate_ttl: Duration) -> Self {
        Self {
            pool: ConnectionPool::new(capacity),
            policy,
            profiles: DashMap::new(),
            candidates: Mutex::new(HashMap::new()),
            candidate_ttl,
        }
    }

    /// The underlying pool (read-only use)
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Replace what we know about a peer
    pub fn update_profile(&self, peer: &PeerId, profile: PeerProfile) {
        self.profiles.insert(peer.clone(), profile);
    }

    /// What we know about a peer
    pub fn profile(&self, peer: &PeerId) -> PeerProfile {
        self.profiles
            .get(peer)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    /// Record traffic with a peer, feeding relationship recency
    pub fn touch(&self, peer: &PeerId, now: Instant) {
        self.profiles.entry(peer.clone()).or_default().last_interaction = Some(now);
    }

    /// Current admission score of a peer
    pub fn score(&self, peer: &PeerId, now: Instant) -> f64 {
        let context = PoolContext {
            occupied: self.pool.occupied(),
            capacity: self.pool.capacity(),
        };
        self.policy.score(&self.profile(peer), context, now)
    }

    /// Decide whether `peer` gets a slot
    pub fn admit(&self, peer: &PeerId, now: Instant) -> AdmissionDecision {
        self.place(peer, now, true)
    }

    fn place(&self, peer: &PeerId, now: Instant, remember: bool) -> AdmissionDecision {
        let score = self.score(peer, now);
        let decision = self.pool.try_admit(peer, score, now);

        match decision {
            SlotDecision::AlreadyAdmitted { slot } => AdmissionDecision::AlreadyAdmitted { slot },
            SlotDecision::Admitted { slot } => {
                self.candidates.lock().remove(peer);
                info!(peer = %peer, slot, score, "Peer admitted");
                AdmissionDecision::Admitted { slot }
            },
            SlotDecision::Replaced { slot, evicted } => {
                self.candidates.lock().remove(peer);
                info!(peer = %peer, evicted = %evicted, slot, score, "Peer admitted by eviction");
                AdmissionDecision::Replaced { slot, evicted }
            },
            SlotDecision::Rejected { lowest_score } => {
                let mut candidates = self.candidates.lock();
                if remember {
                    candidates.insert(
                        peer.clone(),
                        Candidate {
                            score,
                            seen_at: now,
                        },
                    );
                } else if let Some(candidate) = candidates.get_mut(peer) {
                    candidate.score = score;
                }
                drop(candidates);
                debug!(peer = %peer, score, lowest_score, "Peer rejected, kept as candidate");
                AdmissionDecision::Rejected { score }
            },
        }
    }

    /// Ask to drop a peer
    ///
    /// If a candidate is waiting, the best one takes the peer's slot in a single
    /// pool operation. Otherwise the peer is flagged [`LinkIntent::PendingDisconnect`] and
    /// will be the first occupant displaced by the next newcomer.
    pub fn request_disconnect(&self, peer: &PeerId, now: Instant) -> DisconnectDecision {
        if !self.pool.contains(peer) {
            return DisconnectDecision::NotAdmitted;
        }

        match self.best_candidate(now) {
            Some(candidate) => {
                let score = self.score(&candidate, now);
                // The peer may have left between the check and the swap
                let Some(decision) = self.pool.swap(peer, &candidate, score, now) else {
                    return DisconnectDecision::NotAdmitted;
                };
                self.candidates.lock().remove(&candidate);
                let replacement =
                    matches!(decision, SlotDecision::Admitted { .. }).then_some(candidate);
                info!(peer = %peer, replacement = ?replacement, "Peer released for waiting candidate");
                DisconnectDecision::Disconnect { replacement }
            },
            None => {
                self.pool.mark_pending_disconnect(peer);
                debug!(peer = %peer, "Disconnect deferred until an alternative appears");
                DisconnectDecision::Deferred
            },
        }
    }

    /// Withdraw a deferred disconnect
    pub fn cancel_disconnect(&self, peer: &PeerId) -> bool {
        self.pool.clear_pending_disconnect(peer)
    }

    /// Disconnect intent of an admitted peer
    pub fn intent(&self, peer: &PeerId) -> Option<LinkIntent> {
        self.pool.intent(peer)
    }

    /// Record that the link to an admitted peer is live
    pub fn mark_connected(&self, peer: &PeerId, now: Instant) -> bool {
        self.pool.mark_connected(peer, now)
    }

    /// Free the slot of a peer that went away
    pub fn release(&self, peer: &PeerId) -> bool {
        self.pool.release(peer).is_some()
    }

    /// Drop everything known about a peer
    pub fn forget(&self, peer: &PeerId) {
        self.pool.release(peer);
        self.candidates.lock().remove(peer);
        self.profiles.remove(peer);
    }

    /// Re-offer slots to waiting candidates, best score first
    ///
    /// Expired candidates are dropped. A candidate displaces an occupant only if
    /// its current score strictly exceeds that occupant's admission score, or the
    /// occupant has a pending disconnect.
    pub fn rebalance(&self, now: Instant) -> RebalanceOutcome {
        let mut outcome = RebalanceOutcome::default();

        let mut waiting: Vec<PeerId> = {
            let mut candidates = self.candidates.lock();
            candidates.retain(|_, c| now.saturating_duration_since(c.seen_at) < self.candidate_ttl);
            candidates.keys().cloned().collect()
        };
        waiting.sort_by(|a, b| self.score(b, now).total_cmp(&self.score(a, now)));

        for candidate in waiting {
            match self.place(&candidate, now, false) {
                AdmissionDecision::Admitted { .. } => outcome.admitted.push(candidate),
                AdmissionDecision::Replaced { evicted, .. } => {
                    outcome.admitted.push(candidate);
                    outcome.evicted.push(evicted);
                },
                AdmissionDecision::AlreadyAdmitted { .. } | AdmissionDecision::Rejected { .. } => {},
            }
        }

        if !outcome.is_empty() {
            info!(
                admitted = outcome.admitted.len(),
                evicted = outcome.evicted.len(),
                "Pool rebalanced"
            );
        }
        outcome
    }

    /// Whether a peer holds a slot
    pub fn is_admitted(&self, peer: &PeerId) -> bool {
        self.pool.contains(peer)
    }

    /// Snapshot of slot occupants
    pub fn occupants(&self) -> Vec<SlotOccupant> {
        self.pool.occupants()
    }

    /// Peers waiting for a slot
    pub fn candidates(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.candidates.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    fn best_candidate(&self, now: Instant) -> Option<PeerId> {
        let candidates = self.candidates.lock();
        candidates
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.seen_at) < self.candidate_ttl)
            .max_by(|a, b| a.1.score.total_cmp(&b.1.score))
            .map(|(peer, _)| peer.clone())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pool", &self.pool)
            .field("candidates", &self.candidates.lock().len())
            .field("candidate_ttl", &self.candidate_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::priority::{ConnectionClass, WeightedPriorityPolicy};

    fn orchestrator(capacity: usize) -> Orchestrator {
        Orchestrator::new(
            capacity,
            Arc::new(WeightedPriorityPolicy::default()),
            Duration::from_secs(60),
        )
    }

    fn peer(name: &str) -> PeerId {
        PeerId::from(name)
    }

    #[test]
    fn test_admit_until_full_then_reject() {
        let orch = orchestrator(2);
        let now = Instant::now();

        assert!(orch.admit(&peer("a"), now).is_admitted());
        assert!(orch.admit(&peer("b"), now).is_admitted());

        let decision = orch.admit(&peer("c"), now);
        assert!(matches!(decision, AdmissionDecision::Rejected { .. }));
        assert_eq!(orch.candidates(), vec![peer("c")]);
        assert_eq!(orch.pool().occupied(), 2);
    }

    #[test]
    fn test_emergency_peer_evicts_general() {
        let orch = orchestrator(1);
        let now = Instant::now();
        orch.admit(&peer("general"), now);

        orch.update_profile(
            &peer("urgent"),
            PeerProfile::with_class(ConnectionClass::Emergency),
        );
        let decision = orch.admit(&peer("urgent"), now);

        assert_eq!(decision.evicted(), Some(&peer("general")));
        assert!(orch.is_admitted(&peer("urgent")));
        assert!(!orch.is_admitted(&peer("general")));
    }

    #[test]
    fn test_request_disconnect_without_candidate_is_deferred() {
        let orch = orchestrator(2);
        let now = Instant::now();
        orch.admit(&peer("a"), now);

        assert_eq!(
            orch.request_disconnect(&peer("a"), now),
            DisconnectDecision::Deferred
        );
        assert_eq!(orch.intent(&peer("a")), Some(LinkIntent::PendingDisconnect));
        assert!(orch.is_admitted(&peer("a")));

        assert_eq!(
            orch.request_disconnect(&peer("ghost"), now),
            DisconnectDecision::NotAdmitted
        );
    }

    #[test]
    fn test_pending_disconnect_yields_to_newcomer() {
        let orch = orchestrator(1);
        let now = Instant::now();
        orch.update_profile(&peer("a"), PeerProfile::with_class(ConnectionClass::Family));
        orch.admit(&peer("a"), now);
        orch.request_disconnect(&peer("a"), now);

        // Lower priority than the occupant, but the occupant wants out
        let decision = orch.admit(&peer("b"), now);
        assert_eq!(decision.evicted(), Some(&peer("a")));
    }

    #[test]
    fn test_cancelled_disconnect_keeps_slot() {
        let orch = orchestrator(1);
        let now = Instant::now();
        orch.admit(&peer("a"), now);
        orch.request_disconnect(&peer("a"), now);

        assert!(orch.cancel_disconnect(&peer("a")));
        assert_eq!(orch.intent(&peer("a")), Some(LinkIntent::Active));

        // Equal score no longer displaces the occupant
        let decision = orch.admit(&peer("b"), now);
        assert!(matches!(decision, AdmissionDecision::Rejected { .. }));
        assert!(orch.is_admitted(&peer("a")));
        assert!(!orch.cancel_disconnect(&peer("ghost")));
    }

    #[test]
    fn test_deferred_disconnect_resolves_on_newcomer_with_free_slots() {
        let orch = orchestrator(2);
        let now = Instant::now();
        orch.admit(&peer("old"), now);
        assert_eq!(
            orch.request_disconnect(&peer("old"), now),
            DisconnectDecision::Deferred
        );

        let decision = orch.admit(&peer("new"), now);
        assert_eq!(decision.evicted(), Some(&peer("old")));
        assert!(orch.is_admitted(&peer("new")));
        assert!(!orch.is_admitted(&peer("old")));
        assert_eq!(orch.intent(&peer("old")), None);
        assert_eq!(orch.pool().occupied(), 1);
    }

    #[test]
    fn test_request_disconnect_with_candidate_swaps_immediately() {
        let orch = orchestrator(1);
        let now = Instant::now();
        orch.admit(&peer("a"), now);
        assert!(!orch.admit(&peer("b"), now).is_admitted());

        let decision = orch.request_disconnect(&peer("a"), now);
        assert_eq!(
            decision,
            DisconnectDecision::Disconnect {
                replacement: Some(peer("b"))
            }
        );
        assert!(orch.is_admitted(&peer("b")));
        assert_eq!(orch.pool().slot_of(&peer("b")), Some(0));
        assert!(orch.candidates().is_empty());
    }

    #[test]
    fn test_rebalance_fills_freed_slot() {
        let orch = orchestrator(1);
        let now = Instant::now();
        orch.admit(&peer("a"), now);
        orch.admit(&peer("b"), now);

        assert!(orch.rebalance(now).is_empty());

        orch.release(&peer("a"));
        let outcome = orch.rebalance(now);
        assert_eq!(outcome.admitted, vec![peer("b")]);
        assert!(outcome.evicted.is_empty());
    }

    #[test]
    fn test_rebalance_drops_expired_candidates() {
        let orch = orchestrator(1);
        let now = Instant::now();
        orch.admit(&peer("a"), now);
        orch.admit(&peer("b"), now);
        orch.release(&peer("a"));

        let outcome = orch.rebalance(now + Duration::from_secs(61));
        assert!(outcome.admitted.is_empty());
        assert!(orch.candidates().is_empty());
    }

    #[test]
    fn test_forget_clears_everything() {
        let orch = orchestrator(1);
        let now = Instant::now();
        orch.touch(&peer("a"), now);
        orch.admit(&peer("a"), now);
        orch.forget(&peer("a"));

        assert!(!orch.is_admitted(&peer("a")));
        assert_eq!(orch.profile(&peer("a")), PeerProfile::default());
    }

    #[test]
    fn test_touch_raises_score() {
        let orch = orchestrator(4);
        let now = Instant::now();
        let before = orch.score(&peer("a"), now);
        orch.touch(&peer("a"), now);
        assert!(orch.score(&peer("a"), now) > before);
    }
}
