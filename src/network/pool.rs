//! Fixed-capacity connection pool
//!
//! The pool owns exactly `capacity` slots, built synchronously in [`ConnectionPool::new`]
//! so no admission can ever observe a half-initialised pool. Every occupancy change
//! goes through one mutex-guarded decision, which makes admission atomic with respect
//! to concurrent requests: two racers for the last slot cannot both win it.

use crate::identity::PeerId;
use parking_lot::Mutex;
use std::time::Instant;

/// Disconnect intent of an occupant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkIntent {
    /// Occupant is wanted
    Active,
    /// Local side asked to drop this peer; the slot is released as soon as a
    /// replacement shows up or the peer leaves on its own
    PendingDisconnect,
}

/// The peer holding a slot
#[derive(Debug, Clone, PartialEq)]
pub struct SlotOccupant {
    /// Occupying peer
    pub peer: PeerId,
    /// Score the peer was admitted with
    pub priority_score: f64,
    /// When the slot was granted
    pub admitted_at: Instant,
    /// When the transport reported the link live
    pub connected_at: Option<Instant>,
    /// Disconnect intent
    pub intent: LinkIntent,
}

/// One of the pool's slots
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSlot {
    /// Position in the pool
    pub index: usize,
    /// Current occupant, if any
    pub occupant: Option<SlotOccupant>,
}

/// Outcome of [`ConnectionPool::try_admit`]
#[derive(Debug, Clone, PartialEq)]
pub enum SlotDecision {
    /// The peer already holds a slot
    AlreadyAdmitted {
        /// Slot held
        slot: usize,
    },
    /// A free slot was granted
    Admitted {
        /// Slot granted
        slot: usize,
    },
    /// An occupant was displaced
    Replaced {
        /// Slot granted
        slot: usize,
        /// Peer that lost the slot
        evicted: PeerId,
    },
    /// No slot could be granted
    Rejected {
        /// Lowest score among occupants at decision time
        lowest_score: f64,
    },
}

impl SlotDecision {
    /// Whether the peer holds a slot after the decision
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// Connection slots shared by every admission path
#[derive(Debug)]
pub struct ConnectionPool {
    slots: Mutex<Vec<ConnectionSlot>>,
    capacity: usize,
}

impl ConnectionPool {
    /// Create a pool with `capacity` empty slots
    ///
    /// # Example
    ///
    /// ```
    /// use relaymesh::network::ConnectionPool;
    ///
    /// let pool = ConnectionPool::new(7);
    /// assert_eq!(pool.capacity(), 7);
    /// assert_eq!(pool.occupied(), 0);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|index| ConnectionSlot {
                index,
                occupant: None,
            })
            .collect();

        Self {
            slots: Mutex::new(slots),
            capacity,
        }
    }

    /// Try to give `peer` a slot
    ///
    /// Order of preference: an existing slot, the slot of an occupant with a
    /// pending disconnect, a free slot, and finally the slot of the lowest-scoring
    /// occupant if `score` strictly exceeds its admission score. A pending
    /// disconnect is resolved by the first newcomer even while slots are free.
    pub fn try_admit(&self, peer: &PeerId, score: f64, now: Instant) -> SlotDecision {
        let mut slots = self.slots.lock();

        if let Some(slot) = find_peer(&slots, peer) {
            return SlotDecision::AlreadyAdmitted { slot };
        }

        let occupant = SlotOccupant {
            peer: peer.clone(),
            priority_score: score,
            admitted_at: now,
            connected_at: None,
            intent: LinkIntent::Active,
        };

        // A pending disconnect yields to any newcomer
        let pending = slots
            .iter()
            .filter_map(|s| s.occupant.as_ref().map(|o| (s.index, o)))
            .filter(|(_, o)| o.intent == LinkIntent::PendingDisconnect)
            .min_by(|a, b| a.1.priority_score.total_cmp(&b.1.priority_score))
            .map(|(index, _)| index);

        if let Some(index) = pending {
            return replace(&mut slots[index], occupant);
        }

        if let Some(slot) = slots.iter_mut().find(|s| s.occupant.is_none()) {
            slot.occupant = Some(occupant);
            return SlotDecision::Admitted { slot: slot.index };
        }

        // Lowest score loses; among equals the most recent admission loses
        let weakest = slots
            .iter()
            .filter_map(|s| s.occupant.as_ref().map(|o| (s.index, o)))
            .min_by(|a, b| {
                a.1.priority_score
                    .total_cmp(&b.1.priority_score)
                    .then_with(|| b.1.admitted_at.cmp(&a.1.admitted_at))
            })
            .map(|(index, o)| (index, o.priority_score));

        match weakest {
            Some((index, lowest)) if score > lowest => replace(&mut slots[index], occupant),
            Some((_, lowest)) => SlotDecision::Rejected {
                lowest_score: lowest,
            },
            // Zero-capacity pool
            None => SlotDecision::Rejected {
                lowest_score: f64::INFINITY,
            },
        }
    }

    /// Free the slot held by `peer`
    pub fn release(&self, peer: &PeerId) -> Option<usize> {
        let mut slots = self.slots.lock();
        let index = find_peer(&slots, peer)?;
        slots[index].occupant = None;
        Some(index)
    }

    /// Hand the slot of `leaving` to `incoming` in one step
    ///
    /// Returns `None` when `leaving` holds no slot. If `incoming` already holds
    /// one, `leaving` is only released.
    pub fn swap(
        &self,
        leaving: &PeerId,
        incoming: &PeerId,
        score: f64,
        now: Instant,
    ) -> Option<SlotDecision> {
        let mut slots = self.slots.lock();
        let index = find_peer(&slots, leaving)?;
        slots[index].occupant = None;

        if let Some(slot) = find_peer(&slots, incoming) {
            return Some(SlotDecision::AlreadyAdmitted { slot });
        }

        slots[index].occupant = Some(SlotOccupant {
            peer: incoming.clone(),
            priority_score: score,
            admitted_at: now,
            connected_at: None,
            intent: LinkIntent::Active,
        });
        Some(SlotDecision::Admitted { slot: index })
    }

    /// Record that the transport reported the link live
    pub fn mark_connected(&self, peer: &PeerId, now: Instant) -> bool {
        self.with_occupant(peer, |o| {
            o.connected_at.get_or_insert(now);
        })
    }

    /// Flag an occupant for deferred disconnect
    pub fn mark_pending_disconnect(&self, peer: &PeerId) -> bool {
        self.with_occupant(peer, |o| o.intent = LinkIntent::PendingDisconnect)
    }

    /// Withdraw a deferred disconnect
    pub fn clear_pending_disconnect(&self, peer: &PeerId) -> bool {
        self.with_occupant(peer, |o| o.intent = LinkIntent::Active)
    }

    /// Disconnect intent of an occupant
    pub fn intent(&self, peer: &PeerId) -> Option<LinkIntent> {
        let slots = self.slots.lock();
        find_peer(&slots, peer).and_then(|i| slots[i].occupant.as_ref().map(|o| o.intent))
    }

    /// Slot held by a peer
    pub fn slot_of(&self, peer: &PeerId) -> Option<usize> {
        find_peer(&self.slots.lock(), peer)
    }

    /// Whether a peer holds a slot
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.slot_of(peer).is_some()
    }

    /// Number of occupied slots
    pub fn occupied(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| s.occupant.is_some())
            .count()
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether any slot is free
    pub fn has_free_slot(&self) -> bool {
        self.occupied() < self.capacity
    }

    /// Snapshot of all occupants
    pub fn occupants(&self) -> Vec<SlotOccupant> {
        self.slots
            .lock()
            .iter()
            .filter_map(|s| s.occupant.clone())
            .collect()
    }

    /// Snapshot of all slots
    pub fn slots(&self) -> Vec<ConnectionSlot> {
        self.slots.lock().clone()
    }

    fn with_occupant(&self, peer: &PeerId, f: impl FnOnce(&mut SlotOccupant)) -> bool {
        let mut slots = self.slots.lock();
        match find_peer(&slots, peer).and_then(|i| slots[i].occupant.as_mut()) {
            Some(occupant) => {
                f(occupant);
                true
            },
            None => false,
        }
    }
}

fn find_peer(slots: &[ConnectionSlot], peer: &PeerId) -> Option<usize> {
    slots
        .iter()
        .find(|s| s.occupant.as_ref().is_some_and(|o| &o.peer == peer))
        .map(|s| s.index)
}

fn replace(slot: &mut ConnectionSlot, occupant: SlotOccupant) -> SlotDecision {
    match slot.occupant.replace(occupant) {
        Some(previous) => SlotDecision::Replaced {
            slot: slot.index,
            evicted: previous.peer,
        },
        None => SlotDecision::Admitted { slot: slot.index },
    }
}
