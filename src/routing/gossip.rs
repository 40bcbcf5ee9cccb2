//! Topology announcement scheduling
//!
//! Decides when the local peer announces its direct neighbors. An announcement
//! goes out when the neighbor set changed (no more often than the minimum
//! interval) and periodically regardless, so peers can detect silence. Sequence
//! numbers start from the wall clock, which keeps them increasing across
//! restarts.

use crate::identity::PeerId;
use crate::protocol::messages::unix_millis;
use crate::protocol::TopologyBroadcast;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct GossipState {
    dirty: bool,
    last_sent: Option<Instant>,
    sequence: u64,
}

/// Scheduler for neighbor announcements
#[derive(Debug)]
pub struct TopologyGossip {
    local: PeerId,
    interval: Duration,
    min_interval: Duration,
    /// Maximum relay targets per announcement (0 = unlimited)
    max_fanout: usize,
    state: Mutex<GossipState>,
}

impl TopologyGossip {
    /// Create a scheduler announcing every `interval`, rate limited to
    /// one announcement per `min_interval`
    pub fn new(local: PeerId, interval: Duration, min_interval: Duration) -> Self {
        Self {
            local,
            interval,
            min_interval,
            max_fanout: 0,
            state: Mutex::new(GossipState {
                dirty: true,
                last_sent: None,
                sequence: unix_millis(),
            }),
        }
    }

    /// Limit how many neighbors a relayed announcement goes to
    pub fn with_fanout(mut self, max_fanout: usize) -> Self {
        self.max_fanout = max_fanout;
        self
    }

    /// Note that the neighbor set changed
    pub fn mark_dirty(&self) {
        self.state.lock().dirty = true;
    }

    /// Whether an announcement is due at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        let state = self.state.lock();
        self.due_locked(&state, now)
    }

    /// Build the next announcement if one is due
    pub fn next_announcement(&self, neighbors: &[PeerId], now: Instant) -> Option<TopologyBroadcast> {
        let mut state = self.state.lock();
        if !self.due_locked(&state, now) {
            return None;
        }

        state.dirty = false;
        state.last_sent = Some(now);
        state.sequence += 1;

        Some(TopologyBroadcast {
            announcer: self.local.to_string(),
            neighbors: neighbors.iter().map(|p| p.to_string()).collect(),
            sequence: state.sequence,
        })
    }

    /// Pick the neighbors a relayed announcement goes to
    pub fn select_targets(&self, mut peers: Vec<PeerId>) -> Vec<PeerId> {
        if self.max_fanout > 0 && peers.len() > self.max_fanout {
            let mut rng = rand::thread_rng();
            peers.shuffle(&mut rng);
            peers.truncate(self.max_fanout);
        }
        peers
    }

    fn due_locked(&self, state: &GossipState, now: Instant) -> bool {
        match state.last_sent {
            None => true,
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                (state.dirty && elapsed >= self.min_interval) || elapsed >= self.interval
            },
        }
    }
}
