//! Admission priority scoring
//!
//! The pool compares plain `f64` scores; how a score is derived from what we
//! know about a peer is a policy decision kept behind [`PriorityPolicy`].

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Battery level assumed when the reading is unknown or out of range
const DEFAULT_BATTERY: f64 = 0.5;

/// Weakest RSSI considered usable (dBm)
const RSSI_FLOOR_DBM: f64 = -100.0;

/// RSSI at which the signal component saturates (dBm)
const RSSI_CEILING_DBM: f64 = -40.0;

/// Requested class of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionClass {
    /// No special relationship
    #[default]
    General,
    /// Peer belongs to the user's family/group
    Family,
    /// Emergency traffic
    Emergency,
}

/// What the local peer knows about a discovered peer
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PeerProfile {
    /// Reported battery level; anything outside `[0, 1]` counts as unknown
    pub battery: Option<f64>,
    /// Received signal strength in dBm
    pub rssi_dbm: Option<f64>,
    /// Requested connection class
    pub class: ConnectionClass,
    /// Last time we exchanged traffic with this peer
    pub last_interaction: Option<Instant>,
}

impl PeerProfile {
    /// Profile with only a connection class
    pub fn with_class(class: ConnectionClass) -> Self {
        Self {
            class,
            ..Self::default()
        }
    }

    /// Battery reading usable in threshold comparisons
    ///
    /// Negative, NaN and greater-than-one readings are sensor noise and map to the
    /// non-critical default rather than to "critical".
    pub fn sanitized_battery(&self) -> f64 {
        match self.battery {
            Some(level) if (0.0..=1.0).contains(&level) => level,
            _ => DEFAULT_BATTERY,
        }
    }

    /// Signal strength mapped onto `[0, 1]`; unknown maps to the midpoint
    pub fn signal_quality(&self) -> f64 {
        match self.rssi_dbm {
            Some(rssi) if rssi.is_finite() => {
                ((rssi - RSSI_FLOOR_DBM) / (RSSI_CEILING_DBM - RSSI_FLOOR_DBM)).clamp(0.0, 1.0)
            },
            _ => 0.5,
        }
    }
}

/// Pool occupancy at scoring time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolContext {
    /// Occupied slots
    pub occupied: usize,
    /// Total slots
    pub capacity: usize,
}

/// Scoring interface for admission decisions
///
/// Higher scores win. A newcomer displaces an occupant only when its score is
/// strictly greater than the occupant's score at admission.
pub trait PriorityPolicy: Send + Sync {
    /// Score a peer
    fn score(&self, profile: &PeerProfile, context: PoolContext, now: Instant) -> f64;
}

/// Tunable weights of [`WeightedPriorityPolicy`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    /// Base score of an emergency connection
    pub emergency: f64,
    /// Base score of a family connection
    pub family: f64,
    /// Base score of a general connection
    pub general: f64,
    /// Weight of the battery level
    pub battery: f64,
    /// Extra penalty when the battery is below `critical_battery`
    pub critical_penalty: f64,
    /// Battery level considered critical
    pub critical_battery: f64,
    /// Weight of the signal quality
    pub signal: f64,
    /// Weight of relationship recency
    pub relationship: f64,
    /// Window over which relationship recency decays to zero
    pub relationship_window_secs: u64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            emergency: 3.0,
            family: 2.0,
            general: 1.0,
            battery: 0.5,
            critical_penalty: 0.25,
            critical_battery: 0.15,
            signal: 0.3,
            relationship: 0.4,
            relationship_window_secs: 3600,
        }
    }
}

/// Default linear scoring policy
#[derive(Debug, Clone, Default)]
pub struct WeightedPriorityPolicy {
    weights: PriorityWeights,
}

impl WeightedPriorityPolicy {
    /// Create a policy with custom weights
    pub fn new(weights: PriorityWeights) -> Self {
        Self { weights }
    }

    /// The weights in use
    pub fn weights(&self) -> &PriorityWeights {
        &self.weights
    }

    fn class_score(&self, class: ConnectionClass) -> f64 {
        match class {
            ConnectionClass::Emergency => self.weights.emergency,
            ConnectionClass::Family => self.weights.family,
            ConnectionClass::General => self.weights.general,
        }
    }

    fn recency(&self, last: Option<Instant>, now: Instant) -> f64 {
        let window = Duration::from_secs(self.weights.relationship_window_secs);
        match last {
            Some(at) if !window.is_zero() => {
                let age = now.saturating_duration_since(at);
                (1.0 - age.as_secs_f64() / window.as_secs_f64()).max(0.0)
            },
            _ => 0.0,
        }
    }
}

impl PriorityPolicy for WeightedPriorityPolicy {
    fn score(&self, profile: &PeerProfile, _context: PoolContext, now: Instant) -> f64 {
        let battery = profile.sanitized_battery();
        let mut score = self.class_score(profile.class)
            + self.weights.battery * battery
            + self.weights.signal * profile.signal_quality()
            + self.weights.relationship * self.recency(profile.last_interaction, now);

        if battery < self.weights.critical_battery {
            score -= self.weights.critical_penalty;
        }

        score
    }
}
