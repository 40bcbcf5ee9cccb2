//! Configuration types for relaymesh nodes
//!
//! [`MeshConfig`] gathers every tunable of a node. It is plain serde data, so
//! it can live in a JSON file next to the application and be loaded with
//! [`MeshConfig::load`]. Missing fields take their defaults.

use crate::error::ConfigError;
use crate::network::{PriorityWeights, SessionConfig};
use crate::protocol::MAX_TTL;
use crate::routing::RouterConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Pre-configured connection budgets for different devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProfile {
    /// Low-power devices
    ///
    /// - 4 connection slots
    Minimal,

    /// Typical phone (default)
    ///
    /// - 7 connection slots, the usual radio ceiling
    #[default]
    Standard,

    /// Fixed or mains-powered relays that carry traffic for others
    ///
    /// - 16 connection slots
    Relay,
}

impl NetworkProfile {
    /// Connection slots granted by this profile
    pub fn default_max_connections(&self) -> usize {
        match self {
            Self::Minimal => 4,
            Self::Standard => 7,
            Self::Relay => 16,
        }
    }
}

/// Complete configuration of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Preset the slot count was derived from
    pub network_profile: NetworkProfile,
    /// Connection slots
    pub max_connections: usize,
    /// Hop budget of locally originated messages
    pub default_ttl: u32,
    /// Lifetime of a cached route
    pub route_ttl_secs: u64,
    /// How long route discovery waits for a reply
    pub discovery_timeout_ms: u64,
    /// Dedup window
    pub message_cache_ttl_secs: u64,
    /// Maximum remembered fingerprints
    pub message_cache_capacity: usize,
    /// First retransmission delay, doubled on every retry
    pub ack_timeout_ms: u64,
    /// Retransmissions before a send is reported failed
    pub max_retries: u32,
    /// Period of unconditional topology announcements
    pub topology_interval_secs: u64,
    /// Rate limit of change-triggered announcements
    pub topology_min_interval_ms: u64,
    /// Age after which a silent announcer is dropped from the topology
    pub topology_liveness_secs: u64,
    /// Neighbors a relayed announcement goes to (0 = all)
    pub topology_fanout: usize,
    /// Period of the maintenance loop
    pub maintenance_interval_ms: u64,
    /// Time a dial may take
    pub connect_timeout_ms: u64,
    /// Time the tie-break loser waits for the inbound invitation
    pub invite_wait_ms: u64,
    /// Delay after the first failed dial
    pub session_backoff_base_ms: u64,
    /// Upper bound of the dial backoff
    pub session_backoff_max_ms: u64,
    /// Consecutive failures after which transport session state is rebuilt
    pub session_reset_threshold: u32,
    /// Dials after which a peer is given up
    pub max_connect_attempts: u32,
    /// How long a rejected peer stays a re-admission candidate
    pub candidate_ttl_secs: u64,
    /// Admission scoring weights
    pub priority: PriorityWeights,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::for_profile(NetworkProfile::default())
    }
}

impl MeshConfig {
    /// Defaults for a profile
    pub fn for_profile(profile: NetworkProfile) -> Self {
        Self {
            network_profile: profile,
            max_connections: profile.default_max_connections(),
            default_ttl: 8,
            route_ttl_secs: 300,
            discovery_timeout_ms: 5_000,
            message_cache_ttl_secs: 300,
            message_cache_capacity: 10_000,
            ack_timeout_ms: 2_000,
            max_retries: 3,
            topology_interval_secs: 30,
            topology_min_interval_ms: 2_000,
            topology_liveness_secs: 90,
            topology_fanout: 0,
            maintenance_interval_ms: 500,
            connect_timeout_ms: 10_000,
            invite_wait_ms: 3_000,
            session_backoff_base_ms: 1_000,
            session_backoff_max_ms: 30_000,
            session_reset_threshold: 2,
            max_connect_attempts: 6,
            candidate_ttl_secs: 120,
            priority: PriorityWeights::default(),
        }
    }

    /// Switch to a profile, resetting the slot count to the profile's
    pub fn with_profile(mut self, profile: NetworkProfile) -> Self {
        self.network_profile = profile;
        self.max_connections = profile.default_max_connections();
        self
    }

    /// Parse a JSON document; absent fields take defaults
    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as pretty-printed JSON
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()).into())
    }

    /// Read and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::File {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Write the configuration as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let path = path.as_ref();
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|source| ConfigError::File {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first unusable field.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_connections == 0 {
            return Err(ConfigError::invalid("max_connections", "must be at least 1").into());
        }

        if self.default_ttl == 0 || self.default_ttl > MAX_TTL {
            return Err(ConfigError::invalid(
                "default_ttl",
                format!("must be within 1..={}", MAX_TTL),
            )
            .into());
        }

        let positive = [
            ("message_cache_capacity", self.message_cache_capacity as u64),
            ("message_cache_ttl_secs", self.message_cache_ttl_secs),
            ("route_ttl_secs", self.route_ttl_secs),
            ("discovery_timeout_ms", self.discovery_timeout_ms),
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("maintenance_interval_ms", self.maintenance_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("session_backoff_base_ms", self.session_backoff_base_ms),
            ("max_connect_attempts", u64::from(self.max_connect_attempts)),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::invalid(field, "must be positive").into());
        }

        if self.session_backoff_max_ms < self.session_backoff_base_ms {
            return Err(ConfigError::invalid(
                "session_backoff_max_ms",
                "must not be below session_backoff_base_ms",
            )
            .into());
        }

        Ok(())
    }

    /// Settings of the routing core
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            default_ttl: self.default_ttl,
            route_ttl: Duration::from_secs(self.route_ttl_secs),
            discovery_timeout: self.discovery_timeout(),
            message_cache_ttl: Duration::from_secs(self.message_cache_ttl_secs),
            message_cache_capacity: self.message_cache_capacity,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_retries: self.max_retries,
            topology_interval: Duration::from_secs(self.topology_interval_secs),
            topology_min_interval: Duration::from_millis(self.topology_min_interval_ms),
            topology_liveness: Duration::from_secs(self.topology_liveness_secs),
            topology_fanout: self.topology_fanout,
        }
    }

    /// Settings of the connection race resolver
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            invite_wait: Duration::from_millis(self.invite_wait_ms),
            backoff_base: Duration::from_millis(self.session_backoff_base_ms),
            backoff_max: Duration::from_millis(self.session_backoff_max_ms),
            reset_threshold: self.session_reset_threshold,
            max_attempts: self.max_connect_attempts,
        }
    }

    /// Route discovery window
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Period of the maintenance loop
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Lifetime of a re-admission candidate
    pub fn candidate_ttl(&self) -> Duration {
        Duration::from_secs(self.candidate_ttl_secs)
    }
}
