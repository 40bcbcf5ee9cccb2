//! Connection race resolution
//!
//! When two peers discover each other at the same time only one of them should
//! dial. [`should_initiate`] picks that side by plain string comparison of the
//! identities, which every device evaluates identically. The losing side waits a
//! bounded time for the inbound invitation and then dials anyway, so an
//! unreachable winner cannot stall the pair.
//!
//! Failed attempts back off exponentially. Once a peer fails
//! `reset_threshold` times in a row, the next attempt first discards any
//! transport session state for that peer.

use crate::identity::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Whether `local` dials `remote` when both discover each other
///
/// Plain lexicographic comparison; the result is the same on every device.
///
/// ```
/// use relaymesh::network::should_initiate;
/// use relaymesh::PeerId;
///
/// let ana = PeerId::from("Ana");
/// let boris = PeerId::from("Boris");
/// assert_ne!(should_initiate(&ana, &boris), should_initiate(&boris, &ana));
/// ```
pub fn should_initiate(local: &PeerId, remote: &PeerId) -> bool {
    local.as_str() > remote.as_str()
}

/// Timing knobs of the [`SessionManager`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Time a dial may take before it counts as failed
    pub connect_timeout: Duration,
    /// Time the losing side waits for an inbound invitation
    pub invite_wait: Duration,
    /// Delay after the first failure
    pub backoff_base: Duration,
    /// Upper bound on the backoff delay
    pub backoff_max: Duration,
    /// Consecutive failures after which session state is rebuilt
    pub reset_threshold: u32,
    /// Attempts after which the peer is given up
    pub max_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            invite_wait: Duration::from_secs(3),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            reset_threshold: 2,
            max_attempts: 6,
        }
    }
}

/// Where a peer's session stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Nothing in flight
    Idle,
    /// We lost the tie-break and expect the remote to dial
    AwaitingInvite {
        /// When we dial ourselves
        deadline: Instant,
    },
    /// A dial is in flight (ours or theirs)
    Connecting {
        /// When the attempt counts as failed
        deadline: Instant,
    },
    /// Waiting before the next attempt
    Backoff {
        /// End of the backoff
        until: Instant,
        /// Whether the next attempt must rebuild session state first
        reset: bool,
    },
    /// Link is live
    Connected,
}

/// What the caller should do for a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Dial the peer
    Connect(PeerId),
    /// Discard transport session state, then dial
    ResetAndConnect(PeerId),
    /// Discard transport session state and keep waiting for the remote
    Reset(PeerId),
    /// Nothing to do now
    Wait,
    /// Stop trying this peer
    GiveUp(PeerId),
}

#[derive(Debug, Clone)]
struct PeerSession {
    phase: SessionPhase,
    /// Drives the backoff exponent; cleared only by a live link
    consecutive_failures: u32,
    /// Failures since session state was last rebuilt
    since_reset: u32,
    attempts: u32,
}

impl PeerSession {
    fn new() -> Self {
        Self {
            phase: SessionPhase::Idle,
            consecutive_failures: 0,
            since_reset: 0,
            attempts: 0,
        }
    }
}

/// Per-peer connection attempt state
#[derive(Debug)]
pub struct SessionManager {
    local: PeerId,
    config: SessionConfig,
    sessions: Mutex<HashMap<PeerId, PeerSession>>,
}

impl SessionManager {
    /// Create a manager for the local identity
    pub fn new(local: PeerId, config: SessionConfig) -> Self {
        Self {
            local,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the local peer dials `remote` in a race
    pub fn should_initiate(&self, remote: &PeerId) -> bool {
        should_initiate(&self.local, remote)
    }

    /// Start working towards a link with a newly admitted peer
    pub fn begin(&self, peer: &PeerId, now: Instant) -> SessionAction {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(peer.clone()).or_insert_with(PeerSession::new);

        if session.phase != SessionPhase::Idle {
            return SessionAction::Wait;
        }

        if should_initiate(&self.local, peer) {
            self.dial(peer, session, now, false)
        } else {
            session.phase = SessionPhase::AwaitingInvite {
                deadline: now + self.config.invite_wait,
            };
            debug!(peer = %peer, "Waiting for inbound invitation");
            SessionAction::Wait
        }
    }

    /// The remote started dialing us
    pub fn on_inbound(&self, peer: &PeerId, now: Instant) {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(peer.clone()).or_insert_with(PeerSession::new);
        if session.phase != SessionPhase::Connected {
            session.phase = SessionPhase::Connecting {
                deadline: now + self.config.connect_timeout,
            };
        }
    }

    /// The link came up
    pub fn on_connected(&self, peer: &PeerId) {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(peer.clone()).or_insert_with(PeerSession::new);
        session.phase = SessionPhase::Connected;
        session.consecutive_failures = 0;
        session.since_reset = 0;
        session.attempts = 0;
    }

    /// A dial failed
    pub fn on_connect_failed(&self, peer: &PeerId, now: Instant) -> SessionAction {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(peer.clone()).or_insert_with(PeerSession::new);
        self.fail(peer, session, now)
    }

    /// The link went down
    ///
    /// A drop while an attempt was in flight counts as a failed attempt. A drop of
    /// an established link forgets the session.
    pub fn on_disconnected(&self, peer: &PeerId, now: Instant) -> SessionAction {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(peer) else {
            return SessionAction::Wait;
        };

        match session.phase {
            SessionPhase::Connecting { .. } => self.fail(peer, session, now),
            _ => {
                sessions.remove(peer);
                SessionAction::Wait
            },
        }
    }

    /// Advance timers
    pub fn poll(&self, now: Instant) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        let mut given_up = Vec::new();
        let mut sessions = self.sessions.lock();

        for (peer, session) in sessions.iter_mut() {
            let action = match session.phase {
                SessionPhase::AwaitingInvite { deadline } if now >= deadline => {
                    debug!(peer = %peer, "No invitation arrived, dialing");
                    self.dial(peer, session, now, false)
                },
                SessionPhase::Connecting { deadline } if now >= deadline => {
                    debug!(peer = %peer, "Connection attempt timed out");
                    self.fail(peer, session, now)
                },
                SessionPhase::Backoff { until, reset } if now >= until => {
                    if should_initiate(&self.local, peer) {
                        self.dial(peer, session, now, reset)
                    } else {
                        session.phase = SessionPhase::AwaitingInvite {
                            deadline: now + self.config.invite_wait,
                        };
                        if reset {
                            session.since_reset = 0;
                            SessionAction::Reset(peer.clone())
                        } else {
                            SessionAction::Wait
                        }
                    }
                },
                _ => SessionAction::Wait,
            };

            if let SessionAction::GiveUp(peer) = &action {
                given_up.push(peer.clone());
            }
            if action != SessionAction::Wait {
                actions.push(action);
            }
        }

        for peer in given_up {
            sessions.remove(&peer);
        }
        actions
    }

    /// Drop a peer's session
    pub fn forget(&self, peer: &PeerId) {
        self.sessions.lock().remove(peer);
    }

    /// Current phase for a peer
    pub fn phase(&self, peer: &PeerId) -> Option<SessionPhase> {
        self.sessions.lock().get(peer).map(|s| s.phase)
    }

    /// Dials made since the last successful link
    pub fn attempts(&self, peer: &PeerId) -> u32 {
        self.sessions.lock().get(peer).map_or(0, |s| s.attempts)
    }

    fn dial(&self, peer: &PeerId, session: &mut PeerSession, now: Instant, reset: bool) -> SessionAction {
        session.attempts += 1;
        session.phase = SessionPhase::Connecting {
            deadline: now + self.config.connect_timeout,
        };

        if reset {
            session.since_reset = 0;
            SessionAction::ResetAndConnect(peer.clone())
        } else {
            SessionAction::Connect(peer.clone())
        }
    }

    fn fail(&self, peer: &PeerId, session: &mut PeerSession, now: Instant) -> SessionAction {
        session.consecutive_failures += 1;
        session.since_reset += 1;

        if session.attempts >= self.config.max_attempts {
            warn!(peer = %peer, attempts = session.attempts, "Giving up on peer");
            session.phase = SessionPhase::Idle;
            return SessionAction::GiveUp(peer.clone());
        }

        let delay = self.backoff(session.consecutive_failures);
        let reset = session.since_reset >= self.config.reset_threshold;
        session.phase = SessionPhase::Backoff {
            until: now + delay,
            reset,
        };
        debug!(
            peer = %peer,
            failures = session.consecutive_failures,
            delay_ms = delay.as_millis() as u64,
            reset,
            "Connection attempt failed"
        );
        SessionAction::Wait
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.config
            .backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.config.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_secs(5),
            invite_wait: Duration::from_secs(2),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(8),
            reset_threshold: 2,
            max_attempts: 4,
        }
    }

    #[test]
    fn test_tie_break_is_lexicographic() {
        let ana = PeerId::from("Ana");
        let boris = PeerId::from("Boris");
        assert!(!should_initiate(&ana, &boris));
        assert!(should_initiate(&boris, &ana));
    }

    #[test]
    fn test_winner_dials_immediately() {
        let manager = SessionManager::new(PeerId::from("zed"), config());
        let now = Instant::now();
        let peer = PeerId::from("amy");

        assert_eq!(manager.begin(&peer, now), SessionAction::Connect(peer.clone()));
        assert!(matches!(
            manager.phase(&peer),
            Some(SessionPhase::Connecting { .. })
        ));
        assert_eq!(manager.attempts(&peer), 1);

        // A second discovery while dialing changes nothing
        assert_eq!(manager.begin(&peer, now), SessionAction::Wait);
    }

    #[test]
    fn test_loser_dials_after_invite_wait() {
        let manager = SessionManager::new(PeerId::from("amy"), config());
        let now = Instant::now();
        let peer = PeerId::from("zed");

        assert_eq!(manager.begin(&peer, now), SessionAction::Wait);
        assert!(manager.poll(now + Duration::from_secs(1)).is_empty());
        assert_eq!(
            manager.poll(now + Duration::from_secs(2)),
            vec![SessionAction::Connect(peer)]
        );
    }

    #[test]
    fn test_inbound_invitation_cancels_forced_dial() {
        let manager = SessionManager::new(PeerId::from("amy"), config());
        let now = Instant::now();
        let peer = PeerId::from("zed");

        manager.begin(&peer, now);
        manager.on_inbound(&peer, now);
        manager.on_connected(&peer);

        assert!(manager.poll(now + Duration::from_secs(60)).is_empty());
        assert_eq!(manager.phase(&peer), Some(SessionPhase::Connected));
    }

    #[test]
    fn test_failures_back_off_then_reset() {
        let manager = SessionManager::new(PeerId::from("zed"), config());
        let now = Instant::now();
        let peer = PeerId::from("amy");

        manager.begin(&peer, now);
        assert_eq!(manager.on_connect_failed(&peer, now), SessionAction::Wait);
        assert_eq!(
            manager.phase(&peer),
            Some(SessionPhase::Backoff {
                until: now + Duration::from_secs(1),
                reset: false
            })
        );

        let t1 = now + Duration::from_secs(1);
        assert_eq!(manager.poll(t1), vec![SessionAction::Connect(peer.clone())]);

        manager.on_connect_failed(&peer, t1);
        assert_eq!(
            manager.phase(&peer),
            Some(SessionPhase::Backoff {
                until: t1 + Duration::from_secs(2),
                reset: true
            })
        );

        let t2 = t1 + Duration::from_secs(2);
        assert_eq!(
            manager.poll(t2),
            vec![SessionAction::ResetAndConnect(peer.clone())]
        );
    }

    #[test]
    fn test_backoff_keeps_growing_across_resets() {
        let manager = SessionManager::new(
            PeerId::from("zed"),
            SessionConfig {
                max_attempts: 10,
                ..config()
            },
        );
        let mut now = Instant::now();
        let peer = PeerId::from("amy");
        manager.begin(&peer, now);

        let mut delays = Vec::new();
        let mut actions = Vec::new();
        for _ in 0..5 {
            assert_eq!(manager.on_connect_failed(&peer, now), SessionAction::Wait);
            let Some(SessionPhase::Backoff { until, reset }) = manager.phase(&peer) else {
                panic!("expected backoff, got {:?}", manager.phase(&peer));
            };
            delays.push(((until - now).as_secs(), reset));
            now = until;
            actions.extend(manager.poll(now));
        }

        assert_eq!(
            delays,
            vec![(1, false), (2, true), (4, false), (8, true), (8, false)]
        );
        assert_eq!(
            actions,
            vec![
                SessionAction::Connect(peer.clone()),
                SessionAction::ResetAndConnect(peer.clone()),
                SessionAction::Connect(peer.clone()),
                SessionAction::ResetAndConnect(peer.clone()),
                SessionAction::Connect(peer.clone()),
            ]
        );
        assert_eq!(manager.attempts(&peer), 6);
    }

    #[test]
    fn test_connect_timeout_counts_as_failure() {
        let manager = SessionManager::new(PeerId::from("zed"), config());
        let now = Instant::now();
        let peer = PeerId::from("amy");

        manager.begin(&peer, now);
        assert!(manager.poll(now + Duration::from_secs(5)).is_empty());
        assert!(matches!(
            manager.phase(&peer),
            Some(SessionPhase::Backoff { .. })
        ));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let manager = SessionManager::new(PeerId::from("zed"), config());
        let mut now = Instant::now();
        let peer = PeerId::from("amy");

        manager.begin(&peer, now);
        let mut last = SessionAction::Wait;
        for _ in 0..10 {
            last = manager.on_connect_failed(&peer, now);
            if matches!(last, SessionAction::GiveUp(_)) {
                break;
            }
            now += Duration::from_secs(60);
            manager.poll(now);
        }

        assert_eq!(last, SessionAction::GiveUp(peer.clone()));
        assert_eq!(manager.attempts(&peer), 4);
    }

    #[test]
    fn test_disconnect_of_live_link_forgets_session() {
        let manager = SessionManager::new(PeerId::from("zed"), config());
        let peer = PeerId::from("amy");
        manager.on_connected(&peer);
        assert_eq!(
            manager.on_disconnected(&peer, Instant::now()),
            SessionAction::Wait
        );
        assert_eq!(manager.phase(&peer), None);
    }

    #[test]
    fn test_backoff_is_capped() {
        let manager = SessionManager::new(PeerId::from("zed"), config());
        assert_eq!(manager.backoff(1), Duration::from_secs(1));
        assert_eq!(manager.backoff(3), Duration::from_secs(4));
        assert_eq!(manager.backoff(10), Duration::from_secs(8));
    }

    proptest! {
        #[test]
        fn prop_exactly_one_side_initiates(a in "[a-zA-Z0-9]{1,12}", b in "[a-zA-Z0-9]{1,12}") {
            prop_assume!(a != b);
            let a = PeerId::from(a);
            let b = PeerId::from(b);
            prop_assert_ne!(should_initiate(&a, &b), should_initiate(&b, &a));
        }
    }
}
