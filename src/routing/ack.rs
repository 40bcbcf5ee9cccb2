//! Acknowledged delivery
//!
//! Every send that asks for an acknowledgment is tracked until the recipient's
//! ack arrives. The first retry happens after `ack_timeout`; each further retry
//! waits twice as long as the previous one. After `max_retries` retransmissions
//! without an ack the send is reported as failed, exactly once.

use crate::identity::{MessageId, PeerId};
use crate::protocol::Envelope;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// An outstanding acknowledged send
#[derive(Debug, Clone)]
pub struct PendingAck {
    /// Message awaiting an ack
    pub message_id: MessageId,
    /// Final recipient expected to ack
    pub target: PeerId,
    /// Retransmissions made so far
    pub attempts_made: u32,
    /// When the next retransmission is due
    pub next_retry_at: Instant,
    /// Frame to retransmit
    pub envelope: Envelope,
}

/// A send that will not be retried again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelivery {
    /// Message that was never acknowledged
    pub message_id: MessageId,
    /// Recipient that never acknowledged
    pub target: PeerId,
    /// Retransmissions made
    pub attempts: u32,
}

/// Work produced by [`AckManager::poll_due`]
#[derive(Debug, Default)]
pub struct AckPoll {
    /// Frames to retransmit, attempt counter already bumped
    pub retries: Vec<Envelope>,
    /// Sends that exhausted their retries
    pub failures: Vec<FailedDelivery>,
}

/// Tracker of acknowledged sends
#[derive(Debug)]
pub struct AckManager {
    pending: Mutex<HashMap<MessageId, PendingAck>>,
    ack_timeout: Duration,
    max_retries: u32,
}

impl AckManager {
    /// Create a tracker
    pub fn new(ack_timeout: Duration, max_retries: u32) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ack_timeout,
            max_retries,
        }
    }

    /// Delay before retransmission number `attempt + 1`
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.ack_timeout.saturating_mul(1u32 << attempt.min(16))
    }

    /// Start tracking a send
    pub fn register(&self, message_id: MessageId, target: PeerId, envelope: Envelope, now: Instant) {
        let pending = PendingAck {
            message_id,
            target,
            attempts_made: 0,
            next_retry_at: now + self.retry_delay(0),
            envelope,
        };
        self.pending.lock().insert(message_id, pending);
    }

    /// Record an ack from `from`
    ///
    /// Acks from anyone but the tracked recipient are ignored.
    pub fn acknowledge(&self, message_id: &MessageId, from: &PeerId) -> Option<PendingAck> {
        let mut pending = self.pending.lock();
        match pending.get(message_id) {
            Some(entry) if &entry.target == from => pending.remove(message_id),
            Some(entry) => {
                debug!(
                    message_id = %message_id,
                    expected = %entry.target,
                    from = %from,
                    "Ignoring ack from unexpected peer"
                );
                None
            },
            None => None,
        }
    }

    /// Collect retransmissions and failures due at `now`
    pub fn poll_due(&self, now: Instant) -> AckPoll {
        let mut poll = AckPoll::default();
        let mut pending = self.pending.lock();

        pending.retain(|id, entry| {
            if entry.next_retry_at > now {
                return true;
            }

            if entry.attempts_made >= self.max_retries {
                warn!(
                    message_id = %id,
                    target = %entry.target,
                    attempts = entry.attempts_made,
                    "Delivery failed, no ack received"
                );
                poll.failures.push(FailedDelivery {
                    message_id: *id,
                    target: entry.target.clone(),
                    attempts: entry.attempts_made,
                });
                return false;
            }

            entry.attempts_made += 1;
            entry.envelope.attempt = entry.attempts_made;
            entry.next_retry_at = now + self.retry_delay(entry.attempts_made);
            debug!(
                message_id = %id,
                target = %entry.target,
                attempt = entry.attempts_made,
                "Retransmitting unacknowledged message"
            );
            poll.retries.push(entry.envelope.clone());
            true
        });

        poll
    }

    /// Fail every send addressed to `peer` immediately
    pub fn fail_peer(&self, peer: &PeerId) -> Vec<FailedDelivery> {
        let mut failed = Vec::new();
        self.pending.lock().retain(|id, entry| {
            if &entry.target != peer {
                return true;
            }
            failed.push(FailedDelivery {
                message_id: *id,
                target: entry.target.clone(),
                attempts: entry.attempts_made,
            });
            false
        });
        failed
    }

    /// Whether a message awaits its ack
    pub fn is_pending(&self, message_id: &MessageId) -> bool {
        self.pending.lock().contains_key(message_id)
    }

    /// Snapshot of one pending send
    pub fn get(&self, message_id: &MessageId) -> Option<PendingAck> {
        self.pending.lock().get(message_id).cloned()
    }

    /// Number of outstanding sends
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{messages::originate, ChatPayload, WirePayload};

    fn envelope(id: MessageId) -> Envelope {
        originate(
            &PeerId::from("a"),
            &PeerId::from("d"),
            id,
            8,
            &WirePayload::Chat(ChatPayload {
                content: b"hi".to_vec(),
            }),
        )
        .unwrap()
    }

    fn manager() -> AckManager {
        AckManager::new(Duration::from_millis(100), 3)
    }

    #[test]
    fn test_ack_cancels_retries() {
        let acks = manager();
        let now = Instant::now();
        let id = MessageId::generate();
        acks.register(id, PeerId::from("d"), envelope(id), now);

        assert!(acks.acknowledge(&id, &PeerId::from("d")).is_some());
        assert!(!acks.is_pending(&id));

        let poll = acks.poll_due(now + Duration::from_secs(10));
        assert!(poll.retries.is_empty());
        assert!(poll.failures.is_empty());
    }

    #[test]
    fn test_ack_from_wrong_peer_is_ignored() {
        let acks = manager();
        let id = MessageId::generate();
        acks.register(id, PeerId::from("d"), envelope(id), Instant::now());

        assert!(acks.acknowledge(&id, &PeerId::from("mallory")).is_none());
        assert!(acks.is_pending(&id));
    }

    #[test]
    fn test_retries_exactly_max_then_fails_once() {
        let acks = manager();
        let start = Instant::now();
        let id = MessageId::generate();
        acks.register(id, PeerId::from("d"), envelope(id), start);

        let mut now = start;
        let mut retry_times = Vec::new();
        let mut failures = Vec::new();

        // Step through time in small increments
        for _ in 0..200 {
            now += Duration::from_millis(10);
            let poll = acks.poll_due(now);
            for retry in &poll.retries {
                retry_times.push((now, retry.attempt));
            }
            failures.extend(poll.failures);
        }

        assert_eq!(retry_times.len(), 3);
        assert_eq!(
            retry_times.iter().map(|(_, a)| *a).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 3);

        // Gaps between transmissions strictly increase
        let mut sends = vec![start];
        sends.extend(retry_times.iter().map(|(t, _)| *t));
        let gaps: Vec<_> = sends.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|g| g[1] > g[0]));
    }

    #[test]
    fn test_fail_peer_is_immediate() {
        let acks = manager();
        let now = Instant::now();
        let id1 = MessageId::generate();
        let id2 = MessageId::generate();
        acks.register(id1, PeerId::from("d"), envelope(id1), now);
        acks.register(id2, PeerId::from("e"), envelope(id2), now);

        let failed = acks.fail_peer(&PeerId::from("d"));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].message_id, id1);
        assert_eq!(failed[0].attempts, 0);
        assert!(acks.is_pending(&id2));

        // Nothing left to report for the failed peer
        let poll = acks.poll_due(now + Duration::from_secs(60));
        assert!(poll.failures.is_empty());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let acks = manager();
        assert_eq!(acks.retry_delay(0), Duration::from_millis(100));
        assert_eq!(acks.retry_delay(1), Duration::from_millis(200));
        assert_eq!(acks.retry_delay(3), Duration::from_millis(800));
    }
}
