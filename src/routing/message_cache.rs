//! Duplicate suppression
//!
//! Remembers recently seen fingerprints for a fixed window. Size is bounded;
//! when full, the oldest entries go first.

use crate::crypto::Fingerprint;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct CacheInner {
    entries: HashMap<Fingerprint, Instant>,
    /// Insertion order, oldest first
    order: VecDeque<(Fingerprint, Instant)>,
}

/// Expiring set of seen fingerprints
#[derive(Debug)]
pub struct MessageCache {
    inner: RwLock<CacheInner>,
    ttl: Duration,
    max_size: usize,
}

impl MessageCache {
    /// Create a cache remembering entries for `ttl`, holding at most `max_size`
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                entries: HashMap::with_capacity(max_size.min(1024)),
                order: VecDeque::with_capacity(max_size.min(1024)),
            }),
            ttl,
            max_size: max_size.max(1),
        }
    }

    /// Record a fingerprint
    ///
    /// Returns `true` the first time a fingerprint is seen within the window and
    /// `false` for duplicates. Check and insert happen under one lock, so two
    /// concurrent receivers of the same frame cannot both see it as new.
    pub fn observe(&self, fingerprint: Fingerprint) -> bool {
        self.observe_at(fingerprint, Instant::now())
    }

    pub(crate) fn observe_at(&self, fingerprint: Fingerprint, now: Instant) -> bool {
        let mut inner = self.inner.write();

        if let Some(seen_at) = inner.entries.get(&fingerprint) {
            if now.saturating_duration_since(*seen_at) < self.ttl {
                return false;
            }
        }

        self.evict_expired_locked(&mut inner, now);

        while inner.entries.len() >= self.max_size {
            match inner.order.pop_front() {
                Some((old, at)) => {
                    // Skip stale order records of re-inserted fingerprints
                    if inner.entries.get(&old) == Some(&at) {
                        inner.entries.remove(&old);
                    }
                },
                None => break,
            }
        }

        inner.entries.insert(fingerprint, now);
        inner.order.push_back((fingerprint, now));
        true
    }

    /// Whether a fingerprint was seen within the window
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.contains_at(fingerprint, Instant::now())
    }

    pub(crate) fn contains_at(&self, fingerprint: &Fingerprint, now: Instant) -> bool {
        self.inner
            .read()
            .entries
            .get(fingerprint)
            .is_some_and(|seen_at| now.saturating_duration_since(*seen_at) < self.ttl)
    }

    /// Drop expired entries, returning how many were removed
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub(crate) fn evict_expired_at(&self, now: Instant) -> usize {
        let mut inner = self.inner.write();
        self.evict_expired_locked(&mut inner, now)
    }

    fn evict_expired_locked(&self, inner: &mut CacheInner, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((fingerprint, at)) = inner.order.front().copied() {
            if now.saturating_duration_since(at) < self.ttl {
                break;
            }
            inner.order.pop_front();
            if inner.entries.get(&fingerprint) == Some(&at) {
                inner.entries.remove(&fingerprint);
                removed += 1;
            }
        }
        removed
    }

    /// Number of remembered fingerprints
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Forget everything
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fp(n: u8) -> Fingerprint {
        Fingerprint::from_bytes([n; 32])
    }

    #[test]
    fn test_first_observation_is_new() {
        let cache = MessageCache::new(Duration::from_secs(60), 10);
        assert!(cache.observe(fp(1)));
        assert!(!cache.observe(fp(1)));
        assert!(cache.contains(&fp(1)));
        assert!(!cache.contains(&fp(2)));
    }

    #[test]
    fn test_entries_expire() {
        let cache = MessageCache::new(Duration::from_secs(60), 10);
        let now = Instant::now();

        assert!(cache.observe_at(fp(1), now));
        assert!(cache.contains_at(&fp(1), now + Duration::from_secs(59)));
        assert!(!cache.contains_at(&fp(1), now + Duration::from_secs(60)));

        // Seen again after expiry counts as new
        assert!(cache.observe_at(fp(1), now + Duration::from_secs(61)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let cache = MessageCache::new(Duration::from_secs(60), 3);
        let now = Instant::now();

        for n in 1..=3 {
            cache.observe_at(fp(n), now + Duration::from_millis(n as u64));
        }
        cache.observe_at(fp(4), now + Duration::from_millis(4));

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains_at(&fp(1), now));
        for n in 2..=4 {
            assert!(cache.contains_at(&fp(n), now));
        }
    }

    #[test]
    fn test_evict_expired_counts_removals() {
        let cache = MessageCache::new(Duration::from_secs(10), 10);
        let now = Instant::now();
        cache.observe_at(fp(1), now);
        cache.observe_at(fp(2), now + Duration::from_secs(5));

        assert_eq!(cache.evict_expired_at(now + Duration::from_secs(10)), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.evict_expired_at(now + Duration::from_secs(20)), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_observers_see_one_winner() {
        let cache = Arc::new(MessageCache::new(Duration::from_secs(60), 100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.observe(fp(7)))
            })
            .collect();

        let new_count = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|is_new| *is_new)
            .count();
        assert_eq!(new_count, 1);
    }
}
