//! Replay ledger: request-id → observation instant, amortized O(1) per op.
//!
//! A `VecDeque` of `(instant, id)` in insertion order pairs with a
//! `HashSet<id>` for membership tests; eviction pops from the front of the
//! deque while its age exceeds the retention window, which is strictly
//! greater than the request TTL so an id can never be replayed after its own
//! eviction.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

pub struct ReplayLedger {
    entries: VecDeque<(Instant, String)>,
    seen: HashSet<String>,
    retention: Duration,
}

impl ReplayLedger {
    pub fn new(retention: Duration) -> Self {
        ReplayLedger {
            entries: VecDeque::new(),
            seen: HashSet::new(),
            retention,
        }
    }

    /// True if `id` is currently within the retention window.
    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Record `id` as seen now, then evict anything older than the
    /// retention window.
    pub fn record(&mut self, id: &str) {
        self.entries.push_back((Instant::now(), id.to_string()));
        self.seen.insert(id.to_string());
        self.evict_expired();
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        while let Some((observed_at, _)) = self.entries.front() {
            if now.duration_since(*observed_at) <= self.retention {
                break;
            }
            let (_, id) = self.entries.pop_front().unwrap();
            self.seen.remove(&id);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn rejects_id_seen_within_retention() {
        let mut ledger = ReplayLedger::new(Duration::from_secs(60));
        ledger.record("req-1");
        assert!(ledger.contains("req-1"));
    }

    #[test]
    fn evicts_after_retention_elapses() {
        let mut ledger = ReplayLedger::new(Duration::from_millis(20));
        ledger.record("req-1");
        sleep(Duration::from_millis(40));
        ledger.record("req-2");
        assert!(!ledger.contains("req-1"));
        assert!(ledger.contains("req-2"));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn unseen_id_never_flagged() {
        let ledger = ReplayLedger::new(Duration::from_secs(60));
        assert!(!ledger.contains("never-seen"));
    }
}
