//! Cross-reconnect de-duplication cache.
//!
//! Exchanges replay messages after reconnects. The cache is bounded both by
//! entry count and TTL and is keyed by a per-channel extractor (see
//! `StreamEvent::dedup_key`), so replayed events are silently dropped while
//! distinct partial updates at the same price still pass.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct DedupCache {
    seen_at: HashMap<String, Instant>,
    insertion_order: VecDeque<(String, Instant)>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen_at: HashMap::with_capacity(max_entries.min(4096)),
            insertion_order: VecDeque::with_capacity(max_entries.min(4096)),
            ttl,
            max_entries,
        }
    }

    /// Returns true when the key is new; false marks a replay.
    pub fn remember(&mut self, key: String) -> bool {
        let now = Instant::now();
        self.evict_expired(now);

        if self.seen_at.contains_key(&key) {
            return false;
        }
        self.seen_at.insert(key.clone(), now);
        self.insertion_order.push_back((key, now));
        self.evict_oldest_if_needed();
        true
    }

    pub fn len(&self) -> usize {
        self.seen_at.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen_at.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        let cutoff = now.checked_sub(self.ttl).unwrap_or(now);
        while let Some((key, inserted)) = self.insertion_order.front() {
            if *inserted < cutoff {
                self.seen_at.remove(key);
                self.insertion_order.pop_front();
            } else {
                break;
            }
        }
    }

    fn evict_oldest_if_needed(&mut self) {
        while self.seen_at.len() > self.max_entries {
            if let Some((key, _)) = self.insertion_order.pop_front() {
                self.seen_at.remove(&key);
            } else {
                break;
            }
        }
    }
}
