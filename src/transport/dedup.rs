//! Dapp Message Deduplication
//!
//! Bounded cache of hash sums already processed, with a TTL matching the
//! gossip horizon. Entries fall out oldest-first when the cache is full,
//! so memory stays flat no matter how chatty the network is.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Default capacity
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default entry lifetime
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
pub struct MessageDedup {
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
    capacity: usize,
    ttl: Duration,
}

impl Default for MessageDedup {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl MessageDedup {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            ttl,
        }
    }

    /// Record a hash. Returns true the first time a live hash is seen.
    pub fn insert(&mut self, hash: &str) -> bool {
        self.cleanup();

        if let Some(at) = self.seen.get(hash) {
            if at.elapsed() < self.ttl {
                return false;
            }
        }

        let now = Instant::now();
        self.seen.insert(hash.to_string(), now);
        self.order.push_back((hash.to_string(), now));
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn cleanup(&mut self) {
        while let Some((hash, at)) = self.order.front() {
            if at.elapsed() > self.ttl {
                let (hash, at) = (hash.clone(), *at);
                self.order.pop_front();
                // Only drop the live entry if it has not been refreshed.
                if self.seen.get(&hash) == Some(&at) {
                    self.seen.remove(&hash);
                }
            } else {
                break;
            }
        }

        while self.seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some((hash, at)) => {
                    if self.seen.get(&hash) == Some(&at) {
                        self.seen.remove(&hash);
                    }
                }
                None => break,
            }
        }
    }
}
