//! Per-(namespace, tuner, event) deduplication of kernel notifications
//!
//! Kernel probes can emit bursts of near-simultaneous events for the same
//! logical condition. Events whose packed key was seen less than the window
//! ago are suppressed; a suppressed event does not refresh the timestamp, so
//! the window measures from the last *delivered* event.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default suppression window
pub const DEDUP_WINDOW: Duration = Duration::from_millis(25);

/// Maximum number of tracked keys before eviction kicks in
pub const DEDUP_CAPACITY: usize = 65536;

/// Pack (namespace cookie, tuner, event) into the 64-bit dedup key
///
/// Matches the kernel-side packing: the cookie occupies the low bits and the
/// event and tuner ids are folded into bits 32+ and 48+.
pub fn event_key(netns_cookie: i64, tuner_id: u32, event_id: u32) -> u64 {
    (netns_cookie as u64) | ((event_id as u64) << 32) | ((tuner_id as u64) << 48)
}

/// Timestamps of the last delivered event per packed key
#[derive(Debug)]
pub struct LastEventMap {
    window: Duration,
    capacity: usize,
    entries: HashMap<u64, Instant>,
}

impl LastEventMap {
    pub fn new(window: Duration) -> Self {
        Self::with_capacity(window, DEDUP_CAPACITY)
    }

    pub fn with_capacity(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity,
            entries: HashMap::new(),
        }
    }

    /// Record a sighting of `key` at `now`
    ///
    /// Returns `true` if the event should be delivered, `false` if it falls
    /// inside the suppression window of the previous delivery.
    pub fn observe(&mut self, key: u64, now: Instant) -> bool {
        if let Some(last) = self.entries.get(&key) {
            if now.duration_since(*last) < self.window {
                return false;
            }
        } else if self.entries.len() >= self.capacity {
            // Full table never costs an event: shed the oldest eighth.
            self.evict_oldest(self.capacity / 8);
        }
        self.entries.insert(key, now);
        true
    }

    fn evict_oldest(&mut self, count: usize) {
        let mut by_age: Vec<(u64, Instant)> =
            self.entries.iter().map(|(k, t)| (*k, *t)).collect();
        by_age.sort_by_key(|(_, t)| *t);
        for (key, _) in by_age.into_iter().take(count.max(1)) {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
