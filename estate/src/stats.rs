//! Statistics counter map, updated by the service loop as packets are
//! dropped, transactions complete, and so on.

use indexmap::IndexMap;
use std::time::{Duration, Instant};

/// A string keyed integer counter map, reset by a monotonic timer.
#[derive(Debug)]
pub struct Stats {
    counters: IndexMap<String, i64>,
    last_reset: Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            counters: IndexMap::new(),
            last_reset: Instant::now(),
        }
    }
}

impl Stats {
    /// Creates an empty stats map with the reset timer starting now.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments `key` by `delta` (1 by default via [`Stats::inc`]).
    pub fn inc_by(&mut self, key: &str, delta: i64) {
        *self.counters.entry(key.to_string()).or_insert(0) += delta;
    }

    /// Increments `key` by one.
    pub fn inc(&mut self, key: &str) {
        self.inc_by(key, 1);
    }

    /// Sets `key` to an absolute value.
    pub fn update(&mut self, key: &str, value: i64) {
        self.counters.insert(key.to_string(), value);
    }

    /// Reads the current value of `key`, or 0 if it has never been touched.
    pub fn get(&self, key: &str) -> i64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    /// Zeroes a single counter.
    pub fn clear(&mut self, key: &str) {
        if let Some(v) = self.counters.get_mut(key) {
            *v = 0;
        }
    }

    /// Zeroes every counter and restarts the reset timer.
    pub fn clear_all(&mut self) {
        for v in self.counters.values_mut() {
            *v = 0;
        }
        self.last_reset = Instant::now();
    }

    /// Elapsed time since the counters were last reset.
    pub fn elapsed_since_reset(&self) -> Duration {
        self.last_reset.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_and_clear() {
        let mut s = Stats::new();
        s.inc("stale_packet");
        s.inc("stale_packet");
        assert_eq!(s.get("stale_packet"), 2);
        s.clear("stale_packet");
        assert_eq!(s.get("stale_packet"), 0);
    }

    #[test]
    fn update_sets_absolute_value() {
        let mut s = Stats::new();
        s.update("alive_complete", 5);
        assert_eq!(s.get("alive_complete"), 5);
    }
}
