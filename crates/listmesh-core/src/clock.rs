//! Hybrid logical clock used to order writes across replicas

use std::cmp::Ordering;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Logical timestamp attached to every cell, row tombstone and value.
///
/// Ordered by wall-clock milliseconds, then the logical counter, then the
/// replica id, so two distinct writes never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub millis: u64,
    pub counter: u32,
    pub replica: String,
}

impl Stamp {
    pub fn new(millis: u64, counter: u32, replica: impl Into<String>) -> Self {
        Self {
            millis,
            counter,
            replica: replica.into(),
        }
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then(self.counter.cmp(&other.counter))
            .then_with(|| self.replica.cmp(&other.replica))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-replica hybrid logical clock
#[derive(Debug, Clone)]
pub struct HybridClock {
    replica: String,
    last_millis: u64,
    counter: u32,
}

impl HybridClock {
    pub fn new(replica: impl Into<String>) -> Self {
        Self {
            replica: replica.into(),
            last_millis: 0,
            counter: 0,
        }
    }

    pub fn replica(&self) -> &str {
        &self.replica
    }

    /// Stamp for a local write. Strictly greater than every stamp this clock
    /// has produced or observed.
    pub fn tick(&mut self) -> Stamp {
        self.tick_at(wall_millis())
    }

    fn tick_at(&mut self, now: u64) -> Stamp {
        if now > self.last_millis {
            self.last_millis = now;
            self.counter = 0;
        } else if let Some(next) = self.counter.checked_add(1) {
            self.counter = next;
        } else {
            // counter exhausted within one millisecond
            self.last_millis += 1;
            self.counter = 0;
        }
        Stamp::new(self.last_millis, self.counter, self.replica.clone())
    }

    /// Fold a remote stamp into the clock
    pub fn observe(&mut self, stamp: &Stamp) {
        match stamp.millis.cmp(&self.last_millis) {
            Ordering::Greater => {
                self.last_millis = stamp.millis;
                self.counter = stamp.counter;
            }
            Ordering::Equal => self.counter = self.counter.max(stamp.counter),
            Ordering::Less => {}
        }
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn wall_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_are_monotonic() {
        let mut clock = HybridClock::new("a");
        let first = clock.tick_at(100);
        let second = clock.tick_at(100);
        let third = clock.tick_at(90);
        assert!(first < second);
        assert!(second < third);
        assert_eq!(third.millis, 100);
    }

    #[test]
    fn test_observe_moves_clock_forward() {
        let mut clock = HybridClock::new("a");
        clock.tick_at(10);
        let remote = Stamp::new(500, 7, "b");
        clock.observe(&remote);
        let next = clock.tick_at(20);
        assert!(next > remote);
    }

    #[test]
    fn test_exhausted_counter_moves_to_next_millisecond() {
        let mut clock = HybridClock::new("a");
        let remote = Stamp::new(100, u32::MAX, "b");
        clock.observe(&remote);
        let next = clock.tick_at(100);
        assert!(next > remote);
        assert_eq!((next.millis, next.counter), (101, 0));
        assert!(clock.tick_at(100) > next);
    }

    #[test]
    fn test_replica_breaks_ties() {
        let a = Stamp::new(5, 0, "device-a");
        let b = Stamp::new(5, 0, "device-b");
        assert!(a < b);
        assert_ne!(a, b);
    }
}
