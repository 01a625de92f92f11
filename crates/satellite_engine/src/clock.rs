//! Tag generation for local writes.

use satellite_protocol::Tag;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Produces tags for locally committed transactions.
///
/// Timestamps follow the wall clock in milliseconds but never repeat or go
/// backwards for this origin: if the clock stalls or steps back, the last
/// timestamp is bumped by one instead.
#[derive(Debug)]
pub struct TagClock {
    origin: String,
    last: AtomicU64,
}

impl TagClock {
    /// Creates a clock for `origin`.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            last: AtomicU64::new(0),
        }
    }

    /// The origin stamped on every tag.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Builds a tag without touching any clock state.
    pub fn tag(origin: &str, timestamp: u64) -> Tag {
        Tag::new(origin, timestamp)
    }

    /// Next tag at the current wall-clock time.
    pub fn next(&self) -> Tag {
        self.next_at(now_millis())
    }

    /// Next tag given the current time in milliseconds.
    pub fn next_at(&self, now_ms: u64) -> Tag {
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now_ms.max(current.saturating_add(1));
            match self.last.compare_exchange(
                current,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Tag::new(self.origin.clone(), candidate),
                Err(actual) => current = actual,
            }
        }
    }

    /// Raises the floor so later tags sort after `timestamp`.
    ///
    /// Called on start with the highest timestamp found in the local log.
    pub fn observe(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::SeqCst);
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_wall_clock() {
        let clock = TagClock::new("c1");
        assert_eq!(clock.next_at(100), Tag::new("c1", 100));
        assert_eq!(clock.next_at(250), Tag::new("c1", 250));
    }

    #[test]
    fn never_repeats_or_regresses() {
        let clock = TagClock::new("c1");
        assert_eq!(clock.next_at(100).timestamp, 100);
        assert_eq!(clock.next_at(100).timestamp, 101);
        assert_eq!(clock.next_at(50).timestamp, 102);
    }

    #[test]
    fn observe_raises_floor() {
        let clock = TagClock::new("c1");
        clock.observe(1_000);
        assert_eq!(clock.next_at(10).timestamp, 1_001);
        clock.observe(5);
        assert_eq!(clock.next_at(10).timestamp, 1_002);
    }

    #[test]
    fn real_clock_is_monotonic() {
        let clock = TagClock::new("c1");
        let a = clock.next();
        let b = clock.next();
        assert!(b > a);
    }
}
