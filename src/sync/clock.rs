//! Vector clocks for causal ordering of change events.
//!
//! Each device owns one counter. A device only ever increments its own
//! entry; entries from other devices only move forward through [`VectorClock::merge`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Causal relationship between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrder {
    /// Identical clocks.
    Equal,
    /// `self` happened before `other`.
    Before,
    /// `self` happened after `other`.
    After,
    /// Neither observed the other.
    Concurrent,
}

/// Mapping of device id to a monotonically increasing counter.
///
/// Backed by a `BTreeMap` so serialization is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `device`, zero when the device was never observed.
    pub fn get(&self, device: &str) -> u64 {
        self.0.get(device).copied().unwrap_or(0)
    }

    /// Increments the counter for `device` and returns the new value.
    pub fn increment(&mut self, device: &str) -> u64 {
        let counter = self.0.entry(device.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (device, &counter) in &other.0 {
            let entry = self.0.entry(device.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrder {
        let mut less = false;
        let mut greater = false;

        for device in self.0.keys().chain(other.0.keys()) {
            match self.get(device).cmp(&other.get(device)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return ClockOrder::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrder::Equal,
            (true, false) => ClockOrder::Before,
            (false, true) => ClockOrder::After,
            (true, true) => ClockOrder::Concurrent,
        }
    }

    /// True when `self` is strictly ahead of `other`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrder::After
    }

    /// Whether `self` has already observed event number `counter` of `device`.
    pub fn has_seen(&self, device: &str, counter: u64) -> bool {
        self.get(device) >= counter
    }

    /// Sum of all counters. Consistent with causality: if `a` happened
    /// before `b` then `a.sum() < b.sum()`.
    pub fn sum(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&c| c == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(d, &c)| (d.as_str(), c))
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (device, counter)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{device}:{counter}")?;
        }
        write!(f, "}}")
    }
}

impl<const N: usize> From<[(&str, u64); N]> for VectorClock {
    fn from(entries: [(&str, u64); N]) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(d, c)| (d.to_string(), c))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_is_strictly_increasing() {
        let mut clock = VectorClock::new();
        let mut last = 0;
        for _ in 0..10 {
            let next = clock.increment("a");
            assert!(next > last);
            last = next;
        }
        assert_eq!(clock.get("a"), 10);
        assert_eq!(clock.get("b"), 0);
    }

    #[test]
    fn test_compare_equal_and_ordered() {
        let base = VectorClock::from([("A", 1), ("B", 1)]);
        let ahead = VectorClock::from([("A", 2), ("B", 1)]);

        assert_eq!(base.compare(&base.clone()), ClockOrder::Equal);
        assert_eq!(base.compare(&ahead), ClockOrder::Before);
        assert_eq!(ahead.compare(&base), ClockOrder::After);
        assert!(ahead.dominates(&base));
        assert!(!base.dominates(&ahead));
    }

    #[test]
    fn test_compare_concurrent() {
        let a = VectorClock::from([("A", 2), ("B", 1)]);
        let b = VectorClock::from([("A", 1), ("B", 2)]);
        assert_eq!(a.compare(&b), ClockOrder::Concurrent);
        assert_eq!(b.compare(&a), ClockOrder::Concurrent);
        assert!(!a.dominates(&b));
        assert!(!b.dominates(&a));
    }

    #[test]
    fn test_missing_entries_count_as_zero() {
        let a = VectorClock::from([("A", 1)]);
        let b = VectorClock::from([("A", 1), ("B", 0)]);
        assert_eq!(a.compare(&b), ClockOrder::Equal);

        let empty = VectorClock::new();
        assert_eq!(empty.compare(&a), ClockOrder::Before);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_merge_never_decreases() {
        let mut local = VectorClock::from([("A", 5), ("B", 1)]);
        local.merge(&VectorClock::from([("A", 2), ("B", 3), ("C", 1)]));
        assert_eq!(local, VectorClock::from([("A", 5), ("B", 3), ("C", 1)]));
    }

    #[test]
    fn test_has_seen_and_sum() {
        let clock = VectorClock::from([("A", 3), ("B", 2)]);
        assert!(clock.has_seen("A", 3));
        assert!(!clock.has_seen("A", 4));
        assert!(!clock.has_seen("C", 1));
        assert_eq!(clock.sum(), 5);
    }

    #[test]
    fn test_serializes_as_sorted_map() {
        let clock = VectorClock::from([("b", 2), ("a", 1)]);
        let json = serde_json::to_string(&clock).unwrap();
        assert_eq!(json, r#"{"a":1,"b":2}"#);
        let parsed: VectorClock = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, clock);
        assert_eq!(clock.to_string(), "{a:1, b:2}");
    }
}
