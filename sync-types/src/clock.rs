//! Vector clocks for causality tracking between sync clients.
//!
//! Every operation carries a map of `client id -> logical counter`. The
//! server never mutates a clock; comparison and sanitization are pure
//! functions over immutable maps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Maximum number of entries a clock may carry.
///
/// Bounds comparison cost; real deployments see a handful of devices.
pub const MAX_CLOCK_ENTRIES: usize = 100;

/// Maximum length of a clock key (client id).
pub const MAX_CLOCK_KEY_LEN: usize = 255;

/// Maximum counter value accepted during sanitization.
pub const MAX_CLOCK_COUNTER: u64 = 10_000_000;

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// All counters equal.
    Equal,
    /// Left clock dominates: every counter >= right, at least one strictly greater.
    GreaterThan,
    /// Right clock dominates.
    LessThan,
    /// Each clock has at least one counter the other lacks knowledge of.
    Concurrent,
}

/// A vector clock: map of client id to a non-negative logical counter.
///
/// A key absent from the map is treated as counter 0 in all comparisons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Get the counter for a client (0 if absent).
    pub fn get(&self, client_id: &str) -> u64 {
        self.0.get(client_id).copied().unwrap_or(0)
    }

    /// Set the counter for a client.
    pub fn set(&mut self, client_id: impl Into<String>, counter: u64) {
        self.0.insert(client_id.into(), counter);
    }

    /// Number of entries in the clock.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the clock has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(client id, counter)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.0.iter()
    }

    /// Pointwise-maximum merge of another clock into this one.
    ///
    /// Used to aggregate the clocks of operations a download skipped over,
    /// so the client still learns everything those operations observed.
    pub fn merge_max(&mut self, other: &VectorClock) {
        for (client, counter) in other.iter() {
            let entry = self.0.entry(client.clone()).or_insert(0);
            if *counter > *entry {
                *entry = *counter;
            }
        }
    }

    /// Compare this clock against another.
    ///
    /// The comparison is total: exactly one of the four [`ClockOrdering`]
    /// outcomes holds, and `a.compare(b)` mirrors `b.compare(a)`.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for key in self.0.keys().chain(other.0.keys()) {
            let a = self.get(key);
            let b = other.get(key);
            if a > b {
                self_ahead = true;
            } else if b > a {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::GreaterThan,
            (false, true) => ClockOrdering::LessThan,
            (true, true) => ClockOrdering::Concurrent,
        }
    }
}

impl FromIterator<(String, u64)> for VectorClock {
    fn from_iter<T: IntoIterator<Item = (String, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Hard failures during clock sanitization.
///
/// Anything softer than these (bad keys, bad counters) is silently dropped
/// instead, so one misbehaving entry never rejects a whole operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    /// The clock container is not a JSON object.
    #[error("vector clock must be an object")]
    NotAnObject,
    /// The clock has too many entries to sanitize at bounded cost.
    #[error("vector clock has {count} entries (max {MAX_CLOCK_ENTRIES})")]
    TooManyEntries {
        /// Entry count before sanitization.
        count: usize,
    },
}

/// Sanitize a raw, untrusted clock value.
///
/// Rejects outright only when the container itself is malformed (not an
/// object, or oversized before sanitization). Individual entries with empty
/// or overlong keys, or counters that are not integers in
/// `0..=MAX_CLOCK_COUNTER`, are dropped; the returned count says how many.
pub fn sanitize_clock(raw: &serde_json::Value) -> Result<(VectorClock, usize), ClockError> {
    let map = match raw {
        serde_json::Value::Object(map) => map,
        _ => return Err(ClockError::NotAnObject),
    };

    // Reject before per-entry work so a hostile clock can't buy CPU time.
    if map.len() > MAX_CLOCK_ENTRIES {
        return Err(ClockError::TooManyEntries { count: map.len() });
    }

    let mut clock = VectorClock::new();
    let mut stripped = 0usize;

    for (key, value) in map {
        if key.is_empty() || key.len() > MAX_CLOCK_KEY_LEN {
            stripped += 1;
            continue;
        }
        match value.as_u64() {
            Some(counter) if counter <= MAX_CLOCK_COUNTER => {
                clock.set(key.clone(), counter);
            }
            _ => stripped += 1,
        }
    }

    Ok((clock, stripped))
}
