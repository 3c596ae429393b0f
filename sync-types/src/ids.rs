//! Identity and ordering types for the operation log.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A relational user key.
///
/// The sync engine is strictly partitioned by user; every query and every
/// in-memory cache entry is scoped to one of these.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(i64);

impl UserId {
    /// Create a UserId from its relational key.
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this UserId.
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

/// A monotonically increasing, server-assigned sequence number.
///
/// Assigned at upload time, never by clients. Per user, assigned values are
/// strictly increasing and never reused; retention deletes can later make
/// the retained set non-contiguous.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Seq(u64);

impl Seq {
    /// Create a new Seq with the given value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this Seq.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Create a Seq representing "no operations yet".
    pub fn zero() -> Self {
        Self(0)
    }

    /// Increment the sequence by one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}
