//! The conflict decision table.
//!
//! Fetching the competing operation is the server's job; judging the pair of
//! clocks is pure and lives here so the rule can be tested exhaustively.

use sync_types::{ClockOrdering, ErrorCode, VectorClock};

/// Outcome of judging an incoming operation against the latest stored
/// operation for the same entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictVerdict {
    /// Valid causal successor, or an idempotent retry from the same client.
    Accept,
    /// Same clock from a different client: suspicious clock reuse, not a
    /// legitimate retry. Deliberately conservative: two clients creating
    /// the same entity from an empty clock land here too.
    EqualClockDifferentClient,
    /// Neither clock dominates: concurrent modification.
    Concurrent,
    /// The incoming clock is strictly behind what the server has.
    Stale,
}

impl ConflictVerdict {
    /// Whether the incoming operation should be stored.
    pub fn is_accept(&self) -> bool {
        matches!(self, ConflictVerdict::Accept)
    }

    /// Rejection code for this verdict (`None` for accepts).
    ///
    /// Everything that is not an explicit accept maps to a conflict code:
    /// the table fails closed.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ConflictVerdict::Accept => None,
            ConflictVerdict::Concurrent | ConflictVerdict::EqualClockDifferentClient => {
                Some(ErrorCode::ConflictConcurrent)
            }
            ConflictVerdict::Stale => Some(ErrorCode::ConflictStale),
        }
    }
}

/// Judge an incoming clock against the latest stored clock for one entity.
pub fn judge(
    incoming: &VectorClock,
    incoming_client: &str,
    existing: &VectorClock,
    existing_client: &str,
) -> ConflictVerdict {
    match incoming.compare(existing) {
        ClockOrdering::GreaterThan => ConflictVerdict::Accept,
        ClockOrdering::Equal if incoming_client == existing_client => ConflictVerdict::Accept,
        ClockOrdering::Equal => ConflictVerdict::EqualClockDifferentClient,
        ClockOrdering::Concurrent => ConflictVerdict::Concurrent,
        ClockOrdering::LessThan => ConflictVerdict::Stale,
    }
}
