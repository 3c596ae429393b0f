//! # sync-core
//!
//! Pure logic for the oplog-sync engine: payload guarding, operation
//! validation, conflict judgment, and state replay. No I/O anywhere in this
//! crate. Everything here is a function over values, so tests run instantly
//! and the server crate stays free of business rules.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod payload;
pub mod replay;
pub mod validate;

pub use conflict::ConflictVerdict;
pub use payload::PayloadError;
pub use replay::Projection;
pub use validate::{EntityTargets, ValidatedOp, ValidationConfig, ValidationError};
