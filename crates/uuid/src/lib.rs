//! Record identifiers and sharded-path utilities.
//!
//! Every clinical record is stored under a sharded directory derived from its identifier, and
//! every audit entry carries a time-prefixed identifier so that a record's trail sorts in append
//! order.
//!
//! ## Canonical UUID form
//! - Length: 32
//! - Characters: `0-9` and `a-f` only
//! - Example: `550e8400e29b41d4a716446655440000`
//!
//! This is the same value you would get from `Uuid::new_v4().simple().to_string()`. Externally
//! supplied identifiers must already be canonical; hyphenated or uppercase forms are rejected
//! rather than normalised.
//!
//! ## Sharded directory layout
//! For a canonical UUID `u`, data lives under `parent_dir/<u[0..2]>/<u[2..4]>/<u>/`, e.g.
//! `record_data/records/55/0e/550e8400e29b41d4a716446655440000/`. This keeps any single
//! directory's fan-out small.

mod service;

pub use service::{ShardableUuid, TimestampId, Uuid};

/// Error type for UUID operations.
#[derive(Debug, thiserror::Error)]
pub enum UuidError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for UUID operations.
pub type UuidResult<T> = Result<T, UuidError>;
