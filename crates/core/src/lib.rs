//! # medrec core
//!
//! Versioned clinical records with access control, an append-only audit trail and emergency
//! views.
//!
//! - [`record`]: the versioning engine (live state plus immutable snapshots)
//! - [`access`] and [`authorization`]: grants and the per-operation access decision
//! - [`audit`]: audit entries written alongside every read and mutation
//! - [`emergency`]: emergency profile derivation and sealed single-use tokens
//! - [`store`]: persistence behind the [`store::RecordStore`] trait, in memory or on disk with a
//!   git ledger per record
//! - [`service`]: the operations callers use, tying the above together
//!
//! **No transport concerns**: authentication and network servers live outside this crate. Callers
//! hand in an already authenticated `(caller id, role)` pair.

pub mod access;
pub mod audit;
pub mod authorization;
pub mod config;
pub mod constants;
pub mod emergency;
mod error;
pub mod identity;
pub mod payload;
pub mod record;
pub mod service;
pub mod store;
pub mod validation;

pub use access::{AccessGrant, AccessLevel, GrantRegistry, GrantRequest};
pub use audit::{AuditAction, AuditEntry};
pub use authorization::{AccessBasis, CommitGuard, Decision, DenyReason, Operation};
pub use config::CoreConfig;
pub use emergency::{EmergencyProfile, EmergencySummary};
pub use error::{ErrorKind, RecordError, RecordResult};
pub use identity::{ActorId, Caller, Origin, Role};
pub use payload::ClinicalPayload;
pub use record::{NewRecord, RecordId, RecordStatus, RecordUpdate, VersionedRecord};
pub use service::{IssuedEmergencyToken, RecordService, RequestContext};
pub use store::{FileStore, MemoryStore, RecordStore};
