//! Persistence for records, grants, audit trails and consumed emergency tokens.
//!
//! A [`RecordStore`] owns the atomicity the engine relies on:
//!
//! - every mutation takes the [`AuditEvent`] describing it and persists both or neither
//! - record mutations are compare-and-swap on the stored version, so two writers that read the
//!   same version cannot both commit
//! - mutations on the same record are serialized; different records never contend
//! - every mutation re-checks its [`CommitGuard`] against the stored record and grants inside
//!   that serialized section, so it cannot commit on access or validity that changed after the
//!   caller was authorized
//!
//! Audit ids are allocated inside the record's critical section, after the mutation is applied,
//! so per-record audit order is commit order.

mod file;
mod ledger;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::access::{AccessGrant, GrantRegistry};
use crate::audit::{AuditEntry, AuditEvent};
use crate::authorization::CommitGuard;
use crate::identity::ActorId;
use crate::payload::Snapshot;
use crate::record::{RecordId, VersionedRecord};
use crate::{RecordError, RecordResult};
use chrono::{DateTime, Utc};

pub trait RecordStore<P: Snapshot>: Send + Sync {
    /// Persists a new record at version 1.
    ///
    /// Fails with [`RecordError::InvalidInput`] if a record with the same id already exists.
    fn create(&self, record: &VersionedRecord<P>, audit: AuditEvent) -> RecordResult<()>;

    /// Loads a record with its full history.
    fn load(&self, id: RecordId) -> RecordResult<VersionedRecord<P>>;

    /// Replaces the stored record with `record` if the stored version is still
    /// `expected_version`; `record` must be exactly one version ahead of it.
    fn save_update(
        &self,
        record: &VersionedRecord<P>,
        expected_version: u32,
        guard: &CommitGuard,
        audit: AuditEvent,
    ) -> RecordResult<()>;

    /// Persists an invalidation if the stored record is still valid at `expected_version`.
    fn save_invalidation(
        &self,
        record: &VersionedRecord<P>,
        expected_version: u32,
        guard: &CommitGuard,
        audit: AuditEvent,
    ) -> RecordResult<()>;

    fn load_grants(&self, id: RecordId) -> RecordResult<GrantRegistry>;

    /// Inserts or replaces the grant for its `(record, grantee)` pair. Returns the replaced grant.
    ///
    /// Fails with [`RecordError::RecordNotFound`] if the record was invalidated.
    fn put_grant(
        &self,
        grant: AccessGrant,
        guard: &CommitGuard,
        audit: AuditEvent,
    ) -> RecordResult<Option<AccessGrant>>;

    /// Removes the grant for `grantee`, if any. The audit entry is written either way.
    fn remove_grant(
        &self,
        id: RecordId,
        grantee: &ActorId,
        guard: &CommitGuard,
        audit: AuditEvent,
    ) -> RecordResult<Option<AccessGrant>>;

    /// Appends an entry for an event that mutates nothing (views, emergency access).
    fn append_audit(&self, audit: AuditEvent) -> RecordResult<AuditEntry>;

    /// The record's audit trail in append order.
    fn audit_for_record(&self, id: RecordId) -> RecordResult<Vec<AuditEntry>>;

    /// Current state of every record whose subject is `patient_id`, valid or not, without
    /// history.
    fn records_for_patient(&self, patient_id: &ActorId) -> RecordResult<Vec<VersionedRecord<P>>>;

    /// Marks an emergency token id as used.
    ///
    /// Fails with [`RecordError::TokenRejected`] if it was consumed before.
    fn consume_token(&self, token_id: &str, now: DateTime<Utc>) -> RecordResult<()>;
}

/// Shared compare-and-swap check for record mutations.
pub(crate) fn check_version(
    stored: &VersionedRecord<impl Snapshot>,
    expected_version: u32,
) -> RecordResult<()> {
    if stored.version() != expected_version {
        return Err(RecordError::VersionConflict {
            record_id: stored.id(),
            expected: expected_version,
            actual: stored.version(),
        });
    }
    Ok(())
}

/// Shape checks on an updated record before it replaces the stored one.
pub(crate) fn check_successor(
    stored: &VersionedRecord<impl Snapshot>,
    next: &VersionedRecord<impl Snapshot>,
) -> RecordResult<()> {
    if !stored.is_valid() {
        return Err(RecordError::RecordNotFound(stored.id()));
    }
    if next.id() != stored.id() || next.version() != stored.version() + 1 {
        return Err(RecordError::InvalidInput(format!(
            "record {} version {} does not follow stored version {}",
            next.id(),
            next.version(),
            stored.version()
        )));
    }
    next.check_contiguity()
}

pub(crate) fn lock_poisoned<T>(_: T) -> RecordError {
    RecordError::StorageUnavailable("store lock poisoned".into())
}
