//! Record access authorization.
//!
//! One decision function for every operation on a record, evaluated in order:
//!
//! 1. `admin` role → full access
//! 2. caller is the record's patient → full access for read/share, denied for write/invalidate
//! 3. caller authored the record → full access
//! 4. an active grant with a sufficient level → the granted level
//! 5. default → deny
//!
//! Rules 1–3 only look at the caller and the record, so they short-circuit before the grant
//! store is consulted. [`decide_with`] takes the grant lookup as a closure for exactly that
//! reason; [`decide`] is the same policy over an already loaded registry.
//!
//! Deciding never writes an audit entry. Callers decide whether an allowed access is itself
//! auditable, and denied probes are not logged to the trail.

use crate::access::{AccessLevel, GrantRegistry};
use crate::identity::{Caller, Role};
use crate::payload::Snapshot;
use crate::record::VersionedRecord;
use crate::{RecordError, RecordResult};
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Operation {
    Read,
    Write,
    Share,
    Invalidate,
}

impl Operation {
    /// Minimum grant level that permits the operation.
    pub const fn required_level(self) -> AccessLevel {
        match self {
            Self::Read => AccessLevel::Read,
            Self::Write => AccessLevel::Write,
            Self::Share | Self::Invalidate => AccessLevel::Full,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Share => "share",
            Self::Invalidate => "invalidate",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "share" => Ok(Self::Share),
            "invalidate" => Ok(Self::Invalidate),
            other => Err(RecordError::InvalidInput(format!(
                "unknown operation '{other}'"
            ))),
        }
    }
}

/// Why access was allowed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AccessBasis {
    AdminRole,
    RecordSubject,
    RecordAuthor,
    ExplicitGrant,
}

impl AccessBasis {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AdminRole => "admin_role",
            Self::RecordSubject => "record_subject",
            Self::RecordAuthor => "record_author",
            Self::ExplicitGrant => "explicit_grant",
        }
    }
}

impl fmt::Display for AccessBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why access was denied.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DenyReason {
    /// Patients read and share their own records but never author clinical content.
    PatientCannotAuthor,
    /// No active grant at the required level.
    NoGrant,
}

impl DenyReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PatientCannotAuthor => "patient_cannot_author",
            Self::NoGrant => "no_grant",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    Allow {
        level: AccessLevel,
        basis: AccessBasis,
    },
    Deny(DenyReason),
}

impl Decision {
    fn allow(level: AccessLevel, basis: AccessBasis) -> Self {
        Self::Allow { level, basis }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    /// The allowed level, or [`RecordError::Forbidden`] naming the caller and reason.
    pub fn require(self, caller: &Caller, operation: Operation) -> RecordResult<AccessLevel> {
        match self {
            Self::Allow { level, .. } => Ok(level),
            Self::Deny(reason) => {
                tracing::warn!(
                    caller = %caller.id,
                    role = %caller.role,
                    %operation,
                    %reason,
                    "access denied"
                );
                Err(RecordError::forbidden(&caller.id, format!("{operation}: {reason}")))
            }
        }
    }
}

/// Rules 1–3. `None` means the grant store must be consulted.
fn ownership_rule<P>(
    caller: &Caller,
    operation: Operation,
    record: &VersionedRecord<P>,
) -> Option<Decision> {
    if caller.role == Role::Admin {
        return Some(Decision::allow(AccessLevel::Full, AccessBasis::AdminRole));
    }

    if record.patient_id() == &caller.id {
        return Some(match operation {
            Operation::Read | Operation::Share => {
                Decision::allow(AccessLevel::Full, AccessBasis::RecordSubject)
            }
            Operation::Write | Operation::Invalidate => {
                Decision::Deny(DenyReason::PatientCannotAuthor)
            }
        });
    }

    if record.author_id() == &caller.id {
        return Some(Decision::allow(AccessLevel::Full, AccessBasis::RecordAuthor));
    }

    None
}

/// Rule 4 over a loaded registry.
fn grant_rule(
    caller: &Caller,
    operation: Operation,
    grants: &GrantRegistry,
    now: DateTime<Utc>,
) -> Decision {
    match grants.active_grant(&caller.id, now) {
        Some(grant) if grant.level >= operation.required_level() => {
            Decision::allow(grant.level, AccessBasis::ExplicitGrant)
        }
        _ => Decision::Deny(DenyReason::NoGrant),
    }
}

/// Decides `operation` for `caller` on `record` with grants already in hand.
pub fn decide<P>(
    caller: &Caller,
    operation: Operation,
    record: &VersionedRecord<P>,
    grants: &GrantRegistry,
    now: DateTime<Utc>,
) -> Decision {
    ownership_rule(caller, operation, record)
        .unwrap_or_else(|| grant_rule(caller, operation, grants, now))
}

/// Decides `operation`, loading grants only if ownership rules do not settle it.
pub fn decide_with<P, F>(
    caller: &Caller,
    operation: Operation,
    record: &VersionedRecord<P>,
    now: DateTime<Utc>,
    load_grants: F,
) -> RecordResult<Decision>
where
    F: FnOnce() -> RecordResult<GrantRegistry>,
{
    if let Some(decision) = ownership_rule(caller, operation, record) {
        return Ok(decision);
    }
    let grants = load_grants()?;
    Ok(grant_rule(caller, operation, &grants, now))
}

/// The access a mutation must still hold when it commits.
///
/// Services decide before they build a change; stores check the guard again against the record
/// and grants they hold under the record's lock. A revocation or invalidation that commits in
/// between therefore fails the mutation instead of being overtaken by it.
#[derive(Clone, Debug)]
pub struct CommitGuard {
    caller: Caller,
    operation: Operation,
    now: DateTime<Utc>,
}

impl CommitGuard {
    pub fn new(caller: Caller, operation: Operation, now: DateTime<Utc>) -> Self {
        Self {
            caller,
            operation,
            now,
        }
    }

    /// Fails with [`RecordError::RecordNotFound`] for an invalidated record and with
    /// [`RecordError::Forbidden`] if the caller no longer holds the required access.
    pub fn check<P: Snapshot>(
        &self,
        stored: &VersionedRecord<P>,
        grants: &GrantRegistry,
    ) -> RecordResult<AccessLevel> {
        if !stored.is_valid() {
            return Err(RecordError::RecordNotFound(stored.id()));
        }
        decide(&self.caller, self.operation, stored, grants, self.now)
            .require(&self.caller, self.operation)
    }
}
