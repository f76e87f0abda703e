//! Access grants.
//!
//! A grant gives one non-owner a level of access to one record, optionally until an expiry.
//! Levels are totally ordered (`read < write < full`) and a higher level implies every lower
//! one. There is at most one grant per `(record, grantee)`; granting again replaces it.
//!
//! Expiry is evaluated lazily: an expired grant stays in the registry until it is replaced or
//! revoked, but [`GrantRegistry::has_access`] treats it as absent. There is no fallback to a
//! lower level once the only grant has expired.

use crate::identity::ActorId;
use crate::record::RecordId;
use crate::{RecordError, RecordResult};
use chrono::{DateTime, Utc};
use medrec_types::SingleLineText;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Capability tier. Variant order is the access order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Read,
    Write,
    Full,
}

impl AccessLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccessLevel {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "full" => Ok(Self::Full),
            other => Err(RecordError::InvalidInput(format!(
                "unknown access level '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub record_id: RecordId,
    pub grantee_id: ActorId,
    pub level: AccessLevel,
    pub granted_by: ActorId,
    pub granted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub purpose: SingleLineText,
}

impl AccessGrant {
    /// A grant is active strictly before its expiry.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// Caller input for creating or replacing a grant.
#[derive(Clone, Debug)]
pub struct GrantRequest {
    pub record_id: RecordId,
    pub grantee_id: ActorId,
    pub level: AccessLevel,
    pub purpose: Option<SingleLineText>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// All grants on one record, keyed by grantee.
#[derive(Clone, Debug)]
pub struct GrantRegistry {
    record_id: RecordId,
    grants: BTreeMap<ActorId, AccessGrant>,
}

impl GrantRegistry {
    pub fn new(record_id: RecordId) -> Self {
        Self {
            record_id,
            grants: BTreeMap::new(),
        }
    }

    /// Rebuilds a registry from persisted grants.
    pub fn from_grants(record_id: RecordId, grants: Vec<AccessGrant>) -> RecordResult<Self> {
        let mut registry = Self::new(record_id);
        for grant in grants {
            if grant.record_id != record_id {
                return Err(RecordError::StorageUnavailable(format!(
                    "grant for record {} stored under record {record_id}",
                    grant.record_id
                )));
            }
            registry.grants.insert(grant.grantee_id.clone(), grant);
        }
        Ok(registry)
    }

    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    /// The grantee's grant if it has not expired at `now`.
    pub fn active_grant(&self, grantee: &ActorId, now: DateTime<Utc>) -> Option<&AccessGrant> {
        self.grants
            .get(grantee)
            .filter(|grant| grant.is_active_at(now))
    }

    /// Pure check: an active grant with `level >= required` exists.
    pub fn has_access(&self, grantee: &ActorId, required: AccessLevel, now: DateTime<Utc>) -> bool {
        self.active_grant(grantee, now)
            .is_some_and(|grant| grant.level >= required)
    }

    /// Inserts `grant`, returning the grant it replaced (active or expired).
    pub fn grant(&mut self, grant: AccessGrant) -> RecordResult<Option<AccessGrant>> {
        if grant.record_id != self.record_id {
            return Err(RecordError::InvalidInput(format!(
                "grant targets record {} but registry holds {}",
                grant.record_id, self.record_id
            )));
        }
        Ok(self.grants.insert(grant.grantee_id.clone(), grant))
    }

    /// Removes the grantee's grant. Revoking a missing grant is a no-op.
    pub fn revoke(&mut self, grantee: &ActorId) -> Option<AccessGrant> {
        self.grants.remove(grantee)
    }

    pub fn active_grants(&self, now: DateTime<Utc>) -> Vec<&AccessGrant> {
        self.grants
            .values()
            .filter(|grant| grant.is_active_at(now))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccessGrant> {
        self.grants.values()
    }

    pub fn into_grants(self) -> Vec<AccessGrant> {
        self.grants.into_values().collect()
    }
}
