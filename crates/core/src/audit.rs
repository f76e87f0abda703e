//! Audit trail types.
//!
//! Every state change and every read of a record produces one [`AuditEntry`]. Entries are
//! append-only: stores expose no way to edit or remove them, and record invalidation leaves
//! them in place.
//!
//! Callers build an [`AuditEvent`]; the store turns it into an entry inside the same critical
//! section as the mutation it describes, which is where the entry id is allocated. That keeps
//! per-record append order equal to the order mutations committed.

use crate::identity::{ActorId, Origin};
use crate::record::RecordId;
use chrono::{DateTime, Utc};
use medrec_uuid::TimestampId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Updated,
    Viewed,
    Shared,
    Revoked,
    EmergencyAccessed,
}

impl AuditAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Viewed => "viewed",
            Self::Shared => "shared",
            Self::Revoked => "revoked",
            Self::EmergencyAccessed => "emergency_accessed",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending audit entry, not yet assigned an id.
#[derive(Clone, Debug)]
pub struct AuditEvent {
    pub record_id: RecordId,
    pub action: AuditAction,
    pub performed_by: Option<ActorId>,
    pub details: String,
    pub origin: Origin,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        record_id: RecordId,
        action: AuditAction,
        performed_by: Option<&ActorId>,
        details: impl Into<String>,
        origin: &Origin,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id,
            action,
            performed_by: performed_by.cloned(),
            details: details.into(),
            origin: origin.clone(),
            timestamp,
        }
    }

    /// Fixes the event as an entry whose id sorts after `last`.
    pub(crate) fn into_entry(self, last: Option<&TimestampId>) -> AuditEntry {
        AuditEntry {
            id: TimestampId::generate(last, self.timestamp),
            record_id: self.record_id,
            action: self.action,
            performed_by: self.performed_by,
            timestamp: self.timestamp,
            details: self.details,
            origin_address: self.origin.address,
            origin_agent: self.origin.agent,
        }
    }
}

/// One immutable, attributed event on a record.
///
/// `performed_by` is absent only for anonymous emergency access.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    id: TimestampId,
    record_id: RecordId,
    action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    performed_by: Option<ActorId>,
    timestamp: DateTime<Utc>,
    details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin_agent: Option<String>,
}

impl AuditEntry {
    pub fn id(&self) -> &TimestampId {
        &self.id
    }

    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    pub fn action(&self) -> AuditAction {
        self.action
    }

    pub fn performed_by(&self) -> Option<&ActorId> {
        self.performed_by.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn origin_address(&self) -> Option<&str> {
        self.origin_address.as_deref()
    }

    pub fn origin_agent(&self) -> Option<&str> {
        self.origin_agent.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::{actor, t0};

    #[test]
    fn entry_ids_follow_append_order() {
        let record_id = RecordId::new();
        let origin = Origin::default();
        let first = AuditEvent::new(
            record_id,
            AuditAction::Created,
            Some(&actor("doctor-a")),
            "created record",
            &origin,
            t0(),
        )
        .into_entry(None);
        let second = AuditEvent::new(
            record_id,
            AuditAction::Viewed,
            Some(&actor("doctor-a")),
            "viewed version 1",
            &origin,
            t0(),
        )
        .into_entry(Some(first.id()));

        assert!(second.id() > first.id());
        assert_eq!(second.timestamp(), t0());
    }

    #[test]
    fn serializes_actions_in_snake_case_and_omits_anonymous_actor() {
        let entry = AuditEvent::new(
            RecordId::new(),
            AuditAction::EmergencyAccessed,
            None,
            "emergency profile derived",
            &Origin::new(Some("203.0.113.9".into()), None),
            t0(),
        )
        .into_entry(None);

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["action"], "emergency_accessed");
        assert!(json.get("performed_by").is_none());
        assert_eq!(json["origin_address"], "203.0.113.9");

        let back: AuditEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }
}
