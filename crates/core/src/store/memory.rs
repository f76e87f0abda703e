//! In-process store. Each record lives in its own slot so only writers of the same record
//! contend; the outer map lock is held just long enough to find or insert a slot.

use super::{check_successor, check_version, lock_poisoned, RecordStore};
use crate::access::{AccessGrant, GrantRegistry};
use crate::audit::{AuditEntry, AuditEvent};
use crate::authorization::CommitGuard;
use crate::emergency::is_valid_token_id;
use crate::identity::ActorId;
use crate::payload::Snapshot;
use crate::record::{RecordId, VersionedRecord};
use crate::{RecordError, RecordResult};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

struct Slot<P> {
    record: VersionedRecord<P>,
    grants: GrantRegistry,
    audit: Vec<AuditEntry>,
}

impl<P> Slot<P> {
    fn push_audit(&mut self, event: AuditEvent) -> AuditEntry {
        let entry = event.into_entry(self.audit.last().map(AuditEntry::id));
        self.audit.push(entry.clone());
        entry
    }
}

pub struct MemoryStore<P> {
    slots: RwLock<HashMap<RecordId, Arc<Mutex<Slot<P>>>>>,
    consumed_tokens: Mutex<HashSet<String>>,
}

impl<P> Default for MemoryStore<P> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            consumed_tokens: Mutex::new(HashSet::new()),
        }
    }
}

impl<P> MemoryStore<P> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: RecordId) -> RecordResult<Arc<Mutex<Slot<P>>>> {
        let slots = self.slots.read().map_err(lock_poisoned)?;
        slots
            .get(&id)
            .cloned()
            .ok_or(RecordError::RecordNotFound(id))
    }

    fn with_slot<T>(
        &self,
        id: RecordId,
        f: impl FnOnce(&mut Slot<P>) -> RecordResult<T>,
    ) -> RecordResult<T> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().map_err(lock_poisoned)?;
        f(&mut guard)
    }
}

impl<P: Snapshot> RecordStore<P> for MemoryStore<P> {
    fn create(&self, record: &VersionedRecord<P>, audit: AuditEvent) -> RecordResult<()> {
        record.check_contiguity()?;
        let mut slots = self.slots.write().map_err(lock_poisoned)?;
        if slots.contains_key(&record.id()) {
            return Err(RecordError::InvalidInput(format!(
                "record {} already exists",
                record.id()
            )));
        }
        let mut slot = Slot {
            record: record.clone(),
            grants: GrantRegistry::new(record.id()),
            audit: Vec::new(),
        };
        slot.push_audit(audit);
        slots.insert(record.id(), Arc::new(Mutex::new(slot)));
        Ok(())
    }

    fn load(&self, id: RecordId) -> RecordResult<VersionedRecord<P>> {
        self.with_slot(id, |slot| Ok(slot.record.clone()))
    }

    fn save_update(
        &self,
        record: &VersionedRecord<P>,
        expected_version: u32,
        guard: &CommitGuard,
        audit: AuditEvent,
    ) -> RecordResult<()> {
        self.with_slot(record.id(), |slot| {
            guard.check(&slot.record, &slot.grants)?;
            check_version(&slot.record, expected_version)?;
            check_successor(&slot.record, record)?;
            slot.record = record.clone();
            slot.push_audit(audit);
            Ok(())
        })
    }

    fn save_invalidation(
        &self,
        record: &VersionedRecord<P>,
        expected_version: u32,
        guard: &CommitGuard,
        audit: AuditEvent,
    ) -> RecordResult<()> {
        self.with_slot(record.id(), |slot| {
            guard.check(&slot.record, &slot.grants)?;
            check_version(&slot.record, expected_version)?;
            slot.record = record.clone();
            slot.push_audit(audit);
            Ok(())
        })
    }

    fn load_grants(&self, id: RecordId) -> RecordResult<GrantRegistry> {
        self.with_slot(id, |slot| Ok(slot.grants.clone()))
    }

    fn put_grant(
        &self,
        grant: AccessGrant,
        guard: &CommitGuard,
        audit: AuditEvent,
    ) -> RecordResult<Option<AccessGrant>> {
        self.with_slot(grant.record_id, |slot| {
            guard.check(&slot.record, &slot.grants)?;
            let replaced = slot.grants.grant(grant)?;
            slot.push_audit(audit);
            Ok(replaced)
        })
    }

    fn remove_grant(
        &self,
        id: RecordId,
        grantee: &ActorId,
        guard: &CommitGuard,
        audit: AuditEvent,
    ) -> RecordResult<Option<AccessGrant>> {
        self.with_slot(id, |slot| {
            guard.check(&slot.record, &slot.grants)?;
            let removed = slot.grants.revoke(grantee);
            slot.push_audit(audit);
            Ok(removed)
        })
    }

    fn append_audit(&self, audit: AuditEvent) -> RecordResult<AuditEntry> {
        self.with_slot(audit.record_id, |slot| Ok(slot.push_audit(audit)))
    }

    fn audit_for_record(&self, id: RecordId) -> RecordResult<Vec<AuditEntry>> {
        self.with_slot(id, |slot| Ok(slot.audit.clone()))
    }

    fn records_for_patient(&self, patient_id: &ActorId) -> RecordResult<Vec<VersionedRecord<P>>> {
        let slots: Vec<_> = {
            let map = self.slots.read().map_err(lock_poisoned)?;
            map.values().cloned().collect()
        };
        let mut records = Vec::new();
        for slot in slots {
            let slot = slot.lock().map_err(lock_poisoned)?;
            if slot.record.patient_id() == patient_id {
                records.push(slot.record.head());
            }
        }
        Ok(records)
    }

    fn consume_token(&self, token_id: &str, _now: DateTime<Utc>) -> RecordResult<()> {
        if !is_valid_token_id(token_id) {
            return Err(RecordError::TokenRejected("malformed token id"));
        }
        let mut consumed = self.consumed_tokens.lock().map_err(lock_poisoned)?;
        if !consumed.insert(token_id.to_string()) {
            return Err(RecordError::TokenRejected("already redeemed"));
        }
        Ok(())
    }
}
