//! Record service: the operations callers use.
//!
//! [`RecordService`] ties the pieces together for one request at a time:
//!
//! 1. load the record from the store
//! 2. authorize the caller with [`crate::authorization::decide_with`]
//! 3. apply the change to the in-memory record
//! 4. persist the change together with its audit entry
//!
//! Step 4 hands the store a [`CommitGuard`] for the caller, which is checked again against the
//! record and grants the store holds under its lock. A revocation or invalidation that lands
//! between steps 2 and 4 makes the mutation fail with `Forbidden` or `RecordNotFound`.
//!
//! Updates and invalidations that lose a version race are retried from step 1, up to
//! [`CoreConfig::max_conflict_retries`] attempts, unless the caller pinned the version they
//! edited. A pinned stale version surfaces as a conflict straight away.
//!
//! Every successful read of record content and every mutation writes one audit entry. Denied
//! requests and listings do not.
//!
//! An emergency lookup writes one `emergency_accessed` entry on each record in the profile.
//! Audit entries always belong to a record, so a lookup that finds no eligible records writes
//! no entry at all. It is only logged.

use crate::access::{AccessGrant, AccessLevel, GrantRequest};
use crate::audit::{AuditAction, AuditEntry, AuditEvent};
use crate::authorization::{decide_with, CommitGuard, Decision, Operation};
use crate::config::CoreConfig;
use crate::constants::DEFAULT_GRANT_PURPOSE;
use crate::emergency::{
    derive_emergency_profile, open_token, seal_token, EmergencyProfile, EmergencyTokenClaims,
};
use crate::identity::{ActorId, Caller, Origin, Role};
use crate::payload::{EmergencyRelevant, Snapshot};
use crate::record::{
    NewRecord, RecordId, RecordUpdate, VersionSummary, VersionView, VersionedRecord,
};
use crate::store::RecordStore;
use crate::validation::validate_grant_expiry;
use crate::{RecordError, RecordResult};
use chrono::{DateTime, Utc};
use medrec_types::SingleLineText;
use p256::ecdsa::{SigningKey, VerifyingKey};
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Who is asking, from where, and at what time.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub caller: Caller,
    pub origin: Origin,
    pub now: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(caller: Caller, origin: Origin) -> Self {
        Self {
            caller,
            origin,
            now: Utc::now(),
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

/// A freshly sealed emergency token.
#[derive(Clone, Debug, Serialize)]
pub struct IssuedEmergencyToken {
    pub token: String,
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
}

pub struct RecordService<P, S> {
    cfg: Arc<CoreConfig>,
    store: S,
    _payload: PhantomData<fn() -> P>,
}

impl<P: Snapshot, S: RecordStore<P>> RecordService<P, S> {
    pub fn new(cfg: Arc<CoreConfig>, store: S) -> Self {
        Self {
            cfg,
            store,
            _payload: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn event(
        &self,
        ctx: &RequestContext,
        record_id: RecordId,
        action: AuditAction,
        details: impl Into<String>,
    ) -> AuditEvent {
        AuditEvent::new(
            record_id,
            action,
            Some(&ctx.caller.id),
            details,
            &ctx.origin,
            ctx.now,
        )
    }

    fn decide(
        &self,
        ctx: &RequestContext,
        operation: Operation,
        record: &VersionedRecord<P>,
    ) -> RecordResult<Decision> {
        decide_with(&ctx.caller, operation, record, ctx.now, || {
            self.store.load_grants(record.id())
        })
    }

    fn authorize(
        &self,
        ctx: &RequestContext,
        operation: Operation,
        record: &VersionedRecord<P>,
    ) -> RecordResult<AccessLevel> {
        self.decide(ctx, operation, record)?
            .require(&ctx.caller, operation)
    }

    fn commit_guard(&self, ctx: &RequestContext, operation: Operation) -> CommitGuard {
        CommitGuard::new(ctx.caller.clone(), operation, ctx.now)
    }

    /// Loads a record that has not been invalidated.
    fn load_active(&self, id: RecordId) -> RecordResult<VersionedRecord<P>> {
        let record = self.store.load(id)?;
        if !record.is_valid() {
            return Err(RecordError::RecordNotFound(id));
        }
        Ok(record)
    }

    fn with_conflict_retry<T>(
        &self,
        record_id: RecordId,
        pinned: bool,
        mut attempt: impl FnMut() -> RecordResult<T>,
    ) -> RecordResult<T> {
        let max_attempts = if pinned {
            1
        } else {
            self.cfg.max_conflict_retries()
        };
        let mut tries = 1;
        loop {
            match attempt() {
                Err(e) if e.is_retryable() && tries < max_attempts => {
                    tracing::warn!(
                        record_id = %record_id,
                        attempt = tries,
                        error = %e,
                        "version conflict, retrying against a fresh read"
                    );
                    tries += 1;
                }
                result => return result,
            }
        }
    }

    /// Creates version 1 of a record authored by the caller.
    pub fn create_record(
        &self,
        ctx: &RequestContext,
        new: NewRecord<P>,
    ) -> RecordResult<VersionedRecord<P>> {
        let role = ctx.caller.role;
        if !(role == Role::Admin || role.is_clinician()) {
            return Err(RecordError::forbidden(
                &ctx.caller.id,
                format!("role {role} cannot create records"),
            ));
        }

        let record = VersionedRecord::create(RecordId::new(), new, ctx.caller.id.clone(), ctx.now)?;
        let event = self.event(ctx, record.id(), AuditAction::Created, "version 1");
        self.store.create(&record, event)?;

        tracing::info!(record_id = %record.id(), author = %ctx.caller.id, "record created");
        Ok(record)
    }

    /// Applies a versioned update and returns the new live state.
    pub fn update_record(
        &self,
        ctx: &RequestContext,
        id: RecordId,
        update: RecordUpdate<P>,
    ) -> RecordResult<VersionedRecord<P>> {
        let pinned = update.expected_version.is_some();
        self.with_conflict_retry(id, pinned, || {
            let mut record = self.load_active(id)?;
            self.authorize(ctx, Operation::Write, &record)?;

            let expected = record.version();
            record.apply_update(update.clone(), &ctx.caller.id, ctx.now)?;

            let reason = update
                .change_reason
                .as_ref()
                .map_or("no reason given", |r| r.as_str());
            let details = format!("version {}: {reason}", record.version());
            let event = self.event(ctx, id, AuditAction::Updated, details);
            let guard = self.commit_guard(ctx, Operation::Write);
            self.store.save_update(&record, expected, &guard, event)?;

            tracing::info!(record_id = %id, version = record.version(), "record updated");
            Ok(record)
        })
    }

    /// The live record. Invalidated records are not found.
    pub fn get_record(
        &self,
        ctx: &RequestContext,
        id: RecordId,
    ) -> RecordResult<VersionedRecord<P>> {
        let record = self.load_active(id)?;
        self.authorize(ctx, Operation::Read, &record)?;
        tracing::debug!(record_id = %id, version = record.version(), "record read");
        self.store.append_audit(self.event(
            ctx,
            id,
            AuditAction::Viewed,
            format!("version {}", record.version()),
        ))?;
        Ok(record)
    }

    /// One version, live or historical. Works on invalidated records.
    pub fn get_version(
        &self,
        ctx: &RequestContext,
        id: RecordId,
        version: u32,
    ) -> RecordResult<VersionView<P>> {
        let record = self.store.load(id)?;
        self.authorize(ctx, Operation::Read, &record)?;
        let view = record.version_view(version)?;
        tracing::debug!(record_id = %id, version, "record version read");
        self.store.append_audit(self.event(
            ctx,
            id,
            AuditAction::Viewed,
            format!("version {version}"),
        ))?;
        Ok(view)
    }

    /// Ordered summary of versions `1..=current`. Works on invalidated records.
    pub fn history(&self, ctx: &RequestContext, id: RecordId) -> RecordResult<Vec<VersionSummary>> {
        let record = self.store.load(id)?;
        self.authorize(ctx, Operation::Read, &record)?;
        let summaries = record.version_summaries();
        tracing::debug!(record_id = %id, versions = summaries.len(), "version history read");
        self.store
            .append_audit(self.event(ctx, id, AuditAction::Viewed, "version history"))?;
        Ok(summaries)
    }

    /// Soft-deletes a record. Version and history are unchanged.
    pub fn invalidate(
        &self,
        ctx: &RequestContext,
        id: RecordId,
        reason: SingleLineText,
    ) -> RecordResult<VersionedRecord<P>> {
        self.with_conflict_retry(id, false, || {
            let mut record = self.load_active(id)?;
            self.authorize(ctx, Operation::Invalidate, &record)?;

            let version = record.version();
            record.invalidate(reason.clone(), &ctx.caller.id, ctx.now)?;
            let event = self.event(
                ctx,
                id,
                AuditAction::Updated,
                format!("invalidated: {reason}"),
            );
            let guard = self.commit_guard(ctx, Operation::Invalidate);
            self.store.save_invalidation(&record, version, &guard, event)?;

            tracing::info!(record_id = %id, "record invalidated");
            Ok(record)
        })
    }

    /// Creates or replaces the grant for `(record, grantee)`.
    pub fn grant_access(
        &self,
        ctx: &RequestContext,
        request: GrantRequest,
    ) -> RecordResult<AccessGrant> {
        let record = self.load_active(request.record_id)?;
        self.authorize(ctx, Operation::Share, &record)?;

        if request.grantee_id == ctx.caller.id {
            return Err(RecordError::InvalidInput(
                "cannot grant access to yourself".into(),
            ));
        }
        if &request.grantee_id == record.patient_id() || &request.grantee_id == record.author_id() {
            return Err(RecordError::InvalidInput(format!(
                "{} already has full access to this record",
                request.grantee_id
            )));
        }
        validate_grant_expiry(request.expires_at, ctx.now, self.cfg.max_grant_duration())?;

        let purpose = match request.purpose {
            Some(purpose) => purpose,
            None => SingleLineText::new(DEFAULT_GRANT_PURPOSE)?,
        };
        let grant = AccessGrant {
            record_id: record.id(),
            grantee_id: request.grantee_id,
            level: request.level,
            granted_by: ctx.caller.id.clone(),
            granted_at: ctx.now,
            expires_at: request.expires_at,
            purpose,
        };

        let expiry = grant
            .expires_at
            .map_or_else(|| "never".to_string(), |e| e.to_rfc3339());
        let details = format!(
            "{} access for {} ({}), expires {expiry}",
            grant.level, grant.grantee_id, grant.purpose
        );
        let event = self.event(ctx, record.id(), AuditAction::Shared, details);
        let guard = self.commit_guard(ctx, Operation::Share);
        let replaced = self.store.put_grant(grant.clone(), &guard, event)?;

        tracing::info!(
            record_id = %record.id(),
            grantee = %grant.grantee_id,
            level = %grant.level,
            replaced = replaced.is_some(),
            "access granted"
        );
        Ok(grant)
    }

    /// Removes the grantee's grant. Revoking a missing grant succeeds and is still audited.
    pub fn revoke_access(
        &self,
        ctx: &RequestContext,
        id: RecordId,
        grantee: &ActorId,
    ) -> RecordResult<Option<AccessGrant>> {
        let record = self.load_active(id)?;
        self.authorize(ctx, Operation::Share, &record)?;

        let event = self.event(
            ctx,
            id,
            AuditAction::Revoked,
            format!("access revoked for {grantee}"),
        );
        let guard = self.commit_guard(ctx, Operation::Share);
        let removed = self.store.remove_grant(id, grantee, &guard, event)?;
        tracing::info!(record_id = %id, %grantee, removed = removed.is_some(), "access revoked");
        Ok(removed)
    }

    /// Whether `grantee` holds an active grant of at least `required` at `now`.
    ///
    /// A pure query over grants; ownership and roles are not considered and nothing is audited.
    pub fn has_access(
        &self,
        id: RecordId,
        grantee: &ActorId,
        required: AccessLevel,
        now: DateTime<Utc>,
    ) -> RecordResult<bool> {
        Ok(self.store.load_grants(id)?.has_access(grantee, required, now))
    }

    /// The decision the caller would get for `operation`. Not audited.
    pub fn check_access(
        &self,
        ctx: &RequestContext,
        id: RecordId,
        operation: Operation,
    ) -> RecordResult<Decision> {
        let record = self.store.load(id)?;
        self.decide(ctx, operation, &record)
    }

    /// Active grants on a record. Requires full access.
    pub fn list_grants(&self, ctx: &RequestContext, id: RecordId) -> RecordResult<Vec<AccessGrant>> {
        let record = self.store.load(id)?;
        self.authorize(ctx, Operation::Share, &record)?;
        let registry = self.store.load_grants(id)?;
        Ok(registry
            .active_grants(ctx.now)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Valid records of `patient_id` the caller may read, most recently updated first.
    pub fn list_active_records(
        &self,
        ctx: &RequestContext,
        patient_id: &ActorId,
    ) -> RecordResult<Vec<VersionedRecord<P>>> {
        let mut visible = Vec::new();
        for record in self.store.records_for_patient(patient_id)? {
            if record.is_valid() && self.decide(ctx, Operation::Read, &record)?.is_allowed() {
                visible.push(record);
            }
        }
        visible.sort_by(|a, b| {
            b.updated_at()
                .cmp(&a.updated_at())
                .then_with(|| a.id().cmp(&b.id()))
        });
        Ok(visible)
    }

    /// The record's audit trail in append order. Works on invalidated records.
    pub fn audit_for_record(
        &self,
        ctx: &RequestContext,
        id: RecordId,
    ) -> RecordResult<Vec<AuditEntry>> {
        let record = self.store.load(id)?;
        self.authorize(ctx, Operation::Read, &record)?;
        self.store.audit_for_record(id)
    }

    /// Audit entries on every record whose subject is `user_id`, oldest first.
    ///
    /// Records are matched on their current patient at read time. Only the user themself or an
    /// admin may ask.
    pub fn audit_for_user(
        &self,
        ctx: &RequestContext,
        user_id: &ActorId,
    ) -> RecordResult<Vec<AuditEntry>> {
        if &ctx.caller.id != user_id && ctx.caller.role != Role::Admin {
            return Err(RecordError::forbidden(
                &ctx.caller.id,
                "audit trails of other users require the admin role",
            ));
        }

        let mut entries = Vec::new();
        for record in self.store.records_for_patient(user_id)? {
            entries.extend(self.store.audit_for_record(record.id())?);
        }
        entries.sort_by(|a, b| {
            a.timestamp()
                .cmp(&b.timestamp())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(entries)
    }
}

impl<P, S> RecordService<P, S>
where
    P: Snapshot + EmergencyRelevant,
    S: RecordStore<P>,
{
    fn derive_profile(
        &self,
        patient_id: &ActorId,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> RecordResult<EmergencyProfile> {
        let records = self.store.records_for_patient(patient_id)?;
        Ok(derive_emergency_profile(
            patient_id,
            &records,
            now,
            self.cfg.emergency_profile_limit(),
            ttl,
        ))
    }

    /// Writes one entry per projected record.
    fn audit_projection(
        &self,
        profile: &EmergencyProfile,
        action: AuditAction,
        performed_by: Option<&ActorId>,
        details: &str,
        origin: &Origin,
        now: DateTime<Utc>,
    ) -> RecordResult<()> {
        if profile.records.is_empty() {
            tracing::info!(patient = %profile.patient_id, "emergency profile has no eligible records");
        }
        for record_id in profile.record_ids() {
            self.store.append_audit(AuditEvent::new(
                record_id,
                action,
                performed_by,
                details,
                origin,
                now,
            ))?;
        }
        Ok(())
    }

    /// Emergency profile for a responder or admin. Not gated by per-record access.
    pub fn emergency_profile(
        &self,
        ctx: &RequestContext,
        patient_id: &ActorId,
    ) -> RecordResult<EmergencyProfile> {
        if !matches!(ctx.caller.role, Role::EmergencyResponder | Role::Admin) {
            return Err(RecordError::forbidden(
                &ctx.caller.id,
                "emergency profiles require the emergency_responder or admin role",
            ));
        }

        let profile = self.derive_profile(patient_id, ctx.now, self.cfg.emergency_token_ttl())?;
        self.audit_projection(
            &profile,
            AuditAction::EmergencyAccessed,
            Some(&ctx.caller.id),
            "emergency profile",
            &ctx.origin,
            ctx.now,
        )?;

        tracing::warn!(
            patient = %patient_id,
            caller = %ctx.caller.id,
            records = profile.records.len(),
            "emergency profile accessed"
        );
        Ok(profile)
    }

    /// Seals a single-use emergency token for the patient. Allowed for the patient or an admin.
    pub fn issue_emergency_token(
        &self,
        ctx: &RequestContext,
        patient_id: &ActorId,
        key: &SigningKey,
    ) -> RecordResult<IssuedEmergencyToken> {
        if &ctx.caller.id != patient_id && ctx.caller.role != Role::Admin {
            return Err(RecordError::forbidden(
                &ctx.caller.id,
                "emergency tokens are issued by the patient or an admin",
            ));
        }

        let profile = self.derive_profile(patient_id, ctx.now, self.cfg.emergency_token_ttl())?;
        let claims = EmergencyTokenClaims::new(profile);
        let token = seal_token(&claims, key)?;

        self.audit_projection(
            &claims.profile,
            AuditAction::Shared,
            Some(&ctx.caller.id),
            &format!(
                "emergency token {} issued, expires {}",
                claims.token_id,
                claims.expires_at.to_rfc3339()
            ),
            &ctx.origin,
            ctx.now,
        )?;

        tracing::info!(patient = %patient_id, token_id = %claims.token_id, "emergency token issued");
        Ok(IssuedEmergencyToken {
            token,
            token_id: claims.token_id,
            expires_at: claims.expires_at,
        })
    }

    /// Redeems a token once and returns a freshly derived profile.
    ///
    /// The profile embedded in the token is ignored. Audit entries carry no performer.
    pub fn redeem_emergency_token(
        &self,
        token: &str,
        key: &VerifyingKey,
        origin: &Origin,
        now: DateTime<Utc>,
    ) -> RecordResult<EmergencyProfile> {
        let claims = open_token(token, key, now)?;
        self.store.consume_token(&claims.token_id, now)?;

        let profile = self.derive_profile(&claims.patient_id, now, claims.expires_at - now)?;
        self.audit_projection(
            &profile,
            AuditAction::EmergencyAccessed,
            None,
            &format!("emergency token {}", claims.token_id),
            origin,
            now,
        )?;

        tracing::warn!(
            patient = %claims.patient_id,
            token_id = %claims.token_id,
            records = profile.records.len(),
            "emergency token redeemed"
        );
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::{AccessBasis, DenyReason};
    use crate::payload::tests::payload;
    use crate::payload::ClinicalPayload;
    use crate::record::tests::{actor, reason, t0};
    use crate::record::RecordStatus;
    use crate::store::MemoryStore;
    use chrono::Duration;
    use crate::store::tests::{admin_guard, event as store_event};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    type Service = RecordService<ClinicalPayload, MemoryStore<ClinicalPayload>>;

    fn service() -> Service {
        let cfg = CoreConfig::new("unused".into()).unwrap();
        RecordService::new(Arc::new(cfg), MemoryStore::new())
    }

    fn ctx(id: &str, role: Role, now: DateTime<Utc>) -> RequestContext {
        RequestContext::new(Caller::new(actor(id), role), Origin::default()).at(now)
    }

    fn doctor_a() -> RequestContext {
        ctx("doctor-a", Role::Doctor, t0())
    }

    fn create(service: &Service, diagnosis: &str) -> VersionedRecord<ClinicalPayload> {
        service
            .create_record(&doctor_a(), NewRecord::new(actor("patient-1"), payload(diagnosis)))
            .unwrap()
    }

    fn actions(entries: &[AuditEntry]) -> Vec<AuditAction> {
        entries.iter().map(|e| e.action()).collect()
    }

    #[test]
    fn hypertension_history_scenario() {
        let service = service();
        let record = create(&service, "Hypertension");
        let id = record.id();

        service
            .update_record(
                &doctor_a().at(t0() + Duration::days(7)),
                id,
                RecordUpdate::new(payload("Hypertension, dose increased"), reason("dose increase")),
            )
            .unwrap();
        let v3 = service
            .update_record(
                &doctor_a().at(t0() + Duration::days(14)),
                id,
                RecordUpdate::new(payload("Hypertension, lipids raised"), reason("lab results added")),
            )
            .unwrap();
        assert_eq!(v3.version(), 3);

        let trail = service.store().audit_for_record(id).unwrap();
        assert_eq!(
            actions(&trail),
            vec![AuditAction::Created, AuditAction::Updated, AuditAction::Updated]
        );
        assert_eq!(trail[2].details(), "version 3: lab results added");

        let v1 = service.get_version(&doctor_a(), id, 1).unwrap();
        assert_eq!(v1.payload.diagnosis.primary, "Hypertension");
        assert!(!v1.is_current);
        let current = service.get_version(&doctor_a(), id, 3).unwrap();
        assert_eq!(current.payload.diagnosis.primary, "Hypertension, lipids raised");
        assert!(current.is_current);
        assert!(matches!(
            service.get_version(&doctor_a(), id, 4),
            Err(RecordError::VersionNotFound { version: 4, .. })
        ));

        let history = service.history(&doctor_a(), id).unwrap();
        let versions: Vec<u32> = history.iter().map(|h| h.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(
            history[1].change_reason.as_ref().map(|r| r.as_str()),
            Some("dose increase")
        );

        let trail = service.store().audit_for_record(id).unwrap();
        assert_eq!(trail.len(), 6);
        assert!(trail[3..].iter().all(|e| e.action() == AuditAction::Viewed));
    }

    #[test]
    fn grant_expiry_scenario() {
        let service = service();
        let record = create(&service, "Asthma");
        let id = record.id();
        let doctor_b = actor("doctor-b");

        service
            .grant_access(
                &doctor_a(),
                GrantRequest {
                    record_id: id,
                    grantee_id: doctor_b.clone(),
                    level: AccessLevel::Write,
                    purpose: None,
                    expires_at: Some(t0() + Duration::hours(1)),
                },
            )
            .unwrap();

        let half_hour = t0() + Duration::minutes(30);
        let two_hours = t0() + Duration::hours(2);
        assert!(service.has_access(id, &doctor_b, AccessLevel::Write, half_hour).unwrap());
        assert!(service.has_access(id, &doctor_b, AccessLevel::Read, half_hour).unwrap());
        assert!(!service.has_access(id, &doctor_b, AccessLevel::Full, half_hour).unwrap());
        assert!(!service.has_access(id, &doctor_b, AccessLevel::Write, two_hours).unwrap());
        assert!(!service.has_access(id, &doctor_b, AccessLevel::Read, two_hours).unwrap());

        let late = ctx("doctor-b", Role::Doctor, two_hours);
        assert!(matches!(
            service.get_record(&late, id),
            Err(RecordError::Forbidden(_))
        ));

        let grants = service.list_grants(&doctor_a(), id).unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].purpose.as_str(), "unspecified");
    }

    #[test]
    fn concurrent_pinned_updates_produce_one_winner() {
        let service = service();
        let record = create(&service, "v1");
        let id = record.id();
        for n in 2..=3 {
            service
                .update_record(&doctor_a(), id, RecordUpdate::new(payload(&format!("v{n}")), None))
                .unwrap();
        }

        let barrier = Barrier::new(2);
        let results: Vec<RecordResult<VersionedRecord<ClinicalPayload>>> =
            std::thread::scope(|scope| {
                let handles: Vec<_> = ["first", "second"]
                    .into_iter()
                    .map(|label| {
                        let service = &service;
                        let barrier = &barrier;
                        scope.spawn(move || {
                            barrier.wait();
                            service.update_record(
                                &doctor_a(),
                                id,
                                RecordUpdate::new(payload(label), reason(label)).expecting(3),
                            )
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().expect("writer thread panicked"))
                    .collect()
            });

        let won: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(won.len(), 1);
        assert_eq!(won[0].version(), 4);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(e) if e.is_retryable()))
                .count(),
            1
        );

        let retried = service
            .update_record(&doctor_a(), id, RecordUpdate::new(payload("retry"), None).expecting(4))
            .unwrap();
        assert_eq!(retried.version(), 5);
        let versions: Vec<u32> = retried.history().iter().map(|s| s.version()).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    type Rival =
        Box<dyn Fn(&MemoryStore<ClinicalPayload>, RecordId) -> RecordResult<()> + Send + Sync>;

    /// Runs `rival` against the shared state right before each of the next `remaining` commits,
    /// as if another request had committed between authorization and persistence.
    struct InterleavingStore {
        inner: MemoryStore<ClinicalPayload>,
        rival: Rival,
        remaining: AtomicUsize,
    }

    impl InterleavingStore {
        fn interleave(&self, id: RecordId) -> RecordResult<()> {
            let due = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if due {
                (self.rival)(&self.inner, id)?;
            }
            Ok(())
        }
    }

    impl RecordStore<ClinicalPayload> for InterleavingStore {
        fn create(&self, r: &VersionedRecord<ClinicalPayload>, a: AuditEvent) -> RecordResult<()> {
            self.inner.create(r, a)
        }
        fn load(&self, id: RecordId) -> RecordResult<VersionedRecord<ClinicalPayload>> {
            self.inner.load(id)
        }
        fn save_update(
            &self,
            r: &VersionedRecord<ClinicalPayload>,
            expected: u32,
            guard: &CommitGuard,
            a: AuditEvent,
        ) -> RecordResult<()> {
            self.interleave(r.id())?;
            self.inner.save_update(r, expected, guard, a)
        }
        fn save_invalidation(
            &self,
            r: &VersionedRecord<ClinicalPayload>,
            v: u32,
            guard: &CommitGuard,
            a: AuditEvent,
        ) -> RecordResult<()> {
            self.interleave(r.id())?;
            self.inner.save_invalidation(r, v, guard, a)
        }
        fn load_grants(&self, id: RecordId) -> RecordResult<crate::access::GrantRegistry> {
            self.inner.load_grants(id)
        }
        fn put_grant(
            &self,
            g: AccessGrant,
            guard: &CommitGuard,
            a: AuditEvent,
        ) -> RecordResult<Option<AccessGrant>> {
            self.interleave(g.record_id)?;
            self.inner.put_grant(g, guard, a)
        }
        fn remove_grant(
            &self,
            id: RecordId,
            g: &ActorId,
            guard: &CommitGuard,
            a: AuditEvent,
        ) -> RecordResult<Option<AccessGrant>> {
            self.interleave(id)?;
            self.inner.remove_grant(id, g, guard, a)
        }
        fn append_audit(&self, a: AuditEvent) -> RecordResult<AuditEntry> {
            self.inner.append_audit(a)
        }
        fn audit_for_record(&self, id: RecordId) -> RecordResult<Vec<AuditEntry>> {
            self.inner.audit_for_record(id)
        }
        fn records_for_patient(
            &self,
            p: &ActorId,
        ) -> RecordResult<Vec<VersionedRecord<ClinicalPayload>>> {
            self.inner.records_for_patient(p)
        }
        fn consume_token(&self, t: &str, now: DateTime<Utc>) -> RecordResult<()> {
            self.inner.consume_token(t, now)
        }
    }

    fn interleaved_service(
        rival: impl Fn(&MemoryStore<ClinicalPayload>, RecordId) -> RecordResult<()>
            + Send
            + Sync
            + 'static,
        times: usize,
        retries: u32,
    ) -> RecordService<ClinicalPayload, InterleavingStore> {
        let cfg = CoreConfig::new("unused".into())
            .unwrap()
            .with_max_conflict_retries(retries)
            .unwrap();
        RecordService::new(
            Arc::new(cfg),
            InterleavingStore {
                inner: MemoryStore::new(),
                rival: Box::new(rival),
                remaining: AtomicUsize::new(times),
            },
        )
    }

    fn rival_update(store: &MemoryStore<ClinicalPayload>, id: RecordId) -> RecordResult<()> {
        let mut rival = store.load(id)?;
        let expected = rival.version();
        rival.apply_update(
            RecordUpdate::new(payload("rival"), reason("rival")),
            &actor("doctor-r"),
            t0(),
        )?;
        store.save_update(
            &rival,
            expected,
            &admin_guard(Operation::Write),
            store_event(id, AuditAction::Updated, "doctor-r", t0()),
        )
    }

    fn rival_invalidation(store: &MemoryStore<ClinicalPayload>, id: RecordId) -> RecordResult<()> {
        let mut rival = store.load(id)?;
        let version = rival.version();
        rival.invalidate(SingleLineText::new("entered in error")?, &actor("doctor-r"), t0())?;
        store.save_invalidation(
            &rival,
            version,
            &admin_guard(Operation::Invalidate),
            store_event(id, AuditAction::Updated, "doctor-r", t0()),
        )
    }

    fn rival_revocation(store: &MemoryStore<ClinicalPayload>, id: RecordId) -> RecordResult<()> {
        store
            .remove_grant(
                id,
                &actor("doctor-b"),
                &admin_guard(Operation::Share),
                store_event(id, AuditAction::Revoked, "doctor-a", t0()),
            )
            .map(|_| ())
    }

    #[test]
    fn unpinned_update_retries_after_losing_a_race() {
        let service = interleaved_service(rival_update, 1, 3);
        let record = service
            .create_record(&doctor_a(), NewRecord::new(actor("patient-1"), payload("v1")))
            .unwrap();

        let updated = service
            .update_record(&doctor_a(), record.id(), RecordUpdate::new(payload("mine"), None))
            .unwrap();

        assert_eq!(updated.version(), 3);
        assert_eq!(updated.history()[1].payload().diagnosis.primary, "rival");
        assert_eq!(updated.payload().diagnosis.primary, "mine");
    }

    #[test]
    fn retries_are_bounded() {
        let service = interleaved_service(rival_update, usize::MAX, 2);
        let record = service
            .create_record(&doctor_a(), NewRecord::new(actor("patient-1"), payload("v1")))
            .unwrap();

        let err = service
            .update_record(&doctor_a(), record.id(), RecordUpdate::new(payload("mine"), None))
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(service.store().load(record.id()).unwrap().version(), 3);
    }

    #[test]
    fn pinned_update_is_not_retried() {
        let service = interleaved_service(rival_update, 1, 3);
        let record = service
            .create_record(&doctor_a(), NewRecord::new(actor("patient-1"), payload("v1")))
            .unwrap();

        let err = service
            .update_record(
                &doctor_a(),
                record.id(),
                RecordUpdate::new(payload("mine"), None).expecting(1),
            )
            .unwrap_err();
        assert!(matches!(err, RecordError::VersionConflict { expected: 1, actual: 2, .. }));
    }

    #[test]
    fn grant_fails_if_the_record_is_invalidated_before_it_commits() {
        let service = interleaved_service(rival_invalidation, 1, 3);
        let record = service
            .create_record(&doctor_a(), NewRecord::new(actor("patient-1"), payload("Asthma")))
            .unwrap();
        let id = record.id();

        let err = service
            .grant_access(
                &doctor_a(),
                GrantRequest {
                    record_id: id,
                    grantee_id: actor("doctor-b"),
                    level: AccessLevel::Read,
                    purpose: None,
                    expires_at: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, RecordError::RecordNotFound(_)));

        let trail = service.store().audit_for_record(id).unwrap();
        assert_eq!(actions(&trail), vec![AuditAction::Created, AuditAction::Updated]);
        assert!(service.store().load_grants(id).unwrap().iter().next().is_none());
        assert!(!service.store().load(id).unwrap().is_valid());
    }

    #[test]
    fn update_fails_if_the_editors_grant_is_revoked_before_it_commits() {
        let service = interleaved_service(rival_revocation, 0, 3);
        let record = service
            .create_record(&doctor_a(), NewRecord::new(actor("patient-1"), payload("Asthma")))
            .unwrap();
        let id = record.id();
        service
            .grant_access(
                &doctor_a(),
                GrantRequest {
                    record_id: id,
                    grantee_id: actor("doctor-b"),
                    level: AccessLevel::Write,
                    purpose: None,
                    expires_at: None,
                },
            )
            .unwrap();
        service.store().remaining.store(1, Ordering::SeqCst);

        let err = service
            .update_record(
                &ctx("doctor-b", Role::Doctor, t0()),
                id,
                RecordUpdate::new(payload("Revised"), None),
            )
            .unwrap_err();
        assert!(matches!(err, RecordError::Forbidden(_)));

        let trail = service.store().audit_for_record(id).unwrap();
        assert_eq!(
            actions(&trail),
            vec![AuditAction::Created, AuditAction::Shared, AuditAction::Revoked]
        );
        assert_eq!(service.store().load(id).unwrap().version(), 1);
    }

    #[test]
    fn only_clinicians_and_admins_create() {
        let service = service();
        for role in [Role::Patient, Role::EmergencyResponder] {
            let err = service
                .create_record(
                    &ctx("someone", role, t0()),
                    NewRecord::new(actor("patient-1"), payload("Asthma")),
                )
                .unwrap_err();
            assert!(matches!(err, RecordError::Forbidden(_)));
        }
        let nurse = service
            .create_record(
                &ctx("nurse-1", Role::Nurse, t0()),
                NewRecord::new(actor("patient-1"), payload("Asthma")),
            )
            .unwrap();
        assert_eq!(nurse.author_id(), &actor("nurse-1"));
        assert_eq!(nurse.status(), RecordStatus::Completed);
    }

    #[test]
    fn missing_required_field_is_a_validation_error() {
        let service = service();
        let err = service
            .create_record(&doctor_a(), NewRecord::new(actor("patient-1"), payload(" ")))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }

    #[test]
    fn patient_reads_but_cannot_update() {
        let service = service();
        let record = create(&service, "Asthma");
        let patient = ctx("patient-1", Role::Patient, t0());

        service.get_record(&patient, record.id()).unwrap();
        let err = service
            .update_record(&patient, record.id(), RecordUpdate::new(payload("Cured"), None))
            .unwrap_err();
        assert!(matches!(err, RecordError::Forbidden(ref m) if m.contains("patient_cannot_author")));
        assert_eq!(
            service.check_access(&patient, record.id(), Operation::Share).unwrap(),
            Decision::Allow {
                level: AccessLevel::Full,
                basis: AccessBasis::RecordSubject
            }
        );
    }

    #[test]
    fn denied_requests_leave_no_audit_entry() {
        let service = service();
        let record = create(&service, "Asthma");
        let stranger = ctx("doctor-z", Role::Doctor, t0());

        assert!(service.get_record(&stranger, record.id()).is_err());
        assert_eq!(
            service.check_access(&stranger, record.id(), Operation::Read).unwrap(),
            Decision::Deny(DenyReason::NoGrant)
        );
        assert_eq!(service.store().audit_for_record(record.id()).unwrap().len(), 1);
    }

    #[test]
    fn grant_validation() {
        let service = service();
        let record = create(&service, "Asthma");
        let request = |grantee: &str, expires_at| GrantRequest {
            record_id: record.id(),
            grantee_id: actor(grantee),
            level: AccessLevel::Read,
            purpose: None,
            expires_at,
        };

        for bad in [
            request("doctor-a", None),
            request("patient-1", None),
            request("doctor-b", Some(t0())),
            request("doctor-b", Some(t0() + Duration::days(400))),
        ] {
            let err = service.grant_access(&doctor_a(), bad).unwrap_err();
            assert!(matches!(err, RecordError::InvalidInput(_)), "{err}");
        }

        let reader = ctx("doctor-b", Role::Doctor, t0());
        service
            .grant_access(&doctor_a(), request("doctor-b", None))
            .unwrap();
        let err = service
            .grant_access(&reader, request("nurse-1", None))
            .unwrap_err();
        assert!(matches!(err, RecordError::Forbidden(_)));
    }

    #[test]
    fn revoke_is_idempotent_and_audited() {
        let service = service();
        let record = create(&service, "Asthma");
        let doctor_b = actor("doctor-b");
        service
            .grant_access(
                &doctor_a(),
                GrantRequest {
                    record_id: record.id(),
                    grantee_id: doctor_b.clone(),
                    level: AccessLevel::Full,
                    purpose: reason("handover"),
                    expires_at: None,
                },
            )
            .unwrap();

        assert!(service
            .revoke_access(&doctor_a(), record.id(), &doctor_b)
            .unwrap()
            .is_some());
        assert!(service
            .revoke_access(&doctor_a(), record.id(), &doctor_b)
            .unwrap()
            .is_none());
        assert!(!service
            .has_access(record.id(), &doctor_b, AccessLevel::Read, t0())
            .unwrap());

        let trail = service.store().audit_for_record(record.id()).unwrap();
        assert_eq!(
            actions(&trail),
            vec![
                AuditAction::Created,
                AuditAction::Shared,
                AuditAction::Revoked,
                AuditAction::Revoked
            ]
        );
    }

    #[test]
    fn invalidated_records_leave_active_views_but_keep_history() {
        let service = service();
        let record = create(&service, "Wrong patient");
        let kept = create(&service, "Asthma");
        let id = record.id();

        service
            .invalidate(&doctor_a(), id, SingleLineText::new("entered in error").unwrap())
            .unwrap();

        assert!(matches!(
            service.get_record(&doctor_a(), id),
            Err(RecordError::RecordNotFound(_))
        ));
        assert!(matches!(
            service.update_record(&doctor_a(), id, RecordUpdate::new(payload("x"), None)),
            Err(RecordError::RecordNotFound(_))
        ));
        assert!(matches!(
            service.invalidate(&doctor_a(), id, SingleLineText::new("again").unwrap()),
            Err(RecordError::RecordNotFound(_))
        ));

        let view = service.get_version(&doctor_a(), id, 1).unwrap();
        assert_eq!(view.payload.diagnosis.primary, "Wrong patient");

        let active = service
            .list_active_records(&doctor_a(), &actor("patient-1"))
            .unwrap();
        assert_eq!(active.iter().map(|r| r.id()).collect::<Vec<_>>(), vec![kept.id()]);

        let trail = service.audit_for_record(&doctor_a(), id).unwrap();
        assert_eq!(trail[1].action(), AuditAction::Updated);
        assert_eq!(trail[1].details(), "invalidated: entered in error");
    }

    #[test]
    fn active_listing_respects_access() {
        let service = service();
        let mine = create(&service, "Asthma");
        let theirs = service
            .create_record(
                &ctx("doctor-c", Role::Doctor, t0() + Duration::hours(1)),
                NewRecord::new(actor("patient-1"), payload("Migraine")),
            )
            .unwrap();

        let listed = service
            .list_active_records(&doctor_a(), &actor("patient-1"))
            .unwrap();
        assert_eq!(listed.iter().map(|r| r.id()).collect::<Vec<_>>(), vec![mine.id()]);

        let patient = ctx("patient-1", Role::Patient, t0());
        let listed = service
            .list_active_records(&patient, &actor("patient-1"))
            .unwrap();
        assert_eq!(
            listed.iter().map(|r| r.id()).collect::<Vec<_>>(),
            vec![theirs.id(), mine.id()]
        );
    }

    #[test]
    fn audit_for_user_joins_on_patient() {
        let service = service();
        let first = create(&service, "Asthma");
        let second = create(&service, "Migraine");
        service
            .get_record(&doctor_a().at(t0() + Duration::minutes(5)), first.id())
            .unwrap();

        let patient = ctx("patient-1", Role::Patient, t0());
        let entries = service.audit_for_user(&patient, &actor("patient-1")).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries
            .iter()
            .all(|e| e.record_id() == first.id() || e.record_id() == second.id()));
        assert_eq!(entries[2].action(), AuditAction::Viewed);

        assert!(matches!(
            service.audit_for_user(&doctor_a(), &actor("patient-1")),
            Err(RecordError::Forbidden(_))
        ));
        let admin = ctx("admin-1", Role::Admin, t0());
        assert_eq!(
            service.audit_for_user(&admin, &actor("patient-1")).unwrap().len(),
            3
        );
    }

    fn flagged(service: &Service, diagnosis: &str) -> VersionedRecord<ClinicalPayload> {
        let mut new = NewRecord::new(actor("patient-1"), payload(diagnosis));
        new.emergency_accessible = true;
        service.create_record(&doctor_a(), new).unwrap()
    }

    #[test]
    fn emergency_profile_requires_responder_and_is_audited() {
        let service = service();
        let asthma = flagged(&service, "Asthma");
        let retired = flagged(&service, "Epilepsy");
        create(&service, "Private note");
        service
            .invalidate(&doctor_a(), retired.id(), SingleLineText::new("duplicate").unwrap())
            .unwrap();

        assert!(matches!(
            service.emergency_profile(&doctor_a(), &actor("patient-1")),
            Err(RecordError::Forbidden(_))
        ));

        let responder = ctx("medic-9", Role::EmergencyResponder, t0());
        let profile = service
            .emergency_profile(&responder, &actor("patient-1"))
            .unwrap();
        assert_eq!(profile.record_ids().collect::<Vec<_>>(), vec![asthma.id()]);

        let last = service
            .store()
            .audit_for_record(asthma.id())
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(last.action(), AuditAction::EmergencyAccessed);
        assert_eq!(last.performed_by(), Some(&actor("medic-9")));
    }

    #[test]
    fn emergency_lookup_without_eligible_records_writes_no_entry() {
        let service = service();
        let private = create(&service, "Private note");
        let responder = ctx("medic-9", Role::EmergencyResponder, t0());

        let profile = service
            .emergency_profile(&responder, &actor("patient-1"))
            .unwrap();
        assert!(profile.records.is_empty());
        let nobody = service
            .emergency_profile(&responder, &actor("patient-unknown"))
            .unwrap();
        assert!(nobody.records.is_empty());

        let trail = service.store().audit_for_record(private.id()).unwrap();
        assert_eq!(actions(&trail), vec![AuditAction::Created]);
    }

    #[test]
    fn emergency_tokens_redeem_once_with_fresh_data() {
        let service = service();
        let asthma = flagged(&service, "Asthma");
        let key = SigningKey::random(&mut rand::thread_rng());
        let patient = ctx("patient-1", Role::Patient, t0());

        assert!(matches!(
            service.issue_emergency_token(&doctor_a(), &actor("patient-1"), &key),
            Err(RecordError::Forbidden(_))
        ));
        let issued = service
            .issue_emergency_token(&patient, &actor("patient-1"), &key)
            .unwrap();
        assert_eq!(issued.expires_at, t0() + Duration::hours(24));

        // Invalidated after issue: the redeemed profile must not show it.
        service
            .invalidate(&doctor_a(), asthma.id(), SingleLineText::new("entered in error").unwrap())
            .unwrap();
        let later = flagged(&service, "Anaphylaxis");

        let redeemed = service
            .redeem_emergency_token(
                &issued.token,
                key.verifying_key(),
                &Origin::default(),
                t0() + Duration::hours(1),
            )
            .unwrap();
        assert_eq!(redeemed.record_ids().collect::<Vec<_>>(), vec![later.id()]);
        assert_eq!(redeemed.expires_at, issued.expires_at);

        let last = service
            .store()
            .audit_for_record(later.id())
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(last.action(), AuditAction::EmergencyAccessed);
        assert_eq!(last.performed_by(), None);

        assert!(matches!(
            service.redeem_emergency_token(
                &issued.token,
                key.verifying_key(),
                &Origin::default(),
                t0() + Duration::hours(2),
            ),
            Err(RecordError::TokenRejected("already redeemed"))
        ));
    }

    #[test]
    fn expired_token_is_rejected_without_consuming_it() {
        let service = service();
        flagged(&service, "Asthma");
        let key = SigningKey::random(&mut rand::thread_rng());
        let admin = ctx("admin-1", Role::Admin, t0());
        let issued = service
            .issue_emergency_token(&admin, &actor("patient-1"), &key)
            .unwrap();

        let err = service
            .redeem_emergency_token(
                &issued.token,
                key.verifying_key(),
                &Origin::default(),
                issued.expires_at,
            )
            .unwrap_err();
        assert!(matches!(err, RecordError::TokenRejected("expired")));
        assert_eq!(err.kind(), crate::ErrorKind::Authorization);
        service
            .store()
            .consume_token(&issued.token_id, t0())
            .unwrap();
    }
}
