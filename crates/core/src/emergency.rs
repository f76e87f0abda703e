//! Emergency profile derivation and sealed emergency tokens.
//!
//! The emergency profile is a reduced projection of a patient's most recent valid,
//! emergency-flagged records. It is computed from live records on every request and never
//! stored.
//!
//! ## Tokens
//!
//! For offline use (e.g. a printed or scannable code) the profile can be sealed into a token:
//!
//! - Claims: JSON of [`EmergencyTokenClaims`] (stable struct field order)
//! - Signature: ECDSA P-256 over the exact claim bytes, raw 64-byte `r || s`
//! - Token: `base64url(claims) "." base64url(signature)`, no padding
//!
//! The embedded profile is for the offline reader only. Redemption verifies the signature,
//! checks expiry against the caller's clock, consumes the token id once, and then derives a
//! fresh profile; embedded fields are never returned.

use crate::identity::ActorId;
use crate::payload::{BloodGroup, EmergencyRelevant};
use crate::record::{RecordId, VersionedRecord};
use crate::{RecordError, RecordResult};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One record as it appears in an emergency profile.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EmergencyRecordProjection {
    pub record_id: RecordId,
    pub version: u32,
    pub recorded_at: DateTime<Utc>,
    pub primary_diagnosis: String,
    #[serde(default)]
    pub current_medications: Vec<String>,
}

/// Patient-level summary merged across the selected records, most recent first.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EmergencySummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blood_group: Option<BloodGroup>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub chronic_conditions: Vec<String>,
    #[serde(default)]
    pub current_medications: Vec<String>,
    #[serde(default)]
    pub primary_diagnoses: Vec<String>,
}

/// Time-boxed emergency view of a patient.
///
/// `expires_at` is advisory for offline consumers; the core always re-derives.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EmergencyProfile {
    pub patient_id: ActorId,
    pub summary: EmergencySummary,
    pub records: Vec<EmergencyRecordProjection>,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl EmergencyProfile {
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn record_ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.records.iter().map(|r| r.record_id)
    }
}

/// Appends values not already present, ignoring case and surrounding whitespace.
fn merge_unique(target: &mut Vec<String>, values: impl IntoIterator<Item = String>) {
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !target.iter().any(|v| v.eq_ignore_ascii_case(trimmed)) {
            target.push(trimmed.to_string());
        }
    }
}

/// Derives the emergency profile for `patient_id` from `records`.
///
/// Only records of that patient which are valid and flagged emergency-accessible are used, most
/// recently updated first, at most `limit` of them. `limit` is clamped to
/// [`crate::constants::MAX_EMERGENCY_RECORDS`]. The blood group comes from the most recent
/// record that states one.
pub fn derive_emergency_profile<P: EmergencyRelevant>(
    patient_id: &ActorId,
    records: &[VersionedRecord<P>],
    now: DateTime<Utc>,
    limit: usize,
    ttl: Duration,
) -> EmergencyProfile {
    let limit = limit.min(crate::constants::MAX_EMERGENCY_RECORDS);

    let mut eligible: Vec<&VersionedRecord<P>> = records
        .iter()
        .filter(|r| r.patient_id() == patient_id && r.is_valid() && r.is_emergency_accessible())
        .collect();
    eligible.sort_by(|a, b| {
        b.updated_at()
            .cmp(&a.updated_at())
            .then_with(|| a.id().cmp(&b.id()))
    });
    eligible.truncate(limit);

    let mut summary = EmergencySummary::default();
    let mut projections = Vec::with_capacity(eligible.len());

    for record in eligible {
        let fields = record.payload().emergency_fields();

        if summary.blood_group.is_none() {
            summary.blood_group = fields.blood_group;
        }
        merge_unique(&mut summary.allergies, fields.allergies);
        merge_unique(&mut summary.chronic_conditions, fields.chronic_conditions);
        merge_unique(
            &mut summary.current_medications,
            fields.current_medications.iter().cloned(),
        );
        merge_unique(
            &mut summary.primary_diagnoses,
            std::iter::once(fields.primary_diagnosis.clone()),
        );

        projections.push(EmergencyRecordProjection {
            record_id: record.id(),
            version: record.version(),
            recorded_at: record.updated_at(),
            primary_diagnosis: fields.primary_diagnosis,
            current_medications: fields.current_medications,
        });
    }

    EmergencyProfile {
        patient_id: patient_id.clone(),
        summary,
        records: projections,
        generated_at: now,
        expires_at: now + ttl,
    }
}

/// Signed content of an emergency token.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EmergencyTokenClaims {
    /// Single-use identifier, 32 lowercase hex characters.
    pub token_id: String,
    pub patient_id: ActorId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Snapshot for offline readers. Never trusted on redemption.
    pub profile: EmergencyProfile,
}

impl EmergencyTokenClaims {
    pub fn new(profile: EmergencyProfile) -> Self {
        Self {
            token_id: new_token_id(),
            patient_id: profile.patient_id.clone(),
            issued_at: profile.generated_at,
            expires_at: profile.expires_at,
            profile,
        }
    }
}

fn new_token_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Token ids double as marker filenames, so only the generated shape is accepted.
pub fn is_valid_token_id(token_id: &str) -> bool {
    token_id.len() == 32
        && token_id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Signs `claims` into a compact token string.
pub fn seal_token(claims: &EmergencyTokenClaims, key: &SigningKey) -> RecordResult<String> {
    let claims_json = serde_json::to_vec(claims).map_err(RecordError::TokenEncoding)?;
    let signature: Signature = key.sign(&claims_json);

    Ok(format!(
        "{}.{}",
        general_purpose::URL_SAFE_NO_PAD.encode(&claims_json),
        general_purpose::URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// Verifies a token and returns its claims if it has not expired at `now`.
///
/// Single-use enforcement is the store's job; see `RecordStore::consume_token`.
pub fn open_token(
    token: &str,
    key: &VerifyingKey,
    now: DateTime<Utc>,
) -> RecordResult<EmergencyTokenClaims> {
    let (claims_part, signature_part) = token
        .trim()
        .split_once('.')
        .ok_or(RecordError::TokenRejected("malformed token"))?;

    let claims_json = general_purpose::URL_SAFE_NO_PAD
        .decode(claims_part)
        .map_err(|_| RecordError::TokenRejected("malformed token"))?;
    let signature_bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(signature_part)
        .map_err(|_| RecordError::TokenRejected("malformed token"))?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|_| RecordError::TokenRejected("malformed signature"))?;

    key.verify(&claims_json, &signature)
        .map_err(|_| RecordError::TokenRejected("signature mismatch"))?;

    let claims: EmergencyTokenClaims = serde_json::from_slice(&claims_json)
        .map_err(|_| RecordError::TokenRejected("malformed claims"))?;
    if !is_valid_token_id(&claims.token_id) {
        return Err(RecordError::TokenRejected("malformed token id"));
    }
    if now >= claims.expires_at {
        return Err(RecordError::TokenRejected("expired"));
    }

    Ok(claims)
}

/// Resolves key material given inline, as a file path, or base64-encoded.
///
/// Accepted forms, tried in order:
/// 1. a PEM string (contains `-----BEGIN`)
/// 2. a path to a PEM file
/// 3. base64 of a PEM string
fn load_pem(source: &str) -> RecordResult<String> {
    let source = source.trim();
    if source.contains("-----BEGIN") {
        Ok(source.to_string())
    } else if Path::new(source).exists() {
        fs::read_to_string(source).map_err(|e| RecordError::KeyParse(e.to_string()))
    } else {
        let decoded = general_purpose::STANDARD
            .decode(source)
            .map_err(|e| RecordError::KeyParse(e.to_string()))?;
        String::from_utf8(decoded).map_err(|e| RecordError::KeyParse(e.to_string()))
    }
}

/// Loads a PKCS#8 P-256 signing key.
pub fn signing_key_from_pem(source: &str) -> RecordResult<SigningKey> {
    let pem = load_pem(source)?;
    SigningKey::from_pkcs8_pem(&pem).map_err(|e| RecordError::KeyParse(e.to_string()))
}

/// Loads an SPKI P-256 public key.
pub fn verifying_key_from_pem(source: &str) -> RecordResult<VerifyingKey> {
    let pem = load_pem(source)?;
    VerifyingKey::from_public_key_pem(&pem).map_err(|e| RecordError::KeyParse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::tests::payload;
    use crate::payload::{ClinicalPayload, Medication, Treatment};
    use crate::record::tests::{actor, reason, t0};
    use crate::record::{NewRecord, RecordUpdate};
    use medrec_types::SingleLineText;
    use p256::pkcs8::{EncodePrivateKey, EncodePublicKey};

    fn emergency_record(
        patient: &str,
        diagnosis: &str,
        at: DateTime<Utc>,
    ) -> VersionedRecord<ClinicalPayload> {
        let mut p = payload(diagnosis);
        p.allergies = vec!["Penicillin".into()];
        p.blood_group = Some(BloodGroup::ONegative);
        let mut new = NewRecord::new(actor(patient), p);
        new.emergency_accessible = true;
        VersionedRecord::create(RecordId::new(), new, actor("doctor-a"), at).unwrap()
    }

    fn profile_for(records: &[VersionedRecord<ClinicalPayload>], limit: usize) -> EmergencyProfile {
        derive_emergency_profile(&actor("patient-1"), records, t0(), limit, Duration::hours(24))
    }

    #[test]
    fn invalidated_records_never_appear() {
        let mut stale = emergency_record("patient-1", "Epilepsy", t0());
        stale
            .invalidate(SingleLineText::new("wrong patient").unwrap(), &actor("doctor-a"), t0())
            .unwrap();
        let live = emergency_record("patient-1", "Asthma", t0());

        let profile = profile_for(&[stale.clone(), live.clone()], 5);

        assert_eq!(profile.record_ids().collect::<Vec<_>>(), vec![live.id()]);
        assert_eq!(profile.summary.primary_diagnoses, vec!["Asthma".to_string()]);
    }

    #[test]
    fn only_flagged_records_of_the_patient_are_used() {
        let flagged = emergency_record("patient-1", "Asthma", t0());
        let unflagged = VersionedRecord::create(
            RecordId::new(),
            NewRecord::new(actor("patient-1"), payload("Migraine")),
            actor("doctor-a"),
            t0(),
        )
        .unwrap();
        let other_patient = emergency_record("patient-2", "Diabetes", t0());

        let profile = profile_for(&[flagged.clone(), unflagged, other_patient], 5);

        assert_eq!(profile.records.len(), 1);
        assert_eq!(profile.records[0].record_id, flagged.id());
    }

    #[test]
    fn most_recent_first_and_limited() {
        let records: Vec<_> = (0..7)
            .map(|i| emergency_record("patient-1", &format!("Dx {i}"), t0() + Duration::days(i)))
            .collect();

        let profile = profile_for(&records, 3);
        let diagnoses: Vec<_> = profile
            .records
            .iter()
            .map(|r| r.primary_diagnosis.as_str())
            .collect();
        assert_eq!(diagnoses, vec!["Dx 6", "Dx 5", "Dx 4"]);

        let clamped = profile_for(&records, 50);
        assert_eq!(clamped.records.len(), crate::constants::MAX_EMERGENCY_RECORDS);
    }

    #[test]
    fn summary_merges_without_duplicates() {
        let older = emergency_record("patient-1", "Asthma", t0());
        let mut newer = emergency_record("patient-1", "Hypertension", t0() + Duration::days(1));
        let mut p = newer.payload().clone();
        p.allergies = vec!["penicillin".into(), "Latex".into()];
        p.blood_group = None;
        p.treatment = Some(Treatment {
            medications: vec![Medication {
                name: "Amlodipine".into(),
                dosage: Some("5mg".into()),
                ..Medication::default()
            }],
            ..Treatment::default()
        });
        newer
            .apply_update(
                RecordUpdate::new(p, reason("medication started")),
                &actor("doctor-a"),
                t0() + Duration::days(1),
            )
            .unwrap();

        let profile = profile_for(&[older, newer], 5);

        assert_eq!(profile.summary.blood_group, Some(BloodGroup::ONegative));
        assert_eq!(profile.summary.allergies, vec!["penicillin", "Latex"]);
        assert_eq!(profile.summary.current_medications, vec!["Amlodipine 5mg"]);
        assert_eq!(
            profile.summary.primary_diagnoses,
            vec!["Hypertension", "Asthma"]
        );
    }

    #[test]
    fn profile_expiry_is_advisory_window() {
        let profile = profile_for(&[], 5);

        assert!(profile.records.is_empty());
        assert!(profile.is_fresh_at(t0() + Duration::hours(23)));
        assert!(!profile.is_fresh_at(t0() + Duration::hours(24)));
    }

    fn sealed(key: &SigningKey) -> (EmergencyTokenClaims, String) {
        let claims = EmergencyTokenClaims::new(profile_for(
            &[emergency_record("patient-1", "Asthma", t0())],
            5,
        ));
        let token = seal_token(&claims, key).unwrap();
        (claims, token)
    }

    #[test]
    fn token_round_trip_before_expiry() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let (claims, token) = sealed(&key);

        let opened = open_token(&token, key.verifying_key(), t0()).unwrap();
        assert_eq!(opened, claims);
        assert!(is_valid_token_id(&opened.token_id));
    }

    #[test]
    fn token_rejected_after_expiry() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let (claims, token) = sealed(&key);

        let err = open_token(&token, key.verifying_key(), claims.expires_at).unwrap_err();
        assert!(matches!(err, RecordError::TokenRejected("expired")));
    }

    #[test]
    fn tampered_or_foreign_tokens_are_rejected() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let other = SigningKey::random(&mut rand::thread_rng());
        let (mut claims, token) = sealed(&key);

        let err = open_token(&token, other.verifying_key(), t0()).unwrap_err();
        assert!(matches!(err, RecordError::TokenRejected("signature mismatch")));

        claims.expires_at += Duration::days(365);
        let forged_claims = general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&claims).unwrap());
        let (_, signature) = token.split_once('.').unwrap();
        let forged = format!("{forged_claims}.{signature}");
        let err = open_token(&forged, key.verifying_key(), t0()).unwrap_err();
        assert!(matches!(err, RecordError::TokenRejected("signature mismatch")));

        assert!(matches!(
            open_token("not-a-token", key.verifying_key(), t0()),
            Err(RecordError::TokenRejected("malformed token"))
        ));
    }

    #[test]
    fn keys_load_from_pem_and_base64() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let private_pem = key
            .to_pkcs8_pem(p256::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        let public_pem = key
            .verifying_key()
            .to_public_key_pem(p256::pkcs8::LineEnding::LF)
            .unwrap();

        let loaded = signing_key_from_pem(&private_pem).unwrap();
        assert_eq!(loaded.verifying_key(), key.verifying_key());

        let encoded = general_purpose::STANDARD.encode(private_pem.as_bytes());
        let loaded = signing_key_from_pem(&encoded).unwrap();
        assert_eq!(loaded.verifying_key(), key.verifying_key());

        let verifying = verifying_key_from_pem(&public_pem).unwrap();
        assert_eq!(&verifying, key.verifying_key());

        assert!(matches!(
            signing_key_from_pem("definitely not a key"),
            Err(RecordError::KeyParse(_))
        ));
    }
}
