//! File-backed store with a git ledger per record.
//!
//! ## Layout
//!
//! ```text
//! <record_data_dir>/
//!   records/<s1>/<s2>/<uuid>/        one git repository per record
//!     record.json                    live state, without history
//!     history/v000001.json ...       one full snapshot per superseded version
//!     grants.json                    active and expired grants, keyed by grantee
//!     audit.jsonl                    one audit entry per line, append order
//!   emergency_tokens/<token_id>      consumed token markers
//! ```
//!
//! `s1`/`s2` are the first four hex characters of the record id.
//!
//! Mutations of one record are serialized by an in-process lock per record id. A lock lives in
//! the lock map only while some caller holds or waits for it. Stores in different processes
//! pointing at the same directory are not coordinated.

use super::ledger::{FileToWrite, Ledger, LedgerAction, LedgerDomain, LedgerMessage};
use super::{check_successor, check_version, lock_poisoned, RecordStore};
use crate::access::{AccessGrant, GrantRegistry};
use crate::audit::{AuditEntry, AuditEvent};
use crate::authorization::CommitGuard;
use crate::config::CoreConfig;
use crate::constants::{
    history_filename, AUDIT_LOG_FILENAME, GRANTS_JSON_FILENAME, HISTORY_DIR_NAME,
    RECORD_JSON_FILENAME,
};
use crate::emergency::is_valid_token_id;
use crate::identity::ActorId;
use crate::payload::Snapshot;
use crate::record::{RecordId, VersionSnapshot, VersionedRecord};
use crate::{RecordError, RecordResult};
use chrono::{DateTime, Utc};
use medrec_uuid::{ShardableUuid, TimestampId};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// An owned file change, borrowed into [`FileToWrite`] at commit time.
struct PendingFile {
    relative_path: PathBuf,
    content: String,
    old_content: Option<String>,
}

pub struct FileStore<P> {
    cfg: Arc<CoreConfig>,
    locks: Mutex<HashMap<RecordId, Arc<Mutex<()>>>>,
    _payload: PhantomData<fn() -> P>,
}

impl<P: Snapshot> FileStore<P> {
    pub fn new(cfg: Arc<CoreConfig>) -> Self {
        Self {
            cfg,
            locks: Mutex::new(HashMap::new()),
            _payload: PhantomData,
        }
    }

    pub fn record_dir(&self, id: RecordId) -> PathBuf {
        id.sharded_dir(&self.cfg.records_dir())
    }

    fn record_lock(&self, id: RecordId) -> RecordResult<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock().map_err(lock_poisoned)?;
        Ok(Arc::clone(locks.entry(id).or_default()))
    }

    /// Drops the map's entry for `id` once `lock` is its last outside reference.
    ///
    /// Clones are only handed out under the map lock, so a count of two (map plus `lock`)
    /// observed under that lock means nobody else holds or waits for the record.
    fn release_lock(&self, id: RecordId, lock: Arc<Mutex<()>>) {
        match self.locks.lock() {
            Ok(mut locks) => {
                if Arc::strong_count(&lock) == 2 {
                    locks.remove(&id);
                }
            }
            Err(_) => tracing::warn!(record_id = %id, "record lock map poisoned"),
        }
    }

    fn with_record_lock<T>(
        &self,
        id: RecordId,
        f: impl FnOnce() -> RecordResult<T>,
    ) -> RecordResult<T> {
        let lock = self.record_lock(id)?;
        let result = match lock.lock() {
            Ok(_guard) => f(),
            Err(e) => Err(lock_poisoned(e)),
        };
        self.release_lock(id, lock);
        result
    }

    /// Runs `f` holding the record's lock, after checking the record exists.
    fn locked<T>(
        &self,
        id: RecordId,
        f: impl FnOnce(&Path, VersionedRecord<P>) -> RecordResult<T>,
    ) -> RecordResult<T> {
        self.with_record_lock(id, || {
            let dir = self.record_dir(id);
            let head = read_head(&dir, id)?;
            f(&dir, head)
        })
    }

    fn message(
        &self,
        domain: LedgerDomain,
        action: LedgerAction,
        summary: impl AsRef<str>,
        audit: &AuditEvent,
        record_version: u32,
    ) -> RecordResult<LedgerMessage> {
        Ok(LedgerMessage::new(
            domain,
            action,
            summary,
            self.cfg.care_location(),
            record_version,
        )?
        .by(audit.performed_by.as_ref()))
    }
}

fn read_optional(path: &Path) -> RecordResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
        Err(e) => Err(RecordError::FileRead(e)),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> RecordResult<String> {
    serde_json::to_string_pretty(value).map_err(RecordError::Serialization)
}

fn read_head<P: Snapshot>(dir: &Path, id: RecordId) -> RecordResult<VersionedRecord<P>> {
    let contents =
        read_optional(&dir.join(RECORD_JSON_FILENAME))?.ok_or(RecordError::RecordNotFound(id))?;
    let head: VersionedRecord<P> =
        serde_json::from_str(&contents).map_err(RecordError::Deserialization)?;
    if head.id() != id {
        return Err(RecordError::CorruptHistory {
            record_id: id,
            detail: format!("record.json holds record {}", head.id()),
        });
    }
    Ok(head)
}

fn read_history<P: Snapshot>(
    dir: &Path,
    head: &VersionedRecord<P>,
) -> RecordResult<Vec<VersionSnapshot<P>>> {
    let history_dir = dir.join(HISTORY_DIR_NAME);
    (1..head.version())
        .map(|version| {
            let contents = read_optional(&history_dir.join(history_filename(version)))?
                .ok_or_else(|| RecordError::CorruptHistory {
                    record_id: head.id(),
                    detail: format!("snapshot for version {version} is missing"),
                })?;
            serde_json::from_str(&contents).map_err(RecordError::Deserialization)
        })
        .collect()
}

fn read_grants(dir: &Path, id: RecordId) -> RecordResult<(GrantRegistry, Option<String>)> {
    let raw = read_optional(&dir.join(GRANTS_JSON_FILENAME))?;
    let grants: Vec<AccessGrant> = match &raw {
        Some(contents) => serde_json::from_str(contents).map_err(RecordError::Deserialization)?,
        None => Vec::new(),
    };
    Ok((GrantRegistry::from_grants(id, grants)?, raw))
}

fn parse_audit(raw: &str) -> RecordResult<Vec<AuditEntry>> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(RecordError::Deserialization))
        .collect()
}

/// Builds the audit file change for `event`, allocating an id after the last entry on disk.
fn audit_file(dir: &Path, event: AuditEvent) -> RecordResult<(PendingFile, AuditEntry)> {
    let old = read_optional(&dir.join(AUDIT_LOG_FILENAME))?;
    let last: Option<TimestampId> = match old.as_deref().and_then(|raw| raw.lines().last()) {
        Some(line) => Some(
            serde_json::from_str::<AuditEntry>(line)
                .map_err(RecordError::Deserialization)?
                .id()
                .clone(),
        ),
        None => None,
    };
    let entry = event.into_entry(last.as_ref());

    let mut content = old.clone().unwrap_or_default();
    content.push_str(&serde_json::to_string(&entry).map_err(RecordError::Serialization)?);
    content.push('\n');

    Ok((
        PendingFile {
            relative_path: PathBuf::from(AUDIT_LOG_FILENAME),
            content,
            old_content: old,
        },
        entry,
    ))
}

fn head_file<P: Snapshot>(
    dir: &Path,
    record: &VersionedRecord<P>,
) -> RecordResult<PendingFile> {
    Ok(PendingFile {
        relative_path: PathBuf::from(RECORD_JSON_FILENAME),
        content: to_json(&record.head())?,
        old_content: read_optional(&dir.join(RECORD_JSON_FILENAME))?,
    })
}

fn snapshot_file<P: Snapshot>(
    dir: &Path,
    record_id: RecordId,
    snapshot: &VersionSnapshot<P>,
) -> RecordResult<PendingFile> {
    let relative_path = Path::new(HISTORY_DIR_NAME).join(history_filename(snapshot.version()));
    if dir.join(&relative_path).exists() {
        return Err(RecordError::CorruptHistory {
            record_id,
            detail: format!("snapshot for version {} already exists", snapshot.version()),
        });
    }
    Ok(PendingFile {
        relative_path,
        content: to_json(snapshot)?,
        old_content: None,
    })
}

fn grants_file(registry: &GrantRegistry, old: Option<String>) -> RecordResult<PendingFile> {
    let grants: Vec<&AccessGrant> = registry.iter().collect();
    Ok(PendingFile {
        relative_path: PathBuf::from(GRANTS_JSON_FILENAME),
        content: to_json(&grants)?,
        old_content: old,
    })
}

fn as_writes(files: &[PendingFile]) -> Vec<FileToWrite<'_>> {
    files
        .iter()
        .map(|f| FileToWrite {
            relative_path: &f.relative_path,
            content: &f.content,
            old_content: f.old_content.as_deref(),
        })
        .collect()
}

impl<P: Snapshot> RecordStore<P> for FileStore<P> {
    fn create(&self, record: &VersionedRecord<P>, audit: AuditEvent) -> RecordResult<()> {
        record.check_contiguity()?;
        let id = record.id();
        self.with_record_lock(id, || {
            let dir = self.record_dir(id);
            if dir.exists() {
                return Err(RecordError::InvalidInput(format!(
                    "record {id} already exists"
                )));
            }
            if let Some(parent) = dir.parent() {
                fs::create_dir_all(parent).map_err(RecordError::RecordDirCreation)?;
            }

            let message = self.message(
                LedgerDomain::Record,
                LedgerAction::Create,
                format!("version {}", record.version()),
                &audit,
                record.version(),
            )?;
            // Snapshots first and the live state last, so a reader never sees a head whose
            // history is not on disk yet.
            let mut files = record
                .history()
                .iter()
                .map(|s| snapshot_file(&dir, id, s))
                .collect::<RecordResult<Vec<_>>>()?;
            files.push(PendingFile {
                relative_path: PathBuf::from(AUDIT_LOG_FILENAME),
                content: format!(
                    "{}\n",
                    serde_json::to_string(&audit.into_entry(None))
                        .map_err(RecordError::Serialization)?
                ),
                old_content: None,
            });
            files.push(PendingFile {
                relative_path: PathBuf::from(RECORD_JSON_FILENAME),
                content: to_json(&record.head())?,
                old_content: None,
            });

            Ledger::init_and_commit(&dir, &message, &as_writes(&files))?;
            tracing::debug!(record_id = %id, "record directory created");
            Ok(())
        })
    }

    fn load(&self, id: RecordId) -> RecordResult<VersionedRecord<P>> {
        let dir = self.record_dir(id);
        let head = read_head::<P>(&dir, id)?;
        let history = read_history(&dir, &head)?;
        head.with_history(history)
    }

    fn save_update(
        &self,
        record: &VersionedRecord<P>,
        expected_version: u32,
        guard: &CommitGuard,
        audit: AuditEvent,
    ) -> RecordResult<()> {
        self.locked(record.id(), |dir, stored| {
            guard.check(&stored, &read_grants(dir, stored.id())?.0)?;
            check_version(&stored, expected_version)?;
            check_successor(&stored, record)?;
            let superseded = record.snapshot(expected_version).ok_or_else(|| {
                RecordError::CorruptHistory {
                    record_id: record.id(),
                    detail: format!("update carries no snapshot of version {expected_version}"),
                }
            })?;

            let message = self.message(
                LedgerDomain::Record,
                LedgerAction::Update,
                format!("version {}", record.version()),
                &audit,
                record.version(),
            )?;
            let (audit_file, _) = audit_file(dir, audit)?;
            let files = vec![
                snapshot_file(dir, record.id(), superseded)?,
                audit_file,
                head_file(dir, record)?,
            ];
            Ledger::write_and_commit_files(dir, &message, &as_writes(&files))?;
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
        self.locked(record.id(), |dir, stored| {
            guard.check(&stored, &read_grants(dir, stored.id())?.0)?;
            check_version(&stored, expected_version)?;
            if record.version() != expected_version || record.is_valid() {
                return Err(RecordError::InvalidInput(
                    "an invalidation must keep the version and clear validity".into(),
                ));
            }

            let message = self.message(
                LedgerDomain::Record,
                LedgerAction::Invalidate,
                format!("version {}", record.version()),
                &audit,
                record.version(),
            )?;
            let (audit_file, _) = audit_file(dir, audit)?;
            let files = vec![audit_file, head_file(dir, record)?];
            Ledger::write_and_commit_files(dir, &message, &as_writes(&files))?;
            Ok(())
        })
    }

    fn load_grants(&self, id: RecordId) -> RecordResult<GrantRegistry> {
        let dir = self.record_dir(id);
        if !dir.join(RECORD_JSON_FILENAME).is_file() {
            return Err(RecordError::RecordNotFound(id));
        }
        Ok(read_grants(&dir, id)?.0)
    }

    fn put_grant(
        &self,
        grant: AccessGrant,
        guard: &CommitGuard,
        audit: AuditEvent,
    ) -> RecordResult<Option<AccessGrant>> {
        self.locked(grant.record_id, |dir, stored| {
            let (mut registry, old) = read_grants(dir, stored.id())?;
            guard.check(&stored, &registry)?;
            let message = self.message(
                LedgerDomain::Access,
                LedgerAction::Grant,
                format!("grant {}", grant.level),
                &audit,
                stored.version(),
            )?;
            let replaced = registry.grant(grant)?;

            let (audit_file, _) = audit_file(dir, audit)?;
            let files = vec![grants_file(&registry, old)?, audit_file];
            Ledger::write_and_commit_files(dir, &message, &as_writes(&files))?;
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
        self.locked(id, |dir, stored| {
            let (mut registry, old) = read_grants(dir, id)?;
            guard.check(&stored, &registry)?;
            let removed = registry.revoke(grantee);
            let message = self.message(
                LedgerDomain::Access,
                LedgerAction::Revoke,
                if removed.is_some() {
                    "revoke grant"
                } else {
                    "revoke without active grant"
                },
                &audit,
                stored.version(),
            )?;

            let (audit_file, _) = audit_file(dir, audit)?;
            let mut files = vec![audit_file];
            if removed.is_some() {
                files.insert(0, grants_file(&registry, old)?);
            }
            Ledger::write_and_commit_files(dir, &message, &as_writes(&files))?;
            Ok(removed)
        })
    }

    fn append_audit(&self, audit: AuditEvent) -> RecordResult<AuditEntry> {
        self.locked(audit.record_id, |dir, stored| {
            let message = self.message(
                LedgerDomain::Audit,
                LedgerAction::Append,
                audit.action.as_str(),
                &audit,
                stored.version(),
            )?;
            let (audit_file, entry) = audit_file(dir, audit)?;
            Ledger::write_and_commit_files(dir, &message, &as_writes(&[audit_file]))?;
            Ok(entry)
        })
    }

    fn audit_for_record(&self, id: RecordId) -> RecordResult<Vec<AuditEntry>> {
        let dir = self.record_dir(id);
        if !dir.join(RECORD_JSON_FILENAME).is_file() {
            return Err(RecordError::RecordNotFound(id));
        }
        match read_optional(&dir.join(AUDIT_LOG_FILENAME))? {
            Some(raw) => parse_audit(&raw),
            None => Ok(Vec::new()),
        }
    }

    fn records_for_patient(&self, patient_id: &ActorId) -> RecordResult<Vec<VersionedRecord<P>>> {
        let mut records = Vec::new();
        let s1_iter = match fs::read_dir(self.cfg.records_dir()) {
            Ok(it) => it,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(RecordError::FileRead(e)),
        };

        for s1 in s1_iter.flatten() {
            let Ok(s2_iter) = fs::read_dir(s1.path()) else {
                continue;
            };
            for s2 in s2_iter.flatten() {
                let Ok(id_iter) = fs::read_dir(s2.path()) else {
                    continue;
                };
                for id_entry in id_iter.flatten() {
                    let name = id_entry.file_name();
                    let Ok(id) = ShardableUuid::parse(&name.to_string_lossy()) else {
                        continue;
                    };
                    match read_head::<P>(&id_entry.path(), id) {
                        Ok(head) if head.patient_id() == patient_id => records.push(head),
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(record_id = %id, error = %e, "skipping unreadable record");
                        }
                    }
                }
            }
        }

        Ok(records)
    }

    fn consume_token(&self, token_id: &str, now: DateTime<Utc>) -> RecordResult<()> {
        if !is_valid_token_id(token_id) {
            return Err(RecordError::TokenRejected("malformed token id"));
        }
        let dir = self.cfg.emergency_tokens_dir();
        fs::create_dir_all(&dir).map_err(RecordError::FileWrite)?;

        let mut marker = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(token_id))
        {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                return Err(RecordError::TokenRejected("already redeemed"));
            }
            Err(e) => return Err(RecordError::FileWrite(e)),
        };
        writeln!(marker, "{}", now.to_rfc3339()).map_err(RecordError::FileWrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;
    use crate::payload::ClinicalPayload;
    use crate::record::tests::t0;
    use crate::store::tests as shared;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> FileStore<ClinicalPayload> {
        let cfg = CoreConfig::new(tmp.path().to_path_buf())
            .unwrap()
            .with_care_location("Ward 7")
            .unwrap();
        FileStore::new(Arc::new(cfg))
    }

    #[test]
    fn round_trips_history() {
        let tmp = TempDir::new().unwrap();
        shared::round_trips_history(&store(&tmp));
    }

    #[test]
    fn rejects_stale_writes() {
        let tmp = TempDir::new().unwrap();
        shared::rejects_stale_writes(&store(&tmp));
    }

    #[test]
    fn concurrent_updates_stay_contiguous() {
        let tmp = TempDir::new().unwrap();
        shared::concurrent_updates_stay_contiguous(&store(&tmp));
    }

    #[test]
    fn grants_replace_and_revoke() {
        let tmp = TempDir::new().unwrap();
        shared::grants_replace_and_revoke(&store(&tmp));
    }

    #[test]
    fn invalidation_keeps_history_and_audit() {
        let tmp = TempDir::new().unwrap();
        shared::invalidation_keeps_history_and_audit(&store(&tmp));
    }

    #[test]
    fn mutations_recheck_access_at_commit() {
        let tmp = TempDir::new().unwrap();
        shared::mutations_recheck_access_at_commit(&store(&tmp));
    }

    #[test]
    fn lists_records_for_patient() {
        let tmp = TempDir::new().unwrap();
        shared::lists_records_for_patient(&store(&tmp));
    }

    #[test]
    fn tokens_are_single_use() {
        let tmp = TempDir::new().unwrap();
        shared::tokens_are_single_use(&store(&tmp));
        assert!(tmp
            .path()
            .join("emergency_tokens/0123456789abcdef0123456789abcdef")
            .is_file());
    }

    #[test]
    fn missing_records_are_not_found() {
        let tmp = TempDir::new().unwrap();
        shared::missing_records_are_not_found(&store(&tmp));
    }

    #[test]
    fn writes_sharded_layout_and_ledger_commits() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let record = shared::created(&store);
        shared::update(&store, record.id(), "Revised", t0()).unwrap();

        let dir = store.record_dir(record.id());
        let canonical = record.id().to_string();
        assert_eq!(
            dir,
            tmp.path()
                .join("records")
                .join(&canonical[0..2])
                .join(&canonical[2..4])
                .join(&canonical)
        );
        assert!(dir.join("record.json").is_file());
        assert!(dir.join("history/v000001.json").is_file());
        assert!(!dir.join("history/v000002.json").exists());
        assert_eq!(
            fs::read_to_string(dir.join("audit.jsonl"))
                .unwrap()
                .lines()
                .count(),
            2
        );

        assert_eq!(
            Ledger::subjects(&dir).unwrap(),
            vec!["record:update: version 2", "record:create: version 1"]
        );
        let message = Ledger::head_message(&dir).unwrap();
        assert!(message.contains("Actor-Id: doctor-a"));
        assert!(message.contains("Care-Location: Ward 7"));
        assert!(message.contains("Record-Version: 2"));
        assert!(!message.contains("patient-1"));
    }

    #[test]
    fn failed_audit_write_aborts_the_update() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let record = shared::created(&store);
        let dir = store.record_dir(record.id());

        let audit_path = dir.join("audit.jsonl");
        let saved_audit = fs::read_to_string(&audit_path).unwrap();
        fs::remove_file(&audit_path).unwrap();
        fs::create_dir(&audit_path).unwrap();

        let err = shared::update(&store, record.id(), "Revised", t0()).unwrap_err();
        assert!(matches!(err, RecordError::FileRead(_) | RecordError::FileWrite(_)));

        fs::remove_dir(&audit_path).unwrap();
        fs::write(&audit_path, saved_audit).unwrap();
        let loaded = store.load(record.id()).unwrap();
        assert_eq!(loaded.version(), 1);
        assert!(!dir.join("history/v000001.json").exists());
        assert_eq!(Ledger::subjects(&dir).unwrap().len(), 1);
    }

    #[test]
    fn record_locks_are_released() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let record = shared::created(&store);
        shared::update(&store, record.id(), "Revised", t0()).unwrap();
        store
            .append_audit(shared::event(RecordId::new(), AuditAction::Viewed, "doctor-a", t0()))
            .unwrap_err();
        shared::concurrent_updates_stay_contiguous(&store);

        assert!(store.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_snapshot_is_reported_as_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let record = shared::created(&store);
        shared::update(&store, record.id(), "Revised", t0()).unwrap();

        fs::remove_file(store.record_dir(record.id()).join("history/v000001.json")).unwrap();

        assert!(matches!(
            store.load(record.id()),
            Err(RecordError::CorruptHistory { .. })
        ));
    }

    #[test]
    fn state_survives_a_new_store_instance() {
        let tmp = TempDir::new().unwrap();
        let record = {
            let store = store(&tmp);
            let record = shared::created(&store);
            shared::update(&store, record.id(), "Revised", t0()).unwrap();
            store
                .append_audit(shared::event(record.id(), AuditAction::Viewed, "doctor-a", t0()))
                .unwrap();
            record
        };

        let reopened = store(&tmp);
        let loaded = reopened.load(record.id()).unwrap();
        assert_eq!(loaded.version(), 2);

        let trail = reopened.audit_for_record(record.id()).unwrap();
        let actions: Vec<_> = trail.iter().map(|e| e.action()).collect();
        assert_eq!(
            actions,
            vec![AuditAction::Created, AuditAction::Updated, AuditAction::Viewed]
        );
        assert!(trail.windows(2).all(|w| w[0].id() < w[1].id()));
    }
}
