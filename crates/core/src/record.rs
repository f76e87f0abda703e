//! Versioned clinical records.
//!
//! A [`VersionedRecord`] holds the live state of one clinical encounter plus an append-only list
//! of [`VersionSnapshot`]s, one per superseded version. The update protocol is:
//!
//! 1. refuse invalidated records,
//! 2. compare the caller's expected version (the optimistic-concurrency token) with the live one,
//! 3. copy the live state into a snapshot tagged with the *current* version and append it,
//! 4. overwrite the live state and increment the version.
//!
//! The live version is never duplicated into history until it is superseded, so for a record at
//! version `n` the history holds exactly versions `1..n`.
//!
//! Nothing here persists anything; stores in [`crate::store`] make the step atomic against
//! concurrent writers by comparing the stored version before committing.

use crate::identity::ActorId;
use crate::payload::Snapshot;
use crate::{RecordError, RecordResult};
use chrono::{DateTime, Utc};
use medrec_types::SingleLineText;
use medrec_uuid::ShardableUuid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Record identifiers are canonical sharded UUIDs.
pub type RecordId = ShardableUuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Draft,
    Completed,
    Reviewed,
    Amended,
}

impl RecordStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Completed => "completed",
            Self::Reviewed => "reviewed",
            Self::Amended => "amended",
        }
    }

    /// Status a record moves to when edited without an explicit status.
    const fn after_edit(self) -> Self {
        match self {
            Self::Completed | Self::Reviewed => Self::Amended,
            Self::Draft | Self::Amended => self,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "draft" => Ok(Self::Draft),
            "completed" => Ok(Self::Completed),
            "reviewed" => Ok(Self::Reviewed),
            "amended" => Ok(Self::Amended),
            other => Err(RecordError::InvalidInput(format!(
                "unknown record status '{other}'"
            ))),
        }
    }
}

/// Immutable copy of a superseded version.
///
/// `modified_by`/`modified_at`/`change_reason` describe the edit that *produced* this version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VersionSnapshot<P> {
    version: u32,
    payload: P,
    status: RecordStatus,
    emergency_accessible: bool,
    modified_by: ActorId,
    modified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    change_reason: Option<SingleLineText>,
}

impl<P> VersionSnapshot<P> {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    pub fn modified_by(&self) -> &ActorId {
        &self.modified_by
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    pub fn change_reason(&self) -> Option<&SingleLineText> {
        self.change_reason.as_ref()
    }
}

/// Soft-delete metadata.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Invalidation {
    pub reason: SingleLineText,
    pub invalidated_by: ActorId,
    pub invalidated_at: DateTime<Utc>,
}

/// Input for creating a record.
#[derive(Clone, Debug)]
pub struct NewRecord<P> {
    pub patient_id: ActorId,
    pub payload: P,
    pub status: RecordStatus,
    pub emergency_accessible: bool,
}

impl<P> NewRecord<P> {
    pub fn new(patient_id: ActorId, payload: P) -> Self {
        Self {
            patient_id,
            payload,
            status: RecordStatus::Completed,
            emergency_accessible: false,
        }
    }
}

/// Input for a content-mutating update.
#[derive(Clone, Debug)]
pub struct RecordUpdate<P> {
    pub payload: P,
    pub change_reason: Option<SingleLineText>,
    /// The version the caller edited. `None` means "whatever is current", which lets the
    /// service retry transparently on a lost race.
    pub expected_version: Option<u32>,
    pub status: Option<RecordStatus>,
    pub emergency_accessible: Option<bool>,
}

impl<P> RecordUpdate<P> {
    pub fn new(payload: P, change_reason: Option<SingleLineText>) -> Self {
        Self {
            payload,
            change_reason,
            expected_version: None,
            status: None,
            emergency_accessible: None,
        }
    }

    pub fn expecting(mut self, version: u32) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// A read of one version, live or historical.
#[derive(Clone, Debug, Serialize)]
pub struct VersionView<P> {
    pub record_id: RecordId,
    pub version: u32,
    pub payload: P,
    pub status: RecordStatus,
    pub emergency_accessible: bool,
    pub modified_by: ActorId,
    pub modified_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_reason: Option<SingleLineText>,
    pub is_current: bool,
}

/// One line of a record's version history.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct VersionSummary {
    pub version: u32,
    pub modified_by: ActorId,
    pub modified_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_reason: Option<SingleLineText>,
    pub is_current: bool,
}

/// A clinical record with its full version history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VersionedRecord<P> {
    id: RecordId,
    patient_id: ActorId,
    author_id: ActorId,
    created_at: DateTime<Utc>,
    updated_by: ActorId,
    updated_at: DateTime<Utc>,
    version: u32,
    status: RecordStatus,
    is_valid: bool,
    is_emergency_accessible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    change_reason: Option<SingleLineText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invalidation: Option<Invalidation>,
    payload: P,
    #[serde(default = "Vec::new", skip_serializing_if = "Vec::is_empty")]
    history: Vec<VersionSnapshot<P>>,
}

impl<P: Snapshot> VersionedRecord<P> {
    /// Builds version 1 of a new record authored by `author_id`.
    ///
    /// # Errors
    ///
    /// - [`RecordError::MissingField`] / [`RecordError::InvalidInput`] if the payload does not
    ///   validate
    /// - [`RecordError::InvalidInput`] if the initial status is not `draft` or `completed`
    pub fn create(
        id: RecordId,
        new: NewRecord<P>,
        author_id: ActorId,
        now: DateTime<Utc>,
    ) -> RecordResult<Self> {
        new.payload.validate()?;
        if !matches!(new.status, RecordStatus::Draft | RecordStatus::Completed) {
            return Err(RecordError::InvalidInput(format!(
                "a new record must be draft or completed, not {}",
                new.status
            )));
        }

        Ok(Self {
            id,
            patient_id: new.patient_id,
            author_id: author_id.clone(),
            created_at: now,
            updated_by: author_id,
            updated_at: now,
            version: 1,
            status: new.status,
            is_valid: true,
            is_emergency_accessible: new.emergency_accessible,
            change_reason: None,
            invalidation: None,
            payload: new.payload,
            history: Vec::new(),
        })
    }

    /// Applies a content-mutating update in place.
    ///
    /// On success the previous live state is the last history entry and `version` has grown by
    /// exactly one. On error `self` is untouched.
    pub fn apply_update(
        &mut self,
        update: RecordUpdate<P>,
        editor: &ActorId,
        now: DateTime<Utc>,
    ) -> RecordResult<()> {
        if !self.is_valid {
            return Err(RecordError::RecordNotFound(self.id));
        }
        if let Some(expected) = update.expected_version {
            if expected != self.version {
                return Err(RecordError::VersionConflict {
                    record_id: self.id,
                    expected,
                    actual: self.version,
                });
            }
        }
        update.payload.validate()?;
        let next_version = self
            .version
            .checked_add(1)
            .ok_or_else(|| RecordError::InvalidInput("version counter exhausted".into()))?;

        let snapshot = VersionSnapshot {
            version: self.version,
            payload: self.payload.clone(),
            status: self.status,
            emergency_accessible: self.is_emergency_accessible,
            modified_by: self.updated_by.clone(),
            modified_at: self.updated_at,
            change_reason: self.change_reason.clone(),
        };
        self.history.push(snapshot);

        self.payload = update.payload;
        self.status = update.status.unwrap_or(self.status.after_edit());
        if let Some(flag) = update.emergency_accessible {
            self.is_emergency_accessible = flag;
        }
        self.change_reason = update.change_reason;
        self.updated_by = editor.clone();
        self.updated_at = now;
        self.version = next_version;

        Ok(())
    }

    /// Soft-deletes the record. Version and history are left untouched.
    pub fn invalidate(
        &mut self,
        reason: SingleLineText,
        actor: &ActorId,
        now: DateTime<Utc>,
    ) -> RecordResult<()> {
        if !self.is_valid {
            return Err(RecordError::RecordNotFound(self.id));
        }
        self.is_valid = false;
        self.invalidation = Some(Invalidation {
            reason,
            invalidated_by: actor.clone(),
            invalidated_at: now,
        });
        Ok(())
    }

    /// Returns `version` from the live state or from history.
    pub fn version_view(&self, version: u32) -> RecordResult<VersionView<P>> {
        if version == self.version {
            return Ok(VersionView {
                record_id: self.id,
                version,
                payload: self.payload.clone(),
                status: self.status,
                emergency_accessible: self.is_emergency_accessible,
                modified_by: self.updated_by.clone(),
                modified_at: self.updated_at,
                change_reason: self.change_reason.clone(),
                is_current: true,
            });
        }

        let snapshot = self
            .snapshot(version)
            .ok_or(RecordError::VersionNotFound {
                record_id: self.id,
                version,
            })?;

        Ok(VersionView {
            record_id: self.id,
            version,
            payload: snapshot.payload.clone(),
            status: snapshot.status,
            emergency_accessible: snapshot.emergency_accessible,
            modified_by: snapshot.modified_by.clone(),
            modified_at: snapshot.modified_at,
            change_reason: snapshot.change_reason.clone(),
            is_current: false,
        })
    }

    /// The live state as a view.
    pub fn current_view(&self) -> VersionView<P> {
        VersionView {
            record_id: self.id,
            version: self.version,
            payload: self.payload.clone(),
            status: self.status,
            emergency_accessible: self.is_emergency_accessible,
            modified_by: self.updated_by.clone(),
            modified_at: self.updated_at,
            change_reason: self.change_reason.clone(),
            is_current: true,
        }
    }

    /// Ordered summary of every version, oldest first.
    pub fn version_summaries(&self) -> Vec<VersionSummary> {
        let mut summaries: Vec<VersionSummary> = self
            .history
            .iter()
            .map(|s| VersionSummary {
                version: s.version,
                modified_by: s.modified_by.clone(),
                modified_at: s.modified_at,
                change_reason: s.change_reason.clone(),
                is_current: false,
            })
            .collect();
        summaries.push(VersionSummary {
            version: self.version,
            modified_by: self.updated_by.clone(),
            modified_at: self.updated_at,
            change_reason: self.change_reason.clone(),
            is_current: true,
        });
        summaries
    }

    /// Verifies that history holds exactly versions `1..version`, in order.
    pub fn check_contiguity(&self) -> RecordResult<()> {
        for (index, snapshot) in self.history.iter().enumerate() {
            let expected = u32::try_from(index + 1).unwrap_or(u32::MAX);
            if snapshot.version != expected {
                return Err(RecordError::CorruptHistory {
                    record_id: self.id,
                    detail: format!(
                        "history position {} holds version {}",
                        index + 1,
                        snapshot.version
                    ),
                });
            }
        }
        let expected_live = u32::try_from(self.history.len() + 1).unwrap_or(u32::MAX);
        if self.version != expected_live {
            return Err(RecordError::CorruptHistory {
                record_id: self.id,
                detail: format!(
                    "live version {} does not follow {} history entries",
                    self.version,
                    self.history.len()
                ),
            });
        }
        Ok(())
    }

    /// A copy without history, for stores that persist snapshots separately.
    pub(crate) fn head(&self) -> Self {
        Self {
            id: self.id,
            patient_id: self.patient_id.clone(),
            author_id: self.author_id.clone(),
            created_at: self.created_at,
            updated_by: self.updated_by.clone(),
            updated_at: self.updated_at,
            version: self.version,
            status: self.status,
            is_valid: self.is_valid,
            is_emergency_accessible: self.is_emergency_accessible,
            change_reason: self.change_reason.clone(),
            invalidation: self.invalidation.clone(),
            payload: self.payload.clone(),
            history: Vec::new(),
        }
    }

    /// Reattaches separately persisted history and checks it.
    pub(crate) fn with_history(mut self, history: Vec<VersionSnapshot<P>>) -> RecordResult<Self> {
        self.history = history;
        self.check_contiguity()?;
        Ok(self)
    }
}

impl<P> VersionedRecord<P> {
    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn patient_id(&self) -> &ActorId {
        &self.patient_id
    }

    pub fn author_id(&self) -> &ActorId {
        &self.author_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_by(&self) -> &ActorId {
        &self.updated_by
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn is_emergency_accessible(&self) -> bool {
        self.is_emergency_accessible
    }

    pub fn invalidation(&self) -> Option<&Invalidation> {
        self.invalidation.as_ref()
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn history(&self) -> &[VersionSnapshot<P>] {
        &self.history
    }

    /// History is contiguous from 1, so version `n` sits at index `n - 1`.
    pub fn snapshot(&self, version: u32) -> Option<&VersionSnapshot<P>> {
        let index = usize::try_from(version).ok()?.checked_sub(1)?;
        self.history.get(index).filter(|s| s.version == version)
    }
}
