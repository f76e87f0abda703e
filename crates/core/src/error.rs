use crate::identity::ActorId;
use medrec_uuid::ShardableUuid;

/// The caller-facing classification of a [`RecordError`].
///
/// Transport layers map these onto their own status codes; only [`ErrorKind::Conflict`] is
/// safe to retry with a fresh read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Authorization,
    Conflict,
    StorageUnavailable,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("missing required clinical field: {0}")]
    MissingField(&'static str),
    #[error("invalid text: {0}")]
    Text(#[from] medrec_types::TextError),
    #[error("invalid identifier: {0}")]
    Uuid(#[from] medrec_uuid::UuidError),

    #[error("record not found: {0}")]
    RecordNotFound(ShardableUuid),
    #[error("version {version} not found for record {record_id}")]
    VersionNotFound {
        record_id: ShardableUuid,
        version: u32,
    },

    #[error("access denied: {0}")]
    Forbidden(String),
    #[error("emergency token rejected: {0}")]
    TokenRejected(&'static str),

    #[error("version conflict on record {record_id}: expected {expected}, found {actual}")]
    VersionConflict {
        record_id: ShardableUuid,
        expected: u32,
        actual: u32,
    },

    #[error("corrupt version history for record {record_id}: {detail}")]
    CorruptHistory {
        record_id: ShardableUuid,
        detail: String,
    },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("failed to create record directory: {0}")]
    RecordDirCreation(std::io::Error),
    #[error(
        "create failed and cleanup also failed (path: {path}): create={create_error}; cleanup={cleanup_error}",
        path = path.display()
    )]
    CleanupAfterCreateFailed {
        path: std::path::PathBuf,
        #[source]
        create_error: Box<RecordError>,
        cleanup_error: std::io::Error,
    },
    #[error("failed to write record file: {0}")]
    FileWrite(std::io::Error),
    #[error("failed to read record file: {0}")]
    FileRead(std::io::Error),
    #[error("failed to serialize record: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to deserialize record: {0}")]
    Deserialization(serde_json::Error),

    #[error("failed to initialise git repository: {0}")]
    GitInit(git2::Error),
    #[error("failed to open git repository: {0}")]
    GitOpen(git2::Error),
    #[error("failed to access git index: {0}")]
    GitIndex(git2::Error),
    #[error("failed to add file to git index: {0}")]
    GitAdd(git2::Error),
    #[error("failed to write git tree: {0}")]
    GitWriteTree(git2::Error),
    #[error("failed to find git tree: {0}")]
    GitFindTree(git2::Error),
    #[error("failed to create git signature: {0}")]
    GitSignature(git2::Error),
    #[error("failed to create git commit: {0}")]
    GitCommit(git2::Error),
    #[error("failed to get git head: {0}")]
    GitHead(git2::Error),
    #[error("failed to set git head: {0}")]
    GitSetHead(git2::Error),
    #[error("failed to peel git commit: {0}")]
    GitPeel(git2::Error),

    #[error("failed to parse PEM key: {0}")]
    KeyParse(String),
    #[error("failed to encode emergency token: {0}")]
    TokenEncoding(serde_json::Error),
}

impl RecordError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_)
            | Self::MissingField(_)
            | Self::Text(_)
            | Self::Uuid(_)
            | Self::KeyParse(_) => ErrorKind::Validation,
            Self::RecordNotFound(_) | Self::VersionNotFound { .. } => ErrorKind::NotFound,
            Self::Forbidden(_) | Self::TokenRejected(_) => ErrorKind::Authorization,
            Self::VersionConflict { .. } => ErrorKind::Conflict,
            Self::CorruptHistory { .. }
            | Self::StorageUnavailable(_)
            | Self::RecordDirCreation(_)
            | Self::CleanupAfterCreateFailed { .. }
            | Self::FileWrite(_)
            | Self::FileRead(_)
            | Self::Serialization(_)
            | Self::Deserialization(_)
            | Self::GitInit(_)
            | Self::GitOpen(_)
            | Self::GitIndex(_)
            | Self::GitAdd(_)
            | Self::GitWriteTree(_)
            | Self::GitFindTree(_)
            | Self::GitSignature(_)
            | Self::GitCommit(_)
            | Self::GitHead(_)
            | Self::GitSetHead(_)
            | Self::GitPeel(_)
            | Self::TokenEncoding(_) => ErrorKind::StorageUnavailable,
        }
    }

    /// Only version races are retryable; everything else is surfaced as-is.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub(crate) fn forbidden(actor: &ActorId, reason: impl std::fmt::Display) -> Self {
        Self::Forbidden(format!("{actor}: {reason}"))
    }
}

pub type RecordResult<T> = std::result::Result<T, RecordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        let conflict = RecordError::VersionConflict {
            record_id: ShardableUuid::new(),
            expected: 3,
            actual: 4,
        };
        assert!(conflict.is_retryable());
        assert!(!RecordError::StorageUnavailable("disk gone".into()).is_retryable());
        assert!(!RecordError::Forbidden("no_grant".into()).is_retryable());
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            RecordError::MissingField("diagnosis.primary").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            RecordError::RecordNotFound(ShardableUuid::new()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            RecordError::TokenRejected("expired").kind(),
            ErrorKind::Authorization
        );
        assert_eq!(
            RecordError::FileWrite(std::io::Error::other("x")).kind(),
            ErrorKind::StorageUnavailable
        );
    }
}
