//! Git ledger for file-backed records.
//!
//! Every record directory is its own git repository (`git2`/libgit2). A mutation writes all of
//! its files (record state, history snapshot, grants, audit line) and commits them in one commit,
//! so the repository history is an independent, tamper-evident trail of every change.
//!
//! - **Atomic multi-file writes**: [`Ledger::write_and_commit_files`] restores previous file
//!   contents and removes new files and directories if any step fails
//! - **Structured messages**: [`LedgerMessage`] renders `<domain>:<action>: <summary>` followed by
//!   `Actor-Id`, `Care-Location` and `Record-Version` trailers
//! - **Single branch**: every repository commits to `refs/heads/main`
//!
//! Commit messages are labels; they never carry patient identifiers or clinical content.

use crate::{RecordError, RecordResult};
use medrec_types::SingleLineText;
use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

const MAIN_REF: &str = "refs/heads/main";
const COMMITTER_EMAIL: &str = "ledger@medrec.local";
const ANONYMOUS_ACTOR: &str = "anonymous";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub(crate) enum LedgerDomain {
    Record,
    Access,
    Audit,
}

impl LedgerDomain {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Access => "access",
            Self::Audit => "audit",
        }
    }
}

impl fmt::Display for LedgerDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a commit did. Nothing is ever deleted from a ledger; `Invalidate` and `Revoke` only
/// record state changes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub(crate) enum LedgerAction {
    Create,
    Update,
    Invalidate,
    Grant,
    Revoke,
    Append,
}

impl LedgerAction {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Invalidate => "invalidate",
            Self::Grant => "grant",
            Self::Revoke => "revoke",
            Self::Append => "append",
        }
    }
}

impl fmt::Display for LedgerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured, predictable ledger commit message.
///
/// Rendering rules:
///
/// - Subject line: `<domain>:<action>: <summary>`
/// - One blank line, then trailers in fixed order: `Actor-Id`, `Care-Location`, `Record-Version`
/// - No free-form prose
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct LedgerMessage {
    domain: LedgerDomain,
    action: LedgerAction,
    summary: SingleLineText,
    actor: Option<String>,
    care_location: SingleLineText,
    record_version: u32,
}

impl LedgerMessage {
    pub(crate) fn new(
        domain: LedgerDomain,
        action: LedgerAction,
        summary: impl AsRef<str>,
        care_location: &SingleLineText,
        record_version: u32,
    ) -> RecordResult<Self> {
        let summary = SingleLineText::new(summary.as_ref())
            .map_err(|e| RecordError::InvalidInput(format!("commit summary: {e}")))?;
        Ok(Self {
            domain,
            action,
            summary,
            actor: None,
            care_location: care_location.clone(),
            record_version,
        })
    }

    pub(crate) fn by(mut self, actor: Option<&crate::identity::ActorId>) -> Self {
        self.actor = actor.map(|a| a.as_str().to_string());
        self
    }

    fn actor_name(&self) -> &str {
        self.actor.as_deref().unwrap_or(ANONYMOUS_ACTOR)
    }

    pub(crate) fn render(&self) -> String {
        format!(
            "{}:{}: {}\n\nActor-Id: {}\nCare-Location: {}\nRecord-Version: {}",
            self.domain,
            self.action,
            self.summary,
            self.actor_name(),
            self.care_location,
            self.record_version
        )
    }
}

/// Replaces `path` through a sibling temp file so readers see either the old or the new content.
fn write_replacing(path: &Path, content: &str) -> std::io::Result<()> {
    let name = path
        .file_name()
        .ok_or_else(|| std::io::Error::other("path has no file name"))?;
    let tmp = path.with_file_name(format!(".{}.tmp", name.to_string_lossy()));
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}

/// A file to be written and committed.
#[derive(Debug, Clone)]
pub(crate) struct FileToWrite<'a> {
    /// Path relative to the record directory.
    pub relative_path: &'a Path,
    pub content: &'a str,
    /// Previous content for rollback. `None` if the file is new.
    pub old_content: Option<&'a str>,
}

/// Git operations on one record directory.
pub(crate) struct Ledger {
    repo: git2::Repository,
    workdir: PathBuf,
}

impl Ledger {
    pub(crate) fn init(workdir: &Path) -> RecordResult<Self> {
        let repo = git2::Repository::init(workdir).map_err(RecordError::GitInit)?;
        // Use the repository's own workdir so path stripping matches what libgit2 resolved.
        let workdir = repo
            .workdir()
            .ok_or_else(|| {
                RecordError::GitInit(git2::Error::from_str("repository has no working directory"))
            })?
            .to_path_buf();
        Ok(Self { repo, workdir })
    }

    /// Opens exactly the repository at `workdir`; parent directories are never searched.
    pub(crate) fn open(workdir: &Path) -> RecordResult<Self> {
        let repo = git2::Repository::open_ext(
            workdir,
            git2::RepositoryOpenFlags::NO_SEARCH,
            std::iter::empty::<&std::ffi::OsStr>(),
        )
        .map_err(RecordError::GitOpen)?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| {
                RecordError::GitOpen(git2::Error::from_str("repository has no working directory"))
            })?
            .to_path_buf();
        Ok(Self { repo, workdir })
    }

    fn ensure_main_head(&self) -> RecordResult<()> {
        self.repo
            .set_head(MAIN_REF)
            .map_err(RecordError::GitSetHead)
    }

    /// Commits only `relative_paths`, which must stay inside the workdir.
    fn commit_paths(
        &self,
        message: &LedgerMessage,
        relative_paths: &[PathBuf],
    ) -> RecordResult<git2::Oid> {
        self.ensure_main_head()?;
        let mut index = self.repo.index().map_err(RecordError::GitIndex)?;

        for path in relative_paths {
            let rel = if path.is_absolute() {
                path.strip_prefix(&self.workdir)
                    .map_err(|_| {
                        RecordError::InvalidInput(
                            "path is outside the record working directory".into(),
                        )
                    })?
                    .to_path_buf()
            } else {
                path.to_path_buf()
            };

            if rel.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(RecordError::InvalidInput(
                    "path must not contain parent directory references (..)".into(),
                ));
            }

            index.add_path(&rel).map_err(RecordError::GitAdd)?;
        }
        index.write().map_err(RecordError::GitIndex)?;

        let tree_id = index.write_tree().map_err(RecordError::GitWriteTree)?;
        let tree = self
            .repo
            .find_tree(tree_id)
            .map_err(RecordError::GitFindTree)?;
        let sig = git2::Signature::now(message.actor_name(), COMMITTER_EMAIL)
            .map_err(RecordError::GitSignature)?;

        let parents = self.resolve_head_parents()?;
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        self.repo
            .commit(
                Some("HEAD"),
                &sig,
                &sig,
                &message.render(),
                &tree,
                &parent_refs,
            )
            .map_err(RecordError::GitCommit)
    }

    /// The tree currently staged in the index.
    fn staged_tree(&self) -> RecordResult<git2::Oid> {
        let mut index = self.repo.index().map_err(RecordError::GitIndex)?;
        index.write_tree().map_err(RecordError::GitWriteTree)
    }

    /// Stages exactly `tree` again and persists the index.
    fn restore_index(&self, tree: git2::Oid) -> RecordResult<()> {
        let tree = self.repo.find_tree(tree).map_err(RecordError::GitFindTree)?;
        let mut index = self.repo.index().map_err(RecordError::GitIndex)?;
        index.read_tree(&tree).map_err(RecordError::GitIndex)?;
        index.write().map_err(RecordError::GitIndex)
    }

    fn resolve_head_parents(&self) -> RecordResult<Vec<git2::Commit<'_>>> {
        match self.repo.head() {
            Ok(head) => {
                let commit = head.peel_to_commit().map_err(RecordError::GitPeel)?;
                Ok(vec![commit])
            }
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => Ok(vec![]),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(vec![]),
            Err(e) => Err(RecordError::GitHead(e)),
        }
    }

    /// Writes `files` and commits them together.
    ///
    /// On error, files that existed are restored, new files are removed, directories created by
    /// this call are removed (deepest first) and the index is reset to what was staged before.
    pub(crate) fn write_and_commit_files(
        record_dir: &Path,
        message: &LedgerMessage,
        files: &[FileToWrite],
    ) -> RecordResult<git2::Oid> {
        let ledger = Self::open(record_dir)?;
        let staged_before = ledger.staged_tree()?;

        let mut created_dirs: Vec<PathBuf> = Vec::new();
        let mut written_files: Vec<(PathBuf, Option<&str>)> = Vec::new();

        let result: RecordResult<git2::Oid> = (|| {
            let mut dirs_needed = HashSet::new();
            for file in files {
                let full_path = ledger.workdir.join(file.relative_path);
                let mut current = full_path.parent();
                while let Some(dir) = current {
                    if dir == ledger.workdir || dir.exists() {
                        break;
                    }
                    dirs_needed.insert(dir.to_path_buf());
                    current = dir.parent();
                }
            }

            let mut dirs_to_create: Vec<PathBuf> = dirs_needed.into_iter().collect();
            dirs_to_create.sort_by_key(|p| p.components().count());
            for dir in &dirs_to_create {
                std::fs::create_dir(dir).map_err(RecordError::FileWrite)?;
                created_dirs.push(dir.clone());
            }

            for file in files {
                let full_path = ledger.workdir.join(file.relative_path);
                write_replacing(&full_path, file.content).map_err(RecordError::FileWrite)?;
                written_files.push((full_path, file.old_content));
            }

            let paths: Vec<PathBuf> = files
                .iter()
                .map(|f| f.relative_path.to_path_buf())
                .collect();
            ledger.commit_paths(message, &paths)
        })();

        if result.is_err() {
            for (full_path, old_content) in written_files.iter().rev() {
                let restored = match old_content {
                    Some(contents) => write_replacing(full_path, contents),
                    None => std::fs::remove_file(full_path),
                };
                if let Err(e) = restored {
                    tracing::error!(path = %full_path.display(), error = %e, "ledger rollback failed");
                }
            }
            for dir in created_dirs.iter().rev() {
                let _ = std::fs::remove_dir(dir);
            }
            if let Err(e) = ledger.restore_index(staged_before) {
                tracing::error!(
                    record_dir = %record_dir.display(),
                    error = %e,
                    "ledger index reset failed"
                );
            }
        }

        result
    }

    /// Initialises a repository in `record_dir` and commits the first files.
    ///
    /// Either the directory ends up fully initialised with its first commit, or it is removed.
    pub(crate) fn init_and_commit(
        record_dir: &Path,
        message: &LedgerMessage,
        files: &[FileToWrite],
    ) -> RecordResult<git2::Oid> {
        let result = Self::init(record_dir)
            .and_then(|_| Self::write_and_commit_files(record_dir, message, files));

        match result {
            Ok(oid) => Ok(oid),
            Err(create_error) => {
                if let Err(cleanup_error) = std::fs::remove_dir_all(record_dir) {
                    return Err(RecordError::CleanupAfterCreateFailed {
                        path: record_dir.to_path_buf(),
                        create_error: Box::new(create_error),
                        cleanup_error,
                    });
                }
                Err(create_error)
            }
        }
    }

    /// Subject lines from newest to oldest.
    #[cfg(test)]
    pub(crate) fn subjects(record_dir: &Path) -> RecordResult<Vec<String>> {
        let ledger = Self::open(record_dir)?;
        let mut walk = ledger.repo.revwalk().map_err(RecordError::GitHead)?;
        walk.push_head().map_err(RecordError::GitHead)?;
        let mut subjects = Vec::new();
        for oid in walk {
            let oid = oid.map_err(RecordError::GitHead)?;
            let commit = ledger.repo.find_commit(oid).map_err(RecordError::GitPeel)?;
            subjects.push(commit.summary().unwrap_or_default().to_string());
        }
        Ok(subjects)
    }

    #[cfg(test)]
    pub(crate) fn head_message(record_dir: &Path) -> RecordResult<String> {
        let ledger = Self::open(record_dir)?;
        let head = ledger.repo.head().map_err(RecordError::GitHead)?;
        let commit = head.peel_to_commit().map_err(RecordError::GitPeel)?;
        Ok(commit.message().unwrap_or_default().to_string())
    }
}
