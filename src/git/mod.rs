//! Version-control adapter
//!
//! The sync engine only needs five operations from git: clone one branch,
//! pull it, read the current commit, list every tracked file, and list the
//! paths that changed between two commits. They are expressed as the
//! [`VersionControl`] trait; [`GitAdapter`] implements it with libgit2.

mod operations;

pub use operations::{GitAdapter, GitCredentials};

use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

/// Kind of change a path went through between two refs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    /// Regular file, symlink or executable bit swapped for another
    TypeChanged,
    Deleted,
}

impl ChangeKind {
    /// Whether the KV entry must be removed rather than written
    pub fn is_removal(self) -> bool {
        matches!(self, ChangeKind::Deleted)
    }

    /// Single-letter status as printed by `git diff --name-status`
    pub fn letter(self) -> char {
        match self {
            ChangeKind::Added => 'A',
            ChangeKind::Modified => 'M',
            ChangeKind::TypeChanged => 'T',
            ChangeKind::Deleted => 'D',
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// One changed path, relative to the repository root with `/` separators
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub path: String,
}

impl ChangeRecord {
    pub fn new(kind: ChangeKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    /// Shorthand for a full-reconciliation record
    pub fn added(path: impl Into<String>) -> Self {
        Self::new(ChangeKind::Added, path)
    }
}

/// Operations the sync engine needs from version control.
///
/// Implementations return structured errors and never retry on their own;
/// a failed operation fails the sync cycle and is retried by the next trigger.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Clone exactly `branch` of `url` into `dest_parent/<branch>` and return that path
    async fn clone_branch(&self, url: &str, branch: &str, dest_parent: &Path) -> Result<PathBuf>;

    /// Bring the working copy up to date with its remote branch
    async fn pull(&self, working_dir: &Path) -> Result<()>;

    /// Commit id currently checked out
    async fn current_ref(&self, working_dir: &Path) -> Result<String>;

    /// Every tracked file at the current commit
    async fn list_all_files(&self, working_dir: &Path) -> Result<Vec<String>>;

    /// Paths that differ between two commits
    async fn list_changed_files(
        &self,
        from_ref: &str,
        to_ref: &str,
        working_dir: &Path,
    ) -> Result<Vec<ChangeRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_kind_letters() {
        let letters: String = [
            ChangeKind::Added,
            ChangeKind::Modified,
            ChangeKind::TypeChanged,
            ChangeKind::Deleted,
        ]
        .iter()
        .map(|k| k.letter())
        .collect();
        assert_eq!(letters, "AMTD");
        assert!(ChangeKind::Deleted.is_removal());
        assert!(!ChangeKind::TypeChanged.is_removal());
    }
}
