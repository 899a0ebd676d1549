//! Cycle results delivered to sync waiters

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result of one sync cycle, shared by every waiter of that cycle
pub type SyncResult = std::result::Result<SyncOutcome, SyncError>;

/// Summary of a successful cycle
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub repo: String,
    pub branch: String,

    /// Hint of the request that started the cycle
    pub hint: Option<String>,

    /// Ref the working copy was at; the checkpoint now holds this value
    pub resolved_ref: String,

    /// KV entries written
    pub written: usize,

    /// KV entries deleted
    pub deleted: usize,

    /// The checkpoint already matched, nothing was applied
    pub already_processed: bool,

    pub completed_at: DateTime<Utc>,
}

impl SyncOutcome {
    /// Total KV mutations of the cycle (checkpoint excluded)
    pub fn change_count(&self) -> usize {
        self.written + self.deleted
    }
}

/// One record that could not be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub path: String,
    pub key: String,
    pub reason: String,
}

impl std::fmt::Display for RecordFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.path, self.key, self.reason)
    }
}

/// Why a cycle failed. None of these change the checkpoint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Failed to clone branch {branch}: {reason}")]
    Clone { branch: String, reason: String },

    #[error("Failed to pull branch {branch}: {reason}")]
    Pull { branch: String, reason: String },

    #[error("Failed to resolve current ref of {branch}: {reason}")]
    ResolveRef { branch: String, reason: String },

    #[error("Failed to access checkpoint {key}: {reason}")]
    Checkpoint { key: String, reason: String },

    #[error("Failed to list files of {branch}: {reason}")]
    List { branch: String, reason: String },

    #[error("Failed to diff {branch} from {from} to {to}: {reason}")]
    Diff {
        branch: String,
        from: String,
        to: String,
        reason: String,
    },

    /// Every record that failed; the others were applied
    #[error("{} of {total} records failed for {branch}: {}", .failures.len(), join_failures(.failures))]
    Apply {
        branch: String,
        total: usize,
        failures: Vec<RecordFailure>,
    },

    /// The cycle task went away before reporting
    #[error("Sync cycle for {branch} was interrupted")]
    Interrupted { branch: String },
}

impl SyncError {
    /// Failed records, empty unless the batch itself failed
    pub fn failures(&self) -> &[RecordFailure] {
        match self {
            SyncError::Apply { failures, .. } => failures,
            _ => &[],
        }
    }
}

fn join_failures(failures: &[RecordFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
