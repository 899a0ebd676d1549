//! Diff-and-apply engine
//!
//! One cycle takes a branch from its stored checkpoint to the ref currently
//! checked out: it lists the records between the two, applies them to the KV
//! store with bounded concurrency and writes the new checkpoint only when
//! every record landed.

use super::keys::BranchDescriptor;
use super::outcome::{RecordFailure, SyncError, SyncOutcome, SyncResult};
use crate::config::Git2KvConfig;
use crate::git::{ChangeKind, ChangeRecord, VersionControl};
use crate::kv::KvStore;
use crate::metrics;
use crate::Git2KvError;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Tuning shared by every cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Upper bound for one record (file read + KV write/delete) and for
    /// each checkpoint read or write
    pub record_timeout: Duration,

    /// Records in flight at once within a cycle
    pub max_in_flight: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            record_timeout: Duration::from_secs(30),
            max_in_flight: 32,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Git2KvConfig) -> Self {
        Self {
            record_timeout: config.record_timeout(),
            max_in_flight: config.max_in_flight.max(1),
        }
    }
}

/// Collaborators of the engine, shared by all branch units
#[derive(Clone)]
pub struct SyncContext {
    pub vcs: Arc<dyn VersionControl>,
    pub kv: Arc<dyn KvStore>,
    pub settings: EngineSettings,
}

impl SyncContext {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        kv: Arc<dyn KvStore>,
        settings: EngineSettings,
    ) -> Self {
        Self { vcs, kv, settings }
    }
}

/// How a cycle obtains the ref it syncs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Pull the working copy first
    Pull,
    /// The working copy was just cloned; the clone is the ref change
    AfterClone,
}

/// Run one diff-and-apply cycle for `branch`.
///
/// `hint` is the ref the trigger believed the branch was at. It is advisory:
/// the cycle always syncs to the ref resolved from the working copy.
pub async fn sync_branch(
    ctx: &SyncContext,
    branch: &BranchDescriptor,
    mode: SyncMode,
    hint: Option<&str>,
) -> SyncResult {
    let working_dir = branch.working_dir.as_path();

    if mode == SyncMode::Pull {
        ctx.vcs
            .pull(working_dir)
            .await
            .map_err(|e| SyncError::Pull {
                branch: branch.to_string(),
                reason: e.to_string(),
            })?;
    }

    let resolved_ref = ctx
        .vcs
        .current_ref(working_dir)
        .await
        .map_err(|e| SyncError::ResolveRef {
            branch: branch.to_string(),
            reason: e.to_string(),
        })?;

    if let Some(hint) = hint {
        if hint != resolved_ref {
            tracing::debug!(
                branch = %branch,
                hint,
                resolved = %resolved_ref,
                "Trigger hint differs from resolved ref, syncing to resolved ref"
            );
        }
    }

    let checkpoint = read_checkpoint(ctx, branch).await?;

    let records = match checkpoint.as_deref() {
        None => {
            tracing::info!(branch = %branch, "No checkpoint found, reconciling every file");
            ctx.vcs
                .list_all_files(working_dir)
                .await
                .map_err(|e| SyncError::List {
                    branch: branch.to_string(),
                    reason: e.to_string(),
                })?
                .into_iter()
                .map(ChangeRecord::added)
                .collect::<Vec<_>>()
        }
        Some(previous) if previous == resolved_ref => {
            tracing::info!(branch = %branch, commit = %resolved_ref, "Ref already processed");
            return Ok(outcome(branch, hint, resolved_ref, 0, 0, true));
        }
        Some(previous) => ctx
            .vcs
            .list_changed_files(previous, &resolved_ref, working_dir)
            .await
            .map_err(|e| SyncError::Diff {
                branch: branch.to_string(),
                from: previous.to_string(),
                to: resolved_ref.clone(),
                reason: e.to_string(),
            })?,
    };

    tracing::debug!(
        branch = %branch,
        from = checkpoint.as_deref().unwrap_or("<none>"),
        to = %resolved_ref,
        records = records.len(),
        "Applying change records"
    );

    let total = records.len();
    let (written, deleted, failures) = apply_records(ctx, branch, records).await;
    metrics::record_applied(written, deleted);

    if !failures.is_empty() {
        metrics::record_failures(&branch.repo, failures.len());
        for failure in &failures {
            tracing::warn!(branch = %branch, path = %failure.path, key = %failure.key, reason = %failure.reason, "Record failed");
        }
        return Err(SyncError::Apply {
            branch: branch.to_string(),
            total,
            failures,
        });
    }

    write_checkpoint(ctx, branch, &resolved_ref).await?;

    tracing::info!(
        branch = %branch,
        commit = %resolved_ref,
        written,
        deleted,
        "Branch synced"
    );

    Ok(outcome(branch, hint, resolved_ref, written, deleted, false))
}

fn outcome(
    branch: &BranchDescriptor,
    hint: Option<&str>,
    resolved_ref: String,
    written: usize,
    deleted: usize,
    already_processed: bool,
) -> SyncOutcome {
    SyncOutcome {
        repo: branch.repo.clone(),
        branch: branch.branch.clone(),
        hint: hint.map(str::to_string),
        resolved_ref,
        written,
        deleted,
        already_processed,
        completed_at: Utc::now(),
    }
}

async fn read_checkpoint(
    ctx: &SyncContext,
    branch: &BranchDescriptor,
) -> Result<Option<String>, SyncError> {
    let key = branch.checkpoint_key();
    let value = match timeout(ctx.settings.record_timeout, ctx.kv.get(&key)).await {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            return Err(SyncError::Checkpoint {
                key,
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(SyncError::Checkpoint {
                key,
                reason: timed_out(ctx.settings.record_timeout),
            })
        }
    };

    Ok(value
        .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
        .filter(|r| !r.is_empty()))
}

async fn write_checkpoint(
    ctx: &SyncContext,
    branch: &BranchDescriptor,
    resolved_ref: &str,
) -> Result<(), SyncError> {
    let key = branch.checkpoint_key();
    let reason = match timeout(
        ctx.settings.record_timeout,
        ctx.kv.set(&key, resolved_ref.as_bytes()),
    )
    .await
    {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => e.to_string(),
        Err(_) => timed_out(ctx.settings.record_timeout),
    };

    Err(SyncError::Checkpoint { key, reason })
}

/// Apply every record, never short-circuiting. Returns the counts of
/// written and deleted keys and every failure.
async fn apply_records(
    ctx: &SyncContext,
    branch: &BranchDescriptor,
    records: Vec<ChangeRecord>,
) -> (usize, usize, Vec<RecordFailure>) {
    let results: Vec<Result<ChangeKind, RecordFailure>> = stream::iter(records)
        .map(|record| apply_record(ctx, branch, record))
        .buffer_unordered(ctx.settings.max_in_flight.max(1))
        .collect()
        .await;

    let mut written = 0;
    let mut deleted = 0;
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(kind) if kind.is_removal() => deleted += 1,
            Ok(_) => written += 1,
            Err(failure) => failures.push(failure),
        }
    }

    failures.sort_by(|a, b| a.path.cmp(&b.path));
    (written, deleted, failures)
}

async fn apply_record(
    ctx: &SyncContext,
    branch: &BranchDescriptor,
    record: ChangeRecord,
) -> Result<ChangeKind, RecordFailure> {
    let key = branch.data_key(&record.path);

    let operation = async {
        if record.kind.is_removal() {
            ctx.kv.delete(&key).await
        } else {
            let contents = read_contents(&branch.working_dir, &record.path).await?;
            ctx.kv.set(&key, &contents).await
        }
    };

    let reason = match timeout(ctx.settings.record_timeout, operation).await {
        Ok(Ok(())) => {
            tracing::trace!(kind = %record.kind, key = %key, "Record applied");
            return Ok(record.kind);
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => timed_out(ctx.settings.record_timeout),
    };

    Err(RecordFailure {
        path: record.path,
        key,
        reason,
    })
}

/// File contents as stored in the KV: UTF-8 text trimmed, anything else as is.
///
/// Symlinks are followed only while they stay inside the working copy.
async fn read_contents(working_dir: &Path, path: &str) -> crate::Result<Vec<u8>> {
    let root = tokio::fs::canonicalize(working_dir).await?;
    let resolved = tokio::fs::canonicalize(working_dir.join(path)).await?;
    if !resolved.starts_with(&root) {
        return Err(Git2KvError::Other(format!(
            "{} resolves outside the working copy",
            path
        )));
    }

    let bytes = tokio::fs::read(&resolved).await?;
    Ok(normalize_contents(bytes))
}

fn normalize_contents(bytes: Vec<u8>) -> Vec<u8> {
    match String::from_utf8(bytes) {
        Ok(text) => text.trim().as_bytes().to_vec(),
        Err(e) => e.into_bytes(),
    }
}

fn timed_out(limit: Duration) -> String {
    format!("timed out after {:?}", limit)
}
