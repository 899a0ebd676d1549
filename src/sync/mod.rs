//! Per-branch synchronization
//!
//! Mirrors one git branch into the KV store.
//!
//! # Architecture
//!
//! Each tracked branch is owned by exactly one [`BranchSyncUnit`]. Trigger
//! sources call [`BranchSyncUnit::request_sync`]; the unit serializes cycles
//! and coalesces requests that arrive while a cycle runs, so at most one
//! [`sync_branch`] cycle touches a working copy at any time.
//!
//! ## Cycle Phases
//!
//! 1. **Pull Phase**: Bring the working copy up to date and resolve its ref
//! 2. **Diff Phase**: Compare the resolved ref with the stored checkpoint
//! 3. **Apply Phase**: Write or delete one KV entry per changed file, concurrently
//! 4. **Checkpoint Phase**: Record the resolved ref, only if every record landed
//!
//! # Example
//!
//! ```ignore
//! use git2kv::sync::{BranchDescriptor, BranchSyncUnit, SyncContext};
//!
//! let unit = BranchSyncUnit::create(ctx, descriptor, "https://github.com/org/cfg.git").await?;
//! let outcome = unit.request_sync(Some(head_sha)).await?;
//! println!("{} written, {} deleted", outcome.written, outcome.deleted);
//! ```

mod branch;
mod engine;
mod keys;
mod outcome;

#[cfg(test)]
pub(crate) mod testing;

pub use branch::{BranchSyncUnit, SyncRequest, UnitStatus};
pub use engine::{sync_branch, EngineSettings, SyncContext, SyncMode};
pub use keys::{checkpoint_key, data_key, BranchDescriptor};
pub use outcome::{RecordFailure, SyncError, SyncOutcome, SyncResult};
