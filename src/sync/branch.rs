//! Branch sync unit: one serialized, coalescing sync loop per branch

use super::engine::{sync_branch, SyncContext, SyncMode};
use super::keys::BranchDescriptor;
use super::outcome::{SyncError, SyncResult};
use crate::metrics;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::oneshot;

/// A request for one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRequest {
    /// Ref the trigger believes the branch is at; absent for polling
    pub hint: Option<String>,
}

/// Counters and last result of a unit
#[derive(Debug, Clone, Default)]
pub struct UnitStatus {
    pub cycles: u64,
    pub failures: u64,
    pub coalesced: u64,
    pub last_ref: Option<String>,
    pub last_error: Option<String>,
    pub last_completed: Option<DateTime<Utc>>,
}

type Waiter = oneshot::Sender<SyncResult>;

#[derive(Default)]
struct PendingState {
    /// A cycle is running
    busy: bool,

    /// Request for the cycle after the running one; newest wins
    coalesced: Option<SyncRequest>,

    /// Waiters resolved by the running cycle
    current: Vec<Waiter>,

    /// Waiters resolved by the coalesced cycle
    queued: Vec<Waiter>,

    status: UnitStatus,
}

struct UnitInner {
    descriptor: BranchDescriptor,
    ctx: SyncContext,
    state: Mutex<PendingState>,
}

/// Owner of one branch's working copy and checkpoint.
///
/// At most one cycle runs at a time. Requests arriving while a cycle runs
/// are merged into a single follow-up cycle that uses the newest hint; every
/// caller is answered by the first cycle that starts after its request.
#[derive(Clone)]
pub struct BranchSyncUnit {
    inner: Arc<UnitInner>,
}

impl BranchSyncUnit {
    /// Prepare the working copy and run the first cycle.
    ///
    /// An existing working copy is pulled. A missing one is cloned from
    /// `url` and synced without pulling. The unit is returned only once
    /// that first cycle succeeded.
    pub async fn create(
        ctx: SyncContext,
        mut descriptor: BranchDescriptor,
        url: &str,
    ) -> Result<Self, SyncError> {
        let mode = if descriptor.working_dir.exists() {
            tracing::debug!(branch = %descriptor, path = %descriptor.working_dir.display(), "Reusing existing working copy");
            SyncMode::Pull
        } else {
            let repo_dir = descriptor.repo_dir();
            let clone_error = |reason: String| SyncError::Clone {
                branch: descriptor.to_string(),
                reason,
            };

            tokio::fs::create_dir_all(&repo_dir)
                .await
                .map_err(|e| clone_error(format!("cannot create {}: {}", repo_dir.display(), e)))?;

            let working_dir = ctx
                .vcs
                .clone_branch(url, &descriptor.branch, &repo_dir)
                .await
                .map_err(|e| clone_error(e.to_string()))?;

            descriptor.working_dir = working_dir;
            SyncMode::AfterClone
        };

        let unit = Self {
            inner: Arc::new(UnitInner {
                descriptor,
                ctx,
                state: Mutex::new(PendingState::default()),
            }),
        };

        let result = unit.inner.run_cycle(&SyncRequest::default(), mode).await;
        unit.inner.lock_state().status.record(&result);
        result?;

        Ok(unit)
    }

    pub fn descriptor(&self) -> &BranchDescriptor {
        &self.inner.descriptor
    }

    pub fn repo(&self) -> &str {
        &self.inner.descriptor.repo
    }

    pub fn branch(&self) -> &str {
        &self.inner.descriptor.branch
    }

    /// Snapshot of the unit's counters
    pub fn status(&self) -> UnitStatus {
        self.inner.lock_state().status.clone()
    }

    /// Whether a cycle is running
    pub fn is_busy(&self) -> bool {
        self.inner.lock_state().busy
    }

    /// Ask for a sync cycle.
    ///
    /// The request is registered before this returns; the future only waits
    /// for the outcome of the cycle that serves it.
    pub fn request_sync(
        &self,
        hint: Option<String>,
    ) -> impl Future<Output = SyncResult> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let request = SyncRequest { hint };

        let start = {
            let mut state = self.inner.lock_state();
            if state.busy {
                if let Some(ref superseded) = state.coalesced {
                    tracing::debug!(
                        branch = %self.inner.descriptor,
                        superseded = ?superseded.hint,
                        hint = ?request.hint,
                        "Replacing pending sync request"
                    );
                }
                state.coalesced = Some(request);
                state.queued.push(tx);
                state.status.coalesced += 1;
                metrics::record_coalesced(&self.inner.descriptor.repo, &self.inner.descriptor.branch);
                None
            } else {
                state.busy = true;
                state.current.push(tx);
                Some(request)
            }
        };

        if let Some(request) = start {
            tokio::spawn(Arc::clone(&self.inner).drive(request));
        }

        let branch = self.inner.descriptor.to_string();
        async move {
            rx.await
                .unwrap_or(Err(SyncError::Interrupted { branch }))
        }
    }
}

impl UnitInner {
    fn lock_state(&self) -> MutexGuard<'_, PendingState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run cycles until no request is pending, then go idle
    async fn drive(self: Arc<Self>, first: SyncRequest) {
        let mut request = first;

        loop {
            let result = match AssertUnwindSafe(self.run_cycle(&request, SyncMode::Pull))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!(branch = %self.descriptor, "Sync cycle panicked");
                    Err(SyncError::Interrupted {
                        branch: self.descriptor.to_string(),
                    })
                }
            };

            let next = {
                let mut state = self.lock_state();
                state.status.record(&result);

                for waiter in state.current.drain(..) {
                    // Callers that stopped waiting are fine to skip
                    let _ = waiter.send(result.clone());
                }

                match state.coalesced.take() {
                    Some(next) => {
                        state.current = std::mem::take(&mut state.queued);
                        Some(next)
                    }
                    None => {
                        state.busy = false;
                        None
                    }
                }
            };

            match next {
                Some(next) => request = next,
                None => break,
            }
        }
    }

    async fn run_cycle(&self, request: &SyncRequest, mode: SyncMode) -> SyncResult {
        let started = Instant::now();
        tracing::debug!(branch = %self.descriptor, hint = ?request.hint, ?mode, "Starting sync cycle");

        let result = sync_branch(&self.ctx, &self.descriptor, mode, request.hint.as_deref()).await;

        metrics::record_sync_duration(
            &self.descriptor.repo,
            &self.descriptor.branch,
            started.elapsed().as_secs_f64(),
        );

        match result {
            Ok(ref outcome) if outcome.already_processed => metrics::record_sync_cycle("noop"),
            Ok(_) => metrics::record_sync_cycle("success"),
            Err(ref e) => {
                metrics::record_sync_cycle("failure");
                tracing::error!(branch = %self.descriptor, error = %e, "Sync cycle failed");
            }
        }

        result
    }
}

impl UnitStatus {
    fn record(&mut self, result: &SyncResult) {
        self.cycles += 1;
        match result {
            Ok(outcome) => {
                self.last_ref = Some(outcome.resolved_ref.clone());
                self.last_error = None;
                self.last_completed = Some(outcome.completed_at);
            }
            Err(e) => {
                self.failures += 1;
                self.last_error = Some(e.to_string());
                self.last_completed = Some(Utc::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::sync::testing::{context, write_file, FakeVcs};
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    fn descriptor(store: &Path) -> BranchDescriptor {
        BranchDescriptor {
            repo: "repo".into(),
            branch: "main".into(),
            working_dir: store.join("repo").join("main"),
            include_branch_name: true,
        }
    }

    /// A unit past its first cycle, with a working copy holding `a.txt`
    async fn ready_unit(store: &TempDir, vcs: Arc<FakeVcs>, kv: MemoryKv) -> BranchSyncUnit {
        let descriptor = descriptor(store.path());
        write_file(&descriptor.working_dir, "a.txt", "x");
        BranchSyncUnit::create(context(vcs, Arc::new(kv)), descriptor, "/tmp/upstream")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_clones_missing_working_copy() {
        let store = TempDir::new().unwrap();
        let vcs = Arc::new(FakeVcs::new("R1", &[]));
        let kv = MemoryKv::new();

        let unit = BranchSyncUnit::create(
            context(vcs.clone(), Arc::new(kv.clone())),
            descriptor(store.path()),
            "/tmp/upstream",
        )
        .await
        .unwrap();

        assert_eq!(vcs.clones(), 1);
        assert_eq!(vcs.pulls(), 0);
        assert!(store.path().join("repo/main").is_dir());
        assert_eq!(kv.get_string("repo/main.ref").as_deref(), Some("R1"));
        assert_eq!(unit.status().cycles, 1);
        assert!(!unit.is_busy());
    }

    #[tokio::test]
    async fn test_create_pulls_existing_working_copy() {
        let store = TempDir::new().unwrap();
        let vcs = Arc::new(FakeVcs::new("R1", &["a.txt"]));
        let kv = MemoryKv::new();

        ready_unit(&store, vcs.clone(), kv.clone()).await;

        assert_eq!(vcs.clones(), 0);
        assert_eq!(vcs.pulls(), 1);
        assert_eq!(kv.get_string("repo/main/a.txt").as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_create_reports_clone_failure() {
        let store = TempDir::new().unwrap();
        let vcs = Arc::new(FakeVcs::new("R1", &[]));
        vcs.fail_clones(true);

        let err = BranchSyncUnit::create(
            context(vcs, Arc::new(MemoryKv::new())),
            descriptor(store.path()),
            "/tmp/upstream",
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(err, SyncError::Clone { .. }));
    }

    #[tokio::test]
    async fn test_requests_during_a_cycle_are_coalesced() {
        let store = TempDir::new().unwrap();
        let gate = Arc::new(Semaphore::new(1));
        let vcs = Arc::new(FakeVcs::new("R1", &["a.txt"]).gated(gate.clone()));
        let kv = MemoryKv::new();
        let unit = ready_unit(&store, vcs.clone(), kv.clone()).await;
        vcs.set_diff("R1", "R2", Vec::new());
        vcs.set_head("R2");

        let a = unit.request_sync(Some("a".into()));
        let b = unit.request_sync(Some("b".into()));
        let c = unit.request_sync(Some("c".into()));
        assert!(unit.is_busy());

        gate.add_permits(2);
        let (a, b, c) = tokio::join!(a, b, c);
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        // The running cycle, then one for c; b never runs on its own
        assert_eq!(vcs.pulls(), 3);
        assert_eq!(a.hint.as_deref(), Some("a"));
        assert_eq!(b.hint.as_deref(), Some("c"));
        assert_eq!(c.hint.as_deref(), Some("c"));
        assert!(!a.already_processed);
        assert!(c.already_processed);
        assert_eq!(kv.get_string("repo/main.ref").as_deref(), Some("R2"));

        let status = unit.status();
        assert_eq!(status.cycles, 3);
        assert_eq!(status.coalesced, 2);
        assert!(!unit.is_busy());
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter_and_unit_recovers() {
        let store = TempDir::new().unwrap();
        let gate = Arc::new(Semaphore::new(1));
        let vcs = Arc::new(FakeVcs::new("R1", &["a.txt"]).gated(gate.clone()));
        let unit = ready_unit(&store, vcs.clone(), MemoryKv::new()).await;

        vcs.fail_pulls(true);
        let first = unit.request_sync(None);
        let second = unit.request_sync(None);
        gate.add_permits(2);
        let (first, second) = tokio::join!(first, second);
        assert!(matches!(first, Err(SyncError::Pull { .. })));
        assert!(matches!(second, Err(SyncError::Pull { .. })));
        assert_eq!(unit.status().failures, 2);

        vcs.fail_pulls(false);
        gate.add_permits(1);
        let outcome = unit.request_sync(None).await.unwrap();
        assert!(outcome.already_processed);
        assert!(unit.status().last_error.is_none());
    }

    #[tokio::test]
    async fn test_idle_unit_starts_a_new_cycle_per_request() {
        let store = TempDir::new().unwrap();
        let vcs = Arc::new(FakeVcs::new("R1", &["a.txt"]));
        let unit = ready_unit(&store, vcs.clone(), MemoryKv::new()).await;

        unit.request_sync(None).await.unwrap();
        unit.request_sync(None).await.unwrap();

        assert_eq!(vcs.pulls(), 3);
        assert_eq!(unit.status().coalesced, 0);
    }
}
