//! Repo/branch registry
//!
//! Creates one [`BranchSyncUnit`] per configured branch and routes trigger
//! events to them by branch name. Repositories start concurrently; a
//! repository whose configuration or first sync fails is reported and left
//! out, the others keep running.

use crate::config::{validate_repo, Git2KvConfig, RepoConfig};
use crate::git::VersionControl;
use crate::kv::KvStore;
use crate::metrics;
use crate::sync::{BranchDescriptor, BranchSyncUnit, EngineSettings, SyncContext};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The branch units of one repository
pub struct RepoHandle {
    name: String,
    units: BTreeMap<String, BranchSyncUnit>,
}

impl RepoHandle {
    pub fn new(name: impl Into<String>, units: impl IntoIterator<Item = BranchSyncUnit>) -> Self {
        Self {
            name: name.into(),
            units: units
                .into_iter()
                .map(|unit| (unit.branch().to_string(), unit))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self, branch: &str) -> Option<&BranchSyncUnit> {
        self.units.get(branch)
    }

    pub fn units(&self) -> impl Iterator<Item = &BranchSyncUnit> {
        self.units.values()
    }

    /// Request a sync of `branch`. Returns false when the branch is not tracked.
    ///
    /// The request is registered before this returns; its outcome is logged.
    pub fn dispatch(&self, branch: &str, hint: Option<String>, source: &'static str) -> bool {
        let Some(unit) = self.units.get(branch) else {
            tracing::debug!(repo = %self.name, branch, source, "No branch tracked under this name, ignoring");
            return false;
        };

        metrics::record_trigger(source);
        let pending = unit.request_sync(hint);
        let label = unit.descriptor().to_string();

        tokio::spawn(async move {
            match pending.await {
                Ok(outcome) => tracing::debug!(
                    branch = %label,
                    source,
                    commit = %outcome.resolved_ref,
                    written = outcome.written,
                    deleted = outcome.deleted,
                    "Updates in branch complete"
                ),
                Err(e) => tracing::warn!(branch = %label, source, error = %e, "Triggered sync failed"),
            }
        });

        true
    }

    /// Request a sync of every branch without a hint
    pub fn dispatch_all(&self, source: &'static str) {
        for branch in self.units.keys() {
            self.dispatch(branch, None, source);
        }
    }
}

/// Why a repository did not start
#[derive(Debug, Clone, PartialEq)]
pub struct RepoStartError {
    pub repo: String,
    pub errors: Vec<String>,
}

impl std::fmt::Display for RepoStartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Repo {} failed to start: {}", self.repo, self.errors.join("; "))
    }
}

/// Every repository that started
#[derive(Default)]
pub struct Registry {
    repos: BTreeMap<String, Arc<RepoHandle>>,
}

impl Registry {
    /// Validate and start every configured repository.
    ///
    /// `vcs_for` supplies the version-control adapter of a repository.
    pub async fn start<F>(
        config: &Git2KvConfig,
        kv: Arc<dyn KvStore>,
        vcs_for: F,
    ) -> (Self, Vec<RepoStartError>)
    where
        F: Fn(&RepoConfig) -> Arc<dyn VersionControl>,
    {
        let settings = EngineSettings::from_config(config);

        let starts = config.repos.iter().map(|repo| {
            let ctx = SyncContext::new(vcs_for(repo), Arc::clone(&kv), settings);
            start_repo(repo, ctx, config)
        });

        let mut registry = Registry::default();
        let mut failures = Vec::new();
        for result in join_all(starts).await {
            match result {
                Ok(handle) => {
                    registry
                        .repos
                        .insert(handle.name().to_string(), Arc::new(handle));
                }
                Err(e) => failures.push(e),
            }
        }

        (registry, failures)
    }

    pub fn repo(&self, name: &str) -> Option<Arc<RepoHandle>> {
        self.repos.get(name).cloned()
    }

    /// Stop routing to a repository
    pub fn remove(&mut self, name: &str) -> Option<Arc<RepoHandle>> {
        let removed = self.repos.remove(name);
        if removed.is_some() {
            tracing::info!(repo = name, "Repo removed from registry");
        }
        removed
    }

    pub fn repos(&self) -> impl Iterator<Item = &Arc<RepoHandle>> {
        self.repos.values()
    }

    pub fn units(&self) -> impl Iterator<Item = &BranchSyncUnit> {
        self.repos.values().flat_map(|repo| repo.units())
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }
}

async fn start_repo(
    repo: &RepoConfig,
    ctx: SyncContext,
    config: &Git2KvConfig,
) -> Result<RepoHandle, RepoStartError> {
    if let Err(errors) = validate_repo(repo) {
        return Err(RepoStartError {
            repo: repo.name.clone(),
            errors: errors.iter().map(|e| e.to_string()).collect(),
        });
    }

    tracing::info!(repo = %repo.name, branches = ?repo.branches, "Starting repo");

    let creates = repo.branches.iter().map(|branch| {
        let descriptor = BranchDescriptor::new(repo, branch.as_str(), &config.local_store);
        BranchSyncUnit::create(ctx.clone(), descriptor, &repo.url)
    });

    let mut units = Vec::new();
    let mut errors = Vec::new();
    for result in join_all(creates).await {
        match result {
            Ok(unit) => units.push(unit),
            Err(e) => errors.push(e.to_string()),
        }
    }

    if !errors.is_empty() {
        return Err(RepoStartError {
            repo: repo.name.clone(),
            errors,
        });
    }

    tracing::info!(repo = %repo.name, branches = units.len(), "Repo ready");
    Ok(RepoHandle::new(repo.name.clone(), units))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::sync::testing::FakeVcs;
    use tempfile::TempDir;

    fn config(store: &TempDir, repos: Vec<RepoConfig>) -> Git2KvConfig {
        let mut config = Git2KvConfig::new(store.path());
        for repo in repos {
            config.add_repo(repo);
        }
        config
    }

    #[tokio::test]
    async fn test_start_creates_one_unit_per_branch() {
        let store = TempDir::new().unwrap();
        let config = config(
            &store,
            vec![
                RepoConfig::new("one", "/tmp/one")
                    .with_branch("main")
                    .with_branch("dev"),
                RepoConfig::new("two", "/tmp/two").with_branch("main"),
            ],
        );
        let kv = MemoryKv::new();
        let vcs = Arc::new(FakeVcs::new("R1", &[]));

        let (registry, failures) = Registry::start(&config, Arc::new(kv.clone()), |_| {
            vcs.clone() as Arc<dyn VersionControl>
        })
        .await;

        assert!(failures.is_empty());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.units().count(), 3);
        assert!(registry.repo("one").unwrap().unit("dev").is_some());
        assert_eq!(kv.get_string("one/dev.ref").as_deref(), Some("R1"));
        assert_eq!(kv.get_string("two/main.ref").as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn test_broken_repo_does_not_stop_the_others() {
        let store = TempDir::new().unwrap();
        let config = config(
            &store,
            vec![
                RepoConfig::new("good", "/tmp/good").with_branch("main"),
                RepoConfig::new("dupes", "/tmp/dupes")
                    .with_branch("main")
                    .with_branch("main"),
            ],
        );
        let vcs = Arc::new(FakeVcs::new("R1", &[]));

        let (registry, failures) = Registry::start(&config, Arc::new(MemoryKv::new()), |_| {
            vcs.clone() as Arc<dyn VersionControl>
        })
        .await;

        assert_eq!(registry.len(), 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].repo, "dupes");
        assert!(failures[0]
            .to_string()
            .contains("Duplicate name found in branches for repo dupes: main"));
    }

    #[tokio::test]
    async fn test_failed_clone_fails_the_repo() {
        let store = TempDir::new().unwrap();
        let config = config(
            &store,
            vec![RepoConfig::new("r", "/tmp/r").with_branch("main")],
        );
        let vcs = Arc::new(FakeVcs::new("R1", &[]));
        vcs.fail_clones(true);

        let (registry, failures) = Registry::start(&config, Arc::new(MemoryKv::new()), |_| {
            vcs.clone() as Arc<dyn VersionControl>
        })
        .await;

        assert!(registry.is_empty());
        assert!(failures[0].errors[0].contains("Failed to clone branch r/main"));
    }

    #[tokio::test]
    async fn test_remove_repo() {
        let store = TempDir::new().unwrap();
        let config = config(
            &store,
            vec![
                RepoConfig::new("a", "/tmp/a").with_branch("main"),
                RepoConfig::new("b", "/tmp/b").with_branch("main"),
            ],
        );
        let vcs = Arc::new(FakeVcs::new("R1", &[]));
        let (mut registry, _) = Registry::start(&config, Arc::new(MemoryKv::new()), |_| {
            vcs.clone() as Arc<dyn VersionControl>
        })
        .await;

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(registry.repo("a").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_branch_is_ignored() {
        let store = TempDir::new().unwrap();
        let config = config(
            &store,
            vec![RepoConfig::new("r", "/tmp/r").with_branch("main")],
        );
        let vcs = Arc::new(FakeVcs::new("R1", &[]));
        let (registry, _) = Registry::start(&config, Arc::new(MemoryKv::new()), |_| {
            vcs.clone() as Arc<dyn VersionControl>
        })
        .await;
        let repo = registry.repo("r").unwrap();

        assert!(!repo.dispatch("nope", Some("abc".into()), "github"));
        assert!(repo.dispatch("main", Some("abc".into()), "github"));

        // Queued behind (or after) the dispatched cycle
        repo.unit("main").unwrap().request_sync(None).await.unwrap();
        assert_eq!(repo.unit("main").unwrap().status().cycles, 3);
    }
}
