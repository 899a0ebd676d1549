//! KV key layout
//!
//! Data keys are `repo/branch/path`, or `repo/path` when the branch segment is
//! disabled for the repository. The checkpoint of a branch always lives at
//! `repo/branch.ref`, whatever the data layout.

use crate::config::RepoConfig;
use std::path::{Path, PathBuf};

/// KV key for a file of a branch
pub fn data_key(repo: &str, branch: &str, include_branch_name: bool, path: &str) -> String {
    if include_branch_name {
        format!("{}/{}/{}", repo, branch, path)
    } else {
        format!("{}/{}", repo, path)
    }
}

/// KV key holding the last fully applied ref of a branch
pub fn checkpoint_key(repo: &str, branch: &str) -> String {
    format!("{}/{}.ref", repo, branch)
}

/// One tracked branch: where its working copy lives and how its keys look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchDescriptor {
    pub repo: String,
    pub branch: String,
    pub working_dir: PathBuf,
    pub include_branch_name: bool,
}

impl BranchDescriptor {
    /// Descriptor for `branch` of `repo`, with its working copy at
    /// `<local_store>/<repo>/<branch>`
    pub fn new(repo: &RepoConfig, branch: impl Into<String>, local_store: &Path) -> Self {
        let branch = branch.into();
        let working_dir = local_store.join(&repo.name).join(&branch);
        Self {
            repo: repo.name.clone(),
            branch,
            working_dir,
            include_branch_name: repo.include_branch_name,
        }
    }

    /// Directory the working copy is cloned into
    pub fn repo_dir(&self) -> PathBuf {
        let mut dir = self.working_dir.clone();
        // Branch names may contain '/', one path component each
        for _ in self.branch.split('/') {
            dir.pop();
        }
        dir
    }

    pub fn data_key(&self, path: &str) -> String {
        data_key(&self.repo, &self.branch, self.include_branch_name, path)
    }

    pub fn checkpoint_key(&self) -> String {
        checkpoint_key(&self.repo, &self.branch)
    }
}

impl std::fmt::Display for BranchDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.repo, self.branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_key_layouts() {
        assert_eq!(data_key("cfg", "main", true, "a/b.json"), "cfg/main/a/b.json");
        assert_eq!(data_key("cfg", "main", false, "a/b.json"), "cfg/a/b.json");
    }

    #[test]
    fn test_checkpoint_key_ignores_layout() {
        let repo = RepoConfig::new("cfg", "/tmp/cfg").with_branch_name_in_keys(false);
        let branch = BranchDescriptor::new(&repo, "main", Path::new("/var/lib/git2kv"));
        assert_eq!(branch.checkpoint_key(), "cfg/main.ref");
        assert_eq!(branch.data_key("x.txt"), "cfg/x.txt");
    }

    #[test]
    fn test_working_dir_layout() {
        let repo = RepoConfig::new("cfg", "/tmp/cfg");
        let branch = BranchDescriptor::new(&repo, "feature/login", Path::new("/store"));
        assert_eq!(branch.working_dir, PathBuf::from("/store/cfg/feature/login"));
        assert_eq!(branch.repo_dir(), PathBuf::from("/store/cfg"));
        assert_eq!(branch.to_string(), "cfg/feature/login");
    }
}
