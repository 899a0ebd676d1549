//! libgit2-backed version-control adapter

use super::{ChangeKind, ChangeRecord, VersionControl};
use crate::config::{resolve_secret, RepoConfig};
use crate::{Git2KvError, Result};
use async_trait::async_trait;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    Cred, CredentialType, Delta, DiffOptions, FetchOptions, FileMode, ObjectType, Oid,
    RemoteCallbacks, Repository, TreeWalkMode, TreeWalkResult,
};
use std::path::{Path, PathBuf};

/// libgit2 keeps calling the credentials callback while auth fails
const MAX_CREDENTIAL_ATTEMPTS: u32 = 3;

/// Git credentials configuration
#[derive(Debug, Clone, Default)]
pub struct GitCredentials {
    /// Token for HTTPS remotes
    pub token: Option<String>,

    /// Username paired with the token
    pub username: Option<String>,
}

impl GitCredentials {
    /// Credentials for a configured repository
    ///
    /// Without a token, SSH remotes go through the SSH agent and everything
    /// else falls back to libgit2's default credentials.
    pub fn from_repo_config(repo: &RepoConfig) -> Self {
        let token = repo.token.as_deref().and_then(resolve_secret);
        if repo.token.is_some() && token.is_none() {
            tracing::warn!(repo = %repo.name, "Configured git token resolved to nothing");
        }

        Self {
            username: token.as_ref().map(|_| "git".to_string()),
            token,
        }
    }

    /// Create callback for git2 authentication
    fn create_callbacks(&self) -> RemoteCallbacks<'static> {
        let mut callbacks = RemoteCallbacks::new();

        let token = self.token.clone();
        let username = self.username.clone();
        let mut attempts = 0;

        callbacks.credentials(move |url, username_from_url, allowed_types| {
            attempts += 1;
            tracing::debug!(url, attempt = attempts, "Git credentials callback invoked");

            if attempts > MAX_CREDENTIAL_ATTEMPTS {
                return Err(git2::Error::from_str(&format!(
                    "authentication failed for {} after {} attempts",
                    url, MAX_CREDENTIAL_ATTEMPTS
                )));
            }

            if let Some(ref token) = token {
                if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) {
                    let user = username.as_deref().or(username_from_url).unwrap_or("git");
                    return Cred::userpass_plaintext(user, token);
                }
            }

            if allowed_types.contains(CredentialType::SSH_KEY) {
                if let Some(user) = username_from_url {
                    return Cred::ssh_key_from_agent(user);
                }
            }

            Cred::default()
        });

        callbacks
    }

    fn fetch_options(&self) -> FetchOptions<'static> {
        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(self.create_callbacks());
        fetch_options
    }
}

/// [`VersionControl`] over libgit2.
///
/// Every call opens the repository afresh on a blocking thread; nothing is
/// cached between calls, so the adapter can be shared by all branches of a
/// repository.
#[derive(Debug, Clone, Default)]
pub struct GitAdapter {
    credentials: GitCredentials,
}

impl GitAdapter {
    pub fn new(credentials: GitCredentials) -> Self {
        Self { credentials }
    }

    fn open(working_dir: &Path) -> Result<Repository> {
        Repository::open(working_dir).map_err(|e| {
            Git2KvError::Git(format!(
                "Failed to open repository at {}: {}",
                working_dir.display(),
                e
            ))
        })
    }

    fn clone_blocking(
        credentials: &GitCredentials,
        url: &str,
        branch: &str,
        dest: &Path,
    ) -> Result<()> {
        tracing::info!(url, branch, path = %dest.display(), "Cloning branch");

        // Track only the requested branch, like `git clone --single-branch`
        let refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", branch);

        let mut builder = RepoBuilder::new();
        builder.branch(branch);
        builder.fetch_options(credentials.fetch_options());
        builder.remote_create(move |repo, name, url| repo.remote_with_fetch(name, url, &refspec));

        builder.clone(url, dest).map_err(|e| {
            Git2KvError::Git(format!(
                "Failed to clone branch {} of {} into {}: {}",
                branch,
                url,
                dest.display(),
                e
            ))
        })?;

        tracing::info!(path = %dest.display(), "Branch cloned successfully");
        Ok(())
    }

    /// Fetch origin and force the working copy to the remote branch head.
    ///
    /// The working copy is a read-only mirror, so a diverged local branch is
    /// reset rather than merged.
    fn pull_blocking(credentials: &GitCredentials, working_dir: &Path) -> Result<()> {
        let repo = Self::open(working_dir)?;

        let branch_name = {
            let head = repo.head()?;
            if !head.is_branch() {
                return Err(Git2KvError::Git(format!(
                    "Working copy {} is not on a branch",
                    working_dir.display()
                )));
            }
            head.shorthand()
                .ok_or_else(|| Git2KvError::Git("Could not determine current branch".to_string()))?
                .to_string()
        };

        tracing::debug!(branch = %branch_name, path = %working_dir.display(), "Fetching updates from remote");

        let mut remote = repo.find_remote("origin")?;
        let configured_refspecs: [&str; 0] = [];
        remote
            .fetch(
                &configured_refspecs,
                Some(&mut credentials.fetch_options()),
                None,
            )
            .map_err(|e| {
                Git2KvError::Git(format!("Failed to fetch branch {}: {}", branch_name, e))
            })?;

        let upstream_name = format!("refs/remotes/origin/{}", branch_name);
        let upstream_commit = repo.find_reference(&upstream_name)?.peel_to_commit()?;

        let mut checkout_builder = CheckoutBuilder::new();
        checkout_builder.force();
        repo.checkout_tree(upstream_commit.as_object(), Some(&mut checkout_builder))?;

        repo.find_reference(&format!("refs/heads/{}", branch_name))?
            .set_target(
                upstream_commit.id(),
                &format!("git2kv: fast-forward to {}", upstream_name),
            )?;

        tracing::debug!(branch = %branch_name, commit = %upstream_commit.id(), "Pulled updates");
        Ok(())
    }

    fn current_ref_blocking(working_dir: &Path) -> Result<String> {
        let repo = Self::open(working_dir)?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    fn list_all_files_blocking(working_dir: &Path) -> Result<Vec<String>> {
        let repo = Self::open(working_dir)?;
        let tree = repo.head()?.peel_to_tree()?;

        let mut files = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                match entry.name() {
                    Some(name) => files.push(format!("{}{}", root, name)),
                    None => tracing::warn!(root, "Skipping file with a non UTF-8 name"),
                }
            }
            TreeWalkResult::Ok
        })?;

        Ok(files)
    }

    fn list_changed_files_blocking(
        working_dir: &Path,
        from_ref: &str,
        to_ref: &str,
    ) -> Result<Vec<ChangeRecord>> {
        let repo = Self::open(working_dir)?;

        let tree_of = |reference: &str| -> Result<git2::Tree<'_>> {
            let oid = Oid::from_str(reference)
                .map_err(|e| Git2KvError::Git(format!("Invalid ref {}: {}", reference, e)))?;
            let commit = repo.find_commit(oid).map_err(|e| {
                Git2KvError::Git(format!("Commit {} not found: {}", reference, e))
            })?;
            Ok(commit.tree()?)
        };

        let from_tree = tree_of(from_ref)?;
        let to_tree = tree_of(to_ref)?;

        let mut options = DiffOptions::new();
        options.include_typechange(true);
        let diff = repo.diff_tree_to_tree(Some(&from_tree), Some(&to_tree), Some(&mut options))?;

        let mut records = Vec::new();
        for delta in diff.deltas() {
            let kind = match delta.status() {
                Delta::Added => ChangeKind::Added,
                Delta::Modified => ChangeKind::Modified,
                Delta::Typechange => ChangeKind::TypeChanged,
                Delta::Deleted => ChangeKind::Deleted,
                other => {
                    tracing::warn!(status = ?other, "Unknown git status, skipping delta");
                    continue;
                }
            };

            let file = if kind.is_removal() {
                delta.old_file()
            } else {
                delta.new_file()
            };

            if file.mode() == FileMode::Commit {
                tracing::debug!(path = ?file.path(), "Skipping submodule entry");
                continue;
            }

            match file.path().and_then(|p| p.to_str()) {
                Some(path) => records.push(ChangeRecord::new(kind, path)),
                None => tracing::warn!(path = ?file.path(), "Skipping file with a non UTF-8 name"),
            }
        }

        Ok(records)
    }
}

/// Run a libgit2 operation on the blocking pool
async fn blocking<T, F>(operation: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Git2KvError::Git(format!("{} task failed: {}", operation, e)))?
}

#[async_trait]
impl VersionControl for GitAdapter {
    async fn clone_branch(&self, url: &str, branch: &str, dest_parent: &Path) -> Result<PathBuf> {
        let credentials = self.credentials.clone();
        let url = url.to_string();
        let branch = branch.to_string();
        let dest = dest_parent.join(&branch);

        let target = dest.clone();
        blocking("clone", move || {
            Self::clone_blocking(&credentials, &url, &branch, &target)
        })
        .await?;

        Ok(dest)
    }

    async fn pull(&self, working_dir: &Path) -> Result<()> {
        let credentials = self.credentials.clone();
        let working_dir = working_dir.to_path_buf();
        blocking("pull", move || Self::pull_blocking(&credentials, &working_dir)).await
    }

    async fn current_ref(&self, working_dir: &Path) -> Result<String> {
        let working_dir = working_dir.to_path_buf();
        blocking("current_ref", move || Self::current_ref_blocking(&working_dir)).await
    }

    async fn list_all_files(&self, working_dir: &Path) -> Result<Vec<String>> {
        let working_dir = working_dir.to_path_buf();
        blocking("list_all_files", move || {
            Self::list_all_files_blocking(&working_dir)
        })
        .await
    }

    async fn list_changed_files(
        &self,
        from_ref: &str,
        to_ref: &str,
        working_dir: &Path,
    ) -> Result<Vec<ChangeRecord>> {
        let working_dir = working_dir.to_path_buf();
        let from_ref = from_ref.to_string();
        let to_ref = to_ref.to_string();
        blocking("list_changed_files", move || {
            Self::list_changed_files_blocking(&working_dir, &from_ref, &to_ref)
        })
        .await
    }
}
