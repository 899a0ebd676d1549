//! Configuration validation
//!
//! Validates git2kv configuration for correctness:
//! - At least one repository, no duplicate repository names
//! - Every repository has a name, a usable git URL and unique branches
//! - Every hook registration is well formed and no two hooks of a repository
//!   claim the same port and path
//!
//! Errors are split into process-wide settings ([`validate_settings`]) and
//! per-repository problems ([`validate_repo`]) so that one broken repository
//! does not keep the others from starting.

use super::git2kv_config::Git2KvConfig;
use super::repo_config::RepoConfig;
use crate::hooks::HookSpec;
use crate::Git2KvError;
use std::collections::HashSet;

/// Validation error details
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub repo: Option<String>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            repo: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref repo) = self.repo {
            write!(f, "[{}] {}: {}", repo, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate the whole configuration: settings and every repository
pub fn validate_config(config: &Git2KvConfig) -> ValidationResult {
    let mut errors = match validate_settings(config) {
        Ok(()) => Vec::new(),
        Err(errors) => errors,
    };

    for repo in &config.repos {
        if let Err(mut repo_errors) = validate_repo(repo) {
            errors.append(&mut repo_errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate process-wide settings. Any error here is fatal at startup.
pub fn validate_settings(config: &Git2KvConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.repos.is_empty() {
        errors.push(ValidationError::new(
            "repos",
            "At least one repo must be defined",
        ));
    }

    let mut seen_names = HashSet::new();
    for repo in &config.repos {
        if !seen_names.insert(repo.name.as_str()) {
            errors.push(ValidationError::new(
                "repos",
                format!("Duplicate name found in repos: {}", repo.name),
            ));
        }
    }

    if config.local_store.as_os_str().is_empty() {
        errors.push(ValidationError::new(
            "local_store",
            "Local store path cannot be empty",
        ));
    }

    if !config.kv.endpoint.starts_with("http://") && !config.kv.endpoint.starts_with("https://")
    {
        errors.push(ValidationError::new(
            "kv.endpoint",
            format!("Invalid KV endpoint: {}", config.kv.endpoint),
        ));
    }

    if config.record_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "record_timeout_secs",
            "Record timeout must be greater than 0",
        ));
    }

    if config.max_in_flight == 0 {
        errors.push(ValidationError::new(
            "max_in_flight",
            "max_in_flight must be greater than 0",
        ));
    }

    if config.metrics_port == Some(0) {
        errors.push(ValidationError::new(
            "metrics_port",
            "Port must be greater than 0",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a single repository. Errors here disable only this repository.
pub fn validate_repo(repo: &RepoConfig) -> ValidationResult {
    let mut errors = Vec::new();
    let label = if repo.name.is_empty() {
        "<unnamed>"
    } else {
        repo.name.as_str()
    };

    if repo.name.is_empty() {
        errors.push(ValidationError::new("name", "Repo name cannot be empty").with_repo(label));
    } else if repo.name.contains('/') || repo.name == "." || repo.name == ".." {
        errors.push(
            ValidationError::new(
                "name",
                format!("Repo name must be a single path segment: {}", repo.name),
            )
            .with_repo(label),
        );
    }

    if !is_valid_git_url(&repo.url) {
        errors.push(
            ValidationError::new("url", format!("Invalid Git URL format: {}", repo.url))
                .with_repo(label),
        );
    }

    if repo.branches.is_empty() {
        errors.push(ValidationError::new("branches", "No branches specified").with_repo(label));
    }

    let mut seen_branches = HashSet::new();
    for branch in &repo.branches {
        if !is_valid_branch_name(branch) {
            errors.push(
                ValidationError::new("branches", format!("Invalid branch name: '{}'", branch))
                    .with_repo(label),
            );
        }
        if !seen_branches.insert(branch.as_str()) {
            errors.push(
                ValidationError::new(
                    "branches",
                    format!(
                        "Duplicate name found in branches for repo {}: {}",
                        label, branch
                    ),
                )
                .with_repo(label),
            );
        }
    }

    let mut seen_endpoints = HashSet::new();
    for (i, hook) in repo.hooks.iter().enumerate() {
        let field = format!("hooks[{}]", i);
        match HookSpec::parse(hook) {
            Ok(HookSpec::Webhook { port, ref path, .. }) => {
                if !seen_endpoints.insert((port, path.clone())) {
                    errors.push(
                        ValidationError::new(
                            field,
                            format!("A webhook is already listening on {}, {}", port, path),
                        )
                        .with_repo(label),
                    );
                }
            }
            Ok(HookSpec::Polling { .. }) => {}
            Err(e) => {
                errors.push(
                    ValidationError::new(field, format!("Hook configuration failed due to {}", e))
                        .with_repo(label),
                );
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check if a string is a usable git remote
fn is_valid_git_url(url: &str) -> bool {
    // SSH format: git@github.com:user/repo.git
    if url.starts_with("git@") && url.contains(':') {
        return true;
    }

    const SCHEMES: [&str; 5] = ["https://", "http://", "ssh://", "git://", "file://"];
    if SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        return true;
    }

    // Local path: /path/to/repo or ~/path/to/repo
    url.starts_with('/') || url.starts_with("~/")
}

/// Branch names become directory names under the repo's local store
fn is_valid_branch_name(branch: &str) -> bool {
    !branch.is_empty()
        && !branch.starts_with('/')
        && !branch.ends_with('/')
        && branch.split('/').all(|part| !part.is_empty() && part != "." && part != "..")
}

/// Validate configuration and return a Result
pub fn validate_config_result(config: &Git2KvConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        Git2KvError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}
