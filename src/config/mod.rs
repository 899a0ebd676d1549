//! Configuration system
//!
//! Loads the YAML config file (default `~/.config/git2kv/config.yaml`), or a
//! YAML/JSON document stored in the KV store, describing:
//! - Where branch working copies live (`local_store`)
//! - How to reach the KV store (endpoint, ACL token, retries)
//! - Which repositories and branches to mirror
//! - The trigger sources (webhooks, polling) of each repository

mod git2kv_config;
mod repo_config;
pub mod validation;

pub use git2kv_config::{resolve_secret, Git2KvConfig, KvConfig, DEFAULT_CONFIG_KEY};
pub use repo_config::{HookConfig, RepoConfig};
pub use validation::{
    validate_config, validate_config_result, validate_repo, validate_settings, ValidationError,
};
