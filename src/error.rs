//! Error types for git2kv
//!
//! Defines the crate-level error enum covering configuration, git, KV and
//! listener failures. Uses thiserror for ergonomic error handling.
//!
//! Sync cycle failures have their own cloneable type, [`crate::sync::SyncError`],
//! because one outcome is delivered to many waiters.

use crate::retry::Transient;
use thiserror::Error;

/// Result type alias for git2kv operations
pub type Result<T> = std::result::Result<T, Git2KvError>;

/// Comprehensive error type for git2kv operations
#[derive(Error, Debug)]
pub enum Git2KvError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Git operation errors
    #[error("Git error: {0}")]
    Git(String),

    /// KV store errors
    #[error("KV error: {0}")]
    Kv(String),

    /// Trigger source (webhook / polling) errors
    #[error("Hook error: {0}")]
    Hook(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Git2 library errors
    #[error("Git library error: {0}")]
    Git2(#[from] git2::Error),

    /// Consul client errors
    #[error("Consul error: {0}")]
    Consul(#[from] consul::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl Transient for Git2KvError {
    fn is_transient(&self) -> bool {
        match self {
            Git2KvError::Consul(e) => e.is_transient(),
            Git2KvError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
