//! git2kv - Mirror git branches into a Consul-style key-value store
//!
//! git2kv keeps the files of tracked branches of one or more git repositories
//! available as KV entries, so configuration kept in version control can be
//! read and watched through the KV store. Webhooks and polling timers trigger
//! per-branch sync cycles; each cycle applies the diff since the last fully
//! applied ref and records that ref as a checkpoint.
//!
//! # Architecture
//!
//! - **config**: YAML configuration and validation
//! - **git**: Version-control adapter (libgit2)
//! - **kv**: KV store adapter (Consul HTTP API, in-memory)
//! - **sync**: Branch sync units and the diff-and-apply engine
//! - **registry**: One sync unit per configured branch, event routing
//! - **hooks**: Webhook listeners and polling timers
//! - **daemon**: Startup, signal handling and shutdown
//! - **metrics**: Prometheus metrics

// Core modules
pub mod config;
pub mod error;
pub mod git;
pub mod kv;
pub mod sync;

// Components
pub mod daemon;
pub mod hooks;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod retry;

// Re-exports
pub use error::{Git2KvError, Result};
