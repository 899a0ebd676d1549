//! KV store adapter
//!
//! The sync engine reads and writes the store through [`KvStore`]. Production
//! uses [`ConsulKv`] over Consul's HTTP KV API; dry runs and tests use the
//! in-process [`MemoryKv`].

mod consul_kv;
mod memory;

pub use consul_kv::ConsulKv;
pub use memory::MemoryKv;

use crate::Result;
use async_trait::async_trait;

/// Keyed operations against a Consul-style KV store.
///
/// Every mutation is independent and idempotent by key; there is no
/// transaction spanning several keys.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Value stored under `key`, `None` when absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite `key`
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`; removing an absent key succeeds
    async fn delete(&self, key: &str) -> Result<()>;
}
