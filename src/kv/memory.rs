use super::KvStore;
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// In-process [`KvStore`]; clones share the same entries
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    entries: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    mutations: Arc<AtomicUsize>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // A panic while holding the lock cannot leave a map half-updated
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of every entry, ordered by key
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.entries().clone()
    }

    /// Every key, ordered
    pub fn keys(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    /// Value under `key` as text, lossily decoded
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.entries()
            .get(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Seed an entry without counting it as a mutation
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries().insert(key.into(), value.into());
    }

    /// Number of `set` and `delete` calls served so far
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.entries().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.entries().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("r/a").await.unwrap(), None);

        kv.set("r/a", b"x").await.unwrap();
        kv.set("r/a", b"x").await.unwrap();
        assert_eq!(kv.get("r/a").await.unwrap(), Some(b"x".to_vec()));
        assert_eq!(kv.keys(), vec!["r/a"]);

        kv.delete("r/a").await.unwrap();
        kv.delete("r/a").await.unwrap();
        assert!(kv.snapshot().is_empty());
        assert_eq!(kv.mutations(), 4);
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let kv = MemoryKv::new();
        let other = kv.clone();
        other.insert("r/main.ref", "abc");
        assert_eq!(kv.get_string("r/main.ref").as_deref(), Some("abc"));
        assert_eq!(kv.mutations(), 0);
    }
}
