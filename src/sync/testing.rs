//! Fakes for driving sync cycles without git or Consul

use super::engine::{EngineSettings, SyncContext};
use crate::git::{ChangeRecord, VersionControl};
use crate::kv::{KvStore, MemoryKv};
use crate::{Git2KvError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

pub fn context(vcs: Arc<dyn VersionControl>, kv: Arc<dyn KvStore>) -> SyncContext {
    SyncContext::new(vcs, kv, EngineSettings::default())
}

pub fn write_file(dir: &Path, path: &str, contents: &str) {
    let full = dir.join(path);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(full, contents).unwrap();
}

/// Scripted version control: a fixed head, file list and diffs
#[derive(Default)]
pub struct FakeVcs {
    head: Mutex<String>,
    files: Mutex<Vec<String>>,
    diffs: Mutex<HashMap<(String, String), Vec<ChangeRecord>>>,
    pulls: AtomicUsize,
    clones: AtomicUsize,
    fail_pulls: AtomicBool,
    fail_clones: AtomicBool,
    /// When set, every pull waits for a permit
    gate: Option<Arc<Semaphore>>,
}

impl FakeVcs {
    pub fn new(head: &str, files: &[&str]) -> Self {
        Self {
            head: Mutex::new(head.to_string()),
            files: Mutex::new(files.iter().map(|f| f.to_string()).collect()),
            ..Default::default()
        }
    }

    /// Pulls block until `gate` hands out a permit
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn set_head(&self, head: &str) {
        *self.head.lock().unwrap() = head.to_string();
    }

    pub fn set_diff(&self, from: &str, to: &str, records: Vec<ChangeRecord>) {
        self.diffs
            .lock()
            .unwrap()
            .insert((from.to_string(), to.to_string()), records);
    }

    pub fn fail_pulls(&self, fail: bool) {
        self.fail_pulls.store(fail, Ordering::SeqCst);
    }

    pub fn fail_clones(&self, fail: bool) {
        self.fail_clones.store(fail, Ordering::SeqCst);
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn clones(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn clone_branch(&self, url: &str, branch: &str, dest_parent: &Path) -> Result<PathBuf> {
        self.clones.fetch_add(1, Ordering::SeqCst);
        if self.fail_clones.load(Ordering::SeqCst) {
            return Err(Git2KvError::Git(format!("cannot reach {}", url)));
        }
        let dest = dest_parent.join(branch);
        std::fs::create_dir_all(&dest)?;
        Ok(dest)
    }

    async fn pull(&self, _working_dir: &Path) -> Result<()> {
        if let Some(ref gate) = self.gate {
            gate.acquire()
                .await
                .map_err(|e| Git2KvError::Other(e.to_string()))?
                .forget();
        }
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(Git2KvError::Git("remote hung up".into()));
        }
        Ok(())
    }

    async fn current_ref(&self, _working_dir: &Path) -> Result<String> {
        Ok(self.head.lock().unwrap().clone())
    }

    async fn list_all_files(&self, _working_dir: &Path) -> Result<Vec<String>> {
        Ok(self.files.lock().unwrap().clone())
    }

    async fn list_changed_files(
        &self,
        from_ref: &str,
        to_ref: &str,
        _working_dir: &Path,
    ) -> Result<Vec<ChangeRecord>> {
        self.diffs
            .lock()
            .unwrap()
            .get(&(from_ref.to_string(), to_ref.to_string()))
            .cloned()
            .ok_or_else(|| Git2KvError::Git(format!("no diff from {} to {}", from_ref, to_ref)))
    }
}

/// Memory store whose writes fail or hang for chosen keys
#[derive(Clone, Default)]
pub struct FlakyKv {
    pub inner: MemoryKv,
    failing: Arc<Mutex<HashSet<String>>>,
    hanging: Arc<Mutex<HashSet<String>>>,
}

impl FlakyKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_key(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_string());
    }

    pub fn hang_key(&self, key: &str) {
        self.hanging.lock().unwrap().insert(key.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
        self.hanging.lock().unwrap().clear();
    }
}

#[async_trait]
impl KvStore for FlakyKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let hang = self.hanging.lock().unwrap().contains(key);
        if hang {
            std::future::pending::<()>().await;
        }
        let fail = self.failing.lock().unwrap().contains(key);
        if fail {
            return Err(Git2KvError::Kv(format!("write rejected for {}", key)));
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let fail = self.failing.lock().unwrap().contains(key);
        if fail {
            return Err(Git2KvError::Kv(format!("delete rejected for {}", key)));
        }
        self.inner.delete(key).await
    }
}
