use super::faults::{CallLog, Faults};
use crate::error::{BackendError, Result};
use crate::storage::StorageBackend;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    /// path -> size_gb
    volumes: HashMap<String, u32>,
    /// path -> (source volume path, size_gb)
    snapshots: HashMap<String, (String, u32)>,
    /// volume path -> instance
    attachments: HashMap<String, String>,
    next_id: u32,
    snapshot_delay: Duration,
}

/// Block storage held in memory
#[derive(Debug, Default)]
pub struct FakeStorage {
    state: Mutex<State>,
    pub calls: CallLog,
    pub faults: Faults,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_snapshot_delay(&self, delay: Duration) {
        self.lock().snapshot_delay = delay;
    }

    pub fn volume_count(&self) -> usize {
        self.lock().volumes.len()
    }

    pub fn has_volume(&self, path: &str) -> bool {
        self.lock().volumes.contains_key(path)
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock().snapshots.len()
    }

    pub fn attached_to(&self, path: &str) -> Option<String> {
        self.lock().attachments.get(path).cloned()
    }
}

#[async_trait]
impl StorageBackend for FakeStorage {
    async fn create_volume(&self, name: &str, size_gb: u32) -> Result<String> {
        self.calls.record("create_volume", &[name]);
        self.faults.check("create_volume", name)?;
        let mut state = self.lock();
        state.next_id += 1;
        let path = format!("/fake/volumes/{}-{}", name, state.next_id);
        state.volumes.insert(path.clone(), size_gb);
        Ok(path)
    }

    async fn delete_volume(&self, path: &str) -> Result<()> {
        self.calls.record("delete_volume", &[path]);
        self.faults.check("delete_volume", path)?;
        let mut state = self.lock();
        state.attachments.remove(path);
        state
            .volumes
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(format!("volume {}", path)))
    }

    async fn attach_volume(&self, path: &str, instance: &str) -> Result<String> {
        self.calls.record("attach_volume", &[path, instance]);
        self.faults.check("attach_volume", path)?;
        let mut state = self.lock();
        if !state.volumes.contains_key(path) {
            return Err(BackendError::NotFound(format!("volume {}", path)));
        }
        state
            .attachments
            .insert(path.to_string(), instance.to_string());
        Ok(path.to_string())
    }

    async fn detach_volume(&self, path: &str, instance: &str) -> Result<()> {
        self.calls.record("detach_volume", &[path, instance]);
        self.faults.check("detach_volume", path)?;
        self.lock().attachments.remove(path);
        Ok(())
    }

    async fn create_snapshot(&self, path: &str, snapshot: &str) -> Result<String> {
        self.calls.record("create_snapshot", &[path, snapshot]);
        let delay = self.lock().snapshot_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.faults.check("create_snapshot", path)?;
        let mut state = self.lock();
        let size = *state
            .volumes
            .get(path)
            .ok_or_else(|| BackendError::NotFound(format!("volume {}", path)))?;
        state.next_id += 1;
        let snap_path = format!("/fake/snapshots/{}-{}", snapshot, state.next_id);
        state
            .snapshots
            .insert(snap_path.clone(), (path.to_string(), size));
        Ok(snap_path)
    }

    async fn restore_snapshot(&self, path: &str, snapshot_path: &str) -> Result<()> {
        self.calls.record("restore_snapshot", &[path, snapshot_path]);
        self.faults.check("restore_snapshot", path)?;
        let state = self.lock();
        if !state.snapshots.contains_key(snapshot_path) {
            return Err(BackendError::NotFound(format!("snapshot {}", snapshot_path)));
        }
        if !state.volumes.contains_key(path) {
            return Err(BackendError::NotFound(format!("volume {}", path)));
        }
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_path: &str) -> Result<()> {
        self.calls.record("delete_snapshot", &[snapshot_path]);
        self.faults.check("delete_snapshot", snapshot_path)?;
        self.lock().snapshots.remove(snapshot_path);
        Ok(())
    }
}
