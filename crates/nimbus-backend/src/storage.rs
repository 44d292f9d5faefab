//! Block storage capability

use crate::error::Result;
use async_trait::async_trait;

/// Volumes and their snapshots, addressed by the opaque path the backend returns
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Allocate a volume and return its backend path
    async fn create_volume(&self, name: &str, size_gb: u32) -> Result<String>;

    async fn delete_volume(&self, path: &str) -> Result<()>;

    /// Prepare `path` for `instance` and return the host path to bind
    async fn attach_volume(&self, path: &str, instance: &str) -> Result<String>;

    async fn detach_volume(&self, path: &str, instance: &str) -> Result<()>;

    /// Copy the volume at `path` into a snapshot called `snapshot`, returning its path
    async fn create_snapshot(&self, path: &str, snapshot: &str) -> Result<String>;

    /// Overwrite the volume at `path` with the snapshot at `snapshot_path`
    async fn restore_snapshot(&self, path: &str, snapshot_path: &str) -> Result<()>;

    async fn delete_snapshot(&self, snapshot_path: &str) -> Result<()>;
}
