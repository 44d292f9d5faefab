//! Directory-backed volumes
//!
//! ```text
//! <root>/volumes/<name>-<id8>/        volume contents, bind-mounted into instances
//! <root>/volumes/<name>-<id8>.json    VolumeMeta
//! <root>/snapshots/<snap>-<id8>/      full copy taken at snapshot time
//! ```

use crate::error::{HostError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_backend::{Result as BackendResult, StorageBackend};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMeta {
    pub name: String,
    pub size_gb: u32,
    pub attached_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Resolve a path handed back by the control plane, refusing anything outside `parent`
    fn owned(&self, path: &str, parent: &Path) -> Result<PathBuf> {
        let path = PathBuf::from(path);
        if path.parent() != Some(parent) {
            return Err(HostError::ForeignPath(path.display().to_string()));
        }
        Ok(path)
    }

    fn meta_path(volume: &Path) -> PathBuf {
        volume.with_extension("json")
    }

    pub async fn read_meta(&self, path: &str) -> Result<VolumeMeta> {
        let volume = self.owned(path, &self.volumes_dir())?;
        let raw = match tokio::fs::read_to_string(Self::meta_path(&volume)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HostError::VolumeNotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    async fn write_meta(&self, volume: &Path, meta: &VolumeMeta) -> Result<()> {
        let json = serde_json::to_string_pretty(meta)?;
        tokio::fs::write(Self::meta_path(volume), json).await?;
        Ok(())
    }
}

fn unique_dir(parent: &Path, name: &str) -> PathBuf {
    let id = Uuid::new_v4().simple().to_string();
    parent.join(format!("{}-{}", name, &id[..8]))
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

async fn copy_tree_blocking(src: PathBuf, dst: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
        .await
        .map_err(std::io::Error::other)??;
    Ok(())
}

async fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn create_volume(&self, name: &str, size_gb: u32) -> BackendResult<String> {
        let dir = unique_dir(&self.volumes_dir(), name);
        tokio::fs::create_dir_all(&dir).await?;
        let meta = VolumeMeta {
            name: name.to_string(),
            size_gb,
            attached_to: None,
            created_at: Utc::now(),
        };
        self.write_meta(&dir, &meta).await?;
        info!(path = %dir.display(), size_gb, "volume created");
        Ok(dir.display().to_string())
    }

    async fn delete_volume(&self, path: &str) -> BackendResult<()> {
        let dir = self.owned(path, &self.volumes_dir())?;
        if !remove_dir_if_exists(&dir).await? {
            debug!(path = %path, "volume directory already gone");
        }
        match tokio::fs::remove_file(Self::meta_path(&dir)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(path = %path, "volume deleted");
        Ok(())
    }

    async fn attach_volume(&self, path: &str, instance: &str) -> BackendResult<String> {
        let mut meta = self.read_meta(path).await?;
        meta.attached_to = Some(instance.to_string());
        self.write_meta(Path::new(path), &meta).await?;
        Ok(path.to_string())
    }

    async fn detach_volume(&self, path: &str, instance: &str) -> BackendResult<()> {
        let mut meta = self.read_meta(path).await?;
        if meta.attached_to.as_deref() == Some(instance) {
            meta.attached_to = None;
            self.write_meta(Path::new(path), &meta).await?;
        }
        Ok(())
    }

    async fn create_snapshot(&self, path: &str, snapshot: &str) -> BackendResult<String> {
        let src = self.owned(path, &self.volumes_dir())?;
        if !tokio::fs::try_exists(&src).await? {
            return Err(HostError::VolumeNotFound(path.to_string()).into());
        }
        let dst = unique_dir(&self.snapshots_dir(), snapshot);
        copy_tree_blocking(src, dst.clone()).await?;
        info!(volume = %path, snapshot = %dst.display(), "snapshot taken");
        Ok(dst.display().to_string())
    }

    async fn restore_snapshot(&self, path: &str, snapshot_path: &str) -> BackendResult<()> {
        let volume = self.owned(path, &self.volumes_dir())?;
        let snapshot = self.owned(snapshot_path, &self.snapshots_dir())?;
        if !tokio::fs::try_exists(&snapshot).await? {
            return Err(HostError::SnapshotNotFound(snapshot_path.to_string()).into());
        }
        remove_dir_if_exists(&volume).await?;
        copy_tree_blocking(snapshot, volume).await?;
        info!(volume = %path, snapshot = %snapshot_path, "snapshot restored");
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_path: &str) -> BackendResult<()> {
        let snapshot = self.owned(snapshot_path, &self.snapshots_dir())?;
        remove_dir_if_exists(&snapshot).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_backend::BackendError;
    use tempfile::TempDir;

    fn storage() -> (TempDir, FileStorage) {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path());
        (tmp, storage)
    }

    #[tokio::test]
    async fn test_create_and_delete_volume() {
        let (_tmp, storage) = storage();
        let path = storage.create_volume("data", 20).await.unwrap();
        assert!(Path::new(&path).is_dir());
        assert!(path.contains("/volumes/data-"));

        let meta = storage.read_meta(&path).await.unwrap();
        assert_eq!(meta.size_gb, 20);
        assert!(meta.attached_to.is_none());

        storage.delete_volume(&path).await.unwrap();
        assert!(!Path::new(&path).exists());
        // second delete is a no-op
        storage.delete_volume(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_records_instance() {
        let (_tmp, storage) = storage();
        let path = storage.create_volume("data", 1).await.unwrap();

        let host = storage.attach_volume(&path, "web-1").await.unwrap();
        assert_eq!(host, path);
        assert_eq!(
            storage.read_meta(&path).await.unwrap().attached_to.as_deref(),
            Some("web-1")
        );

        storage.detach_volume(&path, "web-1").await.unwrap();
        assert!(storage.read_meta(&path).await.unwrap().attached_to.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_and_restore() {
        let (_tmp, storage) = storage();
        let path = storage.create_volume("db", 1).await.unwrap();
        std::fs::create_dir_all(Path::new(&path).join("pg")).unwrap();
        std::fs::write(Path::new(&path).join("pg/table"), "v1").unwrap();

        let snap = storage.create_snapshot(&path, "nightly").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(Path::new(&snap).join("pg/table")).unwrap(),
            "v1"
        );

        std::fs::write(Path::new(&path).join("pg/table"), "v2").unwrap();
        std::fs::write(Path::new(&path).join("extra"), "x").unwrap();
        storage.restore_snapshot(&path, &snap).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(Path::new(&path).join("pg/table")).unwrap(),
            "v1"
        );
        assert!(!Path::new(&path).join("extra").exists());

        storage.delete_snapshot(&snap).await.unwrap();
        assert!(!Path::new(&snap).exists());
    }

    #[tokio::test]
    async fn test_rejects_foreign_paths() {
        let (_tmp, storage) = storage();
        let err = storage.delete_volume("/etc").await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));

        let err = storage.create_snapshot(
            &storage.root().join("volumes/missing-00000000").display().to_string(),
            "s",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }
}
