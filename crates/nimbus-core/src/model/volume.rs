use super::status_display;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A block volume.
///
/// `instance_id.is_some()` ⇔ `status == InUse` ⇔ `!mount_path.is_empty()`;
/// use [`Volume::attach_to`] and [`Volume::release`] to move between the two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub size_gb: u32,
    pub backend_path: String,
    pub status: VolumeStatus,
    pub instance_id: Option<Uuid>,
    pub mount_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeStatus {
    Available,
    InUse,
    Error,
}

status_display!(VolumeStatus {
    Available => "AVAILABLE",
    InUse => "IN_USE",
    Error => "ERROR",
});

impl Volume {
    pub fn new(
        tenant_id: Uuid,
        user_id: Uuid,
        name: impl Into<String>,
        size_gb: u32,
        backend_path: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            name: name.into(),
            size_gb,
            backend_path: backend_path.into(),
            status: VolumeStatus::Available,
            instance_id: None,
            mount_path: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == VolumeStatus::Available
    }

    pub fn attach_to(&mut self, instance_id: Uuid, mount_path: impl Into<String>) {
        self.status = VolumeStatus::InUse;
        self.instance_id = Some(instance_id);
        self.mount_path = mount_path.into();
        self.updated_at = Utc::now();
    }

    pub fn release(&mut self) {
        self.status = VolumeStatus::Available;
        self.instance_id = None;
        self.mount_path.clear();
        self.updated_at = Utc::now();
    }

    /// Default in-container mount point when the caller gives none
    pub fn default_mount_path(&self) -> String {
        format!("/mnt/{}", self.name)
    }
}

/// Point-in-time copy of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub volume_id: Uuid,
    pub name: String,
    pub size_gb: u32,
    pub backend_path: Option<String>,
    pub status: SnapshotStatus,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotStatus {
    Creating,
    Available,
    Error,
}

status_display!(SnapshotStatus {
    Creating => "CREATING",
    Available => "AVAILABLE",
    Error => "ERROR",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_and_release_keep_invariant() {
        let mut vol = Volume::new(Uuid::new_v4(), Uuid::new_v4(), "data", 10, "/v/data.img");
        assert!(vol.is_available());
        assert!(vol.instance_id.is_none());
        assert!(vol.mount_path.is_empty());

        let instance = Uuid::new_v4();
        vol.attach_to(instance, "/mnt/data");
        assert_eq!(vol.status, VolumeStatus::InUse);
        assert_eq!(vol.instance_id, Some(instance));
        assert_eq!(vol.mount_path, "/mnt/data");

        vol.release();
        assert_eq!(vol.status, VolumeStatus::Available);
        assert!(vol.instance_id.is_none());
        assert_eq!(vol.mount_path, "");
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&VolumeStatus::InUse).unwrap(),
            "\"IN_USE\""
        );
        assert_eq!(VolumeStatus::InUse.to_string(), "IN_USE");
    }
}
