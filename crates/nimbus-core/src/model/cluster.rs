use super::status_display;
use crate::context::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CLUSTER_PROVISION_QUEUE: &str = "cluster-provision";
pub const CLUSTER_DELETE_QUEUE: &str = "cluster-delete";

/// Managed Kubernetes cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub version: String,
    pub worker_count: u32,
    pub status: ClusterStatus,
    pub status_reason: Option<String>,
    pub network_id: Option<String>,
    pub control_plane_id: Option<String>,
    pub worker_ids: Vec<String>,
    pub api_port: Option<u16>,
    /// Encrypted with the owner's secret key
    pub kubeconfig: Option<String>,
    pub ssh_private_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Pending,
    Provisioning,
    Running,
    Deleting,
    Failed,
}

status_display!(ClusterStatus {
    Pending => "PENDING",
    Provisioning => "PROVISIONING",
    Running => "RUNNING",
    Deleting => "DELETING",
    Failed => "FAILED",
});

impl Cluster {
    pub fn new(
        tenant_id: Uuid,
        user_id: Uuid,
        name: impl Into<String>,
        version: impl Into<String>,
        worker_count: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            name: name.into(),
            version: version.into(),
            worker_count,
            status: ClusterStatus::Pending,
            status_reason: None,
            network_id: None,
            control_plane_id: None,
            worker_ids: Vec::new(),
            api_port: None,
            kubeconfig: None,
            ssh_private_key: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Payload enqueued for the cluster worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterJob {
    pub cluster_id: Uuid,
    #[serde(flatten)]
    pub identity: Identity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_payload_shape() {
        let identity = Identity {
            user_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
        };
        let job = ClusterJob {
            cluster_id: Uuid::nil(),
            identity,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert!(value.get("cluster_id").is_some());
        assert!(value.get("user_id").is_some());
        assert!(value.get("tenant_id").is_some());

        let back: ClusterJob = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }
}
