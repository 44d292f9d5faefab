use super::status_display;
use crate::template::ResourceType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A persisted template execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub template: String,
    pub parameters: HashMap<String, String>,
    /// Created resources in creation order
    pub resources: Vec<StackResource>,
    pub status: StackStatus,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    CreateInProgress,
    CreateComplete,
    CreateFailed,
    RollbackInProgress,
    RollbackComplete,
    RollbackFailed,
    DeleteInProgress,
    DeleteFailed,
}

status_display!(StackStatus {
    CreateInProgress => "CREATE_IN_PROGRESS",
    CreateComplete => "CREATE_COMPLETE",
    CreateFailed => "CREATE_FAILED",
    RollbackInProgress => "ROLLBACK_IN_PROGRESS",
    RollbackComplete => "ROLLBACK_COMPLETE",
    RollbackFailed => "ROLLBACK_FAILED",
    DeleteInProgress => "DELETE_IN_PROGRESS",
    DeleteFailed => "DELETE_FAILED",
});

impl StackStatus {
    /// No driver is working on the stack any more
    pub fn is_settled(&self) -> bool {
        !matches!(
            self,
            StackStatus::CreateInProgress
                | StackStatus::RollbackInProgress
                | StackStatus::DeleteInProgress
        )
    }
}

impl Stack {
    pub fn new(
        tenant_id: Uuid,
        user_id: Uuid,
        name: impl Into<String>,
        template: impl Into<String>,
        parameters: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            name: name.into(),
            template: template.into(),
            parameters,
            resources: Vec::new(),
            status: StackStatus::CreateInProgress,
            status_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn physical_id(&self, logical_id: &str) -> Option<Uuid> {
        self.resources
            .iter()
            .find(|r| r.logical_id == logical_id)
            .map(|r| r.physical_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackResource {
    pub logical_id: String,
    pub physical_id: Uuid,
    pub resource_type: ResourceType,
    pub status: StackResourceStatus,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackResourceStatus {
    CreateComplete,
    DeleteComplete,
    DeleteFailed,
}

status_display!(StackResourceStatus {
    CreateComplete => "CREATE_COMPLETE",
    DeleteComplete => "DELETE_COMPLETE",
    DeleteFailed => "DELETE_FAILED",
});
