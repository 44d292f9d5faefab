use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored secret; `ciphertext` is the output of the secret cipher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub ciphertext: String,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What callers get back. `value` is `None` unless the secret was read by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretView {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub value: Option<String>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Secret {
    pub fn redacted(&self) -> SecretView {
        SecretView {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            value: None,
            last_accessed_at: self.last_accessed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn revealed(&self, plaintext: String) -> SecretView {
        SecretView {
            value: Some(plaintext),
            ..self.redacted()
        }
    }
}
