//! `id|name` resolution shared by the services

use crate::store::Store;
use nimbus_core::model::{Instance, Volume, Vpc};
use nimbus_core::{CloudError, Result};
use uuid::Uuid;

/// A caller-supplied reference: a UUID or a resource name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key<'a> {
    Id(Uuid),
    Name(&'a str),
}

impl<'a> Key<'a> {
    pub fn parse(raw: &'a str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CloudError::invalid("an id or name is required"));
        }
        Ok(match Uuid::parse_str(raw) {
            Ok(id) => Key::Id(id),
            Err(_) => Key::Name(raw),
        })
    }
}

pub async fn vpc(store: &dyn Store, tenant_id: Uuid, key: &str) -> Result<Vpc> {
    match Key::parse(key)? {
        Key::Id(id) => store.get_vpc(tenant_id, id).await,
        Key::Name(name) => store
            .find_vpc_by_name(tenant_id, name)
            .await?
            .ok_or_else(|| CloudError::not_found("vpc", name)),
    }
}

pub async fn instance(store: &dyn Store, tenant_id: Uuid, key: &str) -> Result<Instance> {
    match Key::parse(key)? {
        Key::Id(id) => store.get_instance(tenant_id, id).await,
        Key::Name(name) => store
            .find_instance_by_name(tenant_id, name)
            .await?
            .ok_or_else(|| CloudError::not_found("instance", name)),
    }
}

pub async fn volume(store: &dyn Store, tenant_id: Uuid, key: &str) -> Result<Volume> {
    match Key::parse(key)? {
        Key::Id(id) => store.get_volume(tenant_id, id).await,
        Key::Name(name) => store
            .find_volume_by_name(tenant_id, name)
            .await?
            .ok_or_else(|| CloudError::not_found("volume", name)),
    }
}

/// Parse a field that must hold a UUID
pub(crate) fn parse_id(field: &str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| CloudError::invalid(format!("{} '{}' is not a valid id", field, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parse() {
        let id = Uuid::new_v4();
        assert_eq!(Key::parse(&id.to_string()).unwrap(), Key::Id(id));
        assert_eq!(Key::parse(" web-1 ").unwrap(), Key::Name("web-1"));
        assert!(Key::parse("  ").is_err());
    }

    #[tokio::test]
    async fn test_vpc_by_id_or_name_within_tenant() {
        use crate::store::{MemoryStore, VpcStore};
        use nimbus_core::ErrorKind;

        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let cidr = "10.0.0.0/16".parse().unwrap();
        let prod = Vpc::new(tenant, Uuid::new_v4(), "prod", cidr, "nbr-prod");
        store.insert_vpc(&prod).await.unwrap();

        assert_eq!(vpc(&store, tenant, "prod").await.unwrap().id, prod.id);
        assert_eq!(vpc(&store, tenant, &prod.id.to_string()).await.unwrap().id, prod.id);
        let err = vpc(&store, tenant, "staging").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = vpc(&store, Uuid::new_v4(), "prod").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = volume(&store, tenant, " ").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_parse_id_rejects_names() {
        let err = parse_id("vpc_id", "prod").unwrap_err();
        assert_eq!(err.to_string(), "invalid input: vpc_id 'prod' is not a valid id");
    }
}
