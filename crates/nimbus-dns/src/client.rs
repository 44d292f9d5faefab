//! DNS API client
//!
//! Talks to a Cloudflare-compatible `zones/<zone>/dns_records` API with bearer
//! token authentication. Instance records live under a per-tenant label:
//! `<instance>.<tenant8>.<domain>`.

use crate::error::{DnsError, Result};
use async_trait::async_trait;
use nimbus_backend::{DnsRegistrar, Result as BackendResult};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::net::Ipv4Addr;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Connection settings
#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub api_base: String,
    pub api_token: String,
    pub zone_id: String,
    pub domain: String,
}

impl DnsConfig {
    /// Read `NIMBUS_DNS_API_TOKEN`, `NIMBUS_DNS_ZONE_ID`, `NIMBUS_DNS_DOMAIN`
    /// and optionally `NIMBUS_DNS_API_BASE`
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| DnsError::MissingEnvVar(name.to_string()))
        };
        Ok(Self {
            api_base: std::env::var("NIMBUS_DNS_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            api_token: var("NIMBUS_DNS_API_TOKEN")?,
            zone_id: var("NIMBUS_DNS_ZONE_ID")?,
            domain: var("NIMBUS_DNS_DOMAIN")?,
        })
    }
}

/// A-record as returned by the API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    pub content: String,
    pub ttl: u32,
}

pub struct DnsClient {
    client: reqwest::Client,
    config: DnsConfig,
}

impl DnsClient {
    pub fn new(config: DnsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    /// Fully qualified name of an instance record
    pub fn record_name(&self, tenant_id: Uuid, instance: &str) -> String {
        let tenant = tenant_id.simple().to_string();
        format!(
            "{}.{}.{}",
            sanitize_label(instance),
            &tenant[..8],
            self.config.domain
        )
    }

    fn records_url(&self) -> String {
        format!(
            "{}/zones/{}/dns_records",
            self.config.api_base.trim_end_matches('/'),
            self.config.zone_id
        )
    }

    async fn check<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let api_response: ApiResponse<T> = response.json().await?;
        if !api_response.success {
            let error_msg = api_response
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(DnsError::ApiError(error_msg));
        }
        api_response
            .result
            .ok_or_else(|| DnsError::ApiError("response carried no result".to_string()))
    }

    pub async fn find_record(&self, name: &str) -> Result<Option<DnsRecord>> {
        let response = self
            .client
            .get(self.records_url())
            .query(&[("type", "A"), ("name", name)])
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;
        let records: Vec<ApiDnsRecord> = Self::check(response).await?;
        Ok(records.into_iter().next().map(Into::into))
    }

    pub async fn create_record(&self, name: &str, ip: Ipv4Addr) -> Result<DnsRecord> {
        let body = CreateDnsRecordRequest {
            r#type: "A".to_string(),
            name: name.to_string(),
            content: ip.to_string(),
            ttl: 60,
            proxied: false,
        };
        let response = self
            .client
            .post(self.records_url())
            .bearer_auth(&self.config.api_token)
            .json(&body)
            .send()
            .await?;
        let record: ApiDnsRecord = Self::check(response).await?;
        Ok(record.into())
    }

    pub async fn update_record(&self, record_id: &str, ip: Ipv4Addr) -> Result<DnsRecord> {
        let response = self
            .client
            .patch(format!("{}/{}", self.records_url(), record_id))
            .bearer_auth(&self.config.api_token)
            .json(&UpdateDnsRecordRequest {
                content: ip.to_string(),
            })
            .send()
            .await?;
        let record: ApiDnsRecord = Self::check(response).await?;
        Ok(record.into())
    }

    pub async fn delete_record(&self, record_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/{}", self.records_url(), record_id))
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;
        let _: serde_json::Value = Self::check(response).await?;
        Ok(())
    }

    /// Create or update so that `name` resolves to `ip`
    pub async fn ensure_record(&self, name: &str, ip: Ipv4Addr) -> Result<DnsRecord> {
        if let Some(existing) = self.find_record(name).await? {
            if existing.content == ip.to_string() {
                debug!(name = %existing.name, "DNS record already up to date");
                return Ok(existing);
            }
            info!(name = %existing.name, from = %existing.content, to = %ip, "updating DNS record");
            return self.update_record(&existing.id, ip).await;
        }
        info!(name = %name, ip = %ip, "creating DNS record");
        self.create_record(name, ip).await
    }

    pub async fn remove_record(&self, name: &str) -> Result<()> {
        match self.find_record(name).await? {
            Some(record) => {
                info!(name = %record.name, "deleting DNS record");
                self.delete_record(&record.id).await
            }
            None => {
                debug!(name = %name, "DNS record not found, nothing to delete");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl DnsRegistrar for DnsClient {
    async fn register_instance(&self, tenant_id: Uuid, name: &str, ip: Ipv4Addr) -> BackendResult<()> {
        self.ensure_record(&self.record_name(tenant_id, name), ip)
            .await?;
        Ok(())
    }

    async fn deregister_instance(&self, tenant_id: Uuid, name: &str) -> BackendResult<()> {
        self.remove_record(&self.record_name(tenant_id, name))
            .await?;
        Ok(())
    }
}

/// Lowercase, `[a-z0-9-]` only, at most 63 characters
pub fn sanitize_label(name: &str) -> String {
    let label: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let label = label.trim_matches('-');
    label.chars().take(63).collect()
}

// ============ API Types ============

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    result: Option<T>,
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiDnsRecord {
    id: String,
    name: String,
    content: String,
    #[serde(default)]
    ttl: u32,
}

impl From<ApiDnsRecord> for DnsRecord {
    fn from(r: ApiDnsRecord) -> Self {
        Self {
            id: r.id,
            name: r.name,
            content: r.content,
            ttl: r.ttl,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateDnsRecordRequest {
    #[serde(rename = "type")]
    r#type: String,
    name: String,
    content: String,
    ttl: u32,
    proxied: bool,
}

#[derive(Debug, Serialize)]
struct UpdateDnsRecordRequest {
    content: String,
}
