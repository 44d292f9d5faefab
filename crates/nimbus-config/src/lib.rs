//! nimbus daemon configuration
//!
//! A YAML file located by [`find_config_file`] and deserialized into
//! [`NimbusConfig`]. Every section has defaults, so an absent file or an empty
//! one yields a working single-host setup.

pub mod error;

pub use error::*;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "NIMBUS_CONFIG";
pub const MASTER_KEY_ENV: &str = "NIMBUS_MASTER_KEY";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NimbusConfig {
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub workers: WorkerConfig,
    pub quota: QuotaLimits,
    pub secrets: SecretsConfig,
    pub proxy: ProxyConfig,
    pub dns: Option<DnsSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Volumes and snapshots live under `<root>/volumes` and `<root>/snapshots`
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("storage"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ovs_vsctl: String,
    pub ovs_ofctl: String,
    pub ip: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ovs_vsctl: "ovs-vsctl".to_string(),
            ovs_ofctl: "ovs-ofctl".to_string(),
            ip: "ip".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub lb_interval_secs: u64,
    pub cluster_interval_secs: u64,
    pub health_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lb_interval_secs: 10,
            cluster_interval_secs: 5,
            health_timeout_ms: 500,
        }
    }
}

/// Per-tenant limits applied when a tenant has no explicit quota
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub instances: u64,
    pub vpcs: u64,
    pub storage_gb: u64,
    pub memory_gb: u64,
    pub vcpus: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            instances: 10,
            vpcs: 5,
            storage_gb: 500,
            memory_gb: 64,
            vcpus: 32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Base64 of 32 random bytes
    pub master_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub config_dir: PathBuf,
    pub image: String,
    /// Name the proxy container uses to reach published instance ports
    pub upstream_host: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            config_dir: data_dir().join("proxy"),
            image: "nginx:1.27-alpine".to_string(),
            upstream_host: "host.docker.internal".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsSettings {
    #[serde(default)]
    pub api_base: Option<String>,
    pub api_token: String,
    pub zone_id: String,
    pub domain: String,
}

impl NimbusConfig {
    /// Parse a YAML document; an empty document gives the defaults
    pub fn from_yaml(text: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Discovered file, or defaults when none exists
    pub fn discover() -> Result<(Self, Option<PathBuf>)> {
        match find_config_file()? {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.workers;
        for (name, value) in [
            ("workers.lb_interval_secs", w.lb_interval_secs),
            ("workers.cluster_interval_secs", w.cluster_interval_secs),
            ("workers.health_timeout_ms", w.health_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if let Some(key) = &self.secrets.master_key {
            decode_master_key(key)?;
        }
        if let Some(dns) = &self.dns
            && (dns.domain.trim().is_empty() || dns.zone_id.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "dns.domain and dns.zone_id are required when dns is configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Master key from `NIMBUS_MASTER_KEY`, falling back to `secrets.master_key`
    pub fn master_key(&self) -> Result<Option<[u8; 32]>> {
        if let Ok(key) = std::env::var(MASTER_KEY_ENV) {
            return decode_master_key(&key).map(Some);
        }
        self.secrets
            .master_key
            .as_deref()
            .map(decode_master_key)
            .transpose()
    }
}

pub fn decode_master_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ConfigError::Invalid(format!("master key is not base64: {}", e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        ConfigError::Invalid(format!("master key must be 32 bytes, got {}", b.len()))
    })
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("nimbus")
}

/// Global config directory (`~/.config/nimbus`), created if missing
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("nimbus");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Locate the daemon config file.
///
/// Search order:
/// 1. `NIMBUS_CONFIG`
/// 2. current directory: nimbus.local.yaml, nimbus.yaml
/// 3. `./.nimbus/` with the same names
/// 4. `~/.config/nimbus/nimbus.yaml`
pub fn find_config_file() -> Result<Option<PathBuf>> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(Some(path));
        }
        return Err(ConfigError::Invalid(format!(
            "{} points to missing file {}",
            CONFIG_ENV,
            path.display()
        )));
    }

    let current_dir = std::env::current_dir()?;
    let candidates = ["nimbus.local.yaml", "nimbus.yaml"];

    for dir in [current_dir.clone(), current_dir.join(".nimbus")] {
        for filename in &candidates {
            let path = dir.join(filename);
            if path.exists() {
                return Ok(Some(path));
            }
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("nimbus").join("nimbus.yaml");
        if global_config.exists() {
            return Ok(Some(global_config));
        }
    }

    Ok(None)
}
