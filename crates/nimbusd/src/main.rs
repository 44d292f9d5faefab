//! nimbusd: runs the control plane on a single host
//!
//! Wires Docker, Open vSwitch, directory-backed volumes, the nginx proxy and
//! optional private DNS into a [`ControlPlane`], starts the LB and cluster
//! workers and drains background jobs on shutdown.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nimbus_backend::{DnsRegistrar, MemoryTaskQueue, NoDns, Notifier};
use nimbus_config::NimbusConfig;
use nimbus_container::{DockerCompute, NginxProxy};
use nimbus_controlplane::workers::LbWorkerSettings;
use nimbus_controlplane::{Backends, ControlPlane, MemoryStore, PlatformSettings, SecretCipher};
use nimbus_core::model::QuotaCounters;
use nimbus_dns::{DnsClient, DnsConfig};
use nimbus_host::{FileStorage, OvsNetwork, OvsTools};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "nimbusd")]
#[command(about = "nimbus control plane daemon", version)]
struct Cli {
    /// Config file; searched for when omitted
    #[arg(short, long, env = "NIMBUS_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane until interrupted
    Run,
    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json_logs);

    let (config, source) = load_config(cli.config.as_deref())?;
    match source {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found, using defaults"),
    }

    match cli.command {
        Commands::CheckConfig => {
            let rendered = serde_yaml::to_string(&config).context("failed to render configuration")?;
            println!("{}", rendered);
            Ok(())
        }
        Commands::Run => run(config).await,
    }
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> Result<(NimbusConfig, Option<PathBuf>)> {
    let (config, source) = match path {
        Some(path) => (
            NimbusConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            Some(path.to_path_buf()),
        ),
        None => NimbusConfig::discover().context("failed to discover configuration")?,
    };
    config.validate()?;
    Ok((config, source))
}

fn platform_settings(config: &NimbusConfig) -> Result<PlatformSettings> {
    let cipher = match config.master_key()? {
        Some(key) => SecretCipher::new(&key),
        None => {
            warn!("no master key configured; secrets will not survive a restart");
            SecretCipher::ephemeral()
        }
    };
    let quota = &config.quota;
    Ok(PlatformSettings {
        quota_defaults: QuotaCounters {
            instances: quota.instances,
            vpcs: quota.vpcs,
            storage_gb: quota.storage_gb,
            memory_gb: quota.memory_gb,
            vcpus: quota.vcpus,
        },
        cipher,
        lb: LbWorkerSettings {
            interval: Duration::from_secs(config.workers.lb_interval_secs),
            ..LbWorkerSettings::default()
        },
        health_timeout: Duration::from_millis(config.workers.health_timeout_ms),
        cluster_interval: Duration::from_secs(config.workers.cluster_interval_secs),
    })
}

async fn run(config: NimbusConfig) -> Result<()> {
    let settings = platform_settings(&config)?;

    let compute = Arc::new(
        DockerCompute::connect()
            .await
            .context("failed to connect to Docker")?,
    );

    let network = OvsNetwork::new().with_tools(OvsTools {
        vsctl: config.network.ovs_vsctl.clone(),
        ofctl: config.network.ovs_ofctl.clone(),
        ip: config.network.ip.clone(),
    });
    network
        .check_tools()
        .await
        .context("Open vSwitch tools are not usable")?;

    let storage = FileStorage::new(&config.storage.root);
    let proxy = NginxProxy::new(compute.clone(), &config.proxy.config_dir)
        .with_image(config.proxy.image.clone())
        .with_upstream_host(config.proxy.upstream_host.clone());

    let dns: Arc<dyn DnsRegistrar> = match &config.dns {
        Some(dns) => {
            info!(domain = %dns.domain, "private DNS enabled");
            Arc::new(DnsClient::new(DnsConfig {
                api_base: dns
                    .api_base
                    .clone()
                    .unwrap_or_else(|| nimbus_dns::client::DEFAULT_API_BASE.to_string()),
                api_token: dns.api_token.clone(),
                zone_id: dns.zone_id.clone(),
                domain: dns.domain.clone(),
            }))
        }
        None => Arc::new(NoDns),
    };

    let cp = ControlPlane::new(
        Backends {
            store: Arc::new(MemoryStore::new()),
            compute,
            network: Arc::new(network),
            storage: Arc::new(storage),
            proxy: Arc::new(proxy),
            dns,
            queue: Arc::new(MemoryTaskQueue::new()),
            notifier: Notifier::tracing(),
        },
        settings,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = cp.spawn_workers(shutdown_rx);
    info!(
        storage_root = %config.storage.root.display(),
        "nimbusd started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "worker ended abnormally");
        }
    }
    cp.drain().await;
    info!("nimbusd stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_follow_config() {
        let config = NimbusConfig::from_yaml(
            "quota:\n  instances: 3\nworkers:\n  lb_interval_secs: 2\n  health_timeout_ms: 250\n",
        )
        .unwrap();
        let settings = platform_settings(&config).unwrap();
        assert_eq!(settings.quota_defaults.instances, 3);
        assert_eq!(settings.quota_defaults.vpcs, 5);
        assert_eq!(settings.lb.interval, Duration::from_secs(2));
        assert_eq!(settings.lb.target_host, "127.0.0.1");
        assert_eq!(settings.health_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nimbus.yaml");
        std::fs::write(&path, "workers:\n  cluster_interval_secs: 7\n").unwrap();

        let (config, source) = load_config(Some(&path)).unwrap();
        assert_eq!(config.workers.cluster_interval_secs, 7);
        assert_eq!(source.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nimbus.yaml");
        std::fs::write(&path, "workers:\n  lb_interval_secs: 0\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
