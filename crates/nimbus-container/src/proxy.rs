//! nginx-based [`ProxyAdapter`]
//!
//! One nginx container per load balancer. The upstream block is rendered to
//! `<config_dir>/<lb_id>.conf` and bind-mounted as the default server.

use crate::error::ContainerError;
use async_trait::async_trait;
use nimbus_backend::{
    BackendError, ComputeBackend, ContainerSpec, Mount, ProxyAdapter, ProxyTarget,
    Result as BackendResult,
};
use nimbus_core::model::{Algorithm, LoadBalancer, PortMapping};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_PROXY_IMAGE: &str = "nginx:1.27-alpine";
const CONTAINER_CONF: &str = "/etc/nginx/conf.d/default.conf";

/// Name of the upstream block of `lb_id`
pub fn upstream_name(lb_id: Uuid) -> String {
    format!("lb_{}", lb_id.simple())
}

/// Render the nginx server config for a load balancer
pub fn render_config(lb: &LoadBalancer, targets: &[ProxyTarget], upstream_host: &str) -> String {
    let mut out = String::new();
    let name = upstream_name(lb.id);

    if targets.is_empty() {
        let _ = writeln!(out, "# {} has no reachable targets", lb.name);
        let _ = writeln!(out, "server {{");
        let _ = writeln!(out, "    listen 80;");
        let _ = writeln!(out, "    location / {{");
        let _ = writeln!(out, "        return 503;");
        let _ = writeln!(out, "    }}");
        let _ = writeln!(out, "}}");
        return out;
    }

    let _ = writeln!(out, "upstream {} {{", name);
    match lb.algorithm {
        Algorithm::RoundRobin => {}
        Algorithm::LeastConn => {
            let _ = writeln!(out, "    least_conn;");
        }
        Algorithm::IpHash => {
            let _ = writeln!(out, "    ip_hash;");
        }
    }
    for target in targets {
        let _ = writeln!(
            out,
            "    server {}:{} weight={};",
            upstream_host,
            target.port,
            target.weight.max(1)
        );
    }
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);
    let _ = writeln!(out, "server {{");
    let _ = writeln!(out, "    listen 80;");
    let _ = writeln!(out, "    location / {{");
    let _ = writeln!(out, "        proxy_pass http://{};", name);
    let _ = writeln!(out, "        proxy_set_header Host $host;");
    let _ = writeln!(out, "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;");
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");
    out
}

/// Proxy adapter running nginx through a compute backend
pub struct NginxProxy {
    compute: Arc<dyn ComputeBackend>,
    config_dir: PathBuf,
    image: String,
    /// Host name under which nginx reaches published target ports
    upstream_host: String,
    containers: Mutex<HashMap<Uuid, String>>,
}

impl NginxProxy {
    pub fn new(compute: Arc<dyn ComputeBackend>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            compute,
            config_dir: config_dir.into(),
            image: DEFAULT_PROXY_IMAGE.to_string(),
            upstream_host: "host.docker.internal".to_string(),
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_upstream_host(mut self, host: impl Into<String>) -> Self {
        self.upstream_host = host.into();
        self
    }

    pub fn config_path(&self, lb_id: Uuid) -> PathBuf {
        self.config_dir.join(format!("{}.conf", lb_id))
    }

    fn container_name(lb_id: Uuid) -> String {
        format!("nimbus-lb-{}", lb_id.simple())
    }

    /// Container id if this process started it, otherwise the deterministic name
    fn container_ref(&self, lb_id: Uuid) -> String {
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&lb_id)
            .cloned()
            .unwrap_or_else(|| Self::container_name(lb_id))
    }

    /// Write the config; returns false when the file already had this content
    async fn write_config(&self, path: &Path, content: &str) -> Result<bool, ContainerError> {
        if let Ok(existing) = tokio::fs::read_to_string(path).await
            && existing == content
        {
            return Ok(false);
        }
        tokio::fs::create_dir_all(&self.config_dir).await?;
        tokio::fs::write(path, content).await?;
        Ok(true)
    }
}

#[async_trait]
impl ProxyAdapter for NginxProxy {
    async fn deploy_proxy(&self, lb: &LoadBalancer, targets: &[ProxyTarget]) -> BackendResult<String> {
        let path = self.config_path(lb.id);
        let content = render_config(lb, targets, &self.upstream_host);
        self.write_config(&path, &content).await?;

        let mut spec = ContainerSpec::new(Self::container_name(lb.id), &self.image)
            .port(PortMapping::tcp(lb.port, 80))
            .label("nimbus.lb", lb.id.to_string());
        spec.mounts.push(Mount {
            source: path.display().to_string(),
            target: CONTAINER_CONF.to_string(),
            read_only: true,
        });
        spec.extra_hosts
            .push(format!("{}:host-gateway", self.upstream_host));

        let id = self.compute.create_container(&spec).await?;
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(lb.id, id.clone());

        info!(lb_id = %lb.id, container = %id, port = lb.port, "proxy deployed");
        Ok(format!("http://localhost:{}", lb.port))
    }

    async fn update_proxy_config(&self, lb: &LoadBalancer, targets: &[ProxyTarget]) -> BackendResult<()> {
        let path = self.config_path(lb.id);
        let content = render_config(lb, targets, &self.upstream_host);
        if !self.write_config(&path, &content).await? {
            return Ok(());
        }

        let reload = ["nginx".to_string(), "-s".to_string(), "reload".to_string()];
        let output = self.compute.exec(&self.container_ref(lb.id), &reload).await?;
        if !output.success() {
            return Err(BackendError::CommandFailed(format!(
                "nginx reload for {} exited {}: {}",
                lb.id,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        info!(lb_id = %lb.id, targets = targets.len(), "proxy config reloaded");
        Ok(())
    }

    async fn remove_proxy(&self, lb_id: Uuid) -> BackendResult<()> {
        let container = self.container_ref(lb_id);
        match self.compute.remove_container(&container).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&lb_id);

        match tokio::fs::remove_file(self.config_path(lb_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(lb_id = %lb_id, error = %e, "failed to remove proxy config"),
        }
        info!(lb_id = %lb_id, "proxy removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nimbus_backend::testing::FakeCompute;
    use nimbus_core::model::LbStatus;

    fn lb(algorithm: Algorithm) -> LoadBalancer {
        LoadBalancer {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "web".to_string(),
            vpc_id: Uuid::new_v4(),
            port: 8080,
            algorithm,
            status: LbStatus::Creating,
            url: None,
            targets: Vec::new(),
            idempotency_key: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn target(port: u16, weight: u32) -> ProxyTarget {
        ProxyTarget {
            instance_id: Uuid::new_v4(),
            host: "127.0.0.1".to_string(),
            port,
            weight,
        }
    }

    #[test]
    fn test_render_weighted_least_conn() {
        let lb = lb(Algorithm::LeastConn);
        let conf = render_config(&lb, &[target(32770, 3), target(32771, 1)], "host.docker.internal");

        assert!(conf.contains(&format!("upstream {} {{", upstream_name(lb.id))));
        assert!(conf.contains("    least_conn;"));
        assert!(conf.contains("server host.docker.internal:32770 weight=3;"));
        assert!(conf.contains("server host.docker.internal:32771 weight=1;"));
        assert!(conf.contains(&format!("proxy_pass http://{};", upstream_name(lb.id))));
    }

    #[test]
    fn test_render_algorithms() {
        let round_robin = render_config(&lb(Algorithm::RoundRobin), &[target(1, 1)], "h");
        assert!(!round_robin.contains("least_conn") && !round_robin.contains("ip_hash"));
        let ip_hash = render_config(&lb(Algorithm::IpHash), &[target(1, 1)], "h");
        assert!(ip_hash.contains("    ip_hash;"));
    }

    #[test]
    fn test_render_without_targets_returns_503() {
        let conf = render_config(&lb(Algorithm::RoundRobin), &[], "h");
        assert!(conf.contains("return 503;"));
        assert!(!conf.contains("upstream"));
    }

    #[tokio::test]
    async fn test_deploy_update_remove() {
        let dir = tempfile::tempdir().unwrap();
        let compute = Arc::new(FakeCompute::new());
        let proxy = NginxProxy::new(compute.clone(), dir.path().join("proxy"));
        let lb = lb(Algorithm::RoundRobin);

        let url = proxy.deploy_proxy(&lb, &[target(32770, 1)]).await.unwrap();
        assert_eq!(url, "http://localhost:8080");
        assert_eq!(compute.container_count(), 1);

        let id = compute.container_ids().remove(0);
        let spec = compute.spec(&id).unwrap();
        assert_eq!(spec.ports, vec![PortMapping::tcp(8080, 80)]);
        assert_eq!(spec.mounts[0].target, CONTAINER_CONF);
        assert!(proxy.config_path(lb.id).exists());

        // unchanged config does not reload
        proxy
            .update_proxy_config(&lb, &[target(32770, 1)])
            .await
            .unwrap();
        assert_eq!(compute.calls.count("exec"), 0);

        proxy
            .update_proxy_config(&lb, &[target(32770, 1), target(32771, 2)])
            .await
            .unwrap();
        assert_eq!(compute.calls.count("exec"), 1);
        let content = std::fs::read_to_string(proxy.config_path(lb.id)).unwrap();
        assert!(content.contains(":32771 weight=2;"));

        proxy.remove_proxy(lb.id).await.unwrap();
        assert_eq!(compute.container_count(), 0);
        assert!(!proxy.config_path(lb.id).exists());

        // removing twice is fine
        proxy.remove_proxy(lb.id).await.unwrap();
    }
}
