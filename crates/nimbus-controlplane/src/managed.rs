//! Managed databases and caches
//!
//! Each managed service is a single container with generated credentials,
//! published on a dynamic host port.

use crate::instance::LABEL_TENANT_ID;
use crate::{activity, short_id};
use nimbus_backend::{BackendResultExt, ComputeBackend, ContainerSpec, Notifier};
use nimbus_core::model::{PortMapping, TransportProtocol};
use nimbus_core::{CloudError, RequestContext, Result};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const PASSWORD_LEN: usize = 24;
const USERNAME: &str = "nimbus";
pub const LABEL_ENGINE: &str = "nimbus.managed-engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Postgres,
    Mysql,
    Redis,
}

impl std::str::FromStr for Engine {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Engine::Postgres),
            "mysql" => Ok(Engine::Mysql),
            "redis" => Ok(Engine::Redis),
            other => Err(CloudError::invalid(format!("unknown engine '{}'", other))),
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Engine::Postgres => write!(f, "postgres"),
            Engine::Mysql => write!(f, "mysql"),
            Engine::Redis => write!(f, "redis"),
        }
    }
}

impl Engine {
    fn default_version(&self) -> &'static str {
        match self {
            Engine::Postgres => "16",
            Engine::Mysql => "8.0",
            Engine::Redis => "7",
        }
    }

    fn port(&self) -> u16 {
        match self {
            Engine::Postgres => 5432,
            Engine::Mysql => 3306,
            Engine::Redis => 6379,
        }
    }

    /// Client connection string for a service published on `port`
    pub fn connection_string(&self, user: &str, password: &str, port: u16, db: &str) -> String {
        match self {
            Engine::Postgres => format!("postgres://{}:{}@localhost:{}/{}", user, password, port, db),
            Engine::Mysql => format!("{}:{}@tcp(localhost:{})/{}", user, password, port, db),
            Engine::Redis => format!("redis://:{}@localhost:{}", password, port),
        }
    }

    fn container_spec(&self, name: &str, version: &str, db: &str, password: &str) -> ContainerSpec {
        let spec = ContainerSpec::new(
            format!("managed-{}-{}", name, short_id()),
            format!("{}:{}", self, version),
        )
        .port(PortMapping::tcp(0, self.port()))
        .label(LABEL_ENGINE, self.to_string());
        match self {
            Engine::Postgres => spec
                .env("POSTGRES_USER", USERNAME)
                .env("POSTGRES_PASSWORD", password)
                .env("POSTGRES_DB", db),
            Engine::Mysql => spec
                .env("MYSQL_USER", USERNAME)
                .env("MYSQL_PASSWORD", password)
                .env("MYSQL_DATABASE", db)
                .env("MYSQL_ROOT_PASSWORD", password),
            Engine::Redis => {
                let mut spec = spec;
                spec.cmd = vec![
                    "redis-server".to_string(),
                    "--requirepass".to_string(),
                    password.to_string(),
                ];
                spec
            }
        }
    }
}

/// Where and how to reach a launched service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedEndpoint {
    pub engine: Engine,
    pub container_id: String,
    pub host_port: u16,
    /// Empty for caches
    pub username: String,
    pub password: String,
    pub connection_string: String,
}

pub struct ManagedServiceLauncher {
    compute: Arc<dyn ComputeBackend>,
    notifier: Notifier,
}

impl ManagedServiceLauncher {
    pub fn new(compute: Arc<dyn ComputeBackend>, notifier: Notifier) -> Self {
        Self { compute, notifier }
    }

    /// `engine` is `postgres` or `mysql`
    pub async fn launch_database(
        &self,
        ctx: &RequestContext,
        engine: &str,
        name: &str,
        version: Option<&str>,
    ) -> Result<ManagedEndpoint> {
        let engine: Engine = engine.parse()?;
        if engine == Engine::Redis {
            return Err(CloudError::invalid("redis is a cache; use launch_cache"));
        }
        self.launch(ctx, engine, name, version).await
    }

    pub async fn launch_cache(
        &self,
        ctx: &RequestContext,
        name: &str,
        version: Option<&str>,
    ) -> Result<ManagedEndpoint> {
        self.launch(ctx, Engine::Redis, name, version).await
    }

    /// Drop every key of a cache launched by [`Self::launch_cache`]
    pub async fn flush_cache(&self, ctx: &RequestContext, container_id: &str, password: &str) -> Result<()> {
        ctx.ensure_active()?;
        let cmd = ["redis-cli", "-a", password, "FLUSHALL"].map(String::from);
        let output = self
            .compute
            .exec(container_id, &cmd)
            .await
            .step("exec redis-cli")?;
        if !output.success() {
            return Err(CloudError::internal(format!(
                "FLUSHALL exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        info!(container_id = %container_id, "cache flushed");
        Ok(())
    }

    pub async fn remove(&self, ctx: &RequestContext, container_id: &str) -> Result<()> {
        ctx.ensure_active()?;
        self.compute
            .remove_container(container_id)
            .await
            .step("remove managed service")?;
        info!(container_id = %container_id, "managed service removed");
        self.notifier
            .emit(activity(ctx, "MANAGED_SERVICE_DELETE", "managed_service", container_id))
            .await;
        Ok(())
    }

    async fn launch(
        &self,
        ctx: &RequestContext,
        engine: Engine,
        name: &str,
        version: Option<&str>,
    ) -> Result<ManagedEndpoint> {
        ctx.ensure_active()?;
        let name = name.trim();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CloudError::invalid(format!(
                "service name '{}' may only contain letters, digits, '-' and '_'",
                name
            )));
        }
        let version = version
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(engine.default_version());
        let db = name.replace('-', "_");
        let password: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LEN)
            .map(char::from)
            .collect();

        let spec = engine
            .container_spec(name, version, &db, &password)
            .label(LABEL_TENANT_ID, ctx.tenant_id.to_string());
        let container_id = self
            .compute
            .create_container(&spec)
            .await
            .step("create managed service container")?;

        let host_port = match self
            .compute
            .get_container_port(&container_id, engine.port(), TransportProtocol::Tcp)
            .await
        {
            Ok(Some(port)) => port,
            Ok(None) => {
                self.discard(&container_id).await;
                return Err(CloudError::internal(format!(
                    "{} port {} was not published",
                    engine,
                    engine.port()
                )));
            }
            Err(e) => {
                self.discard(&container_id).await;
                return Err(CloudError::internal_from("resolve managed service port", e));
            }
        };

        let username = match engine {
            Engine::Redis => String::new(),
            _ => USERNAME.to_string(),
        };
        let connection_string = engine.connection_string(&username, &password, host_port, &db);
        info!(container_id = %container_id, engine = %engine, host_port, "managed service launched");
        self.notifier
            .emit(
                activity(ctx, "MANAGED_SERVICE_CREATE", "managed_service", &container_id)
                    .with_meta("engine", engine.to_string().into())
                    .with_meta("version", version.into()),
            )
            .await;

        Ok(ManagedEndpoint {
            engine,
            container_id,
            host_port,
            username,
            password,
            connection_string,
        })
    }

    async fn discard(&self, container_id: &str) {
        if let Err(e) = self.compute.remove_container(container_id).await {
            warn!(container_id = %container_id, error = %e, "failed to remove managed service container");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_backend::ExecOutput;
    use nimbus_backend::testing::FakeCompute;
    use uuid::Uuid;

    fn launcher() -> (ManagedServiceLauncher, Arc<FakeCompute>, RequestContext) {
        let compute = Arc::new(FakeCompute::new());
        (
            ManagedServiceLauncher::new(compute.clone(), Notifier::tracing()),
            compute,
            RequestContext::new(Uuid::new_v4(), Uuid::new_v4()),
        )
    }

    #[test]
    fn test_connection_strings() {
        assert_eq!(
            Engine::Postgres.connection_string("u", "p", 32769, "app"),
            "postgres://u:p@localhost:32769/app"
        );
        assert_eq!(
            Engine::Mysql.connection_string("u", "p", 32770, "app"),
            "u:p@tcp(localhost:32770)/app"
        );
        assert_eq!(
            Engine::Redis.connection_string("", "p", 32771, ""),
            "redis://:p@localhost:32771"
        );
    }

    #[tokio::test]
    async fn test_launch_postgres() {
        let (launcher, compute, ctx) = launcher();
        let ep = launcher
            .launch_database(&ctx, "postgres", "orders-db", None)
            .await
            .unwrap();

        assert_eq!(ep.host_port, 32769);
        assert_eq!(ep.password.len(), PASSWORD_LEN);
        assert_eq!(
            ep.connection_string,
            format!("postgres://nimbus:{}@localhost:32769/orders_db", ep.password)
        );
        let spec = compute.spec(&ep.container_id).unwrap();
        assert_eq!(spec.image, "postgres:16");
        assert!(spec.env.contains(&("POSTGRES_DB".to_string(), "orders_db".to_string())));
    }

    #[tokio::test]
    async fn test_unknown_engine() {
        let (launcher, compute, ctx) = launcher();
        let err = launcher
            .launch_database(&ctx, "oracle", "db", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), nimbus_core::ErrorKind::InvalidInput);
        assert_eq!(compute.container_count(), 0);
    }

    #[tokio::test]
    async fn test_cache_and_flush() {
        let (launcher, compute, ctx) = launcher();
        let ep = launcher.launch_cache(&ctx, "sessions", Some("7.2")).await.unwrap();
        assert!(ep.connection_string.starts_with("redis://:"));
        assert_eq!(compute.spec(&ep.container_id).unwrap().image, "redis:7.2");

        launcher
            .flush_cache(&ctx, &ep.container_id, &ep.password)
            .await
            .unwrap();
        let exec = &compute.calls.of("exec")[0];
        assert_eq!(exec[1], format!("redis-cli -a {} FLUSHALL", ep.password));

        compute.set_exec_output(ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "NOAUTH".into(),
        });
        assert!(launcher.flush_cache(&ctx, &ep.container_id, "wrong").await.is_err());
    }
}
