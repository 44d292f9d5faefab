//! Functions
//!
//! A function is source code plus a runtime. Each invocation runs the code in
//! a fresh task container, waits at most `timeout_secs` for it, and records
//! the outcome.

use crate::lookup::Key;
use crate::store::Store;
use crate::{activity, short_id};
use chrono::Utc;
use nimbus_backend::{ComputeBackend, Notifier, TaskOptions};
use nimbus_core::model::{Function, FunctionInvocation, FunctionRuntime, InvocationStatus};
use nimbus_core::{CloudError, RequestContext, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const MAX_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_MEMORY_MB: u64 = 128;
pub const MIN_MEMORY_MB: u64 = 64;
pub const MAX_MEMORY_MB: u64 = 4096;

/// Lines of task output kept on an invocation
const OUTPUT_TAIL: usize = 200;

/// Input of [`FunctionService::register`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterFunction {
    pub name: String,
    pub runtime: String,
    pub handler: String,
    pub code: String,
    /// Zero means the default
    pub timeout_secs: u64,
    /// Zero means the default
    pub memory_mb: u64,
}

pub struct FunctionService {
    store: Arc<dyn Store>,
    compute: Arc<dyn ComputeBackend>,
    notifier: Notifier,
}

impl FunctionService {
    pub fn new(store: Arc<dyn Store>, compute: Arc<dyn ComputeBackend>, notifier: Notifier) -> Self {
        Self {
            store,
            compute,
            notifier,
        }
    }

    pub async fn register(&self, ctx: &RequestContext, req: &RegisterFunction) -> Result<Function> {
        ctx.ensure_active()?;
        let name = req.name.trim();
        if name.is_empty() {
            return Err(CloudError::invalid("function name is required"));
        }
        let runtime: FunctionRuntime = req.runtime.parse()?;
        if req.code.trim().is_empty() {
            return Err(CloudError::invalid("function code is required"));
        }
        let timeout_secs = match req.timeout_secs {
            0 => DEFAULT_TIMEOUT_SECS,
            t if t > MAX_TIMEOUT_SECS => {
                return Err(CloudError::invalid(format!(
                    "timeout must be at most {}s",
                    MAX_TIMEOUT_SECS
                )));
            }
            t => t,
        };
        let memory_mb = match req.memory_mb {
            0 => DEFAULT_MEMORY_MB,
            m if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&m) => {
                return Err(CloudError::invalid(format!(
                    "memory must be between {} and {} MB",
                    MIN_MEMORY_MB, MAX_MEMORY_MB
                )));
            }
            m => m,
        };

        let now = Utc::now();
        let function = Function {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            user_id: ctx.user_id,
            name: name.to_string(),
            runtime,
            handler: req.handler.trim().to_string(),
            code: req.code.clone(),
            timeout_secs,
            memory_mb,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_function(&function).await?;

        info!(function_id = %function.id, name = %function.name, runtime = %runtime, "function registered");
        self.notifier
            .emit(
                activity(ctx, "FUNCTION_CREATE", "function", function.id)
                    .with_meta("runtime", runtime.to_string().into()),
            )
            .await;
        Ok(function)
    }

    pub async fn get(&self, ctx: &RequestContext, key: &str) -> Result<Function> {
        match Key::parse(key)? {
            Key::Id(id) => self.store.get_function(ctx.tenant_id, id).await,
            Key::Name(name) => self
                .store
                .find_function_by_name(ctx.tenant_id, name)
                .await?
                .ok_or_else(|| CloudError::not_found("function", name)),
        }
    }

    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<Function>> {
        self.store.list_functions(ctx.tenant_id).await
    }

    pub async fn delete(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        ctx.ensure_active()?;
        let function = self.get(ctx, key).await?;
        self.store.delete_function(ctx.tenant_id, function.id).await?;
        info!(function_id = %function.id, "function deleted");
        self.notifier
            .emit(activity(ctx, "FUNCTION_DELETE", "function", function.id))
            .await;
        Ok(())
    }

    /// Run the function once with `payload` and record the invocation.
    ///
    /// A non-zero exit or a timeout is a FAILED invocation, not an error; the
    /// call only fails when the task cannot be started.
    pub async fn invoke(
        &self,
        ctx: &RequestContext,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<FunctionInvocation> {
        ctx.ensure_active()?;
        let function = self.get(ctx, key).await?;
        let options = TaskOptions {
            name: format!("fn-{}-{}", function.name, short_id()),
            image: function.runtime.image().to_string(),
            cmd: function.runtime.command(),
            env: vec![
                ("FN_CODE".to_string(), function.code.clone()),
                ("FN_HANDLER".to_string(), function.handler.clone()),
                ("FN_PAYLOAD".to_string(), payload.to_string()),
            ],
            memory_bytes: Some((function.memory_mb * 1024 * 1024) as i64),
            network_id: None,
        };

        let started_at = Utc::now();
        let clock = Instant::now();
        let container_id = self
            .compute
            .run_task(&options)
            .await
            .map_err(|e| CloudError::internal_from("start function task", e))?;

        let limit = Duration::from_secs(function.timeout_secs);
        let (status, exit_code, note) =
            match tokio::time::timeout(limit, self.compute.wait_container(&container_id)).await {
                Ok(Ok(0)) => (InvocationStatus::Success, Some(0), None),
                Ok(Ok(code)) => (
                    InvocationStatus::Failed,
                    Some(code),
                    Some(format!("exited with code {}", code)),
                ),
                Ok(Err(e)) => (
                    InvocationStatus::Failed,
                    None,
                    Some(format!("wait failed: {}", e)),
                ),
                Err(_) => {
                    if let Err(e) = self.compute.stop_container(&container_id).await {
                        warn!(container_id = %container_id, error = %e, "failed to stop timed out task");
                    }
                    (
                        InvocationStatus::Failed,
                        None,
                        Some(format!("timed out after {}s", function.timeout_secs)),
                    )
                }
            };
        let duration_ms = clock.elapsed().as_millis() as u64;

        let output = match self.compute.get_logs(&container_id, Some(OUTPUT_TAIL)).await {
            Ok(output) => output,
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "failed to collect task output");
                String::new()
            }
        };
        if let Err(e) = self.compute.remove_container(&container_id).await {
            warn!(container_id = %container_id, error = %e, "failed to remove task container");
        }

        let invocation = FunctionInvocation {
            id: Uuid::new_v4(),
            function_id: function.id,
            tenant_id: ctx.tenant_id,
            status,
            exit_code,
            output,
            note,
            duration_ms,
            started_at,
        };
        self.store.insert_invocation(&invocation).await?;

        info!(
            function_id = %function.id,
            invocation_id = %invocation.id,
            status = %invocation.status,
            duration_ms,
            "function invoked"
        );
        self.notifier
            .emit(
                activity(ctx, "FUNCTION_INVOKE", "function", function.id)
                    .with_meta("status", invocation.status.to_string().into()),
            )
            .await;
        Ok(invocation)
    }

    /// Newest first
    pub async fn list_invocations(&self, ctx: &RequestContext, key: &str) -> Result<Vec<FunctionInvocation>> {
        let function = self.get(ctx, key).await?;
        self.store.list_invocations(ctx.tenant_id, function.id).await
    }
}
