use super::status_display;
use crate::error::{CloudError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionRuntime {
    #[serde(rename = "python3.12")]
    Python312,
    #[serde(rename = "nodejs20")]
    NodeJs20,
    #[serde(rename = "go1.22")]
    Go122,
}

status_display!(FunctionRuntime {
    Python312 => "python3.12",
    NodeJs20 => "nodejs20",
    Go122 => "go1.22",
});

impl std::str::FromStr for FunctionRuntime {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "python3.12" => Ok(FunctionRuntime::Python312),
            "nodejs20" => Ok(FunctionRuntime::NodeJs20),
            "go1.22" => Ok(FunctionRuntime::Go122),
            other => Err(CloudError::invalid(format!(
                "unsupported runtime '{}' (supported: python3.12, nodejs20, go1.22)",
                other
            ))),
        }
    }
}

impl FunctionRuntime {
    pub fn image(&self) -> &'static str {
        match self {
            FunctionRuntime::Python312 => "python:3.12-alpine",
            FunctionRuntime::NodeJs20 => "node:20-alpine",
            FunctionRuntime::Go122 => "golang:1.22-alpine",
        }
    }

    /// File the code is written to inside the task container
    pub fn source_file(&self) -> &'static str {
        match self {
            FunctionRuntime::Python312 => "handler.py",
            FunctionRuntime::NodeJs20 => "handler.js",
            FunctionRuntime::Go122 => "main.go",
        }
    }

    /// Shell command that writes `$FN_CODE` to `/fn/<source_file>` and runs it.
    ///
    /// The invocation payload reaches the handler as `$PAYLOAD`.
    pub fn command(&self) -> Vec<String> {
        let run = match self {
            FunctionRuntime::Python312 => "python /fn/handler.py",
            FunctionRuntime::NodeJs20 => "node /fn/handler.js",
            FunctionRuntime::Go122 => "cd /fn && go run main.go",
        };
        let script = format!(
            "mkdir -p /fn && printf '%s' \"$FN_CODE\" > /fn/{} && {}",
            self.source_file(),
            run
        );
        vec!["sh".into(), "-c".into(), script]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub runtime: FunctionRuntime,
    pub handler: String,
    pub code: String,
    pub timeout_secs: u64,
    pub memory_mb: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    Success,
    Failed,
}

status_display!(InvocationStatus {
    Success => "SUCCESS",
    Failed => "FAILED",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionInvocation {
    pub id: Uuid,
    pub function_id: Uuid,
    pub tenant_id: Uuid,
    pub status: InvocationStatus,
    pub exit_code: Option<i64>,
    pub output: String,
    pub note: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_names() {
        for name in ["python3.12", "nodejs20", "go1.22"] {
            let rt: FunctionRuntime = name.parse().unwrap();
            assert_eq!(rt.to_string(), name);
            assert_eq!(serde_json::to_value(rt).unwrap(), name);
        }
        let err = "ruby3".parse::<FunctionRuntime>().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_command_writes_source_then_runs() {
        let cmd = FunctionRuntime::NodeJs20.command();
        assert_eq!(cmd[..2], ["sh", "-c"]);
        assert_eq!(
            cmd[2],
            "mkdir -p /fn && printf '%s' \"$FN_CODE\" > /fn/handler.js && node /fn/handler.js"
        );
    }
}
