//! Polling a freshly started container until it can take traffic

use crate::error::{ContainerError, Result};
use bollard::Docker;
use bollard::models::{ContainerState, HealthStatusEnum};
use bollard::query_parameters::InspectContainerOptions;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// How long and how often to poll; the delay doubles up to `max_delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            first_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
        }
    }
}

impl ReadinessPolicy {
    /// Pause after the `attempt`-th failed poll (0-based)
    pub fn pause(&self, attempt: u32) -> Duration {
        self.first_delay
            .checked_mul(1u32 << attempt.min(16))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// What one inspection saw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotRunning,
    /// Running, health check not passing yet
    Unhealthy,
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Readiness::Ready => "ready",
            Readiness::NotRunning => "not running",
            Readiness::Unhealthy => "running but not healthy",
        })
    }
}

impl From<&ContainerState> for Readiness {
    fn from(state: &ContainerState) -> Self {
        if !state.running.unwrap_or(false) {
            return Readiness::NotRunning;
        }
        match state.health.as_ref().and_then(|h| h.status.as_ref()) {
            None | Some(HealthStatusEnum::HEALTHY) | Some(HealthStatusEnum::NONE) => {
                Readiness::Ready
            }
            Some(_) => Readiness::Unhealthy,
        }
    }
}

/// Poll until the container runs and, when it defines a health check, passes it
pub async fn wait_until_ready(
    docker: &Docker,
    container: &str,
    policy: &ReadinessPolicy,
) -> Result<()> {
    let mut last = Readiness::NotRunning;
    for attempt in 0..policy.attempts {
        let inspect = docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await?;
        last = inspect
            .state
            .as_ref()
            .map_or(Readiness::NotRunning, Readiness::from);
        if last == Readiness::Ready {
            return Ok(());
        }
        debug!(container = %container, attempt, state = %last, "waiting for container");
        if attempt + 1 < policy.attempts {
            tokio::time::sleep(policy.pause(attempt)).await;
        }
    }

    Err(ContainerError::ContainerWaitTimeout {
        container: container.to_string(),
        attempts: policy.attempts,
        last_state: last.to_string(),
    })
}
