//! Detached background jobs
//!
//! Snapshot copies and stack drivers outlive the request that started them.
//! Each job runs as its own tokio task under a span carrying the originating
//! identity, so nothing depends on ambient state.

use nimbus_core::{Identity, Result};
use std::future::Future;
use std::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info_span};

#[derive(Default)]
pub struct JobRunner {
    tasks: Mutex<JoinSet<()>>,
}

impl JobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `job` in the background. Failures are logged, never returned.
    pub fn spawn<F>(&self, name: &str, identity: Identity, job: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let span = info_span!(
            "job",
            job = %name,
            user_id = %identity.user_id,
            tenant_id = %identity.tenant_id
        );
        let name = name.to_string();
        let mut tasks = self.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(
            async move {
                debug!("job started");
                match job.await {
                    Ok(()) => debug!("job finished"),
                    Err(e) => error!(job = %name, error = %e, "job failed"),
                }
            }
            .instrument(span),
        );
    }

    /// Jobs spawned and not yet reaped
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Wait until every job, including jobs spawned by jobs, has finished
    pub async fn wait_idle(&self) {
        loop {
            let mut batch = std::mem::take(&mut *self.lock());
            if batch.is_empty() {
                return;
            }
            while let Some(joined) = batch.join_next().await {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    error!(error = %e, "job panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn identity() -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_wait_idle_covers_nested_jobs() {
        let runner = Arc::new(JobRunner::new());
        let done = Arc::new(AtomicUsize::new(0));

        let inner_runner = runner.clone();
        let inner_done = done.clone();
        runner.spawn("outer", identity(), async move {
            tokio::task::yield_now().await;
            let d = inner_done.clone();
            inner_runner.spawn("inner", identity(), async move {
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            inner_done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        runner.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(runner.pending(), 0);
    }

    #[tokio::test]
    async fn test_failed_job_is_swallowed() {
        let runner = JobRunner::new();
        runner.spawn("broken", identity(), async {
            Err(nimbus_core::CloudError::internal("boom"))
        });
        runner.wait_idle().await;
    }
}
