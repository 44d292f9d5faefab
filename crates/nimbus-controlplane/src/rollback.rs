//! Reverse-order cleanup for multi-step operations
//!
//! A service pushes one undo step after each backend step succeeds. If a later
//! step fails it runs the list, which undoes step k-1 down to 0. On success it
//! disarms the list.

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use nimbus_core::Result;
use std::future::Future;
use tracing::{debug, warn};

type Undo = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

#[derive(Default)]
#[must_use = "an armed rollback must be run or disarmed"]
pub struct Rollback {
    steps: Vec<(String, Undo)>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F, Fut>(&mut self, label: impl Into<String>, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.steps
            .push((label.into(), Box::new(move || undo().boxed())));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Forget the undo steps; the operation committed
    pub fn disarm(mut self) {
        self.steps.clear();
    }

    /// Pass `result` through. On error every recorded step is undone first.
    pub async fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            std::mem::take(self).run().await;
        }
        result
    }

    /// Undo in reverse order. Every step runs even if an earlier one fails;
    /// the labels of failed steps are returned.
    pub async fn run(mut self) -> Vec<String> {
        let mut failed = Vec::new();
        while let Some((label, undo)) = self.steps.pop() {
            match undo().await {
                Ok(()) => debug!(step = %label, "rolled back"),
                Err(e) => {
                    warn!(step = %label, error = %e, "rollback step failed");
                    failed.push(label);
                }
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::CloudError;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_runs_in_reverse_and_continues_past_failures() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut rb = Rollback::new();
        for step in ["bridge", "veth", "container"] {
            let order = order.clone();
            rb.push(step, move || async move {
                order.lock().unwrap().push(step);
                if step == "veth" {
                    return Err(CloudError::internal("veth busy"));
                }
                Ok(())
            });
        }
        assert_eq!(rb.len(), 3);

        let failed = rb.run().await;
        assert_eq!(*order.lock().unwrap(), vec!["container", "veth", "bridge"]);
        assert_eq!(failed, vec!["veth"]);
    }

    #[tokio::test]
    async fn test_guard_unwinds_on_error_only() {
        let undone = Arc::new(Mutex::new(0));
        let mut rb = Rollback::new();
        let counter = undone.clone();
        rb.push("volume", move || async move {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        assert_eq!(rb.guard(Ok(7)).await.unwrap(), 7);
        assert_eq!(*undone.lock().unwrap(), 0);

        let err = rb
            .guard::<()>(Err(CloudError::internal("attach failed")))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "internal error: attach failed");
        assert_eq!(*undone.lock().unwrap(), 1);
        assert!(rb.is_empty());
    }

    #[tokio::test]
    async fn test_disarm_skips_undo() {
        let hit = Arc::new(Mutex::new(false));
        let mut rb = Rollback::new();
        let flag = hit.clone();
        rb.push("x", move || async move {
            *flag.lock().unwrap() = true;
            Ok(())
        });
        rb.disarm();
        assert!(!*hit.lock().unwrap());
    }
}
