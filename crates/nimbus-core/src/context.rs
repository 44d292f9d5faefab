//! Request scope passed to every service operation

use crate::error::{CloudError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

/// Caller identity plus a cancellation signal.
///
/// Services never read identity from ambient state; every operation takes a
/// `&RequestContext`. Background work runs under [`RequestContext::detached`],
/// which keeps the ids but drops the caller's cancellation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    cancel: Option<watch::Receiver<bool>>,
}

/// Handle held by the caller to cancel an in-flight operation
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl RequestContext {
    /// Context that can never be cancelled
    pub fn new(user_id: Uuid, tenant_id: Uuid) -> Self {
        Self {
            user_id,
            tenant_id,
            cancel: None,
        }
    }

    /// Context paired with a handle that cancels it
    pub fn cancellable(user_id: Uuid, tenant_id: Uuid) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            user_id,
            tenant_id,
            cancel: Some(rx),
        };
        (ctx, CancelHandle { tx })
    }

    /// Same identity, no cancellation. Used for cleanup that must finish.
    pub fn detached(&self) -> Self {
        Self::new(self.user_id, self.tenant_id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Fail fast with `Cancelled` once the caller has gone away
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(CloudError::Cancelled(format!(
                "request for user {} was cancelled",
                self.user_id
            )));
        }
        Ok(())
    }

    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.user_id,
            tenant_id: self.tenant_id,
        }
    }
}

/// Serializable identity carried inside background job payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
}

impl Identity {
    pub fn context(&self) -> RequestContext {
        RequestContext::new(self.user_id, self.tenant_id)
    }
}
