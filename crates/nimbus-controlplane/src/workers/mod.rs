//! Background reconcilers
//!
//! Each worker exposes a `tick` that performs one full pass and a `run` loop
//! that ticks on an interval until the shutdown channel flips to `true`.

pub mod cluster;
pub mod lb;

pub use cluster::ClusterWorker;
pub use lb::{HealthProbe, LbWorker, LbWorkerSettings, TcpProbe};

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

/// Call `tick` every `period` until `shutdown` reports `true` or its sender is dropped
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(worker = name, period_ms = period.as_millis() as u64, "worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!(worker = name, "tick");
                tick().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(worker = name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = tokio::spawn(run_periodic("test", Duration::from_secs(1), rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        // immediate first tick, then at 1s and 2s
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_when_sender_dropped() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        run_periodic("test", Duration::from_secs(3600), rx, || async {}).await;
    }
}
