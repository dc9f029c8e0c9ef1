//! Background sweep: runner eviction and slot expiry on a fixed interval.
//!
//! Submissions and reports also sweep opportunistically; this loop covers
//! idle periods where nothing else would notice a dead runner.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dispatcher::Dispatcher;

/// Spawn the sweeper. Returns a handle for shutdown.
pub fn spawn_sweeper(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sweep_loop(&dispatcher, interval, shutdown).await;
    })
}

async fn sweep_loop(dispatcher: &Dispatcher, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                tracing::info!("sweeper: shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                let report = dispatcher.sweep();
                if !report.evicted_runners.is_empty() || report.expired_slots > 0 {
                    tracing::info!(
                        evicted = ?report.evicted_runners,
                        expired_slots = report.expired_slots,
                        failed = report.failed_requests,
                        placed = report.placed_from_queue,
                        "sweep",
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryConfig, RunnerReport};
    use crate::scheduler::DispatcherConfig;

    #[tokio::test]
    async fn evicts_silent_runner_and_stops_on_cancel() {
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig {
            registry: RegistryConfig { runner_ttl: Duration::from_millis(30), ..Default::default() },
            ..Default::default()
        }));
        dispatcher.update_runner(RunnerReport::new("r1", 10));

        let shutdown = CancellationToken::new();
        let handle = spawn_sweeper(Arc::clone(&dispatcher), Duration::from_millis(10), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(dispatcher.runner_count(), 0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
