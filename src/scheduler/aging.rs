use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scheduler::Scheduler;

/// Periodically lower the priority number of queued queries until `shutdown`
/// fires. Only started in priority mode with a non-zero interval.
pub fn spawn_aging_task(
    scheduler: Arc<Scheduler>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(period_ms = period.as_millis() as u64, "Aging enabled");
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    scheduler.age().await;
                }
            }
        }
        tracing::debug!("Aging task stopped");
    })
}
