use crate::modules::transcoding::coordinator::JobCoordinator;
use crate::workers::transcoder::CompletionPublisher;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Periodically fails Processing jobs whose lease expired without a holder,
/// and publishes their failed completion events.
pub async fn start_reconciler(
    coordinator: JobCoordinator,
    publisher: CompletionPublisher,
    every: Duration,
    shutdown: CancellationToken,
) {
    info!("🧹 Starting reconciler (every {:?})", every);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let failed = match coordinator.fail_abandoned_jobs().await {
            Ok(failed) => failed,
            Err(e) => {
                error!("❌ Reconciliation sweep failed: {}", e);
                continue;
            }
        };
        if failed.is_empty() {
            continue;
        }
        info!("🧹 Failed {} abandoned job(s)", failed.len());

        for job in failed {
            let event = match coordinator.completion_event(&job).await {
                Ok(event) => event,
                Err(e) => {
                    warn!(job_id = %job.id, "Could not build completion event: {}", e);
                    continue;
                }
            };
            if let Err(e) = publisher.publish(&event).await {
                error!(job_id = %job.id, "❌ Failed to publish completion event: {}", e);
            }
        }
    }
    info!("🧹 Reconciler stopped");
}
