use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::modules::jobs::events::{VideoTranscoded, VideoUploaded};
use crate::modules::transcoding::coordinator::{CoordinatorOutcome, JobCoordinator};
use crate::state::AppState;
use anyhow::{anyhow, Result};
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONSUMER_TAG: &str = "transcoder_worker";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEUE_DELAY: Duration = Duration::from_secs(2);

/// Publishes `VideoTranscoded` events on the completion queue.
#[derive(Clone)]
pub struct CompletionPublisher {
    queue: RabbitMqService,
    queue_name: String,
}

impl CompletionPublisher {
    pub fn new(queue: RabbitMqService, queue_name: impl Into<String>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
        }
    }

    pub async fn publish(&self, event: &VideoTranscoded) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.queue.publish(&self.queue_name, &payload).await?;
        info!(
            job_id = %event.job_id,
            video_id = %event.video_id,
            status = ?event.status,
            "📤 Completion event published"
        );
        Ok(())
    }
}

/// What to do with a delivery once the coordinator has seen it.
#[derive(Debug)]
pub enum Disposition {
    /// Publish the event, then ack. Requeue if publishing fails.
    Publish(VideoTranscoded),
    Ack,
    /// Transient failure; redeliver later.
    Requeue,
    /// Unprocessable payload; drop it.
    Reject,
}

pub async fn process_delivery(coordinator: &JobCoordinator, payload: &[u8]) -> Disposition {
    let event = match serde_json::from_slice::<VideoUploaded>(payload) {
        Ok(event) => event,
        Err(e) => {
            error!("❌ Failed to parse upload notification: {}", e);
            return Disposition::Reject;
        }
    };
    let request_id = event.request_id.clone();

    match coordinator.handle_upload_notification(event).await {
        Ok(CoordinatorOutcome::Processed { event, .. }) => Disposition::Publish(event),
        Ok(CoordinatorOutcome::Existing(job)) if job.status.is_terminal() => {
            // The earlier run may have died before its event went out.
            match coordinator.completion_event(&job).await {
                Ok(event) => Disposition::Publish(event),
                Err(e) if e.is_retryable() => {
                    warn!(job_id = %job.id, "Could not rebuild completion event: {}", e);
                    Disposition::Requeue
                }
                Err(e) => {
                    error!(job_id = %job.id, "Could not rebuild completion event: {}", e);
                    Disposition::Ack
                }
            }
        }
        Ok(CoordinatorOutcome::Existing(_)) => Disposition::Ack,
        Err(e) if e.is_retryable() => {
            warn!(request_id = %request_id, "⏳ Upload notification deferred: {}", e);
            Disposition::Requeue
        }
        Err(e) => {
            error!(request_id = %request_id, "❌ Upload notification rejected: {}", e);
            Disposition::Reject
        }
    }
}

async fn settle(delivery: Delivery, disposition: Disposition, publisher: &CompletionPublisher) {
    let outcome = match disposition {
        Disposition::Publish(event) => match publisher.publish(&event).await {
            Ok(()) => delivery.ack(BasicAckOptions::default()).await,
            Err(e) => {
                error!(job_id = %event.job_id, "❌ Failed to publish completion event: {}", e);
                requeue(&delivery).await
            }
        },
        Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
        Disposition::Requeue => {
            tokio::time::sleep(REQUEUE_DELAY).await;
            requeue(&delivery).await
        }
        Disposition::Reject => delivery.reject(BasicRejectOptions { requeue: false }).await,
    };
    if let Err(e) = outcome {
        error!("Failed to settle delivery: {}", e);
    }
}

async fn requeue(delivery: &Delivery) -> lapin::Result<bool> {
    delivery
        .nack(BasicNackOptions {
            requeue: true,
            ..BasicNackOptions::default()
        })
        .await
}

/// Consumes upload notifications until `shutdown` fires. Each delivery holds a
/// permit from `jobs` for as long as its job runs.
pub async fn start_transcoder_worker(
    state: AppState,
    queue: RabbitMqService,
    publisher: CompletionPublisher,
    jobs: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    info!("🎥 Starting Transcoder Worker...");
    let queue_name = state.config.upload_queue.clone();
    let prefetch = u16::try_from(state.config.transcoding.max_concurrent_jobs).unwrap_or(u16::MAX);

    while !shutdown.is_cancelled() {
        if let Err(e) = consume(&state, &queue, &queue_name, prefetch, &publisher, &jobs, &shutdown).await {
            error!("❌ Transcoder consumer stopped: {}", e);
        }
        if shutdown.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
        if let Err(e) = queue.reconnect().await {
            error!("RabbitMQ reconnect failed: {}", e);
        }
    }

    // Wait for running jobs to settle their deliveries.
    let total = u32::try_from(state.config.transcoding.max_concurrent_jobs).unwrap_or(u32::MAX);
    let _drained = jobs.acquire_many(total).await;
    info!("🎥 Transcoder Worker stopped");
}

async fn consume(
    state: &AppState,
    queue: &RabbitMqService,
    queue_name: &str,
    prefetch: u16,
    publisher: &CompletionPublisher,
    jobs: &Arc<Semaphore>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut consumer = queue.consume(queue_name, CONSUMER_TAG, prefetch).await?;
    info!("🎥 Transcoder Worker listening on '{}'", queue_name);

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            permit = jobs.clone().acquire_owned() => permit?,
        };
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = consumer.next() => match next {
                Some(delivery) => delivery?,
                None => return Err(anyhow!("consumer stream closed")),
            },
        };

        info!("📦 Received upload notification");
        let coordinator = state.coordinator.clone();
        let publisher = publisher.clone();
        tokio::spawn(async move {
            let disposition = process_delivery(&coordinator, &delivery.data).await;
            settle(delivery, disposition, &publisher).await;
            drop(permit);
        });
    }
}
