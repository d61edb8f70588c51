use anyhow::Context;
use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::common::retry::RetryPolicy;
use crate::config::settings::AppConfig;
use crate::infrastructure::db::pool::{connect_to_db, run_migrations};
use crate::infrastructure::encoder::ffmpeg::FfmpegExecutor;
use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::infrastructure::redis::client::RedisService;
use crate::infrastructure::redis::lock::RedisLockManager;
use crate::infrastructure::storage::s3::StorageService;
use crate::modules::jobs::repository::PgJobRepository;
use crate::modules::transcoding::coordinator::JobCoordinator;
use crate::state::AppState;
use crate::workers::reconciler::start_reconciler;
use crate::workers::transcoder::{start_transcoder_worker, CompletionPublisher};

mod app;
mod common;
mod config;
mod docs;
mod infrastructure;
mod modules;
mod routes;
mod state;
#[cfg(test)]
mod testing;
mod workers;

const DB_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting rendition orchestrator...");
    let config = AppConfig::new()?;

    let pool = connect_to_db(&config.database_url, 10)
        .await
        .context("Failed to connect to PostgreSQL")?;
    run_migrations(&pool).await.context("Failed to run migrations")?;

    let redis = RedisService::new(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    let locks = Arc::new(RedisLockManager::new(
        redis,
        config.transcoding.instance_id.clone(),
        config.transcoding.lock_acquire_attempts,
    ));

    let storage = Arc::new(
        StorageService::new(
            &config.minio_url,
            &config.minio_bucket,
            &config.minio_access_key,
            &config.minio_secret_key,
            config.storage_retry_attempts,
        )
        .await,
    );

    let queue = RabbitMqService::new(&config.rabbitmq_url).await?;
    let publisher = CompletionPublisher::new(queue.clone(), config.completion_queue.clone());

    let repo = Arc::new(PgJobRepository::new(
        pool,
        RetryPolicy::new(config.storage_retry_attempts, DB_RETRY_BASE_DELAY),
    ));
    let executor = Arc::new(FfmpegExecutor::new(config.transcoding.ffmpeg_path.clone()));
    let coordinator = JobCoordinator::new(
        repo.clone(),
        storage.clone(),
        locks.clone(),
        executor,
        config.transcoding.clone(),
    );

    let state = AppState::new(config.clone(), repo, storage, locks, coordinator.clone());
    let shutdown = CancellationToken::new();

    let jobs = Arc::new(Semaphore::new(config.transcoding.max_concurrent_jobs));
    let consumer = tokio::spawn(start_transcoder_worker(
        state.clone(),
        queue,
        publisher.clone(),
        jobs,
        shutdown.clone(),
    ));
    let reconciler = config
        .reconcile_interval
        .map(|every| tokio::spawn(start_reconciler(coordinator, publisher, every, shutdown.clone())));

    let app = app::create_app(state);
    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server running on http://{}", addr);
    info!("Swagger UI on http://{}/swagger-ui", addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = consumer.await {
        error!("Transcoder worker panicked: {}", e);
    }
    if let Some(handle) = reconciler {
        if let Err(e) = handle.await {
            error!("Reconciler panicked: {}", e);
        }
    }
    Ok(())
}
