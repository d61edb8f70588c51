use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

use super::executor::{EncodeExecutor, RetryingExecutor};
use super::lock::{lock_key, Heartbeat, LeaseGuard, LeaseToken, LockManager};
use super::manifest::{manifest_key, ManifestFormat, ManifestGenerator};
use super::pipeline::RenditionPipeline;
use super::progress::{JobProgress, ProgressTracker};
use super::storage::StorageGateway;
use crate::common::error::AdapterError;
use crate::config::settings::TranscodingSettings;
use crate::modules::jobs::events::{ManifestUrls, VideoTranscoded, VideoUploaded};
use crate::modules::jobs::model::{JobStatus, JobTransition, RenditionStatus, TranscodingJob};
use crate::modules::jobs::repository::JobRepository;

pub const ABORT_REASON: &str = "aborted by operator";
pub const LEASE_LOST_REASON: &str = "lease lost during processing";
pub const ABANDONED_REASON: &str = "processing lease expired; job abandoned";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid upload notification: {0}")]
    InvalidEvent(String),
    #[error("lease {0} is held by another worker")]
    LockContention(String),
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl CoordinatorError {
    /// Whether redelivering the same notification later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinatorError::LockContention(_) => true,
            CoordinatorError::Adapter(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub enum CoordinatorOutcome {
    /// The notification was a duplicate; the job it maps to is returned as is.
    Existing(TranscodingJob),
    /// This call ran the job to a terminal state.
    Processed {
        job: TranscodingJob,
        event: VideoTranscoded,
    },
}

/// A job running on this instance: its cancel token and the lease it holds.
struct ActiveRun {
    cancel: CancellationToken,
    lease: LeaseToken,
}

/// Top-level job state machine. Owns the lease lifecycle for every job it
/// runs and drives pipeline, manifest step and persisted status.
#[derive(Clone)]
pub struct JobCoordinator {
    repo: Arc<dyn JobRepository>,
    storage: Arc<dyn StorageGateway>,
    locks: Arc<dyn LockManager>,
    pipeline: RenditionPipeline,
    manifests: ManifestGenerator,
    progress: ProgressTracker,
    settings: TranscodingSettings,
    active: Arc<Mutex<HashMap<Uuid, ActiveRun>>>,
}

impl JobCoordinator {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        storage: Arc<dyn StorageGateway>,
        locks: Arc<dyn LockManager>,
        executor: Arc<dyn EncodeExecutor>,
        settings: TranscodingSettings,
    ) -> Self {
        let executor: Arc<dyn EncodeExecutor> = if settings.encode_max_attempts > 1 {
            Arc::new(RetryingExecutor::new(executor, settings.encode_max_attempts))
        } else {
            executor
        };
        let progress = ProgressTracker::new();
        let pipeline = RenditionPipeline::new(
            repo.clone(),
            storage.clone(),
            executor,
            progress.clone(),
            settings.max_concurrent_renditions,
            settings.segment_seconds,
        );
        let manifests = ManifestGenerator::new(
            storage.clone(),
            settings.manifest_formats.clone(),
            settings.segment_seconds,
        );

        Self {
            repo,
            storage,
            locks,
            pipeline,
            manifests,
            progress,
            settings,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn handle_upload_notification(
        &self,
        event: VideoUploaded,
    ) -> Result<CoordinatorOutcome, CoordinatorError> {
        event
            .validate()
            .map_err(|e| CoordinatorError::InvalidEvent(e.to_string()))?;

        if let Some(existing) = self.find_existing(&event).await? {
            if self.abandon_if_stale(&existing).await?.is_none() {
                info!(job_id = %existing.id, request_id = %event.request_id, "Duplicate upload notification");
                return Ok(CoordinatorOutcome::Existing(existing));
            }
            // The stale job is now Failed; a redelivery of its own request maps to it.
            if let Some(existing) = self.find_existing(&event).await? {
                return Ok(CoordinatorOutcome::Existing(existing));
            }
        }

        let key = lock_key(&event.tenant_id, &event.video_id);
        let Some(token) = self.locks.acquire(&key, self.settings.lock_ttl).await? else {
            // The holder may have created the job between our lookup and the lease attempt.
            if let Some(existing) = self.find_existing(&event).await? {
                return Ok(CoordinatorOutcome::Existing(existing));
            }
            warn!(key = %key, "Lease held elsewhere, notification will be retried");
            return Err(CoordinatorError::LockContention(key));
        };

        let guard = LeaseGuard::new(self.locks.clone(), key, token);
        let outcome = self.run_under_lease(&event, &guard).await;
        guard.release().await;
        outcome
    }

    async fn run_under_lease(
        &self,
        event: &VideoUploaded,
        lease: &LeaseGuard,
    ) -> Result<CoordinatorOutcome, CoordinatorError> {
        if let Some(existing) = self.find_existing(event).await? {
            return Ok(CoordinatorOutcome::Existing(existing));
        }

        let job = match self.repo.create_job(event.to_new_job()).await {
            Ok(job) => job,
            Err(AdapterError::Conflict(msg)) => {
                return match self.find_existing(event).await? {
                    Some(existing) => Ok(CoordinatorOutcome::Existing(existing)),
                    None => Err(AdapterError::Conflict(msg).into()),
                };
            }
            Err(e) => return Err(e.into()),
        };
        info!(job_id = %job.id, video_id = %job.video_id, tenant_id = %job.tenant_id, "Job received");

        let cancel = CancellationToken::new();
        self.active.lock().insert(
            job.id,
            ActiveRun {
                cancel: cancel.clone(),
                lease: lease.token().clone(),
            },
        );
        let heartbeat = Heartbeat::spawn(
            self.locks.clone(),
            lease.key().to_string(),
            lease.token().clone(),
            self.settings.lock_ttl,
            self.settings.heartbeat_interval,
            cancel.clone(),
        );

        let scratch = self.settings.work_dir.join(job.id.to_string());
        let result = self.drive(&job, &scratch, &cancel).await;

        let lease_lost = heartbeat.stop().await;
        self.active.lock().remove(&job.id);
        self.progress.finish_job(job.id);
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job_id = %job.id, "Failed to remove scratch dir {}: {}", scratch.display(), e);
            }
        }

        let (transition, manifest_urls) = match result {
            _ if lease_lost => (JobTransition::Fail(LEASE_LOST_REASON.to_string()), ManifestUrls::default()),
            Ok(urls) => (JobTransition::Complete, urls),
            Err(reason) => (JobTransition::Fail(reason), ManifestUrls::default()),
        };
        let final_job = self.settle(&job, transition).await?;

        let renditions = match self.repo.list_renditions(job.id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(job_id = %job.id, "Could not load renditions for completion event: {}", e);
                Vec::new()
            }
        };
        let event = VideoTranscoded::from_job(&final_job, &renditions, manifest_urls);
        Ok(CoordinatorOutcome::Processed { job: final_job, event })
    }

    /// Runs the job body. `Err` carries the persisted failure reason.
    async fn drive(
        &self,
        job: &TranscodingJob,
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> Result<ManifestUrls, String> {
        match self.repo.transition_job(job.id, JobTransition::Start).await {
            Ok(Some(_)) => info!(job_id = %job.id, "Job processing"),
            Ok(None) => return Err("job left Received before it could start".into()),
            Err(e) => return Err(format!("could not start job: {}", e)),
        }

        tokio::fs::create_dir_all(scratch)
            .await
            .map_err(|e| format!("could not prepare scratch space: {}", e))?;
        let source = source_path(scratch, &job.input_path);
        let bytes = self
            .storage
            .download(&job.input_path, &source)
            .await
            .map_err(|e| format!("source download failed: {}", e))?;
        info!(job_id = %job.id, bytes, "Source downloaded");

        if cancel.is_cancelled() {
            return Err("cancelled before encoding".into());
        }

        let outputs = self
            .pipeline
            .run(job, &source, &self.settings.profiles, scratch, cancel)
            .await
            .map_err(|failure| format!("encoding failed: {}", failure))?;

        // Never package a partial set.
        let renditions = self
            .repo
            .list_renditions(job.id)
            .await
            .map_err(|e| format!("could not verify renditions: {}", e))?;
        if renditions.len() != outputs.len() || renditions.iter().any(|r| r.status != RenditionStatus::Completed) {
            return Err("encoding failed: rendition set incomplete".into());
        }
        if cancel.is_cancelled() {
            return Err("cancelled before packaging".into());
        }

        self.manifests
            .generate(job, &outputs)
            .await
            .map_err(|e| format!("packaging failed: {}", e))
    }

    async fn settle(&self, job: &TranscodingJob, transition: JobTransition) -> Result<TranscodingJob, CoordinatorError> {
        let reason = transition.failure_reason().map(str::to_string);
        match self.repo.transition_job(job.id, transition).await? {
            Some(updated) => {
                match &reason {
                    Some(reason) => warn!(job_id = %job.id, "Job failed: {}", reason),
                    None => info!(job_id = %job.id, "Job completed"),
                }
                Ok(updated)
            }
            // Already terminal, e.g. aborted while running.
            None => self
                .repo
                .get_job(job.id)
                .await?
                .ok_or(CoordinatorError::JobNotFound(job.id)),
        }
    }

    async fn find_existing(&self, event: &VideoUploaded) -> Result<Option<TranscodingJob>, CoordinatorError> {
        if let Some(job) = self.repo.find_by_request_id(&event.request_id).await? {
            return Ok(Some(job));
        }
        Ok(self
            .repo
            .find_active_for_video(&event.tenant_id, &event.video_id)
            .await?)
    }

    /// Fails a Received or Processing job, terminates its in-flight encodes
    /// and frees its lease. Returns `false` for jobs already terminal.
    pub async fn abort_job(&self, job_id: Uuid) -> Result<bool, CoordinatorError> {
        let job = self
            .repo
            .get_job(job_id)
            .await?
            .ok_or(CoordinatorError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        if self
            .repo
            .transition_job(job_id, JobTransition::Fail(ABORT_REASON.to_string()))
            .await?
            .is_none()
        {
            return Ok(false);
        }

        // A job running here releases with its own lease token; one running
        // elsewhere loses the lease and stops on its next heartbeat.
        let local = self
            .active
            .lock()
            .get(&job_id)
            .map(|run| (run.cancel.clone(), run.lease.clone()));
        let key = lock_key(&job.tenant_id, &job.video_id);
        let released = match local {
            Some((cancel, lease)) => {
                cancel.cancel();
                self.locks.release(&key, &lease).await
            }
            None => self.locks.force_release(&key).await,
        };
        if let Err(e) = released {
            warn!(job_id = %job_id, key = %key, "Abort could not release lease, it will expire: {}", e);
        }
        info!(job_id = %job_id, "Job aborted by operator");
        Ok(true)
    }

    pub async fn is_being_processed(&self, tenant_id: &str, video_id: &str) -> Result<bool, CoordinatorError> {
        Ok(self.locks.exists(&lock_key(tenant_id, video_id)).await?)
    }

    pub fn progress(&self, job_id: Uuid) -> Option<JobProgress> {
        self.progress.snapshot(job_id)
    }

    /// Fails a non-terminal job that nobody is driving: untouched for longer
    /// than the lease TTL, not running here and without a live lease. Returns
    /// the failed job, or `None` when the job was left alone.
    async fn abandon_if_stale(&self, job: &TranscodingJob) -> Result<Option<TranscodingJob>, CoordinatorError> {
        let cutoff = OffsetDateTime::now_utc() - self.settings.lock_ttl;
        if job.status.is_terminal() || job.updated_at >= cutoff || self.active.lock().contains_key(&job.id) {
            return Ok(None);
        }
        if self.locks.exists(&lock_key(&job.tenant_id, &job.video_id)).await? {
            return Ok(None);
        }
        let failed = self
            .repo
            .transition_job(job.id, JobTransition::Fail(ABANDONED_REASON.to_string()))
            .await?;
        if failed.is_some() {
            warn!(job_id = %job.id, status = %job.status.as_str(), "Abandoned job marked failed");
        }
        Ok(failed)
    }

    /// Fails Received or Processing jobs that were abandoned, e.g. by a
    /// crashed instance or a run whose final status write never landed.
    pub async fn fail_abandoned_jobs(&self) -> Result<Vec<TranscodingJob>, CoordinatorError> {
        let cutoff = OffsetDateTime::now_utc() - self.settings.lock_ttl;
        let mut failed = Vec::new();
        for job in self.repo.list_stale_active(cutoff).await? {
            match self.abandon_if_stale(&job).await {
                Ok(Some(updated)) => failed.push(updated),
                Ok(None) => {}
                Err(e) => error!(job_id = %job.id, "Failed to mark abandoned job: {}", e),
            }
        }
        Ok(failed)
    }

    /// Rebuilds the completion event of a job already terminal in the
    /// repository, so a redelivered notification can re-emit it.
    pub async fn completion_event(&self, job: &TranscodingJob) -> Result<VideoTranscoded, CoordinatorError> {
        let renditions = self.repo.list_renditions(job.id).await?;
        let mut urls = ManifestUrls::default();
        if job.status == JobStatus::Completed {
            for format in &self.settings.manifest_formats {
                let key = manifest_key(&job.output_base_path, *format);
                match format {
                    ManifestFormat::Hls => urls.hls = Some(key),
                    ManifestFormat::Dash => urls.dash = Some(key),
                }
            }
        }
        Ok(VideoTranscoded::from_job(job, &renditions, urls))
    }
}

fn source_path(scratch: &Path, input_path: &str) -> PathBuf {
    match Path::new(input_path).extension().and_then(|e| e.to_str()) {
        Some(ext) => scratch.join(format!("source.{}", ext)),
        None => scratch.join("source"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::jobs::events::CompletionStatus;
    use crate::modules::transcoding::profile::default_ladder;
    use crate::testing::{
        sample_event, FakeExecutor, FakeOutcome, InMemoryJobRepository, InMemoryLockManager, InMemoryStorage,
    };
    use std::time::Duration;

    struct Harness {
        repo: Arc<InMemoryJobRepository>,
        storage: Arc<InMemoryStorage>,
        locks: Arc<InMemoryLockManager>,
        executor: Arc<FakeExecutor>,
        coordinator: JobCoordinator,
    }

    fn harness() -> Harness {
        let repo = Arc::new(InMemoryJobRepository::new());
        let storage = Arc::new(InMemoryStorage::new());
        let locks = Arc::new(InMemoryLockManager::new());
        let executor = Arc::new(FakeExecutor::new());
        let settings = TranscodingSettings {
            work_dir: std::env::temp_dir().join(format!("coordinator-{}", Uuid::new_v4())),
            lock_ttl: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(50),
            profiles: Arc::new(default_ladder().into_iter().take(3).collect()),
            ..TranscodingSettings::default()
        };
        let coordinator = JobCoordinator::new(
            repo.clone(),
            storage.clone(),
            locks.clone(),
            executor.clone(),
            settings,
        );
        Harness {
            repo,
            storage,
            locks,
            executor,
            coordinator,
        }
    }

    fn event(h: &Harness, video: &str, request: &str) -> VideoUploaded {
        let event = sample_event(video, "T1", request);
        h.storage.put(&event.input_path, b"master".to_vec());
        event
    }

    #[tokio::test]
    async fn successful_job_completes_with_manifests_and_event() {
        let h = harness();
        let outcome = h
            .coordinator
            .handle_upload_notification(event(&h, "V1", "r1"))
            .await
            .unwrap();

        let CoordinatorOutcome::Processed { job, event } = outcome else {
            panic!("expected a processed job");
        };
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert_eq!(event.status, CompletionStatus::Completed);
        assert_eq!(event.renditions.len(), 3);
        assert_eq!(event.request_id, "r1");
        assert!(h.storage.contains("T1/V1/manifests/hls/master.m3u8"));
        assert!(h.storage.contains("T1/V1/manifests/dash/manifest.mpd"));
        assert_eq!(event.manifest_urls.hls.as_deref(), Some("T1/V1/manifests/hls/master.m3u8"));
        assert!(h
            .repo
            .renditions_for(job.id)
            .iter()
            .all(|r| r.status == RenditionStatus::Completed));
        assert!(!h.locks.exists(&lock_key("T1", "V1")).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_notifications_create_exactly_one_job() {
        let h = harness();
        h.executor.set_delay(Duration::from_millis(30));
        let first = event(&h, "V1", "r1");
        let second = first.clone();

        let (a, b) = tokio::join!(
            h.coordinator.handle_upload_notification(first),
            h.coordinator.handle_upload_notification(second),
        );

        let outcomes = [a, b];
        let processed = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(CoordinatorOutcome::Processed { .. })))
            .count();
        assert_eq!(processed, 1);
        assert_eq!(h.repo.job_count(), 1);

        // A late redelivery returns the finished job unchanged.
        let again = h
            .coordinator
            .handle_upload_notification(event(&h, "V1", "r1"))
            .await
            .unwrap();
        match again {
            CoordinatorOutcome::Existing(job) => assert_eq!(job.status, JobStatus::Completed),
            other => panic!("expected existing job, got {:?}", other),
        }
        assert_eq!(h.repo.job_count(), 1);
    }

    #[tokio::test]
    async fn rendition_failure_fails_the_job_without_manifests() {
        let h = harness();
        h.executor.set_outcome("480p", FakeOutcome::Fail("bitstream error".into()));

        let outcome = h
            .coordinator
            .handle_upload_notification(event(&h, "V1", "r1"))
            .await
            .unwrap();

        let CoordinatorOutcome::Processed { job, event } = outcome else {
            panic!("expected a processed job");
        };
        assert_eq!(job.status, JobStatus::Failed);
        let reason = job.failure_reason.unwrap();
        assert!(reason.starts_with("encoding failed:"));
        assert!(reason.contains("480p"));
        assert_eq!(event.status, CompletionStatus::Failed);
        assert!(!h.storage.contains("T1/V1/manifests/hls/master.m3u8"));
        assert!(!h.locks.exists(&lock_key("T1", "V1")).await.unwrap());
    }

    #[tokio::test]
    async fn manifest_failure_is_reported_as_packaging() {
        let h = harness();
        h.storage.fail_uploads_under("T1/V1/manifests");

        let outcome = h
            .coordinator
            .handle_upload_notification(event(&h, "V1", "r1"))
            .await
            .unwrap();

        let CoordinatorOutcome::Processed { job, .. } = outcome else {
            panic!("expected a processed job");
        };
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_reason.unwrap().starts_with("packaging failed:"));
        assert!(!h.locks.exists(&lock_key("T1", "V1")).await.unwrap());
    }

    #[tokio::test]
    async fn abort_terminates_running_encodes_and_frees_the_lease() {
        let h = harness();
        for p in default_ladder() {
            h.executor.set_outcome(&p.label, FakeOutcome::BlockUntilCancelled);
        }
        let coordinator = h.coordinator.clone();
        let run = tokio::spawn({
            let event = event(&h, "V1", "r1");
            async move { coordinator.handle_upload_notification(event).await }
        });

        let job_id = loop {
            if let Some(job) = h.repo.jobs().into_iter().find(|j| j.status == JobStatus::Processing) {
                if h.executor.in_flight() > 0 {
                    break job.id;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert!(h.coordinator.abort_job(job_id).await.unwrap());
        assert!(!h.locks.exists(&lock_key("T1", "V1")).await.unwrap());

        let outcome = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("job should stop after abort")
            .unwrap()
            .unwrap();
        let CoordinatorOutcome::Processed { job, .. } = outcome else {
            panic!("expected a processed job");
        };
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some(ABORT_REASON));
        assert!(h
            .repo
            .renditions_for(job_id)
            .iter()
            .all(|r| r.status == RenditionStatus::Failed));
        assert!(!h.coordinator.abort_job(job_id).await.unwrap());
    }

    #[tokio::test]
    async fn contention_without_a_visible_job_is_retryable() {
        let h = harness();
        assert!(h
            .locks
            .acquire(&lock_key("T1", "V1"), Duration::from_secs(5))
            .await
            .unwrap()
            .is_some());
        assert!(h.coordinator.is_being_processed("T1", "V1").await.unwrap());

        let err = h
            .coordinator
            .handle_upload_notification(event(&h, "V1", "r1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::LockContention(_)));
        assert!(err.is_retryable());
        assert_eq!(h.repo.job_count(), 0);
    }

    #[tokio::test]
    async fn lost_lease_fails_the_job() {
        let h = harness();
        for p in default_ladder() {
            h.executor.set_outcome(&p.label, FakeOutcome::BlockUntilCancelled);
        }
        let coordinator = h.coordinator.clone();
        let run = tokio::spawn({
            let event = event(&h, "V1", "r1");
            async move { coordinator.handle_upload_notification(event).await }
        });

        while h.executor.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.locks.force_expire(&lock_key("T1", "V1"));

        let outcome = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("job should stop once the lease is lost")
            .unwrap()
            .unwrap();
        let CoordinatorOutcome::Processed { job, .. } = outcome else {
            panic!("expected a processed job");
        };
        assert_eq!(job.failure_reason.as_deref(), Some(LEASE_LOST_REASON));
    }

    #[tokio::test]
    async fn terminal_jobs_do_not_block_a_new_attempt() {
        let h = harness();
        h.executor.set_outcome("360p", FakeOutcome::Fail("boom".into()));
        h.coordinator
            .handle_upload_notification(event(&h, "V1", "r1"))
            .await
            .unwrap();

        h.executor.set_outcome("360p", FakeOutcome::Succeed);
        let outcome = h
            .coordinator
            .handle_upload_notification(event(&h, "V1", "r2"))
            .await
            .unwrap();
        assert!(matches!(outcome, CoordinatorOutcome::Processed { ref job, .. } if job.status == JobStatus::Completed));
        assert_eq!(h.repo.job_count(), 2);
    }

    #[tokio::test]
    async fn invalid_notifications_are_rejected_before_any_side_effect() {
        let h = harness();
        let mut bad = sample_event("V1", "T1", "r1");
        bad.tenant_id.clear();

        let err = h.coordinator.handle_upload_notification(bad).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidEvent(_)));
        assert!(!err.is_retryable());
        assert_eq!(h.repo.job_count(), 0);
    }

    #[tokio::test]
    async fn missing_source_fails_the_job_and_releases_the_lease() {
        let h = harness();
        let outcome = h
            .coordinator
            .handle_upload_notification(sample_event("V9", "T1", "r1"))
            .await
            .unwrap();
        let CoordinatorOutcome::Processed { job, .. } = outcome else {
            panic!("expected a processed job");
        };
        assert!(job.failure_reason.unwrap().starts_with("source download failed"));
        assert!(!h.locks.exists(&lock_key("T1", "V9")).await.unwrap());
    }

    #[tokio::test]
    async fn completion_event_can_be_rebuilt_for_finished_jobs() {
        let h = harness();
        let CoordinatorOutcome::Processed { job, event } = h
            .coordinator
            .handle_upload_notification(event(&h, "V1", "r1"))
            .await
            .unwrap()
        else {
            panic!("expected a processed job");
        };

        let rebuilt = h.coordinator.completion_event(&job).await.unwrap();
        assert_eq!(rebuilt.manifest_urls, event.manifest_urls);
        assert_eq!(rebuilt.renditions, event.renditions);
        assert_eq!(rebuilt.job_id, job.id);
    }

    #[tokio::test]
    async fn a_new_run_keeps_its_lease_while_an_aborted_run_winds_down() {
        let h = harness();
        for p in default_ladder() {
            h.executor
                .set_outcome(&p.label, FakeOutcome::LingerAfterCancel(Duration::from_millis(300)));
        }
        let processing = |request: &str| {
            h.repo
                .jobs()
                .into_iter()
                .find(|j| j.request_id == request && j.status == JobStatus::Processing)
        };

        let coordinator = h.coordinator.clone();
        let first = tokio::spawn({
            let event = event(&h, "V1", "r1");
            async move { coordinator.handle_upload_notification(event).await }
        });
        let first_id = loop {
            if let Some(job) = processing("r1") {
                if h.executor.in_flight() > 0 {
                    break job.id;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(h.coordinator.abort_job(first_id).await.unwrap());

        // The first run is still draining its encodes when the next one starts.
        let coordinator = h.coordinator.clone();
        let second = tokio::spawn({
            let event = event(&h, "V1", "r2");
            async move { coordinator.handle_upload_notification(event).await }
        });
        let second_id = loop {
            if let Some(job) = processing("r2") {
                break job.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(!first.is_finished());

        tokio::time::timeout(Duration::from_secs(2), first)
            .await
            .expect("aborted run should wind down")
            .unwrap()
            .unwrap();
        assert!(h.locks.exists(&lock_key("T1", "V1")).await.unwrap());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.locks.exists(&lock_key("T1", "V1")).await.unwrap());
        assert!(processing("r2").is_some());

        assert!(h.coordinator.abort_job(second_id).await.unwrap());
        let outcome = tokio::time::timeout(Duration::from_secs(2), second)
            .await
            .expect("second run should stop after abort")
            .unwrap()
            .unwrap();
        let CoordinatorOutcome::Processed { job, .. } = outcome else {
            panic!("expected a processed job");
        };
        assert_eq!(job.id, second_id);
        assert_eq!(job.failure_reason.as_deref(), Some(ABORT_REASON));
        assert!(!h.locks.exists(&lock_key("T1", "V1")).await.unwrap());
    }

    #[tokio::test]
    async fn a_job_stuck_in_received_is_abandoned_by_the_next_notification() {
        let h = harness();
        h.repo.set_transitions_down(true);
        let err = h
            .coordinator
            .handle_upload_notification(event(&h, "V1", "r1"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let stuck = h.repo.jobs().pop().unwrap();
        assert_eq!(stuck.status, JobStatus::Received);
        assert!(!h.locks.exists(&lock_key("T1", "V1")).await.unwrap());
        h.repo.set_transitions_down(false);

        // Still fresh: another notification must not steal it.
        let outcome = h
            .coordinator
            .handle_upload_notification(event(&h, "V1", "r2"))
            .await
            .unwrap();
        assert!(matches!(outcome, CoordinatorOutcome::Existing(ref job) if job.id == stuck.id));

        h.repo.backdate(stuck.id, Duration::from_secs(60));
        let outcome = h
            .coordinator
            .handle_upload_notification(event(&h, "V1", "r2"))
            .await
            .unwrap();
        let CoordinatorOutcome::Processed { job, .. } = outcome else {
            panic!("expected a processed job");
        };
        assert_eq!(job.status, JobStatus::Completed);
        assert_ne!(job.id, stuck.id);

        let old = h.repo.jobs().into_iter().find(|j| j.id == stuck.id).unwrap();
        assert_eq!(old.status, JobStatus::Failed);
        assert_eq!(old.failure_reason.as_deref(), Some(ABANDONED_REASON));
    }

    #[tokio::test]
    async fn the_sweep_fails_stale_received_jobs_but_leaves_leased_ones() {
        let h = harness();
        let mut received = crate::testing::sample_job("V6", "T1", "r6");
        received.updated_at = OffsetDateTime::now_utc() - Duration::from_secs(600);
        h.repo.insert(received.clone());

        let mut leased = crate::testing::sample_job("V7", "T1", "r7");
        leased.updated_at = OffsetDateTime::now_utc() - Duration::from_secs(600);
        let leased = h.repo.insert_processing(leased);
        h.locks
            .acquire(&lock_key("T1", "V7"), Duration::from_secs(5))
            .await
            .unwrap();

        let failed = h.coordinator.fail_abandoned_jobs().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, received.id);
        assert_eq!(failed[0].failure_reason.as_deref(), Some(ABANDONED_REASON));
        let still = h.repo.jobs().into_iter().find(|j| j.id == leased.id).unwrap();
        assert_eq!(still.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn abandoned_processing_jobs_are_failed_by_the_sweep() {
        let h = harness();
        let mut stale = crate::testing::sample_job("V5", "T1", "r5");
        stale.updated_at = OffsetDateTime::now_utc() - Duration::from_secs(600);
        let stale = h.repo.insert_processing(stale);

        let failed = h.coordinator.fail_abandoned_jobs().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, stale.id);
        assert_eq!(failed[0].failure_reason.as_deref(), Some(ABANDONED_REASON));
        assert!(h.coordinator.fail_abandoned_jobs().await.unwrap().is_empty());
    }
}
