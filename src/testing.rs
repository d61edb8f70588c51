//! In-memory adapters shared by unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::error::{AdapterError, AdapterResult};
use crate::modules::jobs::events::{SourceMetadata, VideoUploaded};
use crate::modules::jobs::model::{
    JobStatus, JobTransition, NewJob, Rendition, RenditionTransition, TranscodingJob,
};
use crate::modules::jobs::repository::{JobFilter, JobRepository};
use crate::modules::transcoding::executor::{EncodeError, EncodeExecutor, EncodeOutput, EncodeRequest, ProgressFn};
use crate::modules::transcoding::lock::{LeaseToken, LockManager};
use crate::modules::transcoding::profile::QualityProfile;
use crate::modules::transcoding::storage::{paths, StorageGateway};

pub fn sample_event(video_id: &str, tenant_id: &str, request_id: &str) -> VideoUploaded {
    VideoUploaded {
        video_id: video_id.to_string(),
        tenant_id: tenant_id.to_string(),
        input_path: format!("uploads/{}/{}/master.mp4", tenant_id, video_id),
        filename: "master.mp4".to_string(),
        file_size: 6,
        mime_type: "video/mp4".to_string(),
        metadata: SourceMetadata {
            duration: Some(30.0),
            original_resolution: Some("1920x1080".to_string()),
            has_audio: true,
        },
        request_id: request_id.to_string(),
        timestamp: OffsetDateTime::now_utc(),
    }
}

pub fn sample_job(video_id: &str, tenant_id: &str, request_id: &str) -> TranscodingJob {
    TranscodingJob::from_new(
        NewJob {
            video_id: video_id.to_string(),
            tenant_id: tenant_id.to_string(),
            request_id: request_id.to_string(),
            input_path: format!("uploads/{}/{}/master.mp4", tenant_id, video_id),
            output_base_path: paths::output_base(tenant_id, video_id),
            filename: "master.mp4".to_string(),
            file_size: 6,
            mime_type: "video/mp4".to_string(),
            duration_seconds: Some(30.0),
            original_resolution: None,
            has_audio: true,
        },
        OffsetDateTime::now_utc(),
    )
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RepoState {
    jobs: HashMap<Uuid, TranscodingJob>,
    renditions: HashMap<Uuid, Rendition>,
}

/// Enforces the same uniqueness rules as the database indexes.
#[derive(Default)]
pub struct InMemoryJobRepository {
    state: Mutex<RepoState>,
    down: std::sync::atomic::AtomicBool,
    transitions_down: std::sync::atomic::AtomicBool,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_processing(&self, mut job: TranscodingJob) -> TranscodingJob {
        job.status = JobStatus::Processing;
        self.state.lock().jobs.insert(job.id, job.clone());
        job
    }

    pub fn insert(&self, job: TranscodingJob) {
        self.state.lock().jobs.insert(job.id, job);
    }

    pub fn jobs(&self) -> Vec<TranscodingJob> {
        self.state.lock().jobs.values().cloned().collect()
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn renditions_for(&self, job_id: Uuid) -> Vec<Rendition> {
        let mut out: Vec<Rendition> = self
            .state
            .lock()
            .renditions
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.bitrate_kbps);
        out
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Fails only job transitions, leaving reads and inserts working.
    pub fn set_transitions_down(&self, down: bool) {
        self.transitions_down.store(down, Ordering::SeqCst);
    }

    /// Moves a job's `updated_at` back by `by`.
    pub fn backdate(&self, id: Uuid, by: std::time::Duration) {
        if let Some(job) = self.state.lock().jobs.get_mut(&id) {
            job.updated_at -= by;
        }
    }

    fn check(&self) -> AdapterResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(AdapterError::Transient("repository unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn find_by_request_id(&self, request_id: &str) -> AdapterResult<Option<TranscodingJob>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .find(|j| j.request_id == request_id)
            .cloned())
    }

    async fn find_active_for_video(&self, tenant_id: &str, video_id: &str) -> AdapterResult<Option<TranscodingJob>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .find(|j| j.tenant_id == tenant_id && j.video_id == video_id && !j.status.is_terminal())
            .cloned())
    }

    async fn create_job(&self, new: NewJob) -> AdapterResult<TranscodingJob> {
        self.check()?;
        let mut state = self.state.lock();
        let clash = state.jobs.values().any(|j| {
            j.request_id == new.request_id
                || (j.tenant_id == new.tenant_id && j.video_id == new.video_id && !j.status.is_terminal())
        });
        if clash {
            return Err(AdapterError::Conflict("duplicate job".into()));
        }
        let job = TranscodingJob::from_new(new, OffsetDateTime::now_utc());
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> AdapterResult<Option<TranscodingJob>> {
        self.check()?;
        Ok(self.state.lock().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> AdapterResult<(Vec<TranscodingJob>, i64)> {
        self.check()?;
        let mut jobs: Vec<TranscodingJob> = self
            .state
            .lock()
            .jobs
            .values()
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .filter(|j| filter.tenant_id.as_ref().is_none_or(|t| &j.tenant_id == t))
            .filter(|j| filter.video_id.as_ref().is_none_or(|v| &j.video_id == v))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = jobs.len() as i64;
        let page = jobs
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn list_stale_active(&self, before: OffsetDateTime) -> AdapterResult<Vec<TranscodingJob>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal() && j.updated_at < before)
            .cloned()
            .collect())
    }

    async fn transition_job(&self, id: Uuid, transition: JobTransition) -> AdapterResult<Option<TranscodingJob>> {
        self.check()?;
        if self.transitions_down.load(Ordering::SeqCst) {
            return Err(AdapterError::Transient("repository unavailable".into()));
        }
        let mut state = self.state.lock();
        Ok(state.jobs.get_mut(&id).and_then(|job| {
            job.apply(&transition, OffsetDateTime::now_utc())
                .then(|| job.clone())
        }))
    }

    async fn create_rendition(&self, job_id: Uuid, profile: &QualityProfile) -> AdapterResult<Rendition> {
        self.check()?;
        let rendition = Rendition::pending(job_id, profile, OffsetDateTime::now_utc());
        self.state.lock().renditions.insert(rendition.id, rendition.clone());
        Ok(rendition)
    }

    async fn transition_rendition(&self, id: Uuid, transition: RenditionTransition) -> AdapterResult<Option<Rendition>> {
        self.check()?;
        let mut state = self.state.lock();
        Ok(state.renditions.get_mut(&id).and_then(|r| {
            r.apply(&transition, OffsetDateTime::now_utc())
                .then(|| r.clone())
        }))
    }

    async fn list_renditions(&self, job_id: Uuid) -> AdapterResult<Vec<Rendition>> {
        self.check()?;
        Ok(self.renditions_for(job_id))
    }

    async fn ping(&self) -> AdapterResult<()> {
        self.check()
    }
}

// ---------------------------------------------------------------------------
// Lock store
// ---------------------------------------------------------------------------

/// Models ownership like the Redis store: each lease records the token that
/// acquired it.
#[derive(Default)]
pub struct InMemoryLockManager {
    leases: Mutex<HashMap<String, (LeaseToken, Instant)>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the lease lapsing or being deleted behind the holder's back.
    pub fn force_expire(&self, key: &str) {
        self.leases.lock().remove(key);
    }

    fn live<'a>(leases: &'a mut HashMap<String, (LeaseToken, Instant)>, key: &str) -> Option<&'a LeaseToken> {
        if leases.get(key).is_some_and(|(_, expiry)| *expiry <= Instant::now()) {
            leases.remove(key);
        }
        leases.get(key).map(|(token, _)| token)
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> AdapterResult<Option<LeaseToken>> {
        let mut leases = self.leases.lock();
        if Self::live(&mut leases, key).is_some() {
            return Ok(None);
        }
        let token = LeaseToken::generate("memory");
        leases.insert(key.to_string(), (token.clone(), Instant::now() + ttl));
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> AdapterResult<bool> {
        let mut leases = self.leases.lock();
        if Self::live(&mut leases, key) != Some(token) {
            return Ok(false);
        }
        leases.remove(key);
        Ok(true)
    }

    async fn force_release(&self, key: &str) -> AdapterResult<bool> {
        Ok(self.leases.lock().remove(key).is_some())
    }

    async fn extend(&self, key: &str, token: &LeaseToken, ttl: Duration) -> AdapterResult<bool> {
        let mut leases = self.leases.lock();
        if Self::live(&mut leases, key) != Some(token) {
            return Ok(false);
        }
        leases.insert(key.to_string(), (token.clone(), Instant::now() + ttl));
        Ok(true)
    }

    async fn exists(&self, key: &str) -> AdapterResult<bool> {
        Ok(Self::live(&mut self.leases.lock(), key).is_some())
    }
}

// ---------------------------------------------------------------------------
// Object storage
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failing_prefixes: Mutex<Vec<String>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, body: Vec<u8>) {
        self.objects.lock().insert(key.to_string(), body);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    pub fn read_string(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .get(key)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Uploads under `prefix` fail permanently from now on.
    pub fn fail_uploads_under(&self, prefix: &str) {
        self.failing_prefixes.lock().push(prefix.to_string());
    }

    fn check_upload(&self, key: &str) -> AdapterResult<()> {
        if self.failing_prefixes.lock().iter().any(|p| key.starts_with(p.as_str())) {
            return Err(AdapterError::Permanent(format!("access denied: {}", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageGateway for InMemoryStorage {
    async fn download(&self, key: &str, dest: &Path) -> AdapterResult<u64> {
        let body = self
            .objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| AdapterError::Permanent(format!("no such key: {}", key)))?;
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }

    async fn upload_file(&self, src: &Path, key: &str, _content_type: &str) -> AdapterResult<u64> {
        self.check_upload(key)?;
        let body = tokio::fs::read(src).await?;
        let len = body.len() as u64;
        self.put(key, body);
        Ok(len)
    }

    async fn upload_bytes(&self, key: &str, body: Bytes, _content_type: &str) -> AdapterResult<()> {
        self.check_upload(key)?;
        self.put(key, body.to_vec());
        Ok(())
    }

    async fn exists(&self, key: &str) -> AdapterResult<bool> {
        Ok(self.contains(key))
    }

    async fn presign(&self, key: &str, ttl: Duration) -> AdapterResult<String> {
        Ok(format!("memory://{}?expires={}", key, ttl.as_secs()))
    }

    async fn ping(&self) -> AdapterResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOutcome {
    Succeed,
    Fail(String),
    /// Fails the first `n` calls, then succeeds.
    FailTimes(u32),
    /// Runs until the cancellation token fires.
    BlockUntilCancelled,
    /// Like `BlockUntilCancelled`, but takes this long to stop.
    LingerAfterCancel(Duration),
}

/// Writes a tiny HLS rendition instead of invoking an encoder.
#[derive(Default)]
pub struct FakeExecutor {
    outcomes: Mutex<HashMap<String, FakeOutcome>>,
    calls: Mutex<HashMap<String, u32>>,
    delay: Mutex<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outcome(&self, label: &str, outcome: FakeOutcome) {
        self.outcomes.lock().insert(label.to_string(), outcome);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self, label: &str) -> u32 {
        self.calls.lock().get(label).copied().unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EncodeExecutor for FakeExecutor {
    async fn run(
        &self,
        request: EncodeRequest,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<EncodeOutput, EncodeError> {
        let label = request.profile.label.clone();
        let call = {
            let mut calls = self.calls.lock();
            let n = calls.entry(label.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let outcome = self
            .outcomes
            .lock()
            .get(&label)
            .cloned()
            .unwrap_or(FakeOutcome::Succeed);
        let delay = *self.delay.lock();

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(self.in_flight.clone());

        on_progress(0.5);
        match outcome {
            FakeOutcome::BlockUntilCancelled => {
                cancel.cancelled().await;
                return Err(EncodeError::Cancelled);
            }
            FakeOutcome::LingerAfterCancel(linger) => {
                cancel.cancelled().await;
                tokio::time::sleep(linger).await;
                return Err(EncodeError::Cancelled);
            }
            FakeOutcome::Fail(reason) => return Err(EncodeError::Failed(reason)),
            FakeOutcome::FailTimes(n) if call <= n => {
                return Err(EncodeError::Failed(format!("attempt {} failed", call)));
            }
            _ => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(EncodeError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        tokio::fs::create_dir_all(&request.output_dir).await?;
        tokio::fs::write(request.output_dir.join("init.mp4"), b"init").await?;
        tokio::fs::write(request.output_dir.join("segment_00000.m4s"), b"segment").await?;
        tokio::fs::write(
            request.output_dir.join("index.m3u8"),
            "#EXTM3U\n#EXT-X-MAP:URI=\"init.mp4\"\n#EXTINF:6.0,\nsegment_00000.m4s\n#EXT-X-ENDLIST\n",
        )
        .await?;
        on_progress(1.0);

        Ok(EncodeOutput {
            output_dir: request.output_dir,
            playlist: "index.m3u8".to_string(),
        })
    }
}
