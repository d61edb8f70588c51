use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::executor::{EncodeError, EncodeExecutor, EncodeRequest};
use super::profile::QualityProfile;
use super::progress::ProgressTracker;
use super::storage::{content_type_for, paths, StorageGateway};
use crate::common::error::{AdapterError, AdapterResult};
use crate::modules::jobs::model::{Rendition, RenditionTransition, TranscodingJob};
use crate::modules::jobs::repository::JobRepository;

/// A rendition that was encoded, uploaded and marked Completed.
#[derive(Debug, Clone)]
pub struct RenditionOutput {
    pub rendition_id: Uuid,
    pub profile: QualityProfile,
    /// Storage key of the rendition's media playlist.
    pub output_path: String,
    /// Storage prefix holding the playlist and its segments.
    pub prefix: String,
    pub file_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionFailure {
    pub label: String,
    pub reason: String,
}

/// Every rendition settled and at least one did not complete.
#[derive(Debug, Clone, Error)]
pub struct PipelineFailure {
    pub failures: Vec<RenditionFailure>,
}

impl PipelineFailure {
    fn single(label: &str, reason: impl Into<String>) -> Self {
        Self {
            failures: vec![RenditionFailure {
                label: label.to_string(),
                reason: reason.into(),
            }],
        }
    }
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .failures
            .iter()
            .map(|fail| format!("{} ({})", fail.label, fail.reason))
            .collect();
        write!(f, "{} rendition(s) failed: {}", self.failures.len(), parts.join("; "))
    }
}

struct RenditionTask {
    rendition: Rendition,
    profile: QualityProfile,
}

/// Fans one job out into per-profile encodes on a bounded worker pool and
/// waits for all of them to settle.
#[derive(Clone)]
pub struct RenditionPipeline {
    repo: Arc<dyn JobRepository>,
    storage: Arc<dyn StorageGateway>,
    executor: Arc<dyn EncodeExecutor>,
    progress: ProgressTracker,
    max_parallel: usize,
    segment_seconds: u32,
}

impl RenditionPipeline {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        storage: Arc<dyn StorageGateway>,
        executor: Arc<dyn EncodeExecutor>,
        progress: ProgressTracker,
        max_parallel: usize,
        segment_seconds: u32,
    ) -> Self {
        Self {
            repo,
            storage,
            executor,
            progress,
            max_parallel: max_parallel.max(1),
            segment_seconds,
        }
    }

    pub async fn run(
        &self,
        job: &TranscodingJob,
        source: &Path,
        profiles: &[QualityProfile],
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<RenditionOutput>, PipelineFailure> {
        if profiles.is_empty() {
            return Err(PipelineFailure::single("*", "no quality profiles configured"));
        }

        let mut tasks = Vec::with_capacity(profiles.len());
        for profile in profiles {
            match self.repo.create_rendition(job.id, profile).await {
                Ok(rendition) => tasks.push(RenditionTask {
                    rendition,
                    profile: profile.clone(),
                }),
                Err(e) => {
                    error!(job_id = %job.id, rendition = %profile.label, "Failed to create rendition record: {}", e);
                    for task in &tasks {
                        self.mark_failed(task.rendition.id, &task.profile.label, "not started: job setup failed".into())
                            .await;
                    }
                    return Err(PipelineFailure::single(
                        &profile.label,
                        format!("could not create rendition record: {}", e),
                    ));
                }
            }
        }

        let expected: HashSet<Uuid> = tasks.iter().map(|t| t.rendition.id).collect();
        let labels: Vec<(Uuid, String)> = tasks.iter().map(|t| (t.rendition.id, t.profile.label.clone())).collect();
        self.progress.start_job(job.id, profiles.iter().map(|p| p.label.as_str()));

        let workers = self.max_parallel.min(tasks.len());
        info!(job_id = %job.id, renditions = tasks.len(), workers, "Starting rendition fan-out");

        let (tx, rx) = async_channel::bounded::<RenditionTask>(workers);
        let ctx = Arc::new(WorkerContext {
            pipeline: self.clone(),
            job: job.clone(),
            source: source.to_path_buf(),
            scratch: scratch.to_path_buf(),
            cancel: cancel.clone(),
        });

        let mut set = JoinSet::new();
        for _ in 0..workers {
            let rx = rx.clone();
            let ctx = ctx.clone();
            set.spawn(async move {
                let mut outcomes = Vec::new();
                while let Ok(task) = rx.recv().await {
                    outcomes.push(ctx.process(task).await);
                }
                outcomes
            });
        }
        drop(rx);

        for task in tasks {
            if tx.send(task).await.is_err() {
                warn!(job_id = %job.id, "All rendition workers exited early");
                break;
            }
        }
        drop(tx);

        let mut outputs = Vec::new();
        let mut failures = Vec::new();
        let mut settled = HashSet::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcomes) => {
                    for (id, outcome) in outcomes {
                        settled.insert(id);
                        match outcome {
                            Ok(output) => outputs.push(output),
                            Err(failure) => failures.push(failure),
                        }
                    }
                }
                Err(e) => error!(job_id = %job.id, "Rendition worker crashed: {}", e),
            }
        }

        // Renditions lost with a crashed worker still have to settle.
        for (id, label) in labels.iter().filter(|(id, _)| !settled.contains(id)) {
            failures.push(self.mark_failed(*id, label, "rendition worker crashed".into()).await);
        }

        if failures.is_empty() && outputs.len() == expected.len() {
            outputs.sort_by_key(|o| o.profile.bandwidth_bps());
            info!(job_id = %job.id, "All {} renditions completed", outputs.len());
            Ok(outputs)
        } else {
            failures.sort_by(|a, b| a.label.cmp(&b.label));
            warn!(job_id = %job.id, failed = failures.len(), completed = outputs.len(), "Rendition fan-out failed");
            Err(PipelineFailure { failures })
        }
    }

    async fn mark_failed(&self, id: Uuid, label: &str, reason: String) -> RenditionFailure {
        if let Err(e) = self.repo.transition_rendition(id, RenditionTransition::Fail(reason.clone())).await {
            error!(rendition = label, "Failed to persist rendition failure: {}", e);
        }
        RenditionFailure {
            label: label.to_string(),
            reason,
        }
    }
}

struct WorkerContext {
    pipeline: RenditionPipeline,
    job: TranscodingJob,
    source: PathBuf,
    scratch: PathBuf,
    cancel: CancellationToken,
}

impl WorkerContext {
    async fn process(&self, task: RenditionTask) -> (Uuid, Result<RenditionOutput, RenditionFailure>) {
        let id = task.rendition.id;
        (id, self.encode_and_upload(task).await)
    }

    async fn encode_and_upload(&self, task: RenditionTask) -> Result<RenditionOutput, RenditionFailure> {
        let p = &self.pipeline;
        let id = task.rendition.id;
        let label = task.profile.label.clone();

        if self.cancel.is_cancelled() {
            return Err(p.mark_failed(id, &label, "cancelled before start".into()).await);
        }

        match p.repo.transition_rendition(id, RenditionTransition::Start).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(RenditionFailure {
                    label,
                    reason: "rendition was no longer pending".into(),
                })
            }
            Err(e) => return Err(p.mark_failed(id, &label, format!("could not start rendition: {}", e)).await),
        }

        let output_dir = self.scratch.join("renditions").join(&label);
        if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
            return Err(p.mark_failed(id, &label, format!("could not prepare scratch space: {}", e)).await);
        }

        info!(job_id = %self.job.id, rendition = %label, "Encoding rendition");
        let request = EncodeRequest {
            input: self.source.clone(),
            output_dir,
            profile: task.profile.clone(),
            segment_seconds: p.segment_seconds,
            source_duration: self.job.duration_seconds,
        };
        let output = match p
            .executor
            .run(request, p.progress.sink(self.job.id, &label), self.cancel.child_token())
            .await
        {
            Ok(output) => output,
            Err(EncodeError::Cancelled) => {
                return Err(p.mark_failed(id, &label, "encode cancelled".into()).await);
            }
            Err(e) => {
                warn!(job_id = %self.job.id, rendition = %label, "Encode failed: {}", e);
                return Err(p.mark_failed(id, &label, e.to_string()).await);
            }
        };

        let prefix = paths::rendition_prefix(&self.job.output_base_path, &label);
        let file_size = match upload_dir(p.storage.as_ref(), &output.output_dir, &prefix, &self.cancel).await {
            Ok(bytes) => bytes as i64,
            Err(e) => {
                warn!(job_id = %self.job.id, rendition = %label, "Upload failed: {}", e);
                return Err(p.mark_failed(id, &label, format!("upload failed: {}", e)).await);
            }
        };

        let output_path = format!("{}/{}", prefix, output.playlist);
        let completed = p
            .repo
            .transition_rendition(
                id,
                RenditionTransition::Complete {
                    output_path: output_path.clone(),
                    file_size,
                },
            )
            .await;

        match completed {
            Ok(Some(_)) => {
                p.progress.report(self.job.id, &label, 1.0);
                info!(job_id = %self.job.id, rendition = %label, bytes = file_size, "Rendition completed");
                Ok(RenditionOutput {
                    rendition_id: id,
                    profile: task.profile,
                    output_path,
                    prefix,
                    file_size,
                })
            }
            Ok(None) => Err(RenditionFailure {
                label,
                reason: "rendition state changed while encoding".into(),
            }),
            Err(e) => Err(p.mark_failed(id, &label, format!("could not record completion: {}", e)).await),
        }
    }
}

/// Uploads every file of a flat encoder output directory under `prefix`.
async fn upload_dir(
    storage: &dyn StorageGateway,
    dir: &Path,
    prefix: &str,
    cancel: &CancellationToken,
) -> AdapterResult<u64> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    let mut total = 0;
    for file in files {
        if cancel.is_cancelled() {
            return Err(AdapterError::Permanent("upload cancelled".into()));
        }
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AdapterError::Permanent(format!("non UTF-8 file name in {}", dir.display())))?;
        let key = format!("{}/{}", prefix, name);
        total += storage.upload_file(&file, &key, &content_type_for(&file)).await?;
    }
    Ok(total)
}
