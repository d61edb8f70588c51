use axum::http::StatusCode;
use tracing::warn;
use uuid::Uuid;

use super::dto::{
    AbortResponse, ComponentHealth, HealthResponse, JobDetailResponse, JobListResponse, ListJobsQuery, ManifestLinks,
    ProcessingStatusResponse,
};
use super::model::{JobStatus, TranscodingJob};
use super::repository::JobFilter;
use crate::common::error::AdapterResult;
use crate::common::response::ApiError;
use crate::modules::transcoding::coordinator::CoordinatorError;
use crate::modules::transcoding::manifest::{manifest_key, ManifestFormat};
use crate::state::AppState;

const HEALTH_PROBE_KEY: &str = "transcode:health";

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::JobNotFound(_) => ApiError(err.to_string(), StatusCode::NOT_FOUND),
            CoordinatorError::InvalidEvent(_) => ApiError(err.to_string(), StatusCode::BAD_REQUEST),
            CoordinatorError::LockContention(_) => ApiError(err.to_string(), StatusCode::CONFLICT),
            CoordinatorError::Adapter(e) => e.into(),
        }
    }
}

pub struct JobService;

impl JobService {
    pub async fn list(state: AppState, query: ListJobsQuery) -> Result<JobListResponse, ApiError> {
        let status = query
            .status
            .as_deref()
            .map(str::parse::<JobStatus>)
            .transpose()
            .map_err(|e| ApiError(e, StatusCode::BAD_REQUEST))?;
        let (page, per_page) = query.pagination();

        let filter = JobFilter {
            status,
            tenant_id: query.tenant_id,
            video_id: query.video_id,
            limit: per_page,
            offset: (page - 1) * per_page,
        };
        let (items, total) = state.repo.list_jobs(&filter).await?;

        Ok(JobListResponse {
            items,
            total,
            page,
            per_page,
        })
    }

    pub async fn detail(state: AppState, id: Uuid) -> Result<JobDetailResponse, ApiError> {
        let job = state
            .repo
            .get_job(id)
            .await?
            .ok_or_else(|| ApiError("Job not found".to_string(), StatusCode::NOT_FOUND))?;
        let renditions = state.repo.list_renditions(id).await?;
        let manifests = Self::manifest_links(&state, &job).await;

        Ok(JobDetailResponse {
            progress: state.coordinator.progress(id),
            job,
            renditions,
            manifests,
        })
    }

    async fn manifest_links(state: &AppState, job: &TranscodingJob) -> ManifestLinks {
        let mut links = ManifestLinks::default();
        if job.status != JobStatus::Completed {
            return links;
        }
        for format in &state.config.transcoding.manifest_formats {
            let key = manifest_key(&job.output_base_path, *format);
            // Missing links degrade the response, they never fail it.
            let url = match state.storage.presign(&key, state.config.presign_ttl).await {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(job_id = %job.id, key = %key, "Could not presign manifest: {}", e);
                    None
                }
            };
            match format {
                ManifestFormat::Hls => links.hls = url,
                ManifestFormat::Dash => links.dash = url,
            }
        }
        links
    }

    pub async fn abort(state: AppState, id: Uuid) -> Result<AbortResponse, ApiError> {
        let aborted = state.coordinator.abort_job(id).await?;
        Ok(AbortResponse { job_id: id, aborted })
    }

    pub async fn processing_status(
        state: AppState,
        tenant_id: String,
        video_id: String,
    ) -> Result<ProcessingStatusResponse, ApiError> {
        let processing = state.coordinator.is_being_processed(&tenant_id, &video_id).await?;
        Ok(ProcessingStatusResponse {
            tenant_id,
            video_id,
            processing,
        })
    }

    pub async fn health(state: AppState) -> HealthResponse {
        let (db, storage, locks) = tokio::join!(
            state.repo.ping(),
            state.storage.ping(),
            state.locks.exists(HEALTH_PROBE_KEY),
        );
        let components = vec![
            component("database", db),
            component("storage", storage),
            component("lock_store", locks.map(|_| ())),
        ];
        HealthResponse {
            healthy: components.iter().all(|c| c.healthy),
            components,
        }
    }
}

fn component(name: &str, result: AdapterResult<()>) -> ComponentHealth {
    ComponentHealth {
        name: name.to_string(),
        healthy: result.is_ok(),
        error: result.err().map(|e| e.to_string()),
    }
}
