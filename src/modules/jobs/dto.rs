use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::model::{Rendition, TranscodingJob};
use crate::modules::transcoding::progress::JobProgress;

pub const DEFAULT_PER_PAGE: i64 = 20;
pub const MAX_PER_PAGE: i64 = 100;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListJobsQuery {
    /// RECEIVED, PROCESSING, COMPLETED or FAILED
    pub status: Option<String>,
    pub tenant_id: Option<String>,
    pub video_id: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl ListJobsQuery {
    /// Page is 1-based; `per_page` is clamped to `1..=MAX_PER_PAGE`.
    pub fn pagination(&self) -> (i64, i64) {
        let page = self.page.unwrap_or(1).max(1);
        let per_page = self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
        (page, per_page)
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobListResponse {
    pub items: Vec<TranscodingJob>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Debug, Default, Serialize, ToSchema)]
pub struct ManifestLinks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hls: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dash: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobDetailResponse {
    pub job: TranscodingJob,
    pub renditions: Vec<Rendition>,
    /// Live encode progress; only present while this instance runs the job.
    pub progress: Option<JobProgress>,
    /// Presigned manifest URLs for completed jobs.
    pub manifests: ManifestLinks,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AbortResponse {
    pub job_id: Uuid,
    pub aborted: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProcessingStatusResponse {
    pub tenant_id: String,
    pub video_id: String,
    pub processing: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub healthy: bool,
    pub components: Vec<ComponentHealth>,
}
