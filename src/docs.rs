use utoipa::OpenApi;
use crate::modules::jobs::dto::*;
use crate::modules::jobs::events::{VideoTranscoded, VideoUploaded};
use crate::modules::jobs::model::{JobStatus, Rendition, RenditionStatus, TranscodingJob};
use crate::modules::transcoding::progress::JobProgress;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::modules::jobs::handler::list_jobs,
        crate::modules::jobs::handler::get_job,
        crate::modules::jobs::handler::abort_job,
        crate::modules::jobs::handler::processing_status,
        crate::modules::jobs::handler::health,
    ),
    components(
        schemas(
            TranscodingJob, Rendition, JobStatus, RenditionStatus, JobProgress,
            JobListResponse, JobDetailResponse, ManifestLinks, AbortResponse,
            ProcessingStatusResponse, HealthResponse, ComponentHealth,
            VideoUploaded, VideoTranscoded,
        )
    ),
    tags(
        (name = "Jobs", description = "Transcoding job management"),
        (name = "Health", description = "Dependency connectivity")
    )
)]
pub struct ApiDoc;
