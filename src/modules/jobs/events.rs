use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::model::{NewJob, Rendition, RenditionStatus, TranscodingJob};
use crate::modules::transcoding::storage::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    pub duration: Option<f64>,
    pub original_resolution: Option<String>,
    #[serde(default)]
    pub has_audio: bool,
}

/// Inbound notification published once a master file lands in storage.
/// Delivered at least once.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VideoUploaded {
    #[validate(length(min = 1, max = 255), custom(function = "validate_id_segment"))]
    pub video_id: String,
    #[validate(length(min = 1, max = 255), custom(function = "validate_id_segment"))]
    pub tenant_id: String,
    #[validate(length(min = 1))]
    pub input_path: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub file_size: i64,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub metadata: SourceMetadata,
    #[validate(length(min = 1, max = 255))]
    pub request_id: String,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub timestamp: OffsetDateTime,
}

/// Ids become storage path segments and lock key parts, so they may not
/// carry separators, dot segments or control characters.
fn validate_id_segment(value: &str) -> Result<(), ValidationError> {
    let bad_char = value
        .chars()
        .any(|c| matches!(c, '/' | '\\' | ':') || c.is_control());
    if bad_char || value == "." || value.contains("..") {
        let mut err = ValidationError::new("id_segment");
        err.message = Some("must not contain '/', '\\', ':', '..' or control characters".into());
        return Err(err);
    }
    Ok(())
}

impl VideoUploaded {
    pub fn to_new_job(&self) -> NewJob {
        NewJob {
            video_id: self.video_id.clone(),
            tenant_id: self.tenant_id.clone(),
            request_id: self.request_id.clone(),
            input_path: self.input_path.clone(),
            output_base_path: paths::output_base(&self.tenant_id, &self.video_id),
            filename: self.filename.clone(),
            file_size: self.file_size,
            mime_type: self.mime_type.clone(),
            duration_seconds: self.metadata.duration,
            original_resolution: self.metadata.original_resolution.clone(),
            has_audio: self.metadata.has_audio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ManifestUrls {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hls: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RenditionSummary {
    pub resolution: String,
    pub bitrate: i32,
    pub file_size: i64,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TechnicalMetadata {
    pub duration: Option<f64>,
    pub audio_tracks: u32,
    pub has_subtitles: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct QualityMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psnr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmaf: Option<f64>,
}

/// Outbound completion event, published for both outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VideoTranscoded {
    pub video_id: String,
    pub tenant_id: String,
    pub job_id: Uuid,
    pub status: CompletionStatus,
    pub manifest_urls: ManifestUrls,
    pub renditions: Vec<RenditionSummary>,
    pub technical_metadata: TechnicalMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_metrics: Option<QualityMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub request_id: String,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub timestamp: OffsetDateTime,
}

impl VideoTranscoded {
    /// Builds the event from the persisted job state. Only completed
    /// renditions are listed, ascending by bitrate.
    pub fn from_job(job: &TranscodingJob, renditions: &[Rendition], manifest_urls: ManifestUrls) -> Self {
        let mut completed: Vec<&Rendition> = renditions
            .iter()
            .filter(|r| r.status == RenditionStatus::Completed)
            .collect();
        completed.sort_by_key(|r| r.bitrate_kbps);

        let status = if job.status == super::model::JobStatus::Completed {
            CompletionStatus::Completed
        } else {
            CompletionStatus::Failed
        };

        Self {
            video_id: job.video_id.clone(),
            tenant_id: job.tenant_id.clone(),
            job_id: job.id,
            status,
            manifest_urls,
            renditions: completed
                .into_iter()
                .map(|r| RenditionSummary {
                    resolution: r.resolution(),
                    bitrate: r.bitrate_kbps,
                    file_size: r.file_size.unwrap_or_default(),
                    path: r.output_path.clone().unwrap_or_default(),
                })
                .collect(),
            technical_metadata: TechnicalMetadata {
                duration: job.duration_seconds,
                audio_tracks: u32::from(job.has_audio),
                has_subtitles: false,
            },
            quality_metrics: None,
            failure_reason: job.failure_reason.clone(),
            request_id: job.request_id.clone(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}
