use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::modules::transcoding::profile::{Container, QualityProfile};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Received,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Received => "RECEIVED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RECEIVED" => Ok(JobStatus::Received),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenditionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RenditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenditionStatus::Pending => "PENDING",
            RenditionStatus::Processing => "PROCESSING",
            RenditionStatus::Completed => "COMPLETED",
            RenditionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RenditionStatus::Completed | RenditionStatus::Failed)
    }
}

impl fmt::Display for RenditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenditionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(RenditionStatus::Pending),
            "PROCESSING" => Ok(RenditionStatus::Processing),
            "COMPLETED" => Ok(RenditionStatus::Completed),
            "FAILED" => Ok(RenditionStatus::Failed),
            other => Err(format!("unknown rendition status '{}'", other)),
        }
    }
}

/// A requested job status change. Each transition names the only states it
/// may leave from, so a single conditional update enforces the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTransition {
    Start,
    Complete,
    Fail(String),
}

impl JobTransition {
    pub fn allowed_from(&self) -> &'static [JobStatus] {
        match self {
            JobTransition::Start => &[JobStatus::Received],
            JobTransition::Complete => &[JobStatus::Processing],
            JobTransition::Fail(_) => &[JobStatus::Received, JobStatus::Processing],
        }
    }

    pub fn target(&self) -> JobStatus {
        match self {
            JobTransition::Start => JobStatus::Processing,
            JobTransition::Complete => JobStatus::Completed,
            JobTransition::Fail(_) => JobStatus::Failed,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            JobTransition::Fail(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenditionTransition {
    Start,
    Complete { output_path: String, file_size: i64 },
    Fail(String),
}

impl RenditionTransition {
    pub fn allowed_from(&self) -> &'static [RenditionStatus] {
        match self {
            RenditionTransition::Start => &[RenditionStatus::Pending],
            RenditionTransition::Complete { .. } => &[RenditionStatus::Processing],
            // Pending renditions can fail without ever starting (abort, setup errors).
            RenditionTransition::Fail(_) => &[RenditionStatus::Pending, RenditionStatus::Processing],
        }
    }

    pub fn target(&self) -> RenditionStatus {
        match self {
            RenditionTransition::Start => RenditionStatus::Processing,
            RenditionTransition::Complete { .. } => RenditionStatus::Completed,
            RenditionTransition::Fail(_) => RenditionStatus::Failed,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, ToSchema)]
pub struct TranscodingJob {
    pub id: Uuid,
    pub video_id: String,
    pub tenant_id: String,
    pub request_id: String,
    pub status: JobStatus,
    pub input_path: String,
    pub output_base_path: String,
    pub filename: String,
    pub file_size: i64,
    pub mime_type: String,
    pub duration_seconds: Option<f64>,
    pub original_resolution: Option<String>,
    pub has_audio: bool,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub completed_at: Option<OffsetDateTime>,
}

/// Everything needed to insert a job; the repository assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub video_id: String,
    pub tenant_id: String,
    pub request_id: String,
    pub input_path: String,
    pub output_base_path: String,
    pub filename: String,
    pub file_size: i64,
    pub mime_type: String,
    pub duration_seconds: Option<f64>,
    pub original_resolution: Option<String>,
    pub has_audio: bool,
}

impl TranscodingJob {
    pub fn from_new(new: NewJob, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            video_id: new.video_id,
            tenant_id: new.tenant_id,
            request_id: new.request_id,
            status: JobStatus::Received,
            input_path: new.input_path,
            output_base_path: new.output_base_path,
            filename: new.filename,
            file_size: new.file_size,
            mime_type: new.mime_type,
            duration_seconds: new.duration_seconds,
            original_resolution: new.original_resolution,
            has_audio: new.has_audio,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Applies a transition in memory, mirroring the repository's conditional
    /// update. Returns false when the current status does not allow it.
    pub fn apply(&mut self, transition: &JobTransition, now: OffsetDateTime) -> bool {
        if !transition.allowed_from().contains(&self.status) {
            return false;
        }
        self.status = transition.target();
        self.updated_at = now;
        match transition {
            JobTransition::Complete => self.completed_at = Some(now),
            JobTransition::Fail(reason) => self.failure_reason = Some(reason.clone()),
            JobTransition::Start => {}
        }
        true
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, ToSchema)]
pub struct Rendition {
    pub id: Uuid,
    pub job_id: Uuid,
    pub label: String,
    pub width: i32,
    pub height: i32,
    pub bitrate_kbps: i32,
    pub video_codec: String,
    pub audio_codec: String,
    pub container: Container,
    pub status: RenditionStatus,
    pub output_path: Option<String>,
    pub file_size: Option<i64>,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub completed_at: Option<OffsetDateTime>,
}

impl Rendition {
    pub fn pending(job_id: Uuid, profile: &QualityProfile, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            label: profile.label.clone(),
            width: i32::try_from(profile.width).unwrap_or(i32::MAX),
            height: i32::try_from(profile.height).unwrap_or(i32::MAX),
            bitrate_kbps: i32::try_from(profile.total_bitrate_kbps()).unwrap_or(i32::MAX),
            video_codec: profile.video_codec.clone(),
            audio_codec: profile.audio_codec.clone(),
            container: profile.container,
            status: RenditionStatus::Pending,
            output_path: None,
            file_size: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    pub fn apply(&mut self, transition: &RenditionTransition, now: OffsetDateTime) -> bool {
        if !transition.allowed_from().contains(&self.status) {
            return false;
        }
        self.status = transition.target();
        self.updated_at = now;
        match transition {
            RenditionTransition::Complete { output_path, file_size } => {
                self.output_path = Some(output_path.clone());
                self.file_size = Some(*file_size);
                self.completed_at = Some(now);
            }
            RenditionTransition::Fail(reason) => self.failure_reason = Some(reason.clone()),
            RenditionTransition::Start => {}
        }
        true
    }
}
