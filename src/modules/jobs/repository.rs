use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::model::{JobStatus, JobTransition, NewJob, Rendition, RenditionTransition, TranscodingJob};
use crate::common::error::{AdapterError, AdapterResult};
use crate::common::retry::{with_backoff, RetryPolicy};
use crate::modules::transcoding::profile::QualityProfile;

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub tenant_id: Option<String>,
    pub video_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

/// Durable source of truth for job and rendition state. Every status change
/// is a single conditional update keyed by id.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn find_by_request_id(&self, request_id: &str) -> AdapterResult<Option<TranscodingJob>>;

    /// The non-terminal job for a video, if any.
    async fn find_active_for_video(&self, tenant_id: &str, video_id: &str) -> AdapterResult<Option<TranscodingJob>>;

    /// Inserts a job in `Received`. Fails with `AdapterError::Conflict` when the
    /// request id or an active job for the same video already exists.
    async fn create_job(&self, job: NewJob) -> AdapterResult<TranscodingJob>;

    async fn get_job(&self, id: Uuid) -> AdapterResult<Option<TranscodingJob>>;

    async fn list_jobs(&self, filter: &JobFilter) -> AdapterResult<(Vec<TranscodingJob>, i64)>;

    /// Received or Processing jobs not touched since `before`.
    async fn list_stale_active(&self, before: OffsetDateTime) -> AdapterResult<Vec<TranscodingJob>>;

    /// Returns the updated job, or `None` if its current status does not
    /// permit the transition.
    async fn transition_job(&self, id: Uuid, transition: JobTransition) -> AdapterResult<Option<TranscodingJob>>;

    async fn create_rendition(&self, job_id: Uuid, profile: &QualityProfile) -> AdapterResult<Rendition>;

    async fn transition_rendition(&self, id: Uuid, transition: RenditionTransition) -> AdapterResult<Option<Rendition>>;

    async fn list_renditions(&self, job_id: Uuid) -> AdapterResult<Vec<Rendition>>;

    async fn ping(&self) -> AdapterResult<()>;
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    video_id: String,
    tenant_id: String,
    request_id: String,
    status: String,
    input_path: String,
    output_base_path: String,
    filename: String,
    file_size: i64,
    mime_type: String,
    duration_seconds: Option<f64>,
    original_resolution: Option<String>,
    has_audio: bool,
    failure_reason: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

impl TryFrom<JobRow> for TranscodingJob {
    type Error = AdapterError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            video_id: row.video_id,
            tenant_id: row.tenant_id,
            request_id: row.request_id,
            status: row.status.parse().map_err(AdapterError::Permanent)?,
            input_path: row.input_path,
            output_base_path: row.output_base_path,
            filename: row.filename,
            file_size: row.file_size,
            mime_type: row.mime_type,
            duration_seconds: row.duration_seconds,
            original_resolution: row.original_resolution,
            has_audio: row.has_audio,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RenditionRow {
    id: Uuid,
    job_id: Uuid,
    label: String,
    width: i32,
    height: i32,
    bitrate_kbps: i32,
    video_codec: String,
    audio_codec: String,
    container: String,
    status: String,
    output_path: Option<String>,
    file_size: Option<i64>,
    failure_reason: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

impl TryFrom<RenditionRow> for Rendition {
    type Error = AdapterError;

    fn try_from(row: RenditionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            job_id: row.job_id,
            label: row.label,
            width: row.width,
            height: row.height,
            bitrate_kbps: row.bitrate_kbps,
            video_codec: row.video_codec,
            audio_codec: row.audio_codec,
            container: row.container.parse().map_err(AdapterError::Permanent)?,
            status: row.status.parse().map_err(AdapterError::Permanent)?,
            output_path: row.output_path,
            file_size: row.file_size,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, video_id, tenant_id, request_id, status, input_path, output_base_path, \
    filename, file_size, mime_type, duration_seconds, original_resolution, has_audio, failure_reason, \
    created_at, updated_at, completed_at";

const RENDITION_COLUMNS: &str = "id, job_id, label, width, height, bitrate_kbps, video_codec, audio_codec, \
    container, status, output_path, file_size, failure_reason, created_at, updated_at, completed_at";

fn statuses<S: ToString>(from: &[S]) -> Vec<String> {
    from.iter().map(ToString::to_string).collect()
}

pub struct PgJobRepository {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgJobRepository {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    async fn fetch_job(&self, sql: &str, binds: &[&str]) -> AdapterResult<Option<TranscodingJob>> {
        let row = with_backoff(&self.retry, "fetch job", || async {
            let mut query = sqlx::query_as::<_, JobRow>(sql);
            for value in binds {
                query = query.bind(*value);
            }
            Ok::<_, AdapterError>(query.fetch_optional(&self.pool).await?)
        })
        .await?;
        row.map(TranscodingJob::try_from).transpose()
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn find_by_request_id(&self, request_id: &str) -> AdapterResult<Option<TranscodingJob>> {
        let sql = format!("SELECT {} FROM transcoding_jobs WHERE request_id = $1", JOB_COLUMNS);
        self.fetch_job(&sql, &[request_id]).await
    }

    async fn find_active_for_video(&self, tenant_id: &str, video_id: &str) -> AdapterResult<Option<TranscodingJob>> {
        let sql = format!(
            "SELECT {} FROM transcoding_jobs \
             WHERE tenant_id = $1 AND video_id = $2 AND status IN ('RECEIVED', 'PROCESSING') \
             ORDER BY created_at DESC LIMIT 1",
            JOB_COLUMNS
        );
        self.fetch_job(&sql, &[tenant_id, video_id]).await
    }

    async fn create_job(&self, job: NewJob) -> AdapterResult<TranscodingJob> {
        let sql = format!(
            r#"
            INSERT INTO transcoding_jobs
                (id, video_id, tenant_id, request_id, status, input_path, output_base_path,
                 filename, file_size, mime_type, duration_seconds, original_resolution, has_audio)
            VALUES ($1, $2, $3, $4, 'RECEIVED', $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        // Not retried: a lost acknowledgement would surface as a conflict, which
        // the coordinator resolves by looking the job up again.
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&job.video_id)
            .bind(&job.tenant_id)
            .bind(&job.request_id)
            .bind(&job.input_path)
            .bind(&job.output_base_path)
            .bind(&job.filename)
            .bind(job.file_size)
            .bind(&job.mime_type)
            .bind(job.duration_seconds)
            .bind(&job.original_resolution)
            .bind(job.has_audio)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn get_job(&self, id: Uuid) -> AdapterResult<Option<TranscodingJob>> {
        let sql = format!("SELECT {} FROM transcoding_jobs WHERE id = $1", JOB_COLUMNS);
        let row = with_backoff(&self.retry, "get job", || async {
            Ok::<_, AdapterError>(sqlx::query_as::<_, JobRow>(&sql).bind(id).fetch_optional(&self.pool).await?)
        })
        .await?;
        row.map(TranscodingJob::try_from).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> AdapterResult<(Vec<TranscodingJob>, i64)> {
        let status = filter.status.map(|s| s.as_str().to_string());
        let where_clause = "WHERE ($1::text IS NULL OR status = $1) \
             AND ($2::text IS NULL OR tenant_id = $2) \
             AND ($3::text IS NULL OR video_id = $3)";

        let list_sql = format!(
            "SELECT {} FROM transcoding_jobs {} ORDER BY created_at DESC LIMIT $4 OFFSET $5",
            JOB_COLUMNS, where_clause
        );
        let count_sql = format!("SELECT COUNT(*) FROM transcoding_jobs {}", where_clause);

        let (rows, total) = with_backoff(&self.retry, "list jobs", || async {
            let rows = sqlx::query_as::<_, JobRow>(&list_sql)
                .bind(&status)
                .bind(&filter.tenant_id)
                .bind(&filter.video_id)
                .bind(filter.limit)
                .bind(filter.offset)
                .fetch_all(&self.pool)
                .await?;
            let total: i64 = sqlx::query_scalar(&count_sql)
                .bind(&status)
                .bind(&filter.tenant_id)
                .bind(&filter.video_id)
                .fetch_one(&self.pool)
                .await?;
            Ok::<_, AdapterError>((rows, total))
        })
        .await?;

        let jobs = rows
            .into_iter()
            .map(TranscodingJob::try_from)
            .collect::<AdapterResult<Vec<_>>>()?;
        Ok((jobs, total))
    }

    async fn list_stale_active(&self, before: OffsetDateTime) -> AdapterResult<Vec<TranscodingJob>> {
        let sql = format!(
            "SELECT {} FROM transcoding_jobs WHERE status IN ('RECEIVED', 'PROCESSING') AND updated_at < $1 ORDER BY updated_at ASC",
            JOB_COLUMNS
        );
        let rows = with_backoff(&self.retry, "list stale jobs", || async {
            Ok::<_, AdapterError>(sqlx::query_as::<_, JobRow>(&sql).bind(before).fetch_all(&self.pool).await?)
        })
        .await?;
        rows.into_iter().map(TranscodingJob::try_from).collect()
    }

    async fn transition_job(&self, id: Uuid, transition: JobTransition) -> AdapterResult<Option<TranscodingJob>> {
        let sql = format!(
            r#"
            UPDATE transcoding_jobs
            SET status = $2,
                failure_reason = COALESCE($3, failure_reason),
                completed_at = CASE WHEN $2::text = 'COMPLETED' THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($4)
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let target = transition.target().as_str();
        let reason = transition.failure_reason();
        let from = statuses(transition.allowed_from());

        let row = with_backoff(&self.retry, "transition job", || async {
            Ok::<_, AdapterError>(sqlx::query_as::<_, JobRow>(&sql)
                .bind(id)
                .bind(target)
                .bind(reason)
                .bind(&from)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await?;
        row.map(TranscodingJob::try_from).transpose()
    }

    async fn create_rendition(&self, job_id: Uuid, profile: &QualityProfile) -> AdapterResult<Rendition> {
        let draft = Rendition::pending(job_id, profile, OffsetDateTime::now_utc());
        let sql = format!(
            r#"
            INSERT INTO renditions
                (id, job_id, label, width, height, bitrate_kbps, video_codec, audio_codec, container, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'PENDING')
            ON CONFLICT (id) DO NOTHING
            RETURNING {}
            "#,
            RENDITION_COLUMNS
        );
        let container = draft.container.to_string();

        let row = with_backoff(&self.retry, "create rendition", || async {
            Ok::<_, AdapterError>(sqlx::query_as::<_, RenditionRow>(&sql)
                .bind(draft.id)
                .bind(draft.job_id)
                .bind(&draft.label)
                .bind(draft.width)
                .bind(draft.height)
                .bind(draft.bitrate_kbps)
                .bind(&draft.video_codec)
                .bind(&draft.audio_codec)
                .bind(&container)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await?;

        match row {
            Some(row) => row.try_into(),
            // A retried insert whose first attempt landed.
            None => self
                .list_renditions(job_id)
                .await?
                .into_iter()
                .find(|r| r.id == draft.id)
                .ok_or_else(|| AdapterError::Permanent(format!("rendition {} vanished after insert", draft.id))),
        }
    }

    async fn transition_rendition(&self, id: Uuid, transition: RenditionTransition) -> AdapterResult<Option<Rendition>> {
        let sql = format!(
            r#"
            UPDATE renditions
            SET status = $2,
                output_path = COALESCE($3, output_path),
                file_size = COALESCE($4, file_size),
                failure_reason = COALESCE($5, failure_reason),
                completed_at = CASE WHEN $2::text = 'COMPLETED' THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($6)
            RETURNING {}
            "#,
            RENDITION_COLUMNS
        );
        let target = transition.target().as_str();
        let from = statuses(transition.allowed_from());
        let (output_path, file_size, reason) = match &transition {
            RenditionTransition::Complete { output_path, file_size } => (Some(output_path.as_str()), Some(*file_size), None),
            RenditionTransition::Fail(reason) => (None, None, Some(reason.as_str())),
            RenditionTransition::Start => (None, None, None),
        };

        let row = with_backoff(&self.retry, "transition rendition", || async {
            Ok::<_, AdapterError>(sqlx::query_as::<_, RenditionRow>(&sql)
                .bind(id)
                .bind(target)
                .bind(output_path)
                .bind(file_size)
                .bind(reason)
                .bind(&from)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await?;
        row.map(Rendition::try_from).transpose()
    }

    async fn list_renditions(&self, job_id: Uuid) -> AdapterResult<Vec<Rendition>> {
        let sql = format!(
            "SELECT {} FROM renditions WHERE job_id = $1 ORDER BY bitrate_kbps ASC, label ASC",
            RENDITION_COLUMNS
        );
        let rows = with_backoff(&self.retry, "list renditions", || async {
            Ok::<_, AdapterError>(sqlx::query_as::<_, RenditionRow>(&sql).bind(job_id).fetch_all(&self.pool).await?)
        })
        .await?;
        rows.into_iter().map(Rendition::try_from).collect()
    }

    async fn ping(&self) -> AdapterResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
