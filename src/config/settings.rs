use crate::config::env::{self, EnvKey};
use crate::modules::transcoding::manifest::ManifestFormat;
use crate::modules::transcoding::profile::{self, Container, QualityProfile};
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub rabbitmq_url: String,
    pub minio_url: String,
    pub minio_bucket: String,
    pub minio_access_key: String,
    pub minio_secret_key: String,
    pub upload_queue: String,
    pub completion_queue: String,
    pub storage_retry_attempts: u32,
    pub presign_ttl: Duration,
    pub reconcile_interval: Option<Duration>,
    pub transcoding: TranscodingSettings,
}

/// Knobs consumed by the coordinator, pipeline and encoder.
#[derive(Clone, Debug)]
pub struct TranscodingSettings {
    pub instance_id: String,
    pub work_dir: PathBuf,
    pub ffmpeg_path: String,
    pub lock_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub lock_acquire_attempts: u32,
    pub max_concurrent_jobs: usize,
    pub max_concurrent_renditions: usize,
    pub encode_max_attempts: u32,
    pub segment_seconds: u32,
    pub manifest_formats: Vec<ManifestFormat>,
    pub profiles: Arc<Vec<QualityProfile>>,
}

impl Default for TranscodingSettings {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            work_dir: std::env::temp_dir().join("transcode"),
            ffmpeg_path: "ffmpeg".to_string(),
            lock_ttl: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            lock_acquire_attempts: 3,
            max_concurrent_jobs: 2,
            max_concurrent_renditions: 3,
            encode_max_attempts: 1,
            segment_seconds: 6,
            manifest_formats: vec![ManifestFormat::Hls, ManifestFormat::Dash],
            profiles: Arc::new(profile::default_ladder()),
        }
    }
}

impl AppConfig {
    pub fn new() -> Result<Self> {
        let lock_ttl = Duration::from_secs(env::get_parsed(EnvKey::LockTtlSecs, 300u64).max(1));
        let heartbeat_interval =
            Duration::from_secs(env::get_parsed(EnvKey::LockHeartbeatSecs, 60u64).max(1));
        if heartbeat_interval >= lock_ttl {
            return Err(anyhow!(
                "LOCK_HEARTBEAT_SECS ({:?}) must be shorter than LOCK_TTL_SECS ({:?})",
                heartbeat_interval,
                lock_ttl
            ));
        }

        let manifest_formats = parse_manifest_formats(&env::get_or(EnvKey::ManifestFormats, "hls,dash"))?;

        let profiles = match env::get_opt(EnvKey::QualityProfilesPath) {
            Some(path) => profile::load_from_file(&PathBuf::from(&path))
                .with_context(|| format!("Failed to load quality profiles from {}", path))?,
            None => profile::default_ladder(),
        };

        check_packaging(&manifest_formats, &profiles)?;

        let reconcile_secs = env::get_parsed(EnvKey::ReconcileIntervalSecs, 0u64);

        Ok(Self {
            server_port: env::get_parsed(EnvKey::ServerPort, 3000),
            database_url: env::get(EnvKey::DatabaseUrl).context("DATABASE_URL")?,
            redis_url: env::get(EnvKey::RedisUrl).context("REDIS_URL")?,
            rabbitmq_url: env::get(EnvKey::RabbitMqUrl).context("RABBITMQ_URL")?,
            minio_url: env::get(EnvKey::MinioUrl).context("MINIO_ENDPOINT")?,
            minio_bucket: env::get(EnvKey::MinioBucket).context("MINIO_BUCKET_VIDEOS")?,
            minio_access_key: env::get(EnvKey::MinioAccessKey).context("AWS_ACCESS_KEY_ID")?,
            minio_secret_key: env::get(EnvKey::MinioSecretKey).context("AWS_SECRET_ACCESS_KEY")?,
            upload_queue: env::get_or(EnvKey::UploadQueue, "video_uploaded"),
            completion_queue: env::get_or(EnvKey::CompletionQueue, "video_transcoded"),
            storage_retry_attempts: env::get_parsed(EnvKey::StorageRetryAttempts, 3u32).max(1),
            presign_ttl: Duration::from_secs(env::get_parsed(EnvKey::PresignTtlSecs, 3600u64)),
            reconcile_interval: (reconcile_secs > 0).then(|| Duration::from_secs(reconcile_secs)),
            transcoding: TranscodingSettings {
                instance_id: env::get_opt(EnvKey::InstanceId).unwrap_or_else(|| Uuid::new_v4().to_string()),
                work_dir: PathBuf::from(env::get_or(EnvKey::WorkDir, "/tmp/transcode")),
                ffmpeg_path: env::get_or(EnvKey::FfmpegPath, "ffmpeg"),
                lock_ttl,
                heartbeat_interval,
                lock_acquire_attempts: env::get_parsed(EnvKey::LockAcquireAttempts, 3u32).max(1),
                max_concurrent_jobs: env::get_parsed(EnvKey::MaxConcurrentJobs, 2usize).max(1),
                max_concurrent_renditions: env::get_parsed(EnvKey::MaxConcurrentRenditions, 3usize).max(1),
                encode_max_attempts: env::get_parsed(EnvKey::EncodeMaxAttempts, 1u32).max(1),
                segment_seconds: env::get_parsed(EnvKey::SegmentSeconds, 6u32).max(1),
                manifest_formats,
                profiles: Arc::new(profiles),
            },
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            server_port: 0,
            database_url: String::new(),
            redis_url: String::new(),
            rabbitmq_url: String::new(),
            minio_url: String::new(),
            minio_bucket: "videos".to_string(),
            minio_access_key: String::new(),
            minio_secret_key: String::new(),
            upload_queue: "video_uploaded".to_string(),
            completion_queue: "video_transcoded".to_string(),
            storage_retry_attempts: 1,
            presign_ttl: Duration::from_secs(60),
            reconcile_interval: None,
            transcoding: TranscodingSettings::default(),
        }
    }
}

pub fn parse_manifest_formats(raw: &str) -> Result<Vec<ManifestFormat>> {
    let mut formats = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let format = part.parse::<ManifestFormat>().map_err(|e| anyhow!(e))?;
        if !formats.contains(&format) {
            formats.push(format);
        }
    }
    if formats.is_empty() {
        return Err(anyhow!("MANIFEST_FORMATS must name at least one of: hls, dash"));
    }
    Ok(formats)
}

/// DASH packaging needs fragmented MP4 segments on every rung.
pub fn check_packaging(formats: &[ManifestFormat], profiles: &[QualityProfile]) -> Result<()> {
    if !formats.contains(&ManifestFormat::Dash) {
        return Ok(());
    }
    let ts: Vec<&str> = profiles
        .iter()
        .filter(|p| p.container == Container::Ts)
        .map(|p| p.label.as_str())
        .collect();
    if !ts.is_empty() {
        return Err(anyhow!(
            "MANIFEST_FORMATS includes dash but profiles [{}] use ts segments; use fmp4 or drop dash",
            ts.join(", ")
        ));
    }
    Ok(())
}
