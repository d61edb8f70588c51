use std::env;
use std::str::FromStr;

pub enum EnvKey {
    ServerPort,
    DatabaseUrl,
    RedisUrl,
    RabbitMqUrl,
    MinioUrl,
    MinioBucket,
    MinioAccessKey,
    MinioSecretKey,
    UploadQueue,
    CompletionQueue,
    InstanceId,
    WorkDir,
    FfmpegPath,
    LockTtlSecs,
    LockHeartbeatSecs,
    LockAcquireAttempts,
    MaxConcurrentJobs,
    MaxConcurrentRenditions,
    EncodeMaxAttempts,
    StorageRetryAttempts,
    SegmentSeconds,
    ManifestFormats,
    QualityProfilesPath,
    PresignTtlSecs,
    ReconcileIntervalSecs,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::RedisUrl => "REDIS_URL",
            EnvKey::RabbitMqUrl => "RABBITMQ_URL",
            EnvKey::MinioUrl => "MINIO_ENDPOINT",
            EnvKey::MinioBucket => "MINIO_BUCKET_VIDEOS",
            EnvKey::MinioAccessKey => "AWS_ACCESS_KEY_ID",
            EnvKey::MinioSecretKey => "AWS_SECRET_ACCESS_KEY",
            EnvKey::UploadQueue => "UPLOAD_QUEUE",
            EnvKey::CompletionQueue => "COMPLETION_QUEUE",
            EnvKey::InstanceId => "INSTANCE_ID",
            EnvKey::WorkDir => "WORK_DIR",
            EnvKey::FfmpegPath => "FFMPEG_PATH",
            EnvKey::LockTtlSecs => "LOCK_TTL_SECS",
            EnvKey::LockHeartbeatSecs => "LOCK_HEARTBEAT_SECS",
            EnvKey::LockAcquireAttempts => "LOCK_ACQUIRE_ATTEMPTS",
            EnvKey::MaxConcurrentJobs => "MAX_CONCURRENT_JOBS",
            EnvKey::MaxConcurrentRenditions => "MAX_CONCURRENT_RENDITIONS",
            EnvKey::EncodeMaxAttempts => "ENCODE_MAX_ATTEMPTS",
            EnvKey::StorageRetryAttempts => "STORAGE_RETRY_ATTEMPTS",
            EnvKey::SegmentSeconds => "SEGMENT_SECONDS",
            EnvKey::ManifestFormats => "MANIFEST_FORMATS",
            EnvKey::QualityProfilesPath => "QUALITY_PROFILES_PATH",
            EnvKey::PresignTtlSecs => "PRESIGN_TTL_SECS",
            EnvKey::ReconcileIntervalSecs => "RECONCILE_INTERVAL_SECS",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_opt(key: EnvKey) -> Option<String> {
    env::var(key.as_str()).ok().filter(|v| !v.trim().is_empty())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}
