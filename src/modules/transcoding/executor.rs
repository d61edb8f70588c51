use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::profile::QualityProfile;

/// Fractional progress sink, called with values in `0.0..=1.0`.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub input: PathBuf,
    /// Empty directory the executor writes the rendition into.
    pub output_dir: PathBuf,
    pub profile: QualityProfile,
    pub segment_seconds: u32,
    pub source_duration: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct EncodeOutput {
    pub output_dir: PathBuf,
    /// Media playlist file name inside `output_dir`.
    pub playlist: String,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoder failed: {0}")]
    Failed(String),
    #[error("encode cancelled")]
    Cancelled,
    #[error("encoder io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs one encode of `request.input` for one quality profile.
#[async_trait]
pub trait EncodeExecutor: Send + Sync {
    async fn run(
        &self,
        request: EncodeRequest,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<EncodeOutput, EncodeError>;
}

/// Re-runs a failed encode up to `max_attempts` times. Cancellation is never
/// retried.
pub struct RetryingExecutor {
    inner: Arc<dyn EncodeExecutor>,
    max_attempts: u32,
}

impl RetryingExecutor {
    pub fn new(inner: Arc<dyn EncodeExecutor>, max_attempts: u32) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
        }
    }
}

#[async_trait]
impl EncodeExecutor for RetryingExecutor {
    async fn run(
        &self,
        request: EncodeRequest,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<EncodeOutput, EncodeError> {
        let mut attempt = 1;
        loop {
            match self.inner.run(request.clone(), on_progress.clone(), cancel.clone()).await {
                Err(EncodeError::Cancelled) => return Err(EncodeError::Cancelled),
                Err(e) if attempt < self.max_attempts && !cancel.is_cancelled() => {
                    warn!(
                        rendition = %request.profile.label,
                        "Encode attempt {}/{} failed: {}",
                        attempt,
                        self.max_attempts,
                        e
                    );
                    if request.output_dir.exists() {
                        tokio::fs::remove_dir_all(&request.output_dir).await?;
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
