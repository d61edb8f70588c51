use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;

use super::executor::ProgressFn;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JobProgress {
    /// Mean of rendition fractions, `0.0..=1.0`.
    pub overall: f32,
    pub renditions: BTreeMap<String, f32>,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
}

/// In-memory, best-effort view of running encodes. Reporting never affects
/// job outcomes.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    jobs: Arc<RwLock<HashMap<Uuid, JobProgress>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_job<'a>(&self, job_id: Uuid, labels: impl IntoIterator<Item = &'a str>) {
        let renditions = labels.into_iter().map(|l| (l.to_string(), 0.0)).collect();
        self.jobs.write().insert(
            job_id,
            JobProgress {
                overall: 0.0,
                renditions,
                updated_at: OffsetDateTime::now_utc(),
            },
        );
    }

    pub fn report(&self, job_id: Uuid, label: &str, fraction: f32) {
        let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { return };
        let mut jobs = self.jobs.write();
        let Some(progress) = jobs.get_mut(&job_id) else {
            return;
        };
        progress.renditions.insert(label.to_string(), fraction);
        let total: f32 = progress.renditions.values().sum();
        progress.overall = total / progress.renditions.len().max(1) as f32;
        progress.updated_at = OffsetDateTime::now_utc();
        debug!(%job_id, rendition = label, fraction, overall = progress.overall, "Encode progress");
    }

    /// Callback bound to one rendition of one job.
    pub fn sink(&self, job_id: Uuid, label: &str) -> ProgressFn {
        let tracker = self.clone();
        let label = label.to_string();
        Arc::new(move |fraction| tracker.report(job_id, &label, fraction))
    }

    pub fn snapshot(&self, job_id: Uuid) -> Option<JobProgress> {
        self.jobs.read().get(&job_id).cloned()
    }

    pub fn finish_job(&self, job_id: Uuid) {
        self.jobs.write().remove(&job_id);
    }
}
