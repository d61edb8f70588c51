use super::dto::{
    AbortResponse, HealthResponse, JobDetailResponse, JobListResponse, ListJobsQuery, ProcessingStatusResponse,
};
use super::service::JobService;
use crate::common::response::{ApiResponse, ApiSuccess};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

/// List transcoding jobs
#[utoipa::path(
    get,
    path = "/api/v1/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Page of jobs, newest first", body = ApiResponse<JobListResponse>),
        (status = 400, description = "Unknown status filter")
    ),
    tag = "Jobs"
)]
pub async fn list_jobs(State(state): State<AppState>, Query(query): Query<ListJobsQuery>) -> impl IntoResponse {
    match JobService::list(state, query).await {
        Ok(page) => ApiSuccess(ApiResponse::success(page, "Jobs retrieved successfully"), StatusCode::OK).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Get a job with its renditions, live progress and manifest links
#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job details", body = ApiResponse<JobDetailResponse>),
        (status = 404, description = "Job not found")
    ),
    tag = "Jobs"
)]
pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match JobService::detail(state, id).await {
        Ok(detail) => ApiSuccess(ApiResponse::success(detail, "Job retrieved successfully"), StatusCode::OK).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Abort a received or processing job
#[utoipa::path(
    post,
    path = "/api/v1/jobs/{id}/abort",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Abort outcome; `aborted` is false for finished jobs", body = ApiResponse<AbortResponse>),
        (status = 404, description = "Job not found")
    ),
    tag = "Jobs"
)]
pub async fn abort_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match JobService::abort(state, id).await {
        Ok(result) => {
            let message = if result.aborted {
                "Job aborted"
            } else {
                "Job already finished"
            };
            ApiSuccess(ApiResponse::success(result, message), StatusCode::OK).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Whether a live lease exists for a source video
#[utoipa::path(
    get,
    path = "/api/v1/tenants/{tenant_id}/videos/{video_id}/processing",
    params(
        ("tenant_id" = String, Path, description = "Tenant ID"),
        ("video_id" = String, Path, description = "Source video ID")
    ),
    responses(
        (status = 200, description = "Processing flag", body = ApiResponse<ProcessingStatusResponse>)
    ),
    tag = "Jobs"
)]
pub async fn processing_status(
    State(state): State<AppState>,
    Path((tenant_id, video_id)): Path<(String, String)>,
) -> impl IntoResponse {
    match JobService::processing_status(state, tenant_id, video_id).await {
        Ok(status) => ApiSuccess(ApiResponse::success(status, "Processing status retrieved"), StatusCode::OK).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Connectivity of the database, object storage and lock store
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "All components reachable", body = ApiResponse<HealthResponse>),
        (status = 503, description = "At least one component is down", body = ApiResponse<HealthResponse>)
    ),
    tag = "Health"
)]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = JobService::health(state).await;
    if report.healthy {
        ApiSuccess(ApiResponse::success(report, "All systems operational"), StatusCode::OK).into_response()
    } else {
        ApiSuccess(ApiResponse::failure(report, "Degraded"), StatusCode::SERVICE_UNAVAILABLE).into_response()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::settings::AppConfig;
    use crate::modules::jobs::model::JobStatus;
    use crate::modules::jobs::repository::JobRepository;
    use crate::modules::transcoding::coordinator::JobCoordinator;
    use crate::modules::transcoding::lock::{lock_key, LockManager};
    use crate::state::AppState;
    use crate::testing::{sample_job, FakeExecutor, InMemoryJobRepository, InMemoryLockManager, InMemoryStorage};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct TestApp {
        repo: Arc<InMemoryJobRepository>,
        locks: Arc<InMemoryLockManager>,
        router: Router,
    }

    fn app() -> TestApp {
        let config = AppConfig::for_tests();
        let repo = Arc::new(InMemoryJobRepository::new());
        let storage = Arc::new(InMemoryStorage::new());
        let locks = Arc::new(InMemoryLockManager::new());
        let coordinator = JobCoordinator::new(
            repo.clone(),
            storage.clone(),
            locks.clone(),
            Arc::new(FakeExecutor::new()),
            config.transcoding.clone(),
        );
        let state = AppState::new(config, repo.clone(), storage, locks.clone(), coordinator);
        TestApp {
            repo,
            locks,
            router: crate::routes::configure_routes().with_state(state),
        }
    }

    async fn call(router: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let app = app();
        app.repo.insert(sample_job("V1", "T1", "r1"));
        app.repo.insert(sample_job("V2", "T1", "r2"));
        app.repo.insert_processing(sample_job("V3", "T2", "r3"));

        let (status, body) = call(&app.router, "GET", "/api/v1/jobs?tenant_id=T1&per_page=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 2);
        assert_eq!(body["data"]["items"].as_array().unwrap().len(), 1);

        let (_, body) = call(&app.router, "GET", "/api/v1/jobs?status=processing").await;
        assert_eq!(body["data"]["items"][0]["video_id"], "V3");

        let (status, body) = call(&app.router, "GET", "/api/v1/jobs?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn detail_returns_404_for_unknown_jobs() {
        let app = app();
        let (status, _) = call(&app.router, "GET", &format!("/api/v1/jobs/{}", uuid::Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let job = sample_job("V1", "T1", "r1");
        app.repo.insert(job.clone());
        let (status, body) = call(&app.router, "GET", &format!("/api/v1/jobs/{}", job.id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["job"]["status"], "RECEIVED");
        assert!(body["data"]["manifests"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn abort_fails_live_jobs_once() {
        let app = app();
        let job = app.repo.insert_processing(sample_job("V1", "T1", "r1"));
        let key = lock_key("T1", "V1");
        app.locks.acquire(&key, Duration::from_secs(60)).await.unwrap();

        let uri = format!("/api/v1/jobs/{}/abort", job.id);
        let (status, body) = call(&app.router, "POST", &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["aborted"], true);
        assert!(!app.locks.exists(&key).await.unwrap());

        let stored = app.repo.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);

        let (_, body) = call(&app.router, "POST", &uri).await;
        assert_eq!(body["data"]["aborted"], false);
    }

    #[tokio::test]
    async fn processing_flag_follows_the_lease() {
        let app = app();
        let uri = "/api/v1/tenants/T1/videos/V1/processing";
        let (_, body) = call(&app.router, "GET", uri).await;
        assert_eq!(body["data"]["processing"], false);

        app.locks.acquire(&lock_key("T1", "V1"), Duration::from_secs(60)).await.unwrap();
        let (_, body) = call(&app.router, "GET", uri).await;
        assert_eq!(body["data"]["processing"], true);
    }

    #[tokio::test]
    async fn health_reports_each_component() {
        let app = app();
        let (status, body) = call(&app.router, "GET", "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["healthy"], true);

        app.repo.set_down(true);
        let (status, body) = call(&app.router, "GET", "/api/v1/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let db = &body["data"]["components"][0];
        assert_eq!(db["name"], "database");
        assert_eq!(db["healthy"], false);
    }
}
