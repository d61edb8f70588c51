use axum::routing::{get, post};
use axum::Router;
use crate::state::AppState;

pub mod dto;
pub mod events;
pub mod handler;
pub mod model;
pub mod repository;
pub mod service;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(handler::list_jobs))
        .route("/jobs/{id}", get(handler::get_job))
        .route("/jobs/{id}/abort", post(handler::abort_job))
        .route(
            "/tenants/{tenant_id}/videos/{video_id}/processing",
            get(handler::processing_status),
        )
}
