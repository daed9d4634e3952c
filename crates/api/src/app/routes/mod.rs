use axum::{
    routing::{get, post},
    Router,
};

pub mod jobs;
pub mod system;

/// Router for the versioned job API (mounted under `/api/v1`).
pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(jobs::submit))
        .route("/upload", post(jobs::submit))
        .route("/jobs/:id", get(jobs::status))
        .route("/compare/:id", get(jobs::status))
        .route("/jobs/:id/result", get(jobs::result))
}
