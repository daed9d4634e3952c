use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use docdiff_infra::job_store::JobStoreError;
use docdiff_infra::jobs::{SubmitError, ValidationError};
use docdiff_infra::object_store::ObjectStoreError;
use docdiff_queue::QueueError;

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Validation(v) => validation_error_to_response(v),
        SubmitError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "JOB_NOT_FOUND", format!("job {id} not found")),
        SubmitError::NotCompleted { id, status } => json_error(
            StatusCode::CONFLICT,
            "INVALID_JOB_STATUS",
            format!("job {id} is {status}; results are only available once it is completed"),
        ),
        SubmitError::Store(JobStoreError::Storage(msg)) => unavailable("job store", msg),
        SubmitError::Queue(QueueError::Backend(msg)) => unavailable("task queue", msg),
        SubmitError::Objects(e @ (ObjectStoreError::Backend(_) | ObjectStoreError::Io(_))) => {
            unavailable("object store", e.to_string())
        }
        other => {
            tracing::error!(error = %other, "request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "internal error")
        }
    }
}

pub fn validation_error_to_response(err: ValidationError) -> axum::response::Response {
    let code = match &err {
        ValidationError::MissingFiles => "MISSING_FILES",
        ValidationError::EmptyFile { .. } => "INVALID_FILE",
        ValidationError::TooLarge { .. } => "FILE_TOO_LARGE",
        ValidationError::UnsupportedFormat { .. } => "UNSUPPORTED_FORMAT",
    };
    json_error(StatusCode::BAD_REQUEST, code, err.to_string())
}

pub fn multipart_error_to_response(err: MultipartError) -> axum::response::Response {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        json_error(StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", err.body_text())
    } else {
        json_error(StatusCode::BAD_REQUEST, "INVALID_FILE", err.body_text())
    }
}

fn unavailable(what: &str, detail: String) -> axum::response::Response {
    tracing::error!(backend = what, error = %detail, "backend unavailable");
    json_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "SERVICE_UNAVAILABLE",
        format!("{what} unavailable, try again later"),
    )
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
