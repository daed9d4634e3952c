use std::sync::Arc;

use axum::{
    extract::{Extension, Multipart, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use docdiff_core::JobId;
use docdiff_infra::jobs::{Upload, ValidationError};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// `POST /jobs` (and legacy `POST /upload`): multipart fields `file1` and `file2`.
pub async fn submit(Extension(services): Extension<Arc<AppServices>>, mut multipart: Multipart) -> axum::response::Response {
    let mut left = None;
    let mut right = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return errors::multipart_error_to_response(e),
        };

        let slot = match field.name() {
            Some("file1") => &mut left,
            Some("file2") => &mut right,
            _ => continue,
        };
        let filename = field.file_name().unwrap_or("document.pdf").to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return errors::multipart_error_to_response(e),
        };
        *slot = Some(Upload::new(filename, content_type, bytes));
    }

    let (Some(left), Some(right)) = (left, right) else {
        return errors::validation_error_to_response(ValidationError::MissingFiles);
    };

    match services.gateway.submit_documents(left, right).await {
        Ok(view) => (StatusCode::ACCEPTED, Json(dto::SubmitResponse::from(&view))).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

pub async fn status(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<String>) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.gateway.status(id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

pub async fn result(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<String>) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.gateway.result(id).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>().map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "INVALID_JOB_ID",
            format!("`{raw}` is not a valid job id"),
        )
    })
}
