use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use backlot_infra::queue::{EnqueueError, TaskStoreError};

pub fn store_error_to_response(err: TaskStoreError) -> axum::response::Response {
    match err {
        TaskStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("task {id} not found"))
        }
        TaskStoreError::NotAbandoned(id) => json_error(
            StatusCode::CONFLICT,
            "not_abandoned",
            format!("task {id} still has attempts left or is not failed"),
        ),
        TaskStoreError::Unavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        TaskStoreError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn enqueue_error_to_response(err: EnqueueError) -> axum::response::Response {
    match err {
        EnqueueError::Invalid(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        EnqueueError::Store(e) => store_error_to_response(e),
    }
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
