use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use backlot_core::{Clock as _, TaskId};
use backlot_infra::queue::{EnqueueRequest, TaskStore};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn enqueue(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::EnqueueTaskRequest>,
) -> axum::response::Response {
    match services
        .queue
        .enqueue_detailed(EnqueueRequest::from(body))
        .await
    {
        Ok(outcome) => (
            StatusCode::ACCEPTED,
            Json(dto::EnqueueTaskResponse {
                task_id: outcome.task_id(),
                created: outcome.is_created(),
            }),
        )
            .into_response(),
        Err(e) => errors::enqueue_error_to_response(e),
    }
}

pub async fn get_task(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.store().get(id).await {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "task not found"),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Reset an abandoned task to `pending` with a fresh attempt budget.
pub async fn requeue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.store().requeue(id, services.clock.now()).await {
        Ok(task) => {
            tracing::info!(task_id = %id, topic = %task.topic, "abandoned task requeued");
            services.dispatch.trigger();
            Json(task).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

fn parse_task_id(raw: &str) -> Result<TaskId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid task id"))
}
