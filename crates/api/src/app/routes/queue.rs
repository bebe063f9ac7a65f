use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
};

use backlot_infra::queue::TaskStore;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.store().stats().await {
        Ok(queue) => Json(dto::StatsResponse {
            queue,
            rate_limit: services.limiter.stats(),
        })
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn abandoned(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListQuery>,
) -> axum::response::Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    match services.store().list_abandoned(limit).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Wake the dispatcher for an immediate poll.
pub async fn dispatch_now(Extension(services): Extension<Arc<AppServices>>) -> StatusCode {
    services.dispatch.trigger();
    StatusCode::ACCEPTED
}
