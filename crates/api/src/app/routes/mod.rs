use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use backlot_infra::rate_limit::RateLimitProfiles;

use crate::app::services::AppServices;
use crate::middleware::{self, RateLimitState};

pub mod queue;
pub mod system;
pub mod tasks;

/// Router for the `/v1` surface.
///
/// Write routes are admitted through the rate limiter, each under its route
/// class profile; reads are not limited.
pub fn router(services: Arc<AppServices>) -> Router {
    let enqueue = Router::new()
        .route("/tasks", post(tasks::enqueue))
        .route_layer(axum::middleware::from_fn_with_state(
            RateLimitState::new(services.clone(), RateLimitProfiles::STANDARD),
            middleware::rate_limit_middleware,
        ));

    let admin = Router::new()
        .route("/tasks/:id/requeue", post(tasks::requeue))
        .route("/dispatch", post(queue::dispatch_now))
        .route_layer(axum::middleware::from_fn_with_state(
            RateLimitState::new(services, RateLimitProfiles::ADMIN),
            middleware::rate_limit_middleware,
        ));

    Router::new()
        .route("/tasks/:id", get(tasks::get_task))
        .route("/queue/stats", get(queue::stats))
        .route("/queue/abandoned", get(queue::abandoned))
        .merge(enqueue)
        .merge(admin)
}
