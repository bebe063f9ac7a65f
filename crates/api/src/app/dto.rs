use serde::{Deserialize, Serialize};

use backlot_core::TaskId;
use backlot_infra::queue::{DEFAULT_MAX_ATTEMPTS, EnqueueRequest, QueueStats};
use backlot_infra::rate_limit::LimiterStats;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueTaskRequest {
    pub topic: String,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub max_attempts: Option<u32>,
}

fn empty_payload() -> serde_json::Value {
    serde_json::json!({})
}

impl From<EnqueueTaskRequest> for EnqueueRequest {
    fn from(body: EnqueueTaskRequest) -> Self {
        let mut req = EnqueueRequest::new(body.topic, body.payload)
            .max_attempts(body.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS));
        if let Some(key) = body.idempotency_key {
            req = req.idempotency_key(key);
        }
        req
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct EnqueueTaskResponse {
    pub task_id: TaskId,
    /// `false` when an existing task was returned for the idempotency key
    pub created: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub queue: QueueStats,
    pub rate_limit: LimiterStats,
}
