//! Enqueue API.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use backlot_core::{Clock, CoreError, SystemClock, TaskId};

use super::store::{InsertOutcome, TaskStore, TaskStoreError};
use super::types::{EnqueueRequest, Task};

/// Enqueue failure.
///
/// Nothing was written when this is returned; the caller decides whether to
/// retry or drop the work.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Invalid(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] TaskStoreError),
}

/// Producer-side handle on the queue store.
///
/// Enqueue is a single durable write; no handler runs synchronously.
#[derive(Clone)]
pub struct TaskQueue<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: TaskStore> TaskQueue<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Schedule deferred work, returning the task id.
    ///
    /// With an idempotency key, at most one task is ever created per key: a
    /// repeat call returns the id of the existing task.
    #[instrument(skip(self, req), fields(topic = %req.topic), err)]
    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<TaskId, EnqueueError> {
        Ok(self.enqueue_detailed(req).await?.task_id())
    }

    /// Like [`TaskQueue::enqueue`] but reports whether a record was created.
    pub async fn enqueue_detailed(
        &self,
        req: EnqueueRequest,
    ) -> Result<InsertOutcome, EnqueueError> {
        let req = req.normalized()?;
        let task = Task::from_request(req, self.clock.now());
        let topic = task.topic.clone();

        let outcome = self.store.insert(task).await?;
        match outcome {
            InsertOutcome::Created(id) => info!(task_id = %id, topic = %topic, "task enqueued"),
            InsertOutcome::Duplicate(id) => {
                debug!(task_id = %id, topic = %topic, "duplicate enqueue; returning existing task")
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::InMemoryTaskStore;
    use crate::queue::types::TaskStatus;

    #[tokio::test]
    async fn enqueue_creates_pending_task() {
        let queue = TaskQueue::new(InMemoryTaskStore::arc());

        let id = queue
            .enqueue(EnqueueRequest::new("send_mail", serde_json::json!({"to": "a@b.c"})))
            .await
            .unwrap();

        let task = queue.store().get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.max_attempts, 3);
        assert_eq!(task.payload["to"], "a@b.c");
    }

    #[tokio::test]
    async fn same_idempotency_key_yields_one_task() {
        let queue = TaskQueue::new(InMemoryTaskStore::arc());
        let req = EnqueueRequest::new("process_order", serde_json::json!({"order": 7}))
            .idempotency_key("order-7");

        let first = queue.enqueue(req.clone()).await.unwrap();
        let second = queue.enqueue(req).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(queue.store().stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn concurrent_duplicates_collapse_to_one_task() {
        let queue = TaskQueue::new(InMemoryTaskStore::arc());

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let queue = queue.clone();
            set.spawn(async move {
                queue
                    .enqueue(EnqueueRequest::new("t", serde_json::json!({})).idempotency_key("k"))
                    .await
                    .unwrap()
            });
        }

        let mut ids = Vec::new();
        while let Some(id) = set.join_next().await {
            ids.push(id.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(queue.store().stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn empty_key_does_not_deduplicate() {
        let queue = TaskQueue::new(InMemoryTaskStore::arc());
        let req = EnqueueRequest::new("t", serde_json::json!({})).idempotency_key("");

        let a = queue.enqueue(req.clone()).await.unwrap();
        let b = queue.enqueue(req).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn invalid_request_writes_nothing() {
        let queue = TaskQueue::new(InMemoryTaskStore::arc());
        let err = queue
            .enqueue(EnqueueRequest::new(" ", serde_json::json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, EnqueueError::Invalid(_)));
        assert_eq!(queue.store().stats().await.unwrap(), Default::default());
    }
}
