//! Task store abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use backlot_core::{TaskId, WorkerId};

use super::types::{ClaimToken, QueueStats, Task, TaskOutcome, TaskStatus};

/// Result of an insert that honours idempotency keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new record was written.
    Created(TaskId),
    /// A record with the same idempotency key already existed.
    Duplicate(TaskId),
}

impl InsertOutcome {
    pub fn task_id(&self) -> TaskId {
        match self {
            InsertOutcome::Created(id) | InsertOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }
}

/// Durable queue store.
///
/// Every state transition is a conditional write against the store itself.
/// Implementations must not cache records in-process: several dispatchers in
/// several processes share one store, and the conditional update is the only
/// thing that keeps a task from being claimed twice.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a `pending` task, or return the existing id for its idempotency key.
    async fn insert(&self, task: Task) -> Result<InsertOutcome, TaskStoreError>;

    /// Get a task by ID.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError>;

    /// Up to `limit` claimable tasks at `now`, oldest `created_at` first.
    async fn select_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, TaskStoreError>;

    /// Move a task to `processing` if it still matches `token` and is due.
    ///
    /// Returns `None` when another worker got there first; that is not an error.
    async fn claim(
        &self,
        id: TaskId,
        token: ClaimToken,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, TaskStoreError>;

    /// Record the outcome of a claim held by `worker`.
    ///
    /// Returns `false` if the claim was lost (swept or re-claimed) in the meantime.
    async fn finish(
        &self,
        id: TaskId,
        worker: WorkerId,
        outcome: &TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError>;

    /// Release `processing` tasks claimed before `stale_before` back to `failed`.
    ///
    /// Tasks with attempts left get `next_retry_at = retry_at`; the rest are abandoned.
    async fn reclaim_stuck(
        &self,
        stale_before: DateTime<Utc>,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskStoreError>;

    /// Abandoned tasks, oldest update first.
    async fn list_abandoned(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError>;

    /// Reset an abandoned task to `pending` with a fresh attempt budget.
    async fn requeue(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task, TaskStoreError>;

    /// Counts by lifecycle state.
    async fn stats(&self) -> Result<QueueStats, TaskStoreError>;
}

/// Task store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task {0} is not abandoned")]
    NotAbandoned(TaskId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    async fn insert(&self, task: Task) -> Result<InsertOutcome, TaskStoreError> {
        (**self).insert(task).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        (**self).get(id).await
    }

    async fn select_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, TaskStoreError> {
        (**self).select_candidates(now, limit).await
    }

    async fn claim(
        &self,
        id: TaskId,
        token: ClaimToken,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, TaskStoreError> {
        (**self).claim(id, token, worker, now).await
    }

    async fn finish(
        &self,
        id: TaskId,
        worker: WorkerId,
        outcome: &TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        (**self).finish(id, worker, outcome, now).await
    }

    async fn reclaim_stuck(
        &self,
        stale_before: DateTime<Utc>,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        (**self).reclaim_stuck(stale_before, retry_at, now).await
    }

    async fn list_abandoned(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        (**self).list_abandoned(limit).await
    }

    async fn requeue(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task, TaskStoreError> {
        (**self).requeue(id, now).await
    }

    async fn stats(&self) -> Result<QueueStats, TaskStoreError> {
        (**self).stats().await
    }
}

/// In-memory task store for tests/dev.
///
/// One mutex guards both maps, so every method is atomic with respect to the
/// others; this stands in for the row-level atomicity of the SQL store.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    inner: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    tasks: HashMap<TaskId, Task>,
    by_key: HashMap<String, TaskId>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, TaskStoreError> {
        self.inner
            .lock()
            .map_err(|_| TaskStoreError::Storage("task table lock poisoned".to_string()))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<InsertOutcome, TaskStoreError> {
        let mut tables = self.tables()?;

        if let Some(key) = task.idempotency_key.as_ref() {
            if let Some(existing) = tables.by_key.get(key) {
                return Ok(InsertOutcome::Duplicate(*existing));
            }
            tables.by_key.insert(key.clone(), task.id);
        }

        let id = task.id;
        tables.tasks.insert(id, task);
        Ok(InsertOutcome::Created(id))
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        Ok(self.tables()?.tasks.get(&id).cloned())
    }

    async fn select_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, TaskStoreError> {
        let tables = self.tables()?;
        let mut candidates: Vec<_> = tables
            .tasks
            .values()
            .filter(|t| t.is_claimable(now))
            .cloned()
            .collect();

        // Oldest first; id breaks ties so the order is stable.
        candidates.sort_by_key(|t| (t.created_at, t.id));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn claim(
        &self,
        id: TaskId,
        token: ClaimToken,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, TaskStoreError> {
        let mut tables = self.tables()?;
        let Some(task) = tables.tasks.get_mut(&id) else {
            return Ok(None);
        };

        if task.claim_token() != token || !task.is_claimable(now) {
            return Ok(None);
        }

        task.status = TaskStatus::Processing;
        task.attempts += 1;
        task.locked_by = Some(worker);
        task.locked_at = Some(now);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn finish(
        &self,
        id: TaskId,
        worker: WorkerId,
        outcome: &TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        let mut tables = self.tables()?;
        let Some(task) = tables.tasks.get_mut(&id) else {
            return Err(TaskStoreError::NotFound(id));
        };

        if task.status != TaskStatus::Processing || task.locked_by != Some(worker) {
            return Ok(false);
        }

        match outcome {
            TaskOutcome::Done => {
                task.status = TaskStatus::Done;
                task.next_retry_at = None;
            }
            failure => {
                task.status = TaskStatus::Failed;
                task.next_retry_at = failure.retry_at();
                task.error = failure.error().map(str::to_string);
            }
        }
        task.locked_by = None;
        task.locked_at = None;
        task.updated_at = now;
        Ok(true)
    }

    async fn reclaim_stuck(
        &self,
        stale_before: DateTime<Utc>,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        let mut tables = self.tables()?;
        let mut reclaimed = Vec::new();

        for task in tables.tasks.values_mut() {
            let stale = task.status == TaskStatus::Processing
                && task.locked_at.is_none_or(|at| at < stale_before);
            if !stale {
                continue;
            }

            task.status = TaskStatus::Failed;
            task.next_retry_at = (task.attempts < task.max_attempts).then_some(retry_at);
            task.error = Some(STUCK_ERROR.to_string());
            task.locked_by = None;
            task.locked_at = None;
            task.updated_at = now;
            reclaimed.push(task.id);
        }

        reclaimed.sort();
        Ok(reclaimed)
    }

    async fn list_abandoned(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        let tables = self.tables()?;
        let mut result: Vec<_> = tables
            .tasks
            .values()
            .filter(|t| t.is_abandoned())
            .cloned()
            .collect();

        result.sort_by_key(|t| (t.updated_at, t.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn requeue(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task, TaskStoreError> {
        let mut tables = self.tables()?;
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or(TaskStoreError::NotFound(id))?;

        if !task.is_abandoned() {
            return Err(TaskStoreError::NotAbandoned(id));
        }

        task.status = TaskStatus::Pending;
        task.attempts = 0;
        task.next_retry_at = None;
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn stats(&self) -> Result<QueueStats, TaskStoreError> {
        let tables = self.tables()?;
        let mut stats = QueueStats::default();

        for task in tables.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Done => stats.done += 1,
                TaskStatus::Failed if task.is_abandoned() => stats.abandoned += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }
}

/// Error recorded on tasks released by the stuck-task sweep.
pub const STUCK_ERROR: &str = "claim lease expired before the task finished";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::types::{EnqueueRequest, RetryPolicy};

    fn task(topic: &str, now: DateTime<Utc>) -> Task {
        Task::from_request(EnqueueRequest::new(topic, serde_json::json!({})), now)
    }

    #[tokio::test]
    async fn insert_and_claim() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let worker = WorkerId::new();

        let id = store.insert(task("test", now)).await.unwrap().task_id();

        let candidates = store.select_candidates(now, 10).await.unwrap();
        assert_eq!(candidates.len(), 1);

        let claimed = store
            .claim(id, candidates[0].claim_token(), worker, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.locked_by, Some(worker));

        // Nothing left to claim
        assert!(store.select_candidates(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_token_loses_the_claim() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();

        let id = store.insert(task("test", now)).await.unwrap().task_id();
        let token = store.get(id).await.unwrap().unwrap().claim_token();

        let first = store.claim(id, token, WorkerId::new(), now).await.unwrap();
        let second = store.claim(id, token, WorkerId::new(), now).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_returns_existing_id() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();

        let mut a = task("test", now);
        a.idempotency_key = Some("order-42".into());
        let mut b = task("test", now);
        b.idempotency_key = Some("order-42".into());

        let first = store.insert(a).await.unwrap();
        let second = store.insert(b).await.unwrap();

        assert!(matches!(first, InsertOutcome::Created(_)));
        assert_eq!(second, InsertOutcome::Duplicate(first.task_id()));
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn candidates_are_oldest_first_and_limited() {
        let store = InMemoryTaskStore::new();
        let base = Utc::now();

        let mut ids = Vec::new();
        for i in (0..5).rev() {
            let t = task("test", base + chrono::Duration::seconds(i));
            ids.push((t.created_at, store.insert(t).await.unwrap().task_id()));
        }
        ids.sort();

        let now = base + chrono::Duration::minutes(1);
        let got: Vec<_> = store
            .select_candidates(now, 3)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        let expected: Vec<_> = ids.iter().take(3).map(|(_, id)| *id).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn finish_requires_the_claim_holder() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let owner = WorkerId::new();

        let id = store.insert(task("test", now)).await.unwrap().task_id();
        let token = store.get(id).await.unwrap().unwrap().claim_token();
        store.claim(id, token, owner, now).await.unwrap().unwrap();

        let intruder = store
            .finish(id, WorkerId::new(), &TaskOutcome::Done, now)
            .await
            .unwrap();
        assert!(!intruder);

        let finished = store.finish(id, owner, &TaskOutcome::Done, now).await.unwrap();
        assert!(finished);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn failed_task_waits_for_its_retry_time() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let worker = WorkerId::new();
        let policy = RetryPolicy::default();

        let id = store.insert(task("test", now)).await.unwrap().task_id();
        let token = store.get(id).await.unwrap().unwrap().claim_token();
        let claimed = store.claim(id, token, worker, now).await.unwrap().unwrap();

        let outcome = TaskOutcome::for_failure(&claimed, "boom".into(), &policy, now);
        let retry_at = outcome.retry_at().unwrap();
        store.finish(id, worker, &outcome, now).await.unwrap();

        assert!(store.select_candidates(now, 10).await.unwrap().is_empty());
        assert_eq!(store.select_candidates(retry_at, 10).await.unwrap().len(), 1);

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert_eq!(store.stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn sweep_releases_stuck_claims() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let crashed = WorkerId::new();

        let mut short = task("test", now);
        short.max_attempts = 1;
        let short_id = store.insert(short).await.unwrap().task_id();
        let long_id = store.insert(task("test", now)).await.unwrap().task_id();

        for id in [short_id, long_id] {
            let token = store.get(id).await.unwrap().unwrap().claim_token();
            store.claim(id, token, crashed, now).await.unwrap().unwrap();
        }

        let later = now + chrono::Duration::minutes(10);
        let retry_at = later + chrono::Duration::seconds(30);
        let mut reclaimed = store
            .reclaim_stuck(now + chrono::Duration::minutes(5), retry_at, later)
            .await
            .unwrap();
        reclaimed.sort();
        let mut expected = vec![short_id, long_id];
        expected.sort();
        assert_eq!(reclaimed, expected);

        let long = store.get(long_id).await.unwrap().unwrap();
        assert_eq!(long.status, TaskStatus::Failed);
        assert_eq!(long.next_retry_at, Some(retry_at));
        assert!(!long.is_abandoned());

        let short = store.get(short_id).await.unwrap().unwrap();
        assert!(short.is_abandoned());

        // The crashed worker can no longer record an outcome.
        assert!(!store.finish(long_id, crashed, &TaskOutcome::Done, later).await.unwrap());
    }

    #[tokio::test]
    async fn requeue_resets_abandoned_tasks_only() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let worker = WorkerId::new();

        let mut t = task("test", now);
        t.max_attempts = 1;
        let id = store.insert(t).await.unwrap().task_id();

        assert!(matches!(
            store.requeue(id, now).await,
            Err(TaskStoreError::NotAbandoned(_))
        ));

        let token = store.get(id).await.unwrap().unwrap().claim_token();
        store.claim(id, token, worker, now).await.unwrap().unwrap();
        store
            .finish(id, worker, &TaskOutcome::Abandoned { error: "boom".into() }, now)
            .await
            .unwrap();

        assert_eq!(store.list_abandoned(10).await.unwrap().len(), 1);
        assert_eq!(store.stats().await.unwrap().abandoned, 1);

        let requeued = store.requeue(id, now).await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.attempts, 0);
        assert!(store.list_abandoned(10).await.unwrap().is_empty());
    }
}
