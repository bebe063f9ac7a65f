//! Postgres-backed task store.
//!
//! Every transition is a single conditional `UPDATE ... WHERE <expected state>
//! RETURNING`. An update that matches zero rows means another dispatcher moved
//! the task first; callers treat that as a lost race, not a failure.
//!
//! ## Error Mapping
//!
//! | SQLx Error | TaskStoreError |
//! |------------|----------------|
//! | Io, Tls, PoolTimedOut, PoolClosed | `Unavailable` |
//! | Database (any code) | `Storage` |
//! | Row decode failures | `Storage` |
//!
//! Duplicate idempotency keys never surface as errors: the insert uses
//! `ON CONFLICT DO NOTHING` and then reads back the existing id.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use backlot_core::{TaskId, WorkerId};

use super::store::{InsertOutcome, STUCK_ERROR, TaskStore, TaskStoreError};
use super::types::{ClaimToken, QueueStats, Task, TaskOutcome, TaskStatus};

/// Schema for the `task_queue` table (idempotent).
pub const SCHEMA: &str = include_str!("../../migrations/0001_task_queue.sql");

const TASK_COLUMNS: &str = r#"
    id,
    topic,
    payload,
    idempotency_key,
    status,
    attempts,
    max_attempts,
    next_retry_at,
    error,
    locked_by,
    locked_at,
    created_at,
    updated_at
"#;

/// Postgres-backed durable queue store.
///
/// Thread safe (the SQLx pool is shared); clone freely.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
}

impl PostgresTaskStore {
    /// Create a new store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect and return a store.
    pub async fn connect(database_url: &str) -> Result<Self, TaskStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `task_queue` table and indexes if they are missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), TaskStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<TaskId>, TaskStoreError> {
        let row = sqlx::query("SELECT id FROM task_queue WHERE idempotency_key = $1")
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;

        row.map(|r| {
            r.try_get::<uuid::Uuid, _>("id")
                .map(TaskId::from_uuid)
                .map_err(|e| decode_error("id", e))
        })
        .transpose()
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(
        skip(self, task),
        fields(task_id = %task.id, topic = %task.topic, duplicate = tracing::field::Empty),
        err
    )]
    async fn insert(&self, task: Task) -> Result<InsertOutcome, TaskStoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO task_queue (
                id,
                topic,
                payload,
                idempotency_key,
                status,
                attempts,
                max_attempts,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, $6)
            ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(&task.topic)
        .bind(&task.payload)
        .bind(task.idempotency_key.as_deref())
        .bind(to_i32(task.max_attempts))
        .bind(task.created_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        if inserted.is_some() {
            return Ok(InsertOutcome::Created(task.id));
        }

        // Conflict on the idempotency key: hand back the winner's id.
        let key = task.idempotency_key.as_deref().ok_or_else(|| {
            TaskStoreError::Storage("insert affected no rows without an idempotency key".into())
        })?;
        match self.find_by_idempotency_key(key).await? {
            Some(existing) => {
                Span::current().record("duplicate", true);
                Ok(InsertOutcome::Duplicate(existing))
            }
            None => Err(TaskStoreError::Storage(format!(
                "idempotency key {key} conflicted but no row was found"
            ))),
        }
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_task(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn select_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, TaskStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM task_queue
            WHERE status = 'pending'
               OR (status = 'failed'
                   AND next_retry_at IS NOT NULL
                   AND next_retry_at <= $1
                   AND attempts < max_attempts)
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_candidates", e))?;

        rows.iter().map(decode_task).collect()
    }

    #[instrument(skip(self, token), fields(task_id = %id, worker = %worker), err)]
    async fn claim(
        &self,
        id: TaskId,
        token: ClaimToken,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, TaskStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE task_queue
            SET status = 'processing',
                attempts = attempts + 1,
                locked_by = $2,
                locked_at = $3,
                updated_at = $3
            WHERE id = $1
              AND status = $4
              AND attempts = $5
              AND (status = 'pending'
                   OR (status = 'failed'
                       AND next_retry_at IS NOT NULL
                       AND next_retry_at <= $3
                       AND attempts < max_attempts))
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(worker.as_uuid())
        .bind(now)
        .bind(token.status.as_str())
        .bind(to_i32(token.attempts))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        row.map(|r| decode_task(&r)).transpose()
    }

    #[instrument(skip(self, outcome), fields(task_id = %id, worker = %worker), err)]
    async fn finish(
        &self,
        id: TaskId,
        worker: WorkerId,
        outcome: &TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        let status = match outcome {
            TaskOutcome::Done => TaskStatus::Done,
            _ => TaskStatus::Failed,
        };

        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = $3,
                next_retry_at = $4,
                error = COALESCE($5, error),
                locked_by = NULL,
                locked_at = NULL,
                updated_at = $6
            WHERE id = $1
              AND status = 'processing'
              AND locked_by = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_uuid())
        .bind(status.as_str())
        .bind(outcome.retry_at())
        .bind(outcome.error())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stuck(
        &self,
        stale_before: DateTime<Utc>,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'failed',
                next_retry_at = CASE WHEN attempts < max_attempts THEN $2 ELSE NULL END,
                error = $3,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = $4
            WHERE status = 'processing'
              AND (locked_at IS NULL OR locked_at < $1)
            RETURNING id
            "#,
        )
        .bind(stale_before)
        .bind(retry_at)
        .bind(STUCK_ERROR)
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stuck", e))?;

        let mut ids = rows
            .iter()
            .map(|r| {
                r.try_get::<uuid::Uuid, _>("id")
                    .map(TaskId::from_uuid)
                    .map_err(|e| decode_error("id", e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        ids.sort();
        Ok(ids)
    }

    async fn list_abandoned(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM task_queue
            WHERE status = 'failed'
              AND (attempts >= max_attempts OR next_retry_at IS NULL)
            ORDER BY updated_at ASC, id ASC
            LIMIT $1
            "#
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_abandoned", e))?;

        rows.iter().map(decode_task).collect()
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn requeue(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task, TaskStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE task_queue
            SET status = 'pending',
                attempts = 0,
                next_retry_at = NULL,
                updated_at = $2
            WHERE id = $1
              AND status = 'failed'
              AND (attempts >= max_attempts OR next_retry_at IS NULL)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue", e))?;

        match row {
            Some(r) => decode_task(&r),
            None => match self.get(id).await? {
                Some(_) => Err(TaskStoreError::NotAbandoned(id)),
                None => Err(TaskStoreError::NotFound(id)),
            },
        }
    }

    async fn stats(&self) -> Result<QueueStats, TaskStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'done') AS done,
                COUNT(*) FILTER (WHERE status = 'failed'
                                 AND attempts < max_attempts
                                 AND next_retry_at IS NOT NULL) AS failed,
                COUNT(*) FILTER (WHERE status = 'failed'
                                 AND (attempts >= max_attempts OR next_retry_at IS NULL)) AS abandoned
            FROM task_queue
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<u64, TaskStoreError> {
            row.try_get::<i64, _>(column)
                .map(|n| n.max(0) as u64)
                .map_err(|e| decode_error(column, e))
        };

        Ok(QueueStats {
            pending: count("pending")?,
            processing: count("processing")?,
            done: count("done")?,
            failed: count("failed")?,
            abandoned: count("abandoned")?,
        })
    }
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn decode_error(column: &str, err: sqlx::Error) -> TaskStoreError {
    TaskStoreError::Storage(format!("failed to read {column}: {err}"))
}

fn decode_task(row: &sqlx::postgres::PgRow) -> Result<Task, TaskStoreError> {
    let raw = TaskRow::from_row(row)
        .map_err(|e| TaskStoreError::Storage(format!("failed to deserialize task row: {e}")))?;
    Task::try_from(raw)
}

/// Map SQLx errors to TaskStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    match err {
        sqlx::Error::Io(e) => {
            TaskStoreError::Unavailable(format!("io error in {operation}: {e}"))
        }
        sqlx::Error::Tls(e) => {
            TaskStoreError::Unavailable(format!("tls error in {operation}: {e}"))
        }
        sqlx::Error::PoolTimedOut => {
            TaskStoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            TaskStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            TaskStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        other => TaskStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    id: uuid::Uuid,
    topic: String,
    payload: serde_json::Value,
    idempotency_key: Option<String>,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_retry_at: Option<DateTime<Utc>>,
    error: Option<String>,
    locked_by: Option<uuid::Uuid>,
    locked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for TaskRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            topic: row.try_get("topic")?,
            payload: row.try_get("payload")?,
            idempotency_key: row.try_get("idempotency_key")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            next_retry_at: row.try_get("next_retry_at")?,
            error: row.try_get("error")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = TaskStoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status: TaskStatus = row
            .status
            .parse()
            .map_err(|e| TaskStoreError::Storage(format!("{e}")))?;

        Ok(Task {
            id: TaskId::from_uuid(row.id),
            topic: row.topic,
            payload: row.payload,
            idempotency_key: row.idempotency_key,
            status,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            next_retry_at: row.next_retry_at,
            error: row.error,
            locked_by: row.locked_by.map(WorkerId::from_uuid),
            locked_at: row.locked_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_partial_unique_idempotency_index() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS task_queue"));
        assert!(SCHEMA.contains("WHERE idempotency_key IS NOT NULL"));
    }

    #[test]
    fn pool_errors_map_to_unavailable() {
        assert!(matches!(
            map_sqlx_error("claim", sqlx::Error::PoolTimedOut),
            TaskStoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("claim", sqlx::Error::RowNotFound),
            TaskStoreError::Storage(_)
        ));
    }

    #[test]
    fn row_with_unknown_status_is_rejected() {
        let now = Utc::now();
        let row = TaskRow {
            id: uuid::Uuid::now_v7(),
            topic: "t".into(),
            payload: serde_json::json!({}),
            idempotency_key: None,
            status: "running".into(),
            attempts: 0,
            max_attempts: 3,
            next_retry_at: None,
            error: None,
            locked_by: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(Task::try_from(row).is_err());
    }

    /// Sets the flag when an insert span records `duplicate = true`.
    struct DuplicateFlag(Arc<std::sync::atomic::AtomicBool>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for DuplicateFlag {
        fn on_record(
            &self,
            _id: &tracing::span::Id,
            values: &tracing::span::Record<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            struct Visitor<'a>(&'a std::sync::atomic::AtomicBool);

            impl tracing::field::Visit for Visitor<'_> {
                fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
                    if field.name() == "duplicate" && value {
                        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
                    }
                }

                fn record_debug(&mut self, _: &tracing::field::Field, _: &dyn std::fmt::Debug) {}
            }

            values.record(&mut Visitor(&self.0));
        }
    }

    /// Needs a live database; skipped when `DATABASE_URL` is unset.
    #[tokio::test]
    async fn duplicate_insert_is_recorded_on_the_span() {
        use tracing_subscriber::layer::SubscriberExt;

        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let store = PostgresTaskStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();

        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let subscriber = tracing_subscriber::registry().with(DuplicateFlag(flag.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let key = format!("dup-{}", uuid::Uuid::now_v7());
        let req = || {
            crate::queue::EnqueueRequest::new("t", serde_json::json!({})).idempotency_key(key.clone())
        };
        let first = store.insert(Task::from_request(req(), Utc::now())).await.unwrap();
        assert!(first.is_created());
        assert!(!flag.load(std::sync::atomic::Ordering::SeqCst));

        let second = store.insert(Task::from_request(req(), Utc::now())).await.unwrap();
        assert!(!second.is_created());
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }
}
