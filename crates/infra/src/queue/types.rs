//! Task records, status and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use backlot_core::{CoreError, TaskId, WorkerId};

/// Default attempt ceiling for enqueued tasks.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Longest delay ever added to or taken from a timestamp (30 days).
pub const MAX_DELAY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Task lifecycle status.
///
/// `Failed` covers both "retry scheduled" and "abandoned"; the two are told
/// apart by `next_retry_at` and the attempt counters (see [`Task::is_abandoned`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Enqueued, never claimed
    Pending,
    /// Claimed by exactly one dispatcher
    Processing,
    /// Handler succeeded (terminal)
    Done,
    /// Handler raised; retry scheduled or abandoned
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(CoreError::validation(format!("unknown task status: {other}"))),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry schedule applied by the dispatcher.
///
/// The attempt ceiling lives on each task (`max_attempts`); this only decides
/// how long to wait before the next claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Delay applied to tasks whose topic has no handler
    pub unroutable_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            unroutable_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            ..Default::default()
        }
    }

    /// Create a policy with capped exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            ..Default::default()
        }
    }

    pub fn with_unroutable_delay(mut self, delay: Duration) -> Self {
        self.unroutable_delay = delay;
        self
    }

    /// Reject schedules that could retry immediately.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.base_delay.is_zero() {
            return Err(CoreError::validation("retry base_delay must be > 0"));
        }
        if self.max_delay < self.base_delay {
            return Err(CoreError::validation("retry max_delay must be >= base_delay"));
        }
        if self.unroutable_delay.is_zero() {
            return Err(CoreError::validation("unroutable_delay must be > 0"));
        }
        if self.max_delay > MAX_DELAY || self.unroutable_delay > MAX_DELAY {
            return Err(CoreError::validation(
                "retry delays must not exceed 30 days",
            ));
        }
        Ok(())
    }

    /// Delay before the next claim after `attempts` failed attempts (1-indexed).
    ///
    /// Never zero and non-decreasing in `attempts`.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        let base = self.base_delay.max(Duration::from_millis(1));
        let cap = self.max_delay.max(base);

        match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(cap).min(cap)
            }
            BackoffStrategy::Linear => base.checked_mul(attempts).unwrap_or(cap).min(cap),
        }
    }

    /// Absolute retry time after `attempts` failures observed at `now`.
    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        after(now, self.delay_for_attempt(attempts))
    }

    pub fn unroutable_retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        after(now, self.unroutable_delay)
    }
}

/// `now + delay`, with the delay capped at [`MAX_DELAY`]. Never panics.
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(capped(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - delay`, with the delay capped at [`MAX_DELAY`]. Never panics.
pub(crate) fn before(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(capped(delay))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn capped(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay.min(MAX_DELAY)).unwrap_or_else(|_| chrono::Duration::zero())
}

/// A request to schedule deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub topic: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl EnqueueRequest {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            idempotency_key: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Validate and normalise (an empty idempotency key counts as none).
    pub fn normalized(mut self) -> Result<Self, CoreError> {
        if self.topic.trim().is_empty() {
            return Err(CoreError::validation("topic must not be empty"));
        }
        if self.max_attempts == 0 {
            return Err(CoreError::validation("max_attempts must be >= 1"));
        }
        if self
            .idempotency_key
            .as_deref()
            .is_some_and(|k| k.trim().is_empty())
        {
            self.idempotency_key = None;
        }
        Ok(self)
    }
}

/// A task record as persisted in the queue store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub topic: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub status: TaskStatus,
    /// Dispatch attempts so far (incremented on every claim)
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Last failure detail
    pub error: Option<String>,
    /// Holder of the current claim, if any
    pub locked_by: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a fresh `pending` record from a (normalised) request.
    pub fn from_request(req: EnqueueRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            topic: req.topic,
            payload: req.payload,
            idempotency_key: req.idempotency_key,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: req.max_attempts,
            next_retry_at: None,
            error: None,
            locked_by: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the task may be claimed at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => true,
            TaskStatus::Failed => {
                self.attempts < self.max_attempts
                    && self.next_retry_at.is_some_and(|at| at <= now)
            }
            TaskStatus::Processing | TaskStatus::Done => false,
        }
    }

    /// Failed with no retry left; needs an operator.
    pub fn is_abandoned(&self) -> bool {
        self.status == TaskStatus::Failed
            && (self.attempts >= self.max_attempts || self.next_retry_at.is_none())
    }

    /// Snapshot of the fields a claim must still match.
    pub fn claim_token(&self) -> ClaimToken {
        ClaimToken {
            status: self.status,
            attempts: self.attempts,
        }
    }
}

/// Pre-claim state observed by the poller.
///
/// The claim only succeeds if the row still carries this status and attempt
/// count; a concurrent claim bumps `attempts`, so a stale token never matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimToken {
    pub status: TaskStatus,
    pub attempts: u32,
}

/// How a claimed task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Handler succeeded
    Done,
    /// Handler raised; retry at the given time
    RetryScheduled { error: String, at: DateTime<Utc> },
    /// Handler raised and no attempts remain
    Abandoned { error: String },
    /// No handler registered for the topic; slow retry
    Unroutable { error: String, at: DateTime<Utc> },
}

impl TaskOutcome {
    /// Decide the failure outcome for a claimed task.
    pub fn for_failure(
        task: &Task,
        error: String,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        if task.attempts >= task.max_attempts {
            TaskOutcome::Abandoned { error }
        } else {
            TaskOutcome::RetryScheduled {
                error,
                at: policy.next_retry_at(task.attempts, now),
            }
        }
    }

    /// `next_retry_at` to persist with a `failed` status (`None` = abandoned).
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            TaskOutcome::RetryScheduled { at, .. } | TaskOutcome::Unroutable { at, .. } => Some(*at),
            TaskOutcome::Done | TaskOutcome::Abandoned { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            TaskOutcome::Done => None,
            TaskOutcome::RetryScheduled { error, .. }
            | TaskOutcome::Abandoned { error }
            | TaskOutcome::Unroutable { error, .. } => Some(error),
        }
    }
}

/// Counts by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    /// Failed with a retry scheduled
    pub failed: u64,
    /// Failed with no retry left
    pub abandoned: u64,
}
