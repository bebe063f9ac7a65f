//! Durable task queue with idempotent enqueue and retry/backoff.
//!
//! ## Design
//!
//! - Tasks live in a shared store; the store is the only source of truth
//! - Ownership of a task is its status plus the claim holder, moved by
//!   conditional writes (no lock service)
//! - Retries are bounded by `max_attempts`, spaced by a `RetryPolicy`
//! - Abandoned tasks stay in the table for operators to inspect or requeue
//!
//! ## Components
//!
//! - `Task`: the persisted record
//! - `TaskStore`: persistence (in-memory or Postgres)
//! - `TaskQueue`: producer-side enqueue API

pub mod enqueue;
pub mod postgres;
pub mod store;
pub mod types;

pub use enqueue::{EnqueueError, TaskQueue};
pub use postgres::PostgresTaskStore;
pub use store::{InMemoryTaskStore, InsertOutcome, TaskStore, TaskStoreError};
pub use types::{
    BackoffStrategy, ClaimToken, DEFAULT_MAX_ATTEMPTS, EnqueueRequest, QueueStats, RetryPolicy,
    Task, TaskOutcome, TaskStatus,
};
