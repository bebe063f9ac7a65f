//! Poll loop: select, claim, run, record.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use backlot_core::{Clock, CoreError, SystemClock, WorkerId};

use crate::queue::store::{TaskStore, TaskStoreError};
use crate::queue::types::{MAX_DELAY, RetryPolicy, Task, TaskOutcome, before};

use super::handler::HandlerRegistry;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Delay between polls of the store
    pub poll_interval: Duration,
    /// Candidates selected per poll
    pub batch_size: usize,
    /// Handlers running at once (worker pool size)
    pub max_concurrent: usize,
    /// A `processing` claim older than this is considered stuck
    pub lease_timeout: Duration,
    /// How often the stuck-task sweep runs
    pub sweep_interval: Duration,
    /// Per-handler deadline; `None` lets handlers run unbounded
    pub handler_timeout: Option<Duration>,
    /// Name for logging
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_concurrent: 4,
            lease_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            handler_timeout: Some(Duration::from_secs(120)),
            name: "dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_lease_timeout(mut self, lease: Duration) -> Self {
        self.lease_timeout = lease;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.batch_size == 0 {
            return Err(CoreError::validation("batch_size must be at least 1"));
        }
        if self.max_concurrent == 0 {
            return Err(CoreError::validation("max_concurrent must be at least 1"));
        }
        if self.poll_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(CoreError::validation("poll and sweep intervals must be non-zero"));
        }
        if self.lease_timeout > MAX_DELAY {
            return Err(CoreError::validation("lease_timeout must not exceed 30 days"));
        }
        // A live handler must never look stuck to the sweep.
        if let Some(timeout) = self.handler_timeout {
            if timeout >= self.lease_timeout {
                return Err(CoreError::validation(
                    "handler_timeout must be shorter than lease_timeout",
                ));
            }
        }
        Ok(())
    }
}

/// Running totals for one dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub polls: u64,
    pub tasks_claimed: u64,
    /// Candidates another worker claimed first
    pub claim_conflicts: u64,
    pub tasks_succeeded: u64,
    /// Handler failures with a retry scheduled
    pub tasks_failed: u64,
    pub tasks_abandoned: u64,
    pub tasks_unroutable: u64,
    /// Outcomes dropped because the claim was swept in the meantime
    pub claims_lost: u64,
    pub store_errors: u64,
    pub tasks_reclaimed: u64,
}

impl DispatcherStats {
    fn record(&mut self, processed: Processed) {
        match processed {
            Processed::Succeeded => self.tasks_succeeded += 1,
            Processed::Failed => self.tasks_failed += 1,
            Processed::Abandoned => self.tasks_abandoned += 1,
            Processed::Unroutable => self.tasks_unroutable += 1,
            Processed::ClaimLost => self.claims_lost += 1,
            Processed::StoreError => self.store_errors += 1,
        }
    }
}

/// What one poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub candidates: usize,
    pub claimed: usize,
    pub conflicts: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub unroutable: usize,
}

impl PollReport {
    fn record(&mut self, processed: Processed) {
        match processed {
            Processed::Succeeded => self.succeeded += 1,
            Processed::Failed => self.failed += 1,
            Processed::Abandoned => self.abandoned += 1,
            Processed::Unroutable => self.unroutable += 1,
            Processed::ClaimLost | Processed::StoreError => {}
        }
    }
}

/// Result of running one claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Processed {
    Succeeded,
    Failed,
    Abandoned,
    Unroutable,
    ClaimLost,
    StoreError,
}

/// Pulls due tasks from a [`TaskStore`] and runs their handlers.
///
/// Any number of dispatchers (in one process or many) may share a store;
/// the conditional claim guarantees a task is handed to at most one of them
/// per attempt. Handlers run on their own tokio tasks so a panic or a hung
/// handler only affects its own task.
pub struct Dispatcher<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<S> {
    store: S,
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    worker_id: WorkerId,
    permits: Arc<Semaphore>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl<S> Dispatcher<S>
where
    S: TaskStore + 'static,
{
    pub fn new(
        store: S,
        registry: HandlerRegistry,
        policy: RetryPolicy,
        config: DispatcherConfig,
    ) -> Result<Self, CoreError> {
        Self::with_clock(store, registry, policy, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: S,
        registry: HandlerRegistry,
        policy: RetryPolicy,
        config: DispatcherConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        policy.validate()?;
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                store,
                registry: Arc::new(registry),
                policy,
                permits: Arc::new(Semaphore::new(config.max_concurrent)),
                config,
                clock,
                worker_id: WorkerId::new(),
                stats: Arc::new(Mutex::new(DispatcherStats::default())),
            }),
        })
    }

    pub fn worker_id(&self) -> WorkerId {
        self.shared.worker_id
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> DispatcherStats {
        lock_stats(&self.shared.stats).clone()
    }

    /// Run one poll and wait for every task it claimed to finish.
    pub async fn poll_once(&self) -> Result<PollReport, TaskStoreError> {
        let mut in_flight = JoinSet::new();
        let mut report = self.dispatch_batch(&mut in_flight).await?;
        while let Some(joined) = in_flight.join_next().await {
            if let Some(processed) = self.shared.settle(joined) {
                report.record(processed);
            }
        }
        Ok(report)
    }

    /// Select candidates and start a handler for each one this worker claims.
    ///
    /// Handlers are spawned into `in_flight`; the report covers selection and
    /// claiming only.
    #[instrument(skip(self, in_flight), fields(dispatcher = %self.shared.config.name))]
    async fn dispatch_batch(
        &self,
        in_flight: &mut JoinSet<Processed>,
    ) -> Result<PollReport, TaskStoreError> {
        let shared = &self.shared;
        lock_stats(&shared.stats).polls += 1;

        // Never select more than the pool can start right now.
        let limit = shared
            .config
            .batch_size
            .min(shared.permits.available_permits());
        if limit == 0 {
            debug!("worker pool saturated; skipping poll");
            return Ok(PollReport::default());
        }

        let candidates = shared
            .store
            .select_candidates(shared.clock.now(), limit)
            .await?;
        let mut report = PollReport {
            candidates: candidates.len(),
            ..PollReport::default()
        };

        for candidate in candidates {
            let Ok(permit) = shared.permits.clone().acquire_owned().await else {
                break;
            };

            let claimed = match shared
                .store
                .claim(
                    candidate.id,
                    candidate.claim_token(),
                    shared.worker_id,
                    shared.clock.now(),
                )
                .await
            {
                Ok(Some(task)) => task,
                Ok(None) => {
                    debug!(task_id = %candidate.id, "task claimed by another worker");
                    report.conflicts += 1;
                    continue;
                }
                Err(e) => {
                    error!(task_id = %candidate.id, error = %e, "failed to claim task");
                    lock_stats(&shared.stats).store_errors += 1;
                    continue;
                }
            };
            report.claimed += 1;

            let shared = shared.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                shared.process(claimed).await
            });
        }

        let mut stats = lock_stats(&shared.stats);
        stats.tasks_claimed += report.claimed as u64;
        stats.claim_conflicts += report.conflicts as u64;
        Ok(report)
    }

    /// Release `processing` tasks whose claim is older than the lease timeout.
    pub async fn sweep_stuck(&self) -> Result<usize, TaskStoreError> {
        let shared = &self.shared;
        let now = shared.clock.now();
        let stale_before = before(now, shared.config.lease_timeout);
        let retry_at = shared.policy.next_retry_at(1, now);

        let reclaimed = shared
            .store
            .reclaim_stuck(stale_before, retry_at, now)
            .await?;
        if !reclaimed.is_empty() {
            warn!(
                dispatcher = %shared.config.name,
                count = reclaimed.len(),
                task_ids = ?reclaimed,
                "released stuck tasks"
            );
        }
        lock_stats(&shared.stats).tasks_reclaimed += reclaimed.len() as u64;
        Ok(reclaimed.len())
    }

    /// Start the poll loop on the current tokio runtime.
    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let trigger = Arc::new(Notify::new());
        let stats = self.shared.stats.clone();

        let join = tokio::spawn(self.run(shutdown_rx, trigger.clone()));

        DispatcherHandle {
            shutdown: shutdown_tx,
            trigger: DispatchTrigger(trigger),
            join,
            stats,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>, trigger: Arc<Notify>) {
        let config = &self.shared.config;
        info!(
            dispatcher = %config.name,
            worker_id = %self.shared.worker_id,
            max_concurrent = config.max_concurrent,
            "dispatcher started"
        );

        let mut poll_ticker = tokio::time::interval(config.poll_interval);
        poll_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_ticker = tokio::time::interval(config.sweep_interval);
        sweep_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = sweep_ticker.tick() => {
                    if let Err(e) = self.sweep_stuck().await {
                        error!(dispatcher = %config.name, error = %e, "stuck-task sweep failed");
                    }
                    continue;
                }
                _ = poll_ticker.tick() => {}
                _ = trigger.notified() => {}
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.shared.settle(joined);
                    continue;
                }
            }

            if let Err(e) = self.dispatch_batch(&mut in_flight).await {
                error!(dispatcher = %config.name, error = %e, "poll failed");
                lock_stats(&self.shared.stats).store_errors += 1;
            }
        }

        // Let claimed tasks record their outcome before exiting.
        while let Some(joined) = in_flight.join_next().await {
            self.shared.settle(joined);
        }
        info!(dispatcher = %config.name, "dispatcher stopped");
    }
}

impl<S> Shared<S>
where
    S: TaskStore + 'static,
{
    /// Run the handler for a claimed task and record the outcome.
    async fn process(&self, task: Task) -> Processed {
        let Some(handler) = self.registry.resolve(&task.topic) else {
            let error = format!("no handler registered for topic '{}'", task.topic);
            warn!(task_id = %task.id, topic = %task.topic, "no handler for task");
            let now = self.clock.now();
            let outcome = if task.attempts >= task.max_attempts {
                TaskOutcome::Abandoned { error }
            } else {
                TaskOutcome::Unroutable {
                    error,
                    at: self.policy.unroutable_retry_at(now),
                }
            };
            return self.record(&task, outcome).await;
        };

        let payload = task.payload.clone();
        let task_id = task.id;
        let mut call = tokio::spawn(async move { handler.handle(&payload, task_id).await });

        let result = match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut call).await {
                Ok(joined) => joined,
                Err(_) => {
                    call.abort();
                    Ok(Err(anyhow::anyhow!("handler timed out after {limit:?}")))
                }
            },
            None => call.await,
        };

        let now = self.clock.now();
        let outcome = match result {
            Ok(Ok(())) => TaskOutcome::Done,
            Ok(Err(e)) => TaskOutcome::for_failure(&task, format!("{e:#}"), &self.policy, now),
            Err(join_err) => {
                TaskOutcome::for_failure(&task, describe_join_error(join_err), &self.policy, now)
            }
        };
        self.record(&task, outcome).await
    }

    async fn record(&self, task: &Task, outcome: TaskOutcome) -> Processed {
        let processed = match &outcome {
            TaskOutcome::Done => Processed::Succeeded,
            TaskOutcome::RetryScheduled { .. } => Processed::Failed,
            TaskOutcome::Abandoned { .. } => Processed::Abandoned,
            TaskOutcome::Unroutable { .. } => Processed::Unroutable,
        };

        match self
            .store
            .finish(task.id, self.worker_id, &outcome, self.clock.now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(task_id = %task.id, "claim lost before the outcome was recorded");
                return Processed::ClaimLost;
            }
            Err(e) => {
                // The claim stays in place; the sweep releases it after the lease.
                error!(task_id = %task.id, error = %e, "failed to record task outcome");
                return Processed::StoreError;
            }
        }

        match &outcome {
            TaskOutcome::Done => {
                debug!(task_id = %task.id, topic = %task.topic, "task completed")
            }
            TaskOutcome::RetryScheduled { error, at } => warn!(
                task_id = %task.id,
                topic = %task.topic,
                attempts = task.attempts,
                retry_at = %at,
                error = %error,
                "task failed; retry scheduled"
            ),
            TaskOutcome::Abandoned { error } => warn!(
                task_id = %task.id,
                topic = %task.topic,
                attempts = task.attempts,
                error = %error,
                "task abandoned after exhausting attempts"
            ),
            TaskOutcome::Unroutable { at, .. } => debug!(
                task_id = %task.id,
                retry_at = %at,
                "unroutable task parked"
            ),
        }
        processed
    }

    fn settle(&self, joined: Result<Processed, JoinError>) -> Option<Processed> {
        match joined {
            Ok(processed) => {
                lock_stats(&self.stats).record(processed);
                Some(processed)
            }
            Err(e) => {
                // Only reachable if the runtime is shutting down.
                error!(error = %e, "task worker did not complete");
                None
            }
        }
    }
}

fn describe_join_error(err: JoinError) -> String {
    if err.is_panic() {
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        format!("handler panicked: {message}")
    } else {
        "handler was cancelled".to_string()
    }
}

fn lock_stats(stats: &Mutex<DispatcherStats>) -> MutexGuard<'_, DispatcherStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wakes a running dispatcher for an immediate poll.
#[derive(Debug, Clone)]
pub struct DispatchTrigger(Arc<Notify>);

impl DispatchTrigger {
    pub fn trigger(&self) {
        self.0.notify_one();
    }
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    trigger: DispatchTrigger,
    join: tokio::task::JoinHandle<()>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Poll now instead of waiting for the next tick.
    pub fn trigger(&self) {
        self.trigger.trigger();
    }

    /// A cloneable trigger, e.g. for an HTTP route.
    pub fn trigger_handle(&self) -> DispatchTrigger {
        self.trigger.clone()
    }

    pub fn stats(&self) -> DispatcherStats {
        lock_stats(&self.stats).clone()
    }

    /// Stop polling and wait for in-flight tasks to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use backlot_core::{ManualClock, TaskId};

    use crate::queue::enqueue::TaskQueue;
    use crate::queue::store::InMemoryTaskStore;
    use crate::queue::types::{EnqueueRequest, TaskStatus};

    async fn explode(_: serde_json::Value, _: TaskId) -> anyhow::Result<()> {
        panic!("handler bug")
    }

    fn test_config() -> DispatcherConfig {
        DispatcherConfig::default()
            .with_name("test")
            .with_poll_interval(Duration::from_millis(10))
    }

    fn failing_registry(topic: &str, calls: Arc<AtomicU32>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(topic, move |_, _| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("downstream unavailable"))
            }
        });
        registry
    }

    #[tokio::test]
    async fn successful_task_is_marked_done() {
        let store = InMemoryTaskStore::arc();
        let queue = TaskQueue::new(store.clone());
        let mut registry = HandlerRegistry::new();
        registry.register_fn("system.ping", |_, _| async { Ok(()) });
        let dispatcher =
            Dispatcher::new(store.clone(), registry, RetryPolicy::default(), test_config()).unwrap();

        let id = queue
            .enqueue(EnqueueRequest::new("system.ping", serde_json::json!({})))
            .await
            .unwrap();
        let report = dispatcher.poll_once().await.unwrap();

        assert_eq!(report.claimed, 1);
        assert_eq!(report.succeeded, 1);
        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.attempts, 1);
        assert!(task.locked_by.is_none());
        assert_eq!(dispatcher.stats().tasks_succeeded, 1);
    }

    #[tokio::test]
    async fn failing_task_stops_after_max_attempts() {
        let clock = ManualClock::arc(chrono::Utc::now());
        let store = InMemoryTaskStore::arc();
        let queue = TaskQueue::with_clock(store.clone(), clock.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(60));
        let dispatcher = Dispatcher::with_clock(
            store.clone(),
            failing_registry("flaky", calls.clone()),
            policy,
            test_config(),
            clock.clone(),
        )
        .unwrap();

        let id = queue
            .enqueue(EnqueueRequest::new("flaky", serde_json::json!({})).max_attempts(3))
            .await
            .unwrap();

        for _ in 0..10 {
            dispatcher.poll_once().await.unwrap();
            clock.advance(Duration::from_secs(120));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
        assert!(task.next_retry_at.is_none());
        assert!(task.is_abandoned());
        assert_eq!(task.error.as_deref(), Some("downstream unavailable"));
        assert_eq!(store.stats().await.unwrap().abandoned, 1);
    }

    #[tokio::test]
    async fn retry_delays_do_not_shrink() {
        let clock = ManualClock::arc(chrono::Utc::now());
        let store = InMemoryTaskStore::arc();
        let queue = TaskQueue::with_clock(store.clone(), clock.clone());
        let policy = RetryPolicy::exponential(Duration::from_secs(2), Duration::from_secs(10));
        let dispatcher = Dispatcher::with_clock(
            store.clone(),
            failing_registry("flaky", Arc::new(AtomicU32::new(0))),
            policy,
            test_config(),
            clock.clone(),
        )
        .unwrap();

        let id = queue
            .enqueue(EnqueueRequest::new("flaky", serde_json::json!({})).max_attempts(6))
            .await
            .unwrap();

        let mut delays = Vec::new();
        for _ in 0..5 {
            dispatcher.poll_once().await.unwrap();
            let task = store.get(id).await.unwrap().unwrap();
            let at = task.next_retry_at.unwrap();
            delays.push((at - clock.now()).num_seconds());
            clock.set(at);
        }

        assert_eq!(delays, vec![2, 4, 8, 10, 10]);
    }

    #[tokio::test]
    async fn unroutable_task_is_not_retried_immediately() {
        let clock = ManualClock::arc(chrono::Utc::now());
        let store = InMemoryTaskStore::arc();
        let queue = TaskQueue::with_clock(store.clone(), clock.clone());
        let dispatcher = Dispatcher::with_clock(
            store.clone(),
            HandlerRegistry::new(),
            RetryPolicy::default(),
            test_config(),
            clock.clone(),
        )
        .unwrap();

        let id = queue
            .enqueue(EnqueueRequest::new("send_mail", serde_json::json!({})))
            .await
            .unwrap();

        let first = dispatcher.poll_once().await.unwrap();
        assert_eq!(first.unroutable, 1);

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("no handler"));
        assert!(task.next_retry_at.unwrap() >= clock.now() + chrono::Duration::hours(1));

        clock.advance(Duration::from_secs(1));
        let second = dispatcher.poll_once().await.unwrap();
        assert_eq!(second.claimed, 0);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_batch() {
        let store = InMemoryTaskStore::arc();
        let queue = TaskQueue::new(store.clone());
        let mut registry = HandlerRegistry::new();
        registry.register_fn("ok", |_, _| async { Ok(()) });
        registry.register_fn("bad", |_, _| async { Err(anyhow::anyhow!("boom")) });
        registry.register_fn("panics", explode);
        let dispatcher =
            Dispatcher::new(store.clone(), registry, RetryPolicy::default(), test_config()).unwrap();

        let bad = queue
            .enqueue(EnqueueRequest::new("bad", serde_json::json!({})))
            .await
            .unwrap();
        let panics = queue
            .enqueue(EnqueueRequest::new("panics", serde_json::json!({})))
            .await
            .unwrap();
        let ok = queue
            .enqueue(EnqueueRequest::new("ok", serde_json::json!({})))
            .await
            .unwrap();

        let report = dispatcher.poll_once().await.unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);

        assert_eq!(store.get(ok).await.unwrap().unwrap().status, TaskStatus::Done);
        assert_eq!(store.get(bad).await.unwrap().unwrap().error.as_deref(), Some("boom"));
        let panicked = store.get(panics).await.unwrap().unwrap();
        assert_eq!(panicked.status, TaskStatus::Failed);
        assert!(panicked.error.unwrap().contains("handler bug"));
    }

    #[tokio::test]
    async fn hung_handler_times_out() {
        let store = InMemoryTaskStore::arc();
        let queue = TaskQueue::new(store.clone());
        let mut registry = HandlerRegistry::new();
        registry.register_fn("slow", |_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let config = test_config().with_handler_timeout(Some(Duration::from_millis(50)));
        let dispatcher =
            Dispatcher::new(store.clone(), registry, RetryPolicy::default(), config).unwrap();

        let id = queue
            .enqueue(EnqueueRequest::new("slow", serde_json::json!({})))
            .await
            .unwrap();
        let report = dispatcher.poll_once().await.unwrap();

        assert_eq!(report.failed, 1);
        let task = store.get(id).await.unwrap().unwrap();
        assert!(task.error.unwrap().contains("timed out"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispatchers_never_share_a_task() {
        const TASKS: usize = 40;
        let store = InMemoryTaskStore::arc();
        let queue = TaskQueue::new(store.clone());
        let runs: Arc<Mutex<HashMap<TaskId, u32>>> = Arc::default();

        let mut dispatchers = Vec::new();
        for n in 0..4 {
            let mut registry = HandlerRegistry::new();
            let runs = runs.clone();
            registry.register_fn("work", move |_, id| {
                let runs = runs.clone();
                async move {
                    *runs.lock().unwrap().entry(id).or_default() += 1;
                    tokio::task::yield_now().await;
                    Ok(())
                }
            });
            let config = test_config()
                .with_name(format!("d{n}"))
                .with_batch_size(TASKS);
            dispatchers.push(
                Dispatcher::new(store.clone(), registry, RetryPolicy::default(), config).unwrap(),
            );
        }

        for i in 0..TASKS {
            queue
                .enqueue(EnqueueRequest::new("work", serde_json::json!({ "i": i })))
                .await
                .unwrap();
        }

        for _ in 0..100 {
            let mut set = JoinSet::new();
            for dispatcher in &dispatchers {
                let dispatcher = dispatcher.clone();
                set.spawn(async move { dispatcher.poll_once().await.unwrap() });
            }
            while set.join_next().await.is_some() {}
            if store.stats().await.unwrap().done == TASKS as u64 {
                break;
            }
        }

        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), TASKS);
        assert!(runs.values().all(|&n| n == 1));
        let claimed: u64 = dispatchers.iter().map(|d| d.stats().tasks_claimed).sum();
        assert_eq!(claimed, TASKS as u64);
    }

    #[tokio::test]
    async fn pool_bounds_concurrent_handlers() {
        let store = InMemoryTaskStore::arc();
        let queue = TaskQueue::new(store.clone());
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut registry = HandlerRegistry::new();
        {
            let (running, peak) = (running.clone(), peak.clone());
            registry.register_fn("work", move |_, _| {
                let (running, peak) = (running.clone(), peak.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        let config = test_config().with_batch_size(10).with_max_concurrent(2);
        let dispatcher =
            Dispatcher::new(store.clone(), registry, RetryPolicy::default(), config).unwrap();

        for _ in 0..6 {
            queue
                .enqueue(EnqueueRequest::new("work", serde_json::json!({})))
                .await
                .unwrap();
        }
        while store.stats().await.unwrap().done < 6 {
            dispatcher.poll_once().await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn sweep_releases_abandoned_claims() {
        let clock = ManualClock::arc(chrono::Utc::now());
        let store = InMemoryTaskStore::arc();
        let queue = TaskQueue::with_clock(store.clone(), clock.clone());
        let dispatcher = Dispatcher::with_clock(
            store.clone(),
            HandlerRegistry::new(),
            RetryPolicy::default(),
            test_config(),
            clock.clone(),
        )
        .unwrap();

        let id = queue
            .enqueue(EnqueueRequest::new("t", serde_json::json!({})))
            .await
            .unwrap();
        // A worker that claims and then dies.
        let task = store.get(id).await.unwrap().unwrap();
        store
            .claim(id, task.claim_token(), WorkerId::new(), clock.now())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(dispatcher.sweep_stuck().await.unwrap(), 0);
        clock.advance(Duration::from_secs(301));
        assert_eq!(dispatcher.sweep_stuck().await.unwrap(), 1);

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.next_retry_at.is_some());
        assert!(task.locked_by.is_none());
        assert_eq!(dispatcher.stats().tasks_reclaimed, 1);
    }

    #[tokio::test]
    async fn spawned_dispatcher_runs_until_shutdown() {
        let store = InMemoryTaskStore::arc();
        let queue = TaskQueue::new(store.clone());
        let mut registry = HandlerRegistry::new();
        registry.register_fn("system.ping", |_, _| async { Ok(()) });
        let config = test_config().with_poll_interval(Duration::from_secs(3600));
        let handle = Dispatcher::new(store.clone(), registry, RetryPolicy::default(), config)
            .unwrap()
            .spawn();

        let id = queue
            .enqueue(EnqueueRequest::new("system.ping", serde_json::json!({})))
            .await
            .unwrap();
        handle.trigger();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.get(id).await.unwrap().unwrap().status != TaskStatus::Done {
            assert!(tokio::time::Instant::now() < deadline, "task was not dispatched");
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.trigger();
        }

        assert_eq!(handle.stats().tasks_succeeded, 1);
        handle.shutdown().await;
    }

    #[test]
    fn handler_timeout_must_fit_inside_the_lease() {
        let config = DispatcherConfig::default()
            .with_lease_timeout(Duration::from_secs(10))
            .with_handler_timeout(Some(Duration::from_secs(10)));
        assert!(config.validate().is_err());
        assert!(DispatcherConfig::default().validate().is_ok());

        let unbounded = DispatcherConfig::default().with_lease_timeout(Duration::from_secs(u64::MAX));
        assert!(unbounded.validate().is_err());
    }
}
