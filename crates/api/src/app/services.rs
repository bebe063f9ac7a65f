use std::sync::Arc;

use anyhow::Context;

use backlot_core::{Clock, SystemClock};
use backlot_infra::config::Settings;
use backlot_infra::dispatcher::{DispatchTrigger, Dispatcher, DispatcherHandle, HandlerRegistry};
use backlot_infra::queue::{InMemoryTaskStore, PostgresTaskStore, TaskQueue, TaskStore};
use backlot_infra::rate_limit::{
    AdmissionStore, InMemoryAdmissionStore, RateLimiter, RedisAdmissionStore,
};

/// Shared handles used by the HTTP handlers.
pub struct AppServices {
    pub queue: TaskQueue<Arc<dyn TaskStore>>,
    pub limiter: RateLimiter<Arc<dyn AdmissionStore>>,
    pub dispatch: DispatchTrigger,
    /// Time source shared with the queue, limiter and dispatcher
    pub clock: Arc<dyn Clock>,
}

impl AppServices {
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        self.queue.store()
    }
}

/// Services plus the background dispatcher that serves them.
pub struct Runtime {
    pub services: Arc<AppServices>,
    pub dispatcher: DispatcherHandle,
}

impl Runtime {
    pub async fn shutdown(self) {
        self.dispatcher.shutdown().await;
    }
}

/// Wire stores, limiter and dispatcher from settings, and start dispatching.
///
/// `DATABASE_URL` selects the Postgres queue store (migrated on startup) and
/// `REDIS_URL` the Redis admission store; each falls back to in-memory.
pub async fn start(settings: &Settings, registry: HandlerRegistry) -> anyhow::Result<Runtime> {
    start_with_clock(settings, registry, Arc::new(SystemClock)).await
}

/// [`start`] with an injected time source.
pub async fn start_with_clock(
    settings: &Settings,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Runtime> {
    let store: Arc<dyn TaskStore> = match &settings.database_url {
        Some(url) => {
            let store = PostgresTaskStore::connect(url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("migrating task_queue")?;
            tracing::info!("using postgres task store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; tasks are kept in memory only");
            InMemoryTaskStore::arc()
        }
    };

    let admission: Arc<dyn AdmissionStore> = match &settings.redis_url {
        Some(url) => {
            // Connected on first use; an unreachable Redis degrades admission
            // to fail-open rather than blocking startup.
            let store = RedisAdmissionStore::open(url)
                .context("invalid REDIS_URL")?
                .with_timeout(settings.redis_timeout);
            tracing::info!("using redis admission store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("REDIS_URL not set; rate limits are per process");
            InMemoryAdmissionStore::arc()
        }
    };

    if registry.is_empty() {
        tracing::warn!("no task handlers registered; every task will be unroutable");
    }

    let dispatcher = Dispatcher::with_clock(
        store.clone(),
        registry,
        settings.retry.clone(),
        settings.dispatcher.clone(),
        clock.clone(),
    )
    .context("invalid dispatcher settings")?
    .spawn();

    let services = AppServices {
        queue: TaskQueue::with_clock(store, clock.clone()),
        limiter: RateLimiter::with_clock(admission, settings.profiles.clone(), clock.clone()),
        dispatch: dispatcher.trigger_handle(),
        clock,
    };

    Ok(Runtime {
        services: Arc::new(services),
        dispatcher,
    })
}
