use backlot_infra::config::Settings;
use backlot_infra::dispatcher::HandlerRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    backlot_observability::init();

    let settings = Settings::from_env()?;

    let mut registry = HandlerRegistry::new();
    registry.register_fn("system.ping", |payload, task_id| async move {
        tracing::info!(task_id = %task_id, payload = %payload, "ping");
        Ok(())
    });

    let runtime = backlot_api::app::services::start(&settings, registry).await?;
    let app = backlot_api::app::build_app(runtime.services.clone());

    let listener = tokio::net::TcpListener::bind(settings.listen_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
