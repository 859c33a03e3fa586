//! dockside server entry point.
//!
//! Starts the webhook HTTP server, the job workers, the sweep scheduler
//! and the maintenance loop, and stops them together on Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use dockside::alerts::Scheduler;
use dockside::api;
use dockside::app_state::AppState;
use dockside::config::{DocksideConfig, LogFormat};
use dockside::dispatch::{JobHandler, JobQueue, MemoryJobQueue, WorkerPool};
use dockside::messaging::{CloudApiMessenger, Messenger, RecordingMessenger};
use dockside::persistence::{Stores, postgres};
use dockside::service::Services;

const SCHEDULER_TICK: Duration = Duration::from_secs(60);
const MAINTENANCE_TICK: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DocksideConfig::from_env().map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    tracing::info!(addr = %config.listen_addr, persistence = config.persistence_enabled, "starting dockside");

    // Build persistence layer
    let (stores, queue): (Stores, Arc<dyn JobQueue>) = if config.persistence_enabled {
        let pool = postgres::connect(
            &config.database_url,
            config.database_max_connections,
            config.database_min_connections,
            Duration::from_secs(config.database_connect_timeout_secs),
        )
        .await
        .context("connecting to PostgreSQL")?;
        postgres::migrate(&pool).await.context("running migrations")?;
        (
            Stores::postgres(pool.clone()),
            Arc::new(postgres::PgJobQueue::new(pool)),
        )
    } else {
        tracing::warn!("persistence disabled; sessions and jobs live in memory");
        (Stores::in_memory(), Arc::new(MemoryJobQueue::new()))
    };

    // Outbound provider
    let messenger: Arc<dyn Messenger> = if config.outbound_dry_run {
        tracing::warn!("outbound dry run; messages are logged, not sent");
        Arc::new(RecordingMessenger::new())
    } else {
        Arc::new(
            CloudApiMessenger::new(
                &config.whatsapp_api_base,
                &config.whatsapp_access_token,
                &config.whatsapp_phone_number_id,
            )
            .context("building provider client")?,
        )
    };

    // Build service layer
    let services = Services::build(&config, stores, messenger, Arc::clone(&queue));

    // Background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = WorkerPool::new(
        Arc::clone(&queue),
        Arc::clone(&services.jobs) as Arc<dyn JobHandler>,
        config.worker_poll_interval(),
    );
    let mut tasks = workers.spawn(config.worker_count, &shutdown_rx);
    tasks.push(
        Scheduler::new(Arc::clone(&queue), config.alert_utc_offset_minutes)
            .spawn(SCHEDULER_TICK, shutdown_rx.clone()),
    );
    tasks.push(services.spawn_maintenance(MAINTENANCE_TICK, shutdown_rx.clone()));

    // Build router
    let app_state = AppState::new(services, &config.webhook_verify_token);
    let app = api::build_app(app_state);

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        }
        let _ = shutdown_tx.send(true);
    });

    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("HTTP server failed")?;

    futures_util::future::join_all(tasks).await;
    tracing::info!("dockside stopped");
    Ok(())
}
