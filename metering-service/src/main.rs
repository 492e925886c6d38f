use anyhow::Result;
use metering_service::{
    config::AppConfig,
    gateway,
    http::{self, AppState},
    metrics_server, observability,
    scheduler::{BillingScheduler, PgAdvisoryLocks},
    store::{MeteringStore, PgStore},
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.url)
        .await?;

    let store: Arc<dyn MeteringStore> = Arc::new(PgStore::new(pool.clone()));
    let gateway = gateway::from_config(&cfg.tuya)?;
    let scheduler = Arc::new(BillingScheduler::new(
        store.clone(),
        gateway.clone(),
        Arc::new(PgAdvisoryLocks::new(pool)),
        cfg.scheduler_settings()?,
    ));

    let shutdown = CancellationToken::new();
    let scheduler_task = cfg
        .scheduler
        .enabled
        .then(|| scheduler.clone().start(shutdown.clone()));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
            shutdown.cancel();
        });
    }

    let state = AppState {
        store,
        gateway,
        scheduler,
        utc_offset: cfg.billing.offset()?,
        poll: cfg.poll_settings(),
    };
    let served = http::serve(&cfg.http.bind_addr, state, shutdown.clone()).await;

    // Stop the scheduler even when the listener failed.
    shutdown.cancel();
    if let Some(task) = scheduler_task {
        task.await?;
    }
    served
}
