use anyhow::{bail, Result};
use metering_client::domain::Reading;
use metering_service::{
    config::AppConfig,
    observability,
    pipeline::Pipeline,
    sinks::ReadingStoreSink,
    sources::ReadingCsvFileSource,
    store::PgStore,
    transform,
};
use sqlx::postgres::PgPoolOptions;
use std::{env, sync::Arc};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: backfill_readings <csv_file_path>");
    }
    let file_path = &args[1];

    // METERING_CONFIG may point at a backfill-specific file.
    let cfg = AppConfig::load()?;

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.url)
        .await?;

    let settings = cfg.poll_settings();
    let sink = ReadingStoreSink::new(
        Arc::new(PgStore::new(pool)),
        settings.batch_size,
        settings.max_retries,
        settings.retry_backoff,
    );
    let tally = sink.tally();

    let pipeline: Pipeline<_, Reading, _> = Pipeline {
        source: ReadingCsvFileSource::new(file_path),
        transforms: vec![Arc::new(transform::ReadingValidation)],
        sink,
    };
    pipeline.run().await?;

    let tally = tally.lock().await;
    tracing::info!(
        stored = tally.stored.len(),
        failed = tally.failed.len() + tally.unattributed.len(),
        "backfill finished"
    );
    for (device_id, error) in &tally.failed {
        tracing::warn!(device_id = %device_id, error = %error, "row not stored");
    }
    Ok(())
}
