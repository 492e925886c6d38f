use anyhow::{bail, Result};
use metering_service::{
    config::AppConfig,
    gateway, observability,
    scheduler::{BillingScheduler, CycleOutcome, PgAdvisoryLocks, RunOptions},
    store::PgStore,
};
use sqlx::postgres::PgPoolOptions;
use std::{env, sync::Arc};

const USAGE: &str = "usage: run_cycle [--building <id>] [--dry-run] [--parallel <n>]";

fn parse_args(args: &[String]) -> Result<RunOptions> {
    let mut opts = RunOptions::default();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--building" => {
                let Some(id) = it.next().and_then(|v| v.parse::<i32>().ok()) else {
                    bail!(USAGE);
                };
                opts.building = Some(id);
            }
            "--parallel" => {
                let Some(n) = it.next().and_then(|v| v.parse::<usize>().ok()) else {
                    bail!(USAGE);
                };
                opts.parallel = Some(n);
            }
            "--dry-run" => opts.dry_run = Some(true),
            _ => bail!(USAGE),
        }
    }
    Ok(opts)
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let opts = parse_args(&args)?;

    let cfg = AppConfig::load()?;
    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.url)
        .await?;

    let scheduler = BillingScheduler::new(
        Arc::new(PgStore::new(pool.clone())),
        gateway::from_config(&cfg.tuya)?,
        Arc::new(PgAdvisoryLocks::new(pool)),
        cfg.scheduler_settings()?,
    );

    match scheduler.run_once(opts).await? {
        CycleOutcome::Completed(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        CycleOutcome::Skipped => bail!("another metering cycle holds the lock"),
    }
}
