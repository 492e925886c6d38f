//! Periodic ingest (and optional billing refresh) across all buildings.
//!
//! A cycle takes the global lock, then walks every building with active
//! devices under a per-building lock. Contention skips; a failing or
//! panicking building is reported and the cycle moves on.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use metering_client::domain::MeterKind;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use time::{OffsetDateTime, UtcOffset};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    billing::{summary, BillingMonth},
    gateway::DeviceGateway,
    ingest::{self, PollSettings, PollSummary},
    store::{MeteringStore, StoreError},
};

pub mod lock;

pub use lock::{with_lock, LockError, LockGuard, MemoryLocks, NamedLocks, PgAdvisoryLocks};

pub const GLOBAL_LOCK: &str = "metering-cycle";

pub fn building_lock_name(building_id: i32) -> String {
    format!("{GLOBAL_LOCK}:building:{building_id}")
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub max_jitter: Duration,
    pub billing_enabled: bool,
    pub utc_offset: UtcOffset,
    pub poll: PollSettings,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_jitter: Duration::from_millis(12_000),
            billing_enabled: false,
            utc_offset: UtcOffset::UTC,
            poll: PollSettings::default(),
        }
    }
}

/// Per-run overrides; `None` falls back to the scheduler settings.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub building: Option<i32>,
    pub dry_run: Option<bool>,
    pub parallel: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildingStatus {
    Ok,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetTotal {
    pub kind: MeterKind,
    pub month: String,
    pub total_used: f64,
    pub total_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildingRun {
    pub building_id: i32,
    pub status: BuildingStatus,
    pub took_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing: Option<Vec<SheetTotal>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub took_ms: u64,
    pub buildings: Vec<BuildingRun>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Another cycle holds the global lock.
    Skipped,
    Completed(CycleSummary),
}

#[derive(Debug, thiserror::Error)]
enum BuildingError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("panicked: {0}")]
    Panic(String),
}

pub struct BillingScheduler {
    store: Arc<dyn MeteringStore>,
    gateway: Arc<dyn DeviceGateway>,
    locks: Arc<dyn NamedLocks>,
    settings: SchedulerSettings,
}

impl BillingScheduler {
    pub fn new(
        store: Arc<dyn MeteringStore>,
        gateway: Arc<dyn DeviceGateway>,
        locks: Arc<dyn NamedLocks>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            locks,
            settings,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// One cycle now. `Skipped` when the global lock is held elsewhere.
    pub async fn run_once(&self, opts: RunOptions) -> Result<CycleOutcome, LockError> {
        let Some(guard) = self.locks.try_acquire(GLOBAL_LOCK).await? else {
            tracing::warn!(lock = GLOBAL_LOCK, "metering cycle already running, skipping");
            metrics::counter!("metering_cycles_skipped_total").increment(1);
            return Ok(CycleOutcome::Skipped);
        };

        let summary = AssertUnwindSafe(self.run_cycle(&opts)).catch_unwind().await;
        if let Err(e) = guard.release().await {
            tracing::warn!(lock = GLOBAL_LOCK, error = %e, "global lock release failed");
        }

        match summary {
            Ok(summary) => Ok(CycleOutcome::Completed(summary)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn run_cycle(&self, opts: &RunOptions) -> CycleSummary {
        let started = tokio::time::Instant::now();
        let mut summary = CycleSummary::default();

        let buildings = match opts.building {
            Some(id) => vec![id],
            None => match self.store.buildings_with_active_devices().await {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::error!(error = %e, "listing buildings failed");
                    summary.errors.push(format!("listing buildings: {e}"));
                    Vec::new()
                }
            },
        };

        let mut poll = self.settings.poll.clone();
        if let Some(dry_run) = opts.dry_run {
            poll.dry_run = dry_run;
        }
        if let Some(parallel) = opts.parallel {
            poll.parallel = parallel.max(1);
        }

        for building_id in buildings {
            let run = self.run_building(building_id, &poll).await;
            if let Some(error) = &run.error {
                summary.errors.push(format!("building {building_id}: {error}"));
            }
            summary.buildings.push(run);
        }

        summary.took_ms = started.elapsed().as_millis() as u64;
        metrics::counter!("metering_cycles_total").increment(1);
        metrics::histogram!("metering_cycle_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            took_ms = summary.took_ms,
            buildings = summary.buildings.len(),
            errors = summary.errors.len(),
            "metering cycle finished"
        );
        summary
    }

    async fn run_building(&self, building_id: i32, poll: &PollSettings) -> BuildingRun {
        let started = tokio::time::Instant::now();
        let name = building_lock_name(building_id);
        let work = AssertUnwindSafe(self.process_building(building_id, poll)).catch_unwind();

        let outcome = match with_lock(self.locks.as_ref(), &name, work).await {
            Ok(Some(Ok(result))) => result,
            Ok(Some(Err(panic))) => Err(BuildingError::Panic(panic_message(panic.as_ref()))),
            Ok(None) => {
                tracing::warn!(building_id, lock = %name, "building locked by another run, skipping");
                return BuildingRun {
                    building_id,
                    status: BuildingStatus::Skipped,
                    took_ms: started.elapsed().as_millis() as u64,
                    poll: None,
                    billing: None,
                    error: None,
                };
            }
            Err(e) => Err(BuildingError::Store(StoreError::Backend(anyhow::Error::new(e)))),
        };
        let took_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((poll, billing)) => BuildingRun {
                building_id,
                status: BuildingStatus::Ok,
                took_ms,
                poll: Some(poll),
                billing,
                error: None,
            },
            Err(e) => {
                tracing::error!(building_id, took_ms, error = %e, "building cycle failed");
                metrics::counter!("metering_building_failures_total").increment(1);
                BuildingRun {
                    building_id,
                    status: BuildingStatus::Failed,
                    took_ms,
                    poll: None,
                    billing: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn process_building(
        &self,
        building_id: i32,
        poll: &PollSettings,
    ) -> Result<(PollSummary, Option<Vec<SheetTotal>>), BuildingError> {
        let polled = ingest::poll_building(self.store.clone(), self.gateway.clone(), building_id, poll).await?;
        tracing::info!(
            building_id,
            scanned = polled.scanned,
            updated = polled.updated,
            failed = polled.failed,
            cut = polled.cut,
            "building polled"
        );

        if !self.settings.billing_enabled || poll.dry_run {
            return Ok((polled, None));
        }

        let now = OffsetDateTime::now_utc();
        let month = BillingMonth::containing(now, self.settings.utc_offset);
        let sheets =
            summary::refresh_building(self.store.as_ref(), building_id, month, self.settings.utc_offset, now).await?;
        let totals = sheets
            .into_iter()
            .map(|s| SheetTotal {
                kind: s.kind,
                month: s.month.to_string(),
                total_used: s.total_used,
                total_amount: s.total_amount,
            })
            .collect();
        Ok((polled, Some(totals)))
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.settings.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Runs a cycle every `interval` (plus jitter) until `shutdown` fires.
    /// Cycles are awaited inline, so they never overlap; missed ticks are skipped.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(interval_secs = self.settings.interval.as_secs(), "metering scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let jitter = self.jitter();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(jitter) => {}
                }
                match self.run_once(RunOptions::default()).await {
                    Ok(CycleOutcome::Completed(_)) | Ok(CycleOutcome::Skipped) => {}
                    Err(e) => tracing::error!(error = %e, "metering cycle could not take its lock"),
                }
            }
            tracing::info!("metering scheduler stopped");
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
