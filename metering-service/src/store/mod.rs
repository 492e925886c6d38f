//! Data-store seams used by the ingest loop and the billing engine.
//!
//! The traits mirror the handful of parameterized queries the core needs.
//! `PgStore` backs them with Postgres; `MemoryStore` keeps everything in
//! process for tests and local runs.

use async_trait::async_trait;
use metering_client::domain::{AlertLevel, BillingSummaryRow, CreditAccount, MeterDevice, MeterKind, Reading, UtilityRate};
use time::{Date, OffsetDateTime};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

/// Append-only time series of meter samples.
///
/// Boundary lookups (`latest_before`, `first_in_range`) only consider readings
/// that carry the kind's cumulative counter. `range` returns every reading.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn append(&self, reading: &Reading) -> Result<(), StoreError>;

    async fn append_batch(&self, readings: &[Reading]) -> Result<(), StoreError> {
        for reading in readings {
            self.append(reading).await?;
        }
        Ok(())
    }

    async fn latest_before(
        &self,
        device_id: &str,
        kind: MeterKind,
        before: OffsetDateTime,
    ) -> Result<Option<Reading>, StoreError>;

    async fn first_in_range(
        &self,
        device_id: &str,
        kind: MeterKind,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Option<Reading>, StoreError>;

    async fn range(
        &self,
        device_id: &str,
        kind: MeterKind,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<Reading>, StoreError>;
}

/// Read-only view of provisioned devices and room occupancy.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn active_devices(&self, building_id: i32) -> Result<Vec<MeterDevice>, StoreError>;

    async fn buildings_with_active_devices(&self) -> Result<Vec<i32>, StoreError>;

    /// Most recently created active device of `kind` in a room.
    async fn room_device(
        &self,
        building_id: i32,
        room_number: &str,
        kind: MeterKind,
    ) -> Result<Option<MeterDevice>, StoreError>;

    /// All devices of `kind` a room has had, inactive included, oldest first.
    async fn room_device_history(
        &self,
        building_id: i32,
        room_number: &str,
        kind: MeterKind,
    ) -> Result<Vec<MeterDevice>, StoreError>;

    /// Rooms with a tenancy overlapping `[start, end)`.
    async fn occupied_rooms(
        &self,
        building_id: i32,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait RateTable: Send + Sync {
    /// Latest rate row with `effective_date <= as_of`.
    async fn effective_rate(&self, building_id: i32, as_of: Date) -> Result<Option<UtilityRate>, StoreError>;
}

#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn save_summary(&self, summary: &BillingSummaryRow) -> Result<(), StoreError>;
}

/// Prepaid balances (read only) and the alert/cut-off state kept beside them.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// `None` for postpaid devices.
    async fn credit_account(&self, device_id: &str) -> Result<Option<CreditAccount>, StoreError>;

    async fn record_alert(&self, device_id: &str, level: AlertLevel, at: OffsetDateTime) -> Result<(), StoreError>;

    async fn record_cut(&self, device_id: &str, at: OffsetDateTime) -> Result<(), StoreError>;
}

/// Everything the service needs from its data store.
pub trait MeteringStore: ReadingStore + DeviceDirectory + RateTable + SummaryStore + CreditLedger {}

impl<T> MeteringStore for T where T: ReadingStore + DeviceDirectory + RateTable + SummaryStore + CreditLedger {}
