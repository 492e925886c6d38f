use async_trait::async_trait;
use metering_client::{
    db::{credit_queries, device_queries, rate_queries, reading_queries, summary_queries},
    domain::{AlertLevel, BillingSummaryRow, CreditAccount, MeterDevice, MeterKind, Reading, UtilityRate},
};
use sqlx::PgPool;
use time::{Date, OffsetDateTime};

use super::{CreditLedger, DeviceDirectory, RateTable, ReadingStore, StoreError, SummaryStore};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn append(&self, reading: &Reading) -> Result<(), StoreError> {
        reading_queries::insert_readings(&self.pool, std::slice::from_ref(reading)).await?;
        Ok(())
    }

    async fn append_batch(&self, readings: &[Reading]) -> Result<(), StoreError> {
        reading_queries::insert_readings(&self.pool, readings).await?;
        Ok(())
    }

    async fn latest_before(
        &self,
        device_id: &str,
        kind: MeterKind,
        before: OffsetDateTime,
    ) -> Result<Option<Reading>, StoreError> {
        Ok(reading_queries::latest_counter_before(&self.pool, device_id, kind, before).await?)
    }

    async fn first_in_range(
        &self,
        device_id: &str,
        kind: MeterKind,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Option<Reading>, StoreError> {
        Ok(reading_queries::first_counter_in_range(&self.pool, device_id, kind, start, end).await?)
    }

    async fn range(
        &self,
        device_id: &str,
        kind: MeterKind,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<Reading>, StoreError> {
        Ok(reading_queries::readings_in_range(&self.pool, device_id, kind, start, end).await?)
    }
}

#[async_trait]
impl DeviceDirectory for PgStore {
    async fn active_devices(&self, building_id: i32) -> Result<Vec<MeterDevice>, StoreError> {
        Ok(device_queries::active_devices(&self.pool, building_id).await?)
    }

    async fn buildings_with_active_devices(&self) -> Result<Vec<i32>, StoreError> {
        Ok(device_queries::buildings_with_active_devices(&self.pool).await?)
    }

    async fn room_device(
        &self,
        building_id: i32,
        room_number: &str,
        kind: MeterKind,
    ) -> Result<Option<MeterDevice>, StoreError> {
        Ok(device_queries::active_room_device(&self.pool, building_id, room_number, kind).await?)
    }

    async fn room_device_history(
        &self,
        building_id: i32,
        room_number: &str,
        kind: MeterKind,
    ) -> Result<Vec<MeterDevice>, StoreError> {
        Ok(device_queries::room_device_history(&self.pool, building_id, room_number, kind).await?)
    }

    async fn occupied_rooms(
        &self,
        building_id: i32,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<String>, StoreError> {
        Ok(device_queries::occupied_rooms(&self.pool, building_id, start, end).await?)
    }
}

#[async_trait]
impl RateTable for PgStore {
    async fn effective_rate(&self, building_id: i32, as_of: Date) -> Result<Option<UtilityRate>, StoreError> {
        Ok(rate_queries::effective_rate(&self.pool, building_id, as_of).await?)
    }
}

#[async_trait]
impl SummaryStore for PgStore {
    async fn save_summary(&self, summary: &BillingSummaryRow) -> Result<(), StoreError> {
        summary_queries::upsert_billing_summary(&self.pool, summary).await?;
        Ok(())
    }
}

#[async_trait]
impl CreditLedger for PgStore {
    async fn credit_account(&self, device_id: &str) -> Result<Option<CreditAccount>, StoreError> {
        Ok(credit_queries::credit_account(&self.pool, device_id).await?)
    }

    async fn record_alert(&self, device_id: &str, level: AlertLevel, at: OffsetDateTime) -> Result<(), StoreError> {
        credit_queries::mark_notified(&self.pool, device_id, level, at).await?;
        Ok(())
    }

    async fn record_cut(&self, device_id: &str, at: OffsetDateTime) -> Result<(), StoreError> {
        credit_queries::mark_cut(&self.pool, device_id, at).await?;
        Ok(())
    }
}
