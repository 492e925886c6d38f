use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use metering_client::domain::{AlertLevel, BillingSummaryRow, CreditAccount, MeterDevice, MeterKind, Reading, UtilityRate};
use rust_decimal::Decimal;
use time::{Date, OffsetDateTime};

use super::{CreditLedger, DeviceDirectory, RateTable, ReadingStore, StoreError, SummaryStore};

#[derive(Debug, Clone)]
struct Tenancy {
    building_id: i32,
    room_number: String,
    starts_at: Option<OffsetDateTime>,
    ends_at: Option<OffsetDateTime>,
}

#[derive(Default)]
struct Inner {
    rooms: Vec<(i32, String)>,
    tenancies: Vec<Tenancy>,
    devices: Vec<MeterDevice>,
    readings: Vec<Reading>,
    rates: Vec<UtilityRate>,
    summaries: HashMap<(i32, String, MeterKind), BillingSummaryRow>,
    credits: HashMap<String, CreditAccount>,
    broken_devices: HashSet<String>,
    failing_appends: usize,
}

/// In-process store with the same semantics as the Postgres backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a room with an open-ended tenancy.
    pub fn add_occupied_room(&self, building_id: i32, room_number: &str) {
        self.add_room(building_id, room_number);
        self.add_tenancy(building_id, room_number, None, None);
    }

    pub fn add_room(&self, building_id: i32, room_number: &str) {
        self.lock().rooms.push((building_id, room_number.to_string()));
    }

    pub fn add_tenancy(
        &self,
        building_id: i32,
        room_number: &str,
        starts_at: Option<OffsetDateTime>,
        ends_at: Option<OffsetDateTime>,
    ) {
        self.lock().tenancies.push(Tenancy {
            building_id,
            room_number: room_number.to_string(),
            starts_at,
            ends_at,
        });
    }

    pub fn add_device(&self, device: MeterDevice) {
        self.lock().devices.push(device);
    }

    pub fn add_rate(&self, building_id: i32, electric_unit_price: Decimal, water_unit_price: Decimal, effective_date: Date) {
        self.lock().rates.push(UtilityRate {
            building_id,
            electric_unit_price,
            water_unit_price,
            effective_date,
        });
    }

    /// Inserts a reading regardless of duplicates (backfill helper).
    pub fn push_reading(&self, reading: Reading) {
        self.lock().readings.push(reading);
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.lock().readings.clone()
    }

    pub fn summaries(&self) -> Vec<BillingSummaryRow> {
        self.lock().summaries.values().cloned().collect()
    }

    /// Makes every reading query for `device_id` fail.
    pub fn set_credit(&self, account: CreditAccount) {
        self.lock().credits.insert(account.device_id.clone(), account);
    }

    pub fn credit(&self, device_id: &str) -> Option<CreditAccount> {
        self.lock().credits.get(device_id).cloned()
    }

    pub fn break_device(&self, device_id: &str) {
        self.lock().broken_devices.insert(device_id.to_string());
    }

    /// Makes the next `n` appends fail.
    pub fn fail_next_appends(&self, n: usize) {
        self.lock().failing_appends = n;
    }

    fn check_device(inner: &Inner, device_id: &str) -> Result<(), StoreError> {
        if inner.broken_devices.contains(device_id) {
            return Err(StoreError::Backend(anyhow::anyhow!("reading query failed for {device_id}")));
        }
        Ok(())
    }
}

fn matches(r: &Reading, device_id: &str, kind: MeterKind) -> bool {
    r.device_id == device_id && r.kind == kind
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn append(&self, reading: &Reading) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.failing_appends > 0 {
            inner.failing_appends -= 1;
            return Err(StoreError::Backend(anyhow::anyhow!("append failed")));
        }
        let exists = inner
            .readings
            .iter()
            .any(|r| matches(r, &reading.device_id, reading.kind) && r.at == reading.at);
        if !exists {
            inner.readings.push(reading.clone());
        }
        Ok(())
    }

    async fn latest_before(
        &self,
        device_id: &str,
        kind: MeterKind,
        before: OffsetDateTime,
    ) -> Result<Option<Reading>, StoreError> {
        let inner = self.lock();
        Self::check_device(&inner, device_id)?;
        Ok(inner
            .readings
            .iter()
            .filter(|r| matches(r, device_id, kind) && r.at < before && r.counter().is_some())
            .max_by_key(|r| r.at)
            .cloned())
    }

    async fn first_in_range(
        &self,
        device_id: &str,
        kind: MeterKind,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Option<Reading>, StoreError> {
        let inner = self.lock();
        Self::check_device(&inner, device_id)?;
        Ok(inner
            .readings
            .iter()
            .filter(|r| matches(r, device_id, kind) && r.at >= start && r.at < end && r.counter().is_some())
            .min_by_key(|r| r.at)
            .cloned())
    }

    async fn range(
        &self,
        device_id: &str,
        kind: MeterKind,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<Reading>, StoreError> {
        let inner = self.lock();
        Self::check_device(&inner, device_id)?;
        let mut out: Vec<Reading> = inner
            .readings
            .iter()
            .filter(|r| matches(r, device_id, kind) && r.at >= start && r.at < end)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.at);
        Ok(out)
    }
}

#[async_trait]
impl DeviceDirectory for MemoryStore {
    async fn active_devices(&self, building_id: i32) -> Result<Vec<MeterDevice>, StoreError> {
        let mut out: Vec<MeterDevice> = self
            .lock()
            .devices
            .iter()
            .filter(|d| d.building_id == building_id && d.active)
            .cloned()
            .collect();
        out.sort_by(|a, b| (&a.room_number, &a.device_id).cmp(&(&b.room_number, &b.device_id)));
        Ok(out)
    }

    async fn buildings_with_active_devices(&self) -> Result<Vec<i32>, StoreError> {
        let mut ids: Vec<i32> = self.lock().devices.iter().filter(|d| d.active).map(|d| d.building_id).collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn room_device(
        &self,
        building_id: i32,
        room_number: &str,
        kind: MeterKind,
    ) -> Result<Option<MeterDevice>, StoreError> {
        Ok(self
            .lock()
            .devices
            .iter()
            .filter(|d| d.building_id == building_id && d.room_number == room_number && d.kind == kind && d.active)
            .max_by_key(|d| d.created_at)
            .cloned())
    }

    async fn room_device_history(
        &self,
        building_id: i32,
        room_number: &str,
        kind: MeterKind,
    ) -> Result<Vec<MeterDevice>, StoreError> {
        let mut out: Vec<MeterDevice> = self
            .lock()
            .devices
            .iter()
            .filter(|d| d.building_id == building_id && d.room_number == room_number && d.kind == kind)
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.created_at, &a.device_id).cmp(&(b.created_at, &b.device_id)));
        Ok(out)
    }

    async fn occupied_rooms(
        &self,
        building_id: i32,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();
        let mut rooms: Vec<String> = inner
            .rooms
            .iter()
            .filter(|(b, _)| *b == building_id)
            .filter(|(_, room)| {
                inner.tenancies.iter().any(|t| {
                    t.building_id == building_id
                        && t.room_number == *room
                        && t.starts_at.map_or(true, |s| s < end)
                        && t.ends_at.map_or(true, |e| e > start)
                })
            })
            .map(|(_, room)| room.clone())
            .collect();
        rooms.sort();
        rooms.dedup();
        Ok(rooms)
    }
}

#[async_trait]
impl RateTable for MemoryStore {
    async fn effective_rate(&self, building_id: i32, as_of: Date) -> Result<Option<UtilityRate>, StoreError> {
        // Later insertions win ties on the same effective date, like `rate_id DESC`.
        Ok(self
            .lock()
            .rates
            .iter()
            .enumerate()
            .filter(|(_, r)| r.building_id == building_id && r.effective_date <= as_of)
            .max_by_key(|(idx, r)| (r.effective_date, *idx))
            .map(|(_, r)| r.clone()))
    }
}

#[async_trait]
impl SummaryStore for MemoryStore {
    async fn save_summary(&self, summary: &BillingSummaryRow) -> Result<(), StoreError> {
        self.lock().summaries.insert(
            (summary.building_id, summary.month.clone(), summary.kind),
            summary.clone(),
        );
        Ok(())
    }
}

#[async_trait]
impl CreditLedger for MemoryStore {
    async fn credit_account(&self, device_id: &str) -> Result<Option<CreditAccount>, StoreError> {
        Ok(self.credit(device_id))
    }

    async fn record_alert(&self, device_id: &str, level: AlertLevel, at: OffsetDateTime) -> Result<(), StoreError> {
        if let Some(account) = self.lock().credits.get_mut(device_id) {
            match level {
                AlertLevel::Low => account.last_low_notified_at = Some(at),
                AlertLevel::Critical => account.last_critical_notified_at = Some(at),
            }
        }
        Ok(())
    }

    async fn record_cut(&self, device_id: &str, at: OffsetDateTime) -> Result<(), StoreError> {
        if let Some(account) = self.lock().credits.get_mut(device_id) {
            account.is_cut = true;
            account.last_cut_at = Some(at);
        }
        Ok(())
    }
}
