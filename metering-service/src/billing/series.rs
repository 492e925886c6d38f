use metering_client::domain::{MeterDevice, MeterKind};
use rust_decimal::Decimal;
use serde::Serialize;
use time::{OffsetDateTime, UtcOffset};

use super::{charges::line_amount, consumption, period::BillingMonth, rate};
use crate::store::{DeviceDirectory, RateTable, ReadingStore, StoreError};

pub const MAX_SERIES_MONTHS: u32 = 24;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyUsage {
    pub month: String,
    pub electric_kwh: f64,
    pub water_liters: f64,
    pub electric_rate: Decimal,
    pub water_rate: Decimal,
    pub electric_amount: Decimal,
    pub water_amount: Decimal,
}

fn round_to(value: f64, dp: u32) -> f64 {
    let factor = 10f64.powi(dp as i32);
    (value * factor).round() / factor
}

/// The device a room was metered by during a month ending at `end`: the
/// newest one installed before `end`, or the first one ever when the month
/// predates every installation.
fn device_for_month(history: &[MeterDevice], end: OffsetDateTime) -> Option<&MeterDevice> {
    history
        .iter()
        .rev()
        .find(|d| d.created_at < end)
        .or_else(|| history.first())
}

/// Usage and charges for one room over the last `months` months, oldest
/// first and ending with the month containing `now`. `months` is clamped to
/// `1..=24`. Each month is read from the device installed at the time, so a
/// swapped meter keeps its history.
///
/// Amounts come from the unrounded quantity; quantities are reported to
/// 2 dp (kWh) and 1 dp (liters).
pub async fn usage_series<S>(
    store: &S,
    building_id: i32,
    room_number: &str,
    months: u32,
    now: OffsetDateTime,
    offset: UtcOffset,
) -> Result<Vec<MonthlyUsage>, StoreError>
where
    S: ReadingStore + DeviceDirectory + RateTable + ?Sized,
{
    let months = months.clamp(1, MAX_SERIES_MONTHS);
    let current = BillingMonth::containing(now, offset);

    let electric = store.room_device_history(building_id, room_number, MeterKind::Electric).await?;
    let water = store.room_device_history(building_id, room_number, MeterKind::Water).await?;

    let mut out = Vec::with_capacity(months as usize);
    for back in (0..months).rev() {
        let month = current.back(back);
        let (start, end) = (month.start(offset), month.end(offset));
        let rate = rate::resolve(store, building_id, month.last_day()).await?;

        let mut used = [0.0_f64; 2];
        for (slot, history) in [&electric, &water].into_iter().enumerate() {
            if let Some(device) = device_for_month(history, end) {
                used[slot] = consumption::estimate(store, &device.device_id, device.kind, start, end)
                    .await?
                    .used_quantity;
            }
        }
        let [kwh, liters] = used;

        out.push(MonthlyUsage {
            month: month.to_string(),
            electric_kwh: round_to(kwh, 2),
            water_liters: round_to(liters, 1),
            electric_rate: rate.electric_per_kwh,
            water_rate: rate.water_per_liter,
            electric_amount: line_amount(kwh, rate.electric_per_kwh),
            water_amount: line_amount(liters, rate.water_per_liter),
        });
    }

    Ok(out)
}
