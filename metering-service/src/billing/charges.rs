use metering_client::domain::MeterKind;
use rust_decimal::{prelude::FromPrimitive, Decimal, RoundingStrategy};
use serde_json::{json, Map, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime, UtcOffset};

use super::{
    consumption::{self, ConsumptionResult},
    period::BillingMonth,
    rate::{self, ResolvedRate},
};
use crate::store::{DeviceDirectory, RateTable, ReadingStore, StoreError};

/// Round half away from zero to 2 decimal places (half-up for charges).
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// `round2(used * price)`.
pub fn line_amount(used_quantity: f64, price_per_unit: Decimal) -> Decimal {
    let used = Decimal::from_f64(used_quantity).unwrap_or_default();
    round2(used * price_per_unit)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeLine {
    pub room_number: String,
    pub device_id: Option<String>,
    pub consumption: ConsumptionResult,
    pub price_per_unit: Decimal,
    pub amount: Decimal,
}

impl ChargeLine {
    fn zero(room_number: String, device_id: Option<String>, price_per_unit: Decimal) -> Self {
        Self {
            room_number,
            device_id,
            consumption: ConsumptionResult::empty(),
            price_per_unit,
            amount: Decimal::ZERO,
        }
    }

    pub fn used_quantity(&self) -> f64 {
        self.consumption.used_quantity
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeSheet {
    pub building_id: i32,
    pub month: BillingMonth,
    pub kind: MeterKind,
    pub rate: ResolvedRate,
    pub total_used: f64,
    /// Sum of the already-rounded line amounts.
    pub total_amount: Decimal,
    pub items: Vec<ChargeLine>,
}

impl ChargeSheet {
    pub fn price_per_unit(&self) -> Decimal {
        self.rate.price(self.kind)
    }

    /// Response body shape: `{month, rate, totalKwh|totalLiters, totalAmount, items}`.
    pub fn to_json(&self) -> Value {
        let unit = match self.kind {
            MeterKind::Electric => "Kwh",
            MeterKind::Water => "Liters",
        };
        let items: Vec<Value> = self
            .items
            .iter()
            .map(|line| {
                let c = &line.consumption;
                let mut item = Map::new();
                item.insert("roomNumber".into(), json!(line.room_number));
                item.insert("deviceId".into(), json!(line.device_id));
                item.insert(format!("start{unit}"), json!(c.start_quantity));
                item.insert(format!("end{unit}"), json!(c.end_quantity));
                item.insert(format!("used{unit}"), json!(c.used_quantity));
                item.insert("pricePerUnit".into(), json!(line.price_per_unit));
                item.insert("amount".into(), json!(line.amount));
                item.insert("startAt".into(), json!(c.start_observed_at.and_then(rfc3339)));
                item.insert("endAt".into(), json!(c.end_observed_at.and_then(rfc3339)));
                item.insert("method".into(), json!(c.method));
                Value::Object(item)
            })
            .collect();

        let mut body = Map::new();
        body.insert("month".into(), json!(self.month.to_string()));
        body.insert("rate".into(), json!(self.price_per_unit()));
        body.insert(format!("total{unit}"), json!(self.total_used));
        body.insert("totalAmount".into(), json!(self.total_amount));
        body.insert("items".into(), Value::Array(items));
        Value::Object(body)
    }
}

fn rfc3339(at: OffsetDateTime) -> Option<String> {
    at.format(&Rfc3339).ok()
}

/// Charges for every occupied room of a building in `month`.
///
/// The rate is resolved as of the month's last day. Rooms without an active
/// device, and rooms whose readings cannot be loaded, get a zero line.
pub async fn room_charges<S>(
    store: &S,
    building_id: i32,
    month: BillingMonth,
    kind: MeterKind,
    offset: UtcOffset,
) -> Result<ChargeSheet, StoreError>
where
    S: ReadingStore + DeviceDirectory + RateTable + ?Sized,
{
    let start = month.start(offset);
    let end = month.end(offset);
    let rate = rate::resolve(store, building_id, month.last_day()).await?;
    let price = rate.price(kind);
    let rooms = store.occupied_rooms(building_id, start, end).await?;

    let mut items = Vec::with_capacity(rooms.len());
    for room_number in rooms {
        let device = match store.room_device(building_id, &room_number, kind).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                items.push(ChargeLine::zero(room_number, None, price));
                continue;
            }
            Err(e) => {
                tracing::warn!(building_id, room = %room_number, error = %e, "device lookup failed, billing room as zero");
                items.push(ChargeLine::zero(room_number, None, price));
                continue;
            }
        };

        match consumption::estimate(store, &device.device_id, kind, start, end).await {
            Ok(result) => {
                let amount = line_amount(result.used_quantity, price);
                items.push(ChargeLine {
                    room_number,
                    device_id: Some(device.device_id),
                    consumption: result,
                    price_per_unit: price,
                    amount,
                });
            }
            Err(e) => {
                tracing::warn!(
                    building_id,
                    room = %room_number,
                    device_id = %device.device_id,
                    error = %e,
                    "consumption estimate failed, billing room as zero"
                );
                items.push(ChargeLine::zero(room_number, Some(device.device_id), price));
            }
        }
    }

    let total_used = items.iter().map(ChargeLine::used_quantity).sum();
    let total_amount = items.iter().map(|l| l.amount).sum();
    metrics::counter!("charge_sheets_computed_total", "kind" => kind.as_str()).increment(1);

    Ok(ChargeSheet {
        building_id,
        month,
        kind,
        rate,
        total_used,
        total_amount,
        items,
    })
}
