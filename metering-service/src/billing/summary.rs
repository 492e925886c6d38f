use metering_client::domain::{BillingSummaryRow, MeterKind};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

use super::{
    charges::{room_charges, ChargeSheet},
    period::BillingMonth,
};
use crate::store::{MeteringStore, StoreError, SummaryStore};

/// Row persisted for a computed sheet. `items` carries the same line objects
/// the charges endpoint returns.
pub fn summary_row(sheet: &ChargeSheet, computed_at: OffsetDateTime) -> BillingSummaryRow {
    let items = match sheet.to_json() {
        Value::Object(mut body) => body.remove("items").unwrap_or(Value::Array(Vec::new())),
        _ => Value::Array(Vec::new()),
    };
    BillingSummaryRow {
        building_id: sheet.building_id,
        month: sheet.month.to_string(),
        kind: sheet.kind,
        rate: sheet.price_per_unit(),
        total_used: sheet.total_used,
        total_amount: sheet.total_amount,
        items,
        computed_at,
    }
}

pub async fn persist_sheet<S>(store: &S, sheet: &ChargeSheet, computed_at: OffsetDateTime) -> Result<(), StoreError>
where
    S: SummaryStore + ?Sized,
{
    store.save_summary(&summary_row(sheet, computed_at)).await
}

/// Recomputes and upserts both kinds' sheets for a building's month.
pub async fn refresh_building<S>(
    store: &S,
    building_id: i32,
    month: BillingMonth,
    offset: UtcOffset,
    computed_at: OffsetDateTime,
) -> Result<Vec<ChargeSheet>, StoreError>
where
    S: MeteringStore + ?Sized,
{
    let mut sheets = Vec::with_capacity(MeterKind::ALL.len());
    for kind in MeterKind::ALL {
        let sheet = room_charges(store, building_id, month, kind, offset).await?;
        persist_sheet(store, &sheet, computed_at).await?;
        tracing::debug!(
            building_id,
            month = %month,
            kind = kind.as_str(),
            total_amount = %sheet.total_amount,
            "billing summary saved"
        );
        sheets.push(sheet);
    }
    Ok(sheets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use metering_client::domain::{DataPointMap, MeterDevice, Reading};
    use rust_decimal_macros::dec;
    use time::{
        macros::{date, datetime},
        Month,
    };

    #[tokio::test]
    async fn refresh_upserts_one_row_per_kind() {
        let store = MemoryStore::new();
        store.add_occupied_room(1, "101");
        store.add_rate(1, dec!(4), dec!(0.01), date!(2024-01-01));
        store.add_device(MeterDevice {
            device_id: "e1".into(),
            room_number: "101".into(),
            building_id: 1,
            kind: MeterKind::Electric,
            active: true,
            created_at: datetime!(2024-01-01 00:00 UTC),
            dp_map: DataPointMap::default(),
        });
        for (at, kwh) in [(datetime!(2024-05-01 00:00 UTC), 10.0), (datetime!(2024-05-20 00:00 UTC), 15.0)] {
            let mut r = Reading::blank("e1", "101", 1, MeterKind::Electric, at);
            r.energy_kwh = Some(kwh);
            store.push_reading(r);
        }
        let month = BillingMonth::new(2024, Month::May);
        let computed_at = datetime!(2024-05-20 01:00 UTC);

        refresh_building(&store, 1, month, UtcOffset::UTC, computed_at).await.unwrap();
        // Second run replaces rather than duplicates.
        refresh_building(&store, 1, month, UtcOffset::UTC, computed_at).await.unwrap();

        let mut rows = store.summaries();
        rows.sort_by_key(|r| r.kind.as_str());
        assert_eq!(rows.len(), 2);
        let electric = &rows[0];
        assert_eq!(electric.kind, MeterKind::Electric);
        assert_eq!(electric.month, "2024-05");
        assert_eq!(electric.rate, dec!(4));
        assert_eq!(electric.total_amount, dec!(20.00));
        assert_eq!(electric.items[0]["roomNumber"], "101");
        assert_eq!(electric.items[0]["usedKwh"], 5.0);
        assert_eq!(rows[1].total_amount, dec!(0));
    }
}
