use metering_client::domain::MeterKind;
use rust_decimal::Decimal;
use time::Date;

use crate::store::{RateTable, StoreError};

/// Prices in effect for a building on a given date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRate {
    pub electric_per_kwh: Decimal,
    pub water_per_liter: Decimal,
    /// `None` when the building has no rate row yet.
    pub effective_date: Option<Date>,
}

impl ResolvedRate {
    pub fn zero() -> Self {
        Self {
            electric_per_kwh: Decimal::ZERO,
            water_per_liter: Decimal::ZERO,
            effective_date: None,
        }
    }

    pub fn price(&self, kind: MeterKind) -> Decimal {
        match kind {
            MeterKind::Electric => self.electric_per_kwh,
            MeterKind::Water => self.water_per_liter,
        }
    }
}

/// Latest rate with `effective_date <= as_of`; zero prices when none exists.
pub async fn resolve<S>(store: &S, building_id: i32, as_of: Date) -> Result<ResolvedRate, StoreError>
where
    S: RateTable + ?Sized,
{
    Ok(match store.effective_rate(building_id, as_of).await? {
        Some(rate) => ResolvedRate {
            electric_per_kwh: rate.electric_unit_price,
            water_per_liter: rate.water_unit_price,
            effective_date: Some(rate.effective_date),
        },
        None => ResolvedRate::zero(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;
    use time::macros::date;

    #[tokio::test]
    async fn picks_latest_effective_row_and_is_stable() {
        let store = MemoryStore::new();
        store.add_rate(1, dec!(5.0), dec!(0.02), date!(2024-01-01));
        store.add_rate(1, dec!(6.0), dec!(0.05), date!(2024-05-15));
        store.add_rate(2, dec!(9.0), dec!(0.09), date!(2023-01-01));

        let april = resolve(&store, 1, date!(2024-04-30)).await.unwrap();
        assert_eq!(april.electric_per_kwh, dec!(5.0));

        let may = resolve(&store, 1, date!(2024-05-31)).await.unwrap();
        assert_eq!(may.price(MeterKind::Electric), dec!(6.0));
        assert_eq!(may.price(MeterKind::Water), dec!(0.05));
        assert_eq!(may.effective_date, Some(date!(2024-05-15)));
        assert_eq!(resolve(&store, 1, date!(2024-05-31)).await.unwrap(), may);
    }

    #[tokio::test]
    async fn missing_rate_resolves_to_zero() {
        let store = MemoryStore::new();
        let rate = resolve(&store, 42, date!(2024-05-31)).await.unwrap();
        assert_eq!(rate, ResolvedRate::zero());
    }
}
