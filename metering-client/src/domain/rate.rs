use rust_decimal::Decimal;
use time::Date;

/// Effective-dated unit prices for one building.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct UtilityRate {
    pub building_id: i32,
    /// Currency per kWh.
    pub electric_unit_price: Decimal,
    /// Currency per liter.
    pub water_unit_price: Decimal,
    pub effective_date: Date,
}
