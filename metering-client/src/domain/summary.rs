use rust_decimal::Decimal;
use time::OffsetDateTime;

use super::MeterKind;

/// Persisted monthly charge sheet for one building and meter kind.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingSummaryRow {
    pub building_id: i32,
    /// `YYYY-MM`
    pub month: String,
    pub kind: MeterKind,
    pub rate: Decimal,
    pub total_used: f64,
    pub total_amount: Decimal,
    pub items: serde_json::Value,
    pub computed_at: OffsetDateTime,
}
