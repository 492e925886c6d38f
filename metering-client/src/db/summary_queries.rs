use anyhow::Result;
use sqlx::PgPool;

use crate::domain::BillingSummaryRow;

/// Insert or replace the summary for `(building_id, month, kind)`.
pub async fn upsert_billing_summary(pool: &PgPool, s: &BillingSummaryRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO billing_summaries
            (building_id, month, kind, rate, total_used, total_amount, items, computed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (building_id, month, kind) DO UPDATE SET
            rate         = EXCLUDED.rate,
            total_used   = EXCLUDED.total_used,
            total_amount = EXCLUDED.total_amount,
            items        = EXCLUDED.items,
            computed_at  = EXCLUDED.computed_at
        "#,
    )
    .bind(s.building_id)
    .bind(&s.month)
    .bind(s.kind.as_str())
    .bind(s.rate)
    .bind(s.total_used)
    .bind(s.total_amount)
    .bind(&s.items)
    .bind(s.computed_at)
    .execute(pool)
    .await?;

    Ok(())
}
