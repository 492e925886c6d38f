use anyhow::Result;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::domain::{AlertLevel, CreditAccount, DEFAULT_CRITICAL_THRESHOLD_KWH, DEFAULT_LOW_THRESHOLD_KWH};

/// Prepaid state of a device, or `None` when it has no credit row.
pub async fn credit_account(pool: &PgPool, device_id: &str) -> Result<Option<CreditAccount>> {
    let account = sqlx::query_as::<_, CreditAccount>(
        r#"
        SELECT d.device_id,
               c.credit_kwh,
               COALESCE(d.threshold_low_kwh, $2)      AS threshold_low_kwh,
               COALESCE(d.threshold_critical_kwh, $3) AS threshold_critical_kwh,
               d.is_cut,
               d.last_cut_at,
               d.last_low_notified_at,
               d.last_critical_notified_at
        FROM meter_devices d
        JOIN meter_credit c
          ON c.device_id = d.device_id
        WHERE d.device_id = $1
        "#,
    )
    .bind(device_id)
    .bind(DEFAULT_LOW_THRESHOLD_KWH)
    .bind(DEFAULT_CRITICAL_THRESHOLD_KWH)
    .fetch_optional(pool)
    .await?;

    Ok(account)
}

pub async fn mark_notified(pool: &PgPool, device_id: &str, level: AlertLevel, at: OffsetDateTime) -> Result<()> {
    let sql = match level {
        AlertLevel::Low => "UPDATE meter_devices SET last_low_notified_at = $2 WHERE device_id = $1",
        AlertLevel::Critical => "UPDATE meter_devices SET last_critical_notified_at = $2 WHERE device_id = $1",
    };
    sqlx::query(sql).bind(device_id).bind(at).execute(pool).await?;
    Ok(())
}

pub async fn mark_cut(pool: &PgPool, device_id: &str, at: OffsetDateTime) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE meter_devices
        SET is_cut = TRUE, last_cut_at = $2
        WHERE device_id = $1
        "#,
    )
    .bind(device_id)
    .bind(at)
    .execute(pool)
    .await?;

    Ok(())
}
