use anyhow::Result;
use sqlx::PgPool;
use time::Date;

use crate::domain::UtilityRate;

/// The rate row in effect on `as_of`: latest `effective_date <= as_of`.
pub async fn effective_rate(pool: &PgPool, building_id: i32, as_of: Date) -> Result<Option<UtilityRate>> {
    let row = sqlx::query_as::<_, UtilityRate>(
        r#"
        SELECT building_id, electric_unit_price, water_unit_price, effective_date
        FROM utility_rates
        WHERE building_id = $1
          AND effective_date <= $2
        ORDER BY effective_date DESC, rate_id DESC
        LIMIT 1
        "#,
    )
    .bind(building_id)
    .bind(as_of)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}
