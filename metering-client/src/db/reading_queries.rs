use anyhow::Result;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::domain::{MeterKind, Reading};

#[derive(Debug, Clone, sqlx::FromRow)]
struct ReadingRow {
    device_id: String,
    room_number: String,
    building_id: i32,
    at: OffsetDateTime,
    kind: String,
    energy_kwh: Option<f64>,
    power_w: Option<f64>,
    voltage_v: Option<f64>,
    current_a: Option<f64>,
    total_liters: Option<f64>,
    session_liters: Option<f64>,
    flow_lpm: Option<f64>,
    battery_pct: Option<f64>,
    raw: Option<serde_json::Value>,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = anyhow::Error;

    fn try_from(r: ReadingRow) -> Result<Self> {
        Ok(Reading {
            kind: r.kind.parse()?,
            device_id: r.device_id,
            room_number: r.room_number,
            building_id: r.building_id,
            at: r.at,
            energy_kwh: r.energy_kwh,
            power_w: r.power_w,
            voltage_v: r.voltage_v,
            current_a: r.current_a,
            total_liters: r.total_liters,
            session_liters: r.session_liters,
            flow_lpm: r.flow_lpm,
            battery_pct: r.battery_pct,
            raw: r.raw,
        })
    }
}

const READING_COLUMNS: &str = r#"
    device_id, room_number, building_id, at, kind,
    energy_kwh, power_w, voltage_v, current_a,
    total_liters, session_liters, flow_lpm, battery_pct, raw
"#;

/// Counter column filter shared by the boundary lookups.
const HAS_COUNTER: &str =
    "(CASE WHEN kind = 'electric' THEN energy_kwh ELSE total_liters END) IS NOT NULL";

/// Append readings. Existing rows for the same `(device_id, kind, at)` are
/// left untouched.
pub async fn insert_readings(pool: &PgPool, readings: &[Reading]) -> Result<u64> {
    if readings.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Postgres>::new(format!("INSERT INTO meter_readings ({READING_COLUMNS}) "));

    builder.push_values(readings, |mut b, r| {
        b.push_bind(&r.device_id)
            .push_bind(&r.room_number)
            .push_bind(r.building_id)
            .push_bind(r.at)
            .push_bind(r.kind.as_str())
            .push_bind(r.energy_kwh)
            .push_bind(r.power_w)
            .push_bind(r.voltage_v)
            .push_bind(r.current_a)
            .push_bind(r.total_liters)
            .push_bind(r.session_liters)
            .push_bind(r.flow_lpm)
            .push_bind(r.battery_pct)
            .push_bind(&r.raw);
    });
    builder.push(" ON CONFLICT (device_id, kind, at) DO NOTHING");

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

/// Most recent counter-bearing reading strictly before `before`.
pub async fn latest_counter_before(
    pool: &PgPool,
    device_id: &str,
    kind: MeterKind,
    before: OffsetDateTime,
) -> Result<Option<Reading>> {
    let sql = format!(
        r#"
        SELECT {READING_COLUMNS}
        FROM meter_readings
        WHERE device_id = $1
          AND kind = $2
          AND at < $3
          AND {HAS_COUNTER}
        ORDER BY at DESC
        LIMIT 1
        "#
    );

    let row = sqlx::query_as::<_, ReadingRow>(&sql)
        .bind(device_id)
        .bind(kind.as_str())
        .bind(before)
        .fetch_optional(pool)
        .await?;

    row.map(Reading::try_from).transpose()
}

/// Earliest counter-bearing reading in `[start, end)`.
pub async fn first_counter_in_range(
    pool: &PgPool,
    device_id: &str,
    kind: MeterKind,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Option<Reading>> {
    let sql = format!(
        r#"
        SELECT {READING_COLUMNS}
        FROM meter_readings
        WHERE device_id = $1
          AND kind = $2
          AND at >= $3
          AND at <  $4
          AND {HAS_COUNTER}
        ORDER BY at ASC
        LIMIT 1
        "#
    );

    let row = sqlx::query_as::<_, ReadingRow>(&sql)
        .bind(device_id)
        .bind(kind.as_str())
        .bind(start)
        .bind(end)
        .fetch_optional(pool)
        .await?;

    row.map(Reading::try_from).transpose()
}

/// All readings of a kind in `[start, end)`, ascending by timestamp.
pub async fn readings_in_range(
    pool: &PgPool,
    device_id: &str,
    kind: MeterKind,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<Reading>> {
    let sql = format!(
        r#"
        SELECT {READING_COLUMNS}
        FROM meter_readings
        WHERE device_id = $1
          AND kind = $2
          AND at >= $3
          AND at <  $4
        ORDER BY at ASC
        "#
    );

    let rows = sqlx::query_as::<_, ReadingRow>(&sql)
        .bind(device_id)
        .bind(kind.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(Reading::try_from).collect()
}
