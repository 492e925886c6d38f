use anyhow::Result;
use sqlx::{types::Json, PgPool};
use time::OffsetDateTime;

use crate::domain::{DataPointMap, MeterDevice, MeterKind};

#[derive(Debug, Clone, sqlx::FromRow)]
struct DeviceRow {
    device_id: String,
    room_number: String,
    building_id: i32,
    kind: String,
    active: bool,
    created_at: OffsetDateTime,
    dp_map: Option<Json<DataPointMap>>,
}

impl TryFrom<DeviceRow> for MeterDevice {
    type Error = anyhow::Error;

    fn try_from(r: DeviceRow) -> Result<Self> {
        Ok(MeterDevice {
            kind: r.kind.parse()?,
            device_id: r.device_id,
            room_number: r.room_number,
            building_id: r.building_id,
            active: r.active,
            created_at: r.created_at,
            dp_map: r.dp_map.map(|j| j.0).unwrap_or_default(),
        })
    }
}

/// Active devices of a building, ordered by room then device id.
pub async fn active_devices(pool: &PgPool, building_id: i32) -> Result<Vec<MeterDevice>> {
    let rows = sqlx::query_as::<_, DeviceRow>(
        r#"
        SELECT device_id, room_number, building_id, kind, active, created_at, dp_map
        FROM meter_devices
        WHERE building_id = $1
          AND active IS TRUE
        ORDER BY room_number, device_id
        "#,
    )
    .bind(building_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(MeterDevice::try_from).collect()
}

/// Distinct buildings that have at least one active device.
pub async fn buildings_with_active_devices(pool: &PgPool) -> Result<Vec<i32>> {
    let ids = sqlx::query_scalar::<_, i32>(
        r#"
        SELECT DISTINCT building_id
        FROM meter_devices
        WHERE active IS TRUE
        ORDER BY building_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// The most recently created active device of a kind for a room.
pub async fn active_room_device(
    pool: &PgPool,
    building_id: i32,
    room_number: &str,
    kind: MeterKind,
) -> Result<Option<MeterDevice>> {
    let row = sqlx::query_as::<_, DeviceRow>(
        r#"
        SELECT device_id, room_number, building_id, kind, active, created_at, dp_map
        FROM meter_devices
        WHERE building_id = $1
          AND room_number = $2
          AND kind = $3
          AND active IS TRUE
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(building_id)
    .bind(room_number)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(MeterDevice::try_from).transpose()
}

/// Every device of a kind ever installed in a room, active or not, oldest
/// first.
pub async fn room_device_history(
    pool: &PgPool,
    building_id: i32,
    room_number: &str,
    kind: MeterKind,
) -> Result<Vec<MeterDevice>> {
    let rows = sqlx::query_as::<_, DeviceRow>(
        r#"
        SELECT device_id, room_number, building_id, kind, active, created_at, dp_map
        FROM meter_devices
        WHERE building_id = $1
          AND room_number = $2
          AND kind = $3
        ORDER BY created_at, device_id
        "#,
    )
    .bind(building_id)
    .bind(room_number)
    .bind(kind.as_str())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(MeterDevice::try_from).collect()
}

/// Rooms of a building with a tenancy overlapping `[start, end)`.
pub async fn occupied_rooms(
    pool: &PgPool,
    building_id: i32,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<String>> {
    let rooms = sqlx::query_scalar::<_, String>(
        r#"
        SELECT DISTINCT r.room_number
        FROM rooms r
        JOIN tenancies t
          ON t.building_id = r.building_id
         AND t.room_number = r.room_number
        WHERE r.building_id = $1
          AND (t.starts_at IS NULL OR t.starts_at <  $3)
          AND (t.ends_at   IS NULL OR t.ends_at   >  $2)
        ORDER BY r.room_number
        "#,
    )
    .bind(building_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rooms)
}
