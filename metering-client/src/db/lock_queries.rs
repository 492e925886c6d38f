use anyhow::Result;
use sqlx::PgConnection;

// Session-level advisory locks: they stay held for as long as the connection
// that took them, so callers must keep that connection checked out.

pub async fn try_advisory_lock(conn: &mut PgConnection, key: i64) -> Result<bool> {
    let ok = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
        .bind(key)
        .fetch_one(conn)
        .await?;
    Ok(ok)
}

pub async fn advisory_unlock(conn: &mut PgConnection, key: i64) -> Result<bool> {
    let ok = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
        .bind(key)
        .fetch_one(conn)
        .await?;
    Ok(ok)
}
