use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::ServerRow;
use crate::error::ApiError;

/// Paged listing, most recently scanned first.
pub async fn list(pool: &PgPool, limit: i64, offset: i64) -> Result<Vec<ServerRow>, ApiError> {
    let rows = sqlx::query_as::<_, ServerRow>(
        "SELECT * FROM servers \
         ORDER BY last_scanned_at DESC NULLS LAST, first_seen_at DESC \
         LIMIT $1 OFFSET $2",
    )
    .bind(limit.clamp(1, 500))
    .bind(offset.max(0))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<ServerRow, ApiError> {
    sqlx::query_as::<_, ServerRow>("SELECT * FROM servers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(ApiError::NotFound("server"))
}

/// Lookup by the original input string. Several rows can share an address
/// (re-resolution over time); the most recently scanned wins.
pub async fn get_by_address(pool: &PgPool, address: &str) -> Result<ServerRow, ApiError> {
    sqlx::query_as::<_, ServerRow>(
        "SELECT * FROM servers WHERE server_address = $1 \
         ORDER BY last_scanned_at DESC NULLS LAST LIMIT 1",
    )
    .bind(address)
    .fetch_optional(pool)
    .await?
    .ok_or(ApiError::NotFound("server"))
}

pub async fn delete(pool: &PgPool, id: Uuid) -> Result<(), ApiError> {
    let deleted = sqlx::query("DELETE FROM servers WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound("server"));
    }
    Ok(())
}

/// Remove one history entry by its RFC3339 timestamp. Removing the last
/// entry removes the row; removing the newest entry re-derives
/// `latest_result` from the remaining head.
pub async fn delete_scan(pool: &PgPool, id: Uuid, timestamp: &str) -> Result<(), ApiError> {
    let mut tx = pool.begin().await?;

    let server = sqlx::query_as::<_, ServerRow>("SELECT * FROM servers WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ApiError::NotFound("server"))?;

    let mut history = match server.scan_history {
        Value::Array(entries) => entries,
        _ => Vec::new(),
    };
    let before = history.len();
    history.retain(|e| e.get("timestamp").and_then(Value::as_str) != Some(timestamp));
    if history.len() == before {
        return Err(ApiError::NotFound("scan entry"));
    }

    if history.is_empty() {
        sqlx::query("DELETE FROM servers WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    } else {
        let latest = history
            .first()
            .and_then(|e| e.get("result"))
            .cloned()
            .filter(|v| !v.is_null());
        sqlx::query("UPDATE servers SET scan_history = $2, latest_result = $3 WHERE id = $1")
            .bind(id)
            .bind(Value::Array(history))
            .bind(latest)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}
