use sqlx::PgPool;
use uuid::Uuid;

use crate::db::{AgentRow, AGENT_IDLE};
use crate::error::ApiError;
use crate::types::AgentStatus;

/// Agents older than this many seconds are hard-deleted on any list read.
const EXPIRY_SECONDS: i64 = 60;

/// Agent ids are opaque but must match `^[A-Za-z0-9_-]{1,100}$`.
pub fn valid_agent_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 100
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// `agent-<n>` becomes "Agent n"; anything else keeps the raw id.
pub fn display_name(id: &str) -> String {
    id.strip_prefix("agent-")
        .and_then(|n| n.parse::<u64>().ok())
        .map(|n| format!("Agent {n}"))
        .unwrap_or_else(|| id.to_string())
}

/// Upsert the agent row: back to idle, lease cleared, heartbeat stamped.
pub async fn register(pool: &PgPool, agent_id: &str) -> Result<String, ApiError> {
    if !valid_agent_id(agent_id) {
        return Err(ApiError::Validation(
            "invalid agent id (want 1-100 chars of [A-Za-z0-9_-])".to_string(),
        ));
    }
    let name = display_name(agent_id);
    sqlx::query(
        "INSERT INTO agents (id, display_name, status, current_queue_id, last_heartbeat) \
         VALUES ($1, $2, $3, NULL, now()) \
         ON CONFLICT (id) DO UPDATE SET \
           display_name = EXCLUDED.display_name, \
           status = EXCLUDED.status, \
           current_queue_id = NULL, \
           last_heartbeat = now()",
    )
    .bind(agent_id)
    .bind(&name)
    .bind(AGENT_IDLE)
    .execute(pool)
    .await?;
    Ok(name)
}

/// Stamp the heartbeat and apply any supplied fields. Unknown agents are a
/// 404 — they must re-register after expiry.
pub async fn heartbeat(
    pool: &PgPool,
    agent_id: &str,
    status: Option<AgentStatus>,
    current_queue_id: Option<Uuid>,
) -> Result<(), ApiError> {
    let status_text = status.map(|s| match s {
        AgentStatus::Idle => "idle",
        AgentStatus::Busy => "busy",
    });
    let updated = sqlx::query(
        "UPDATE agents SET \
           last_heartbeat = now(), \
           status = COALESCE($2, status), \
           current_queue_id = COALESCE($3, current_queue_id) \
         WHERE id = $1",
    )
    .bind(agent_id)
    .bind(status_text)
    .bind(current_queue_id)
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(ApiError::NotFound("agent"));
    }
    Ok(())
}

/// Delete agents whose heartbeat is older than 60 s. Idempotent; callers
/// may race.
pub async fn expire_stale(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let deleted = sqlx::query(
        "DELETE FROM agents WHERE last_heartbeat < now() - make_interval(secs => $1)",
    )
    .bind(EXPIRY_SECONDS as f64)
    .execute(pool)
    .await?
    .rows_affected();
    if deleted > 0 {
        tracing::debug!(count = deleted, "expired stale agents");
    }
    Ok(deleted)
}

/// Sweep expired rows, then list what is left.
pub async fn list(pool: &PgPool) -> Result<Vec<AgentRow>, ApiError> {
    expire_stale(pool).await?;
    let agents = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(agents)
}
