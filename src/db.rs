use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

/// Connect to Postgres and run the embedded migrations.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("connecting to database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("running migrations")?;
    Ok(pool)
}

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PROCESSING: &str = "processing";
pub const AGENT_IDLE: &str = "idle";
pub const AGENT_BUSY: &str = "busy";

#[derive(Debug, Clone, FromRow)]
pub struct QueueRow {
    pub id: Uuid,
    pub server_address: String,
    pub hostname: Option<String>,
    pub resolved_ip: String,
    pub port: i32,
    pub status: String,
    pub assigned_agent_id: Option<String>,
    pub assigned_proxy_id: Option<Uuid>,
    pub assigned_account_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRow {
    pub id: Uuid,
    pub server_address: String,
    pub hostname: Option<String>,
    pub resolved_ip: String,
    pub port: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_scanned_at: Option<OffsetDateTime>,
    pub scan_count: i32,
    pub latest_result: Option<Value>,
    /// Bounded list of `{timestamp, result, errorMessage}` entries,
    /// newest first.
    pub scan_history: Value,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRow {
    pub id: Uuid,
    pub host: String,
    pub port: i32,
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_concurrent: i32,
    pub current_usage: i32,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRow {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub account_type: String,
    pub username: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub max_concurrent: i32,
    pub current_usage: i32,
    pub is_active: bool,
    pub is_valid: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_validated_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRow {
    pub id: String,
    pub display_name: String,
    pub status: String,
    pub current_queue_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_heartbeat: OffsetDateTime,
}
