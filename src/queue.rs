use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::allocator;
use crate::db::{QueueRow, ServerRow, AGENT_IDLE, AGENT_BUSY, STATUS_PENDING, STATUS_PROCESSING};
use crate::error::ApiError;
use crate::resolver;
use crate::sanitize::{self, MAX_FIELD_BYTES};
use crate::socks::{ProxyConfig, ProxyKind};
use crate::types::{
    AccountKind, AccountLease, AddServersResponse, ClaimResponse, QueueStats, QueuedServer,
    ScanResult,
};

/// Scan history per server is capped at this many entries, newest first.
const HISTORY_CAP: usize = 100;

/// The dedup identity of a probe: (resolvedIp, port, hostname), with a raw-IP
/// input carrying a `None` hostname distinct from any named entry.
type AdmissionKey = (String, u16, Option<String>);

#[derive(Debug, Clone)]
struct Candidate {
    server_address: String,
    hostname: Option<String>,
    resolved_ip: String,
    port: u16,
}

impl Candidate {
    fn key(&self) -> AdmissionKey {
        (self.resolved_ip.clone(), self.port, self.hostname.clone())
    }
}

/// Trim, parse, classify, and resolve one admission input. `None` means the
/// entry is dropped silently: empty after sanitizing, DNS failure, or a
/// private/reserved destination.
async fn resolve_candidate(raw: &str) -> Option<Candidate> {
    let address = sanitize::clean(raw.trim(), MAX_FIELD_BYTES);
    if address.is_empty() {
        return None;
    }
    let (host, port) = resolver::parse_server_address(&address);
    let hostname = if host.parse::<IpAddr>().is_ok() {
        None
    } else {
        Some(host.clone())
    };
    match resolver::resolve_server_ip(&host).await {
        Ok(ip) => Some(Candidate {
            server_address: address,
            hostname,
            resolved_ip: ip.to_string(),
            port,
        }),
        Err(err) => {
            tracing::debug!(address = %address, error = %err, "dropping admission entry");
            None
        }
    }
}

/// Dedup the batch by key and subtract keys already live in the queue.
/// Returns the candidates to insert plus how many were skipped as
/// duplicates; the first occurrence of a key wins.
fn select_new(
    candidates: Vec<Candidate>,
    live: &HashSet<AdmissionKey>,
) -> (Vec<Candidate>, usize) {
    let mut seen = HashSet::new();
    let mut fresh = Vec::new();
    let mut skipped = 0usize;
    for c in candidates {
        let key = c.key();
        if live.contains(&key) || !seen.insert(key) {
            skipped += 1;
            continue;
        }
        fresh.push(c);
    }
    (fresh, skipped)
}

/// Admission: trim, parse, classify, resolve, dedup, enqueue.
///
/// Inputs that fail DNS or resolve into a private range are dropped without
/// counting toward `skipped` — only duplicates (within the batch or against
/// live queue rows) are skipped.
pub async fn add_servers(pool: &PgPool, inputs: &[String]) -> Result<AddServersResponse, ApiError> {
    let mut candidates = Vec::new();
    for raw in inputs {
        if let Some(c) = resolve_candidate(raw).await {
            candidates.push(c);
        }
    }

    let live: HashSet<AdmissionKey> = sqlx::query(
        "SELECT resolved_ip, port, hostname FROM scan_queue WHERE status IN ($1, $2)",
    )
    .bind(STATUS_PENDING)
    .bind(STATUS_PROCESSING)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|row| {
        (
            row.get::<String, _>("resolved_ip"),
            row.get::<i32, _>("port") as u16,
            row.get::<Option<String>, _>("hostname"),
        )
    })
    .collect();

    let (fresh, mut skipped) = select_new(candidates, &live);

    let mut queued = Vec::new();
    for c in fresh {
        // The partial unique index absorbs races with concurrent admissions.
        let id: Option<Uuid> = sqlx::query_scalar(
            "INSERT INTO scan_queue (id, server_address, hostname, resolved_ip, port, status) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (resolved_ip, port, COALESCE(hostname, '')) \
               WHERE status IN ('pending', 'processing') \
             DO NOTHING \
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(&c.server_address)
        .bind(&c.hostname)
        .bind(&c.resolved_ip)
        .bind(c.port as i32)
        .bind(STATUS_PENDING)
        .fetch_optional(pool)
        .await?;
        let Some(id) = id else {
            skipped += 1;
            continue;
        };
        queued.push(QueuedServer {
            id,
            server_address: c.server_address,
            resolved_ip: c.resolved_ip,
            port: c.port,
        });
    }

    Ok(AddServersResponse {
        added: queued.len(),
        skipped,
        queued,
    })
}

/// Claim one pending item for `agent_id`, leasing a proxy and an account in
/// the same transaction. Returns `None` (caller answers 204) when the queue
/// is empty or the resource pools are exhausted — in the latter case the
/// transaction is rolled back and the item stays pending for the next
/// claimer.
pub async fn claim(pool: &PgPool, agent_id: &str) -> Result<Option<ClaimResponse>, ApiError> {
    let mut tx = pool.begin().await?;

    let agent_exists: Option<String> =
        sqlx::query_scalar("SELECT id FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_optional(&mut *tx)
            .await?;
    if agent_exists.is_none() {
        return Err(ApiError::NotFound("agent"));
    }

    let item = sqlx::query_as::<_, QueueRow>(
        "SELECT * FROM scan_queue WHERE status = $1 \
         ORDER BY created_at LIMIT 1 FOR UPDATE SKIP LOCKED",
    )
    .bind(STATUS_PENDING)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(item) = item else {
        return Ok(None);
    };

    let Some(lease) = allocator::allocate(&mut tx).await? else {
        tx.rollback().await?;
        tracing::debug!(queue_id = %item.id, "no proxy/account available, leaving item pending");
        return Ok(None);
    };

    sqlx::query(
        "UPDATE scan_queue SET status = $2, assigned_agent_id = $3, \
           assigned_proxy_id = $4, assigned_account_id = $5, started_at = now() \
         WHERE id = $1",
    )
    .bind(item.id)
    .bind(STATUS_PROCESSING)
    .bind(agent_id)
    .bind(lease.proxy.id)
    .bind(lease.account.id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE agents SET status = $2, current_queue_id = $3, last_heartbeat = now() WHERE id = $1",
    )
    .bind(agent_id)
    .bind(AGENT_BUSY)
    .bind(item.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    tracing::info!(queue_id = %item.id, agent = %agent_id, server = %item.server_address, "claimed");

    let kind = match lease.proxy.proxy_type.as_str() {
        "socks4" => ProxyKind::Socks4,
        _ => ProxyKind::Socks5,
    };
    let account_kind = match lease.account.account_type.as_str() {
        "microsoft" => AccountKind::Microsoft,
        _ => AccountKind::Cracked,
    };
    Ok(Some(ClaimResponse {
        queue_id: item.id,
        server_address: item.server_address,
        port: item.port as u16,
        proxy: ProxyConfig {
            host: lease.proxy.host,
            port: lease.proxy.port as u16,
            kind,
            username: lease.proxy.username,
            password: lease.proxy.password,
        },
        account: AccountLease {
            id: lease.account.id,
            kind: account_kind,
            username: lease.account.username,
            access_token: lease.account.access_token,
            refresh_token: lease.account.refresh_token,
        },
    }))
}

/// Record a successful probe and retire the queue item.
pub async fn complete(pool: &PgPool, queue_id: Uuid, result: ScanResult) -> Result<(), ApiError> {
    finish(pool, queue_id, Some(result), None).await
}

/// Record a failed probe and retire the queue item.
pub async fn fail(pool: &PgPool, queue_id: Uuid, error_message: &str) -> Result<(), ApiError> {
    let message = sanitize::clean(error_message, MAX_FIELD_BYTES);
    finish(pool, queue_id, None, Some(message)).await
}

/// One history entry as stored in `servers.scan_history`; a failure carries
/// `errorMessage` and a null result.
fn history_entry(timestamp: String, result: &Option<Value>, error_message: &Option<String>) -> Value {
    json!({
        "timestamp": timestamp,
        "result": result.clone().unwrap_or(Value::Null),
        "errorMessage": error_message,
    })
}

/// Prepend `entry` to a stored history array, newest first, capped at 100.
fn push_history(stored: Value, entry: Value) -> Vec<Value> {
    let mut history = match stored {
        Value::Array(entries) => entries,
        _ => Vec::new(),
    };
    history.insert(0, entry);
    history.truncate(HISTORY_CAP);
    history
}

/// Terminal transition, one transaction: history upsert, lease release,
/// agent back to idle (cleared before the row goes away), row delete.
/// Items that are missing or not `processing` are ignored, which makes
/// duplicate reports and reports for swept items harmless.
async fn finish(
    pool: &PgPool,
    queue_id: Uuid,
    result: Option<ScanResult>,
    error_message: Option<String>,
) -> Result<(), ApiError> {
    let mut tx = pool.begin().await?;

    let item = sqlx::query_as::<_, QueueRow>(
        "SELECT * FROM scan_queue WHERE id = $1 AND status = $2 FOR UPDATE",
    )
    .bind(queue_id)
    .bind(STATUS_PROCESSING)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(item) = item else {
        return Ok(());
    };

    let now = OffsetDateTime::now_utc();
    let result_value = result.map(|r| serde_json::to_value(r).unwrap_or(Value::Null));
    let entry = history_entry(
        now.format(&Rfc3339).unwrap_or_default(),
        &result_value,
        &error_message,
    );

    let existing = sqlx::query_as::<_, ServerRow>(
        "SELECT * FROM servers \
         WHERE resolved_ip = $1 AND port = $2 AND hostname IS NOT DISTINCT FROM $3 \
         FOR UPDATE",
    )
    .bind(&item.resolved_ip)
    .bind(item.port)
    .bind(&item.hostname)
    .fetch_optional(&mut *tx)
    .await?;

    match existing {
        Some(server) => {
            let history = push_history(server.scan_history, entry);
            sqlx::query(
                "UPDATE servers SET scan_history = $2, scan_count = scan_count + 1, \
                   last_scanned_at = $3, latest_result = $4 \
                 WHERE id = $1",
            )
            .bind(server.id)
            .bind(Value::Array(history))
            .bind(now)
            .bind(&result_value)
            .execute(&mut *tx)
            .await?;
        }
        None => {
            sqlx::query(
                "INSERT INTO servers (id, server_address, hostname, resolved_ip, port, \
                   first_seen_at, last_scanned_at, scan_count, latest_result, scan_history) \
                 VALUES ($1, $2, $3, $4, $5, $6, $6, 1, $7, $8)",
            )
            .bind(Uuid::new_v4())
            .bind(&item.server_address)
            .bind(&item.hostname)
            .bind(&item.resolved_ip)
            .bind(item.port)
            .bind(now)
            .bind(&result_value)
            .bind(Value::Array(vec![entry]))
            .execute(&mut *tx)
            .await?;
        }
    }

    if let (Some(proxy_id), Some(account_id)) = (item.assigned_proxy_id, item.assigned_account_id) {
        allocator::release(&mut tx, proxy_id, account_id).await?;
    }
    if let Some(agent_id) = &item.assigned_agent_id {
        sqlx::query("UPDATE agents SET status = $2, current_queue_id = NULL WHERE id = $1")
            .bind(agent_id)
            .bind(AGENT_IDLE)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("DELETE FROM scan_queue WHERE id = $1")
        .bind(queue_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Operator sweep: fail items stuck in `processing` longer than
/// `older_than`. Each item goes through the ordinary `fail` path so lease
/// release and history stay uniform.
pub async fn fail_stale(pool: &PgPool, older_than: Duration) -> Result<u64, ApiError> {
    let cutoff = OffsetDateTime::now_utc() - older_than;
    let ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM scan_queue WHERE status = $1 AND started_at < $2",
    )
    .bind(STATUS_PROCESSING)
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    let count = ids.len() as u64;
    for id in ids {
        tracing::warn!(queue_id = %id, "failing stale processing item");
        fail(pool, id, "processing timeout exceeded").await?;
    }
    Ok(count)
}

/// Dashboard counters. `completed`/`failed` are derived from the bounded
/// scan histories since terminal queue rows are deleted.
pub async fn stats(pool: &PgPool) -> Result<QueueStats, ApiError> {
    let queue = sqlx::query(
        "SELECT \
           count(*) FILTER (WHERE status = $1) AS pending, \
           count(*) FILTER (WHERE status = $2) AS processing \
         FROM scan_queue",
    )
    .bind(STATUS_PENDING)
    .bind(STATUS_PROCESSING)
    .fetch_one(pool)
    .await?;

    let history = sqlx::query(
        "SELECT \
           count(*) FILTER (WHERE e->>'errorMessage' IS NULL) AS completed, \
           count(*) FILTER (WHERE e->>'errorMessage' IS NOT NULL) AS failed \
         FROM servers CROSS JOIN LATERAL jsonb_array_elements(scan_history) AS e",
    )
    .fetch_one(pool)
    .await?;

    let total_servers: i64 = sqlx::query_scalar("SELECT count(*) FROM servers")
        .fetch_one(pool)
        .await?;

    Ok(QueueStats {
        pending: queue.get("pending"),
        processing: queue.get("processing"),
        completed: history.get("completed"),
        failed: history.get("failed"),
        total_servers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(address: &str, ip: &str, port: u16, hostname: Option<&str>) -> Candidate {
        Candidate {
            server_address: address.to_string(),
            hostname: hostname.map(str::to_string),
            resolved_ip: ip.to_string(),
            port,
        }
    }

    #[test]
    fn inputs_sharing_a_key_collapse_to_one() {
        // "mc.example.com:25565" and "mc.example.com" resolve to the same
        // (ip, port, hostname) key; only the first survives
        let batch = vec![
            candidate("mc.example.com:25565", "93.184.216.34", 25565, Some("mc.example.com")),
            candidate("mc.example.com", "93.184.216.34", 25565, Some("mc.example.com")),
        ];
        let (fresh, skipped) = select_new(batch, &HashSet::new());
        assert_eq!((fresh.len(), skipped), (1, 1));
        assert_eq!(fresh[0].server_address, "mc.example.com:25565");
    }

    #[test]
    fn raw_ip_and_hostname_entries_stay_distinct() {
        let batch = vec![
            candidate("93.184.216.34", "93.184.216.34", 25565, None),
            candidate("mc.example.com", "93.184.216.34", 25565, Some("mc.example.com")),
        ];
        let (fresh, skipped) = select_new(batch, &HashSet::new());
        assert_eq!((fresh.len(), skipped), (2, 0));
    }

    #[test]
    fn live_queue_keys_are_subtracted() {
        let live: HashSet<AdmissionKey> = [(
            "93.184.216.34".to_string(),
            25565,
            Some("mc.example.com".to_string()),
        )]
        .into_iter()
        .collect();
        let batch = vec![
            candidate("mc.example.com", "93.184.216.34", 25565, Some("mc.example.com")),
            candidate("other.example.net", "198.51.100.4", 25565, Some("other.example.net")),
        ];
        let (fresh, skipped) = select_new(batch, &live);
        assert_eq!((fresh.len(), skipped), (1, 1));
        assert_eq!(fresh[0].resolved_ip, "198.51.100.4");
    }

    #[tokio::test]
    async fn private_input_is_dropped_not_skipped() {
        assert!(resolve_candidate("10.0.0.5").await.is_none());
        // a batch of nothing admits nothing and skips nothing
        let (fresh, skipped) = select_new(Vec::new(), &HashSet::new());
        assert_eq!((fresh.len(), skipped), (0, 0));
    }

    #[tokio::test]
    async fn literal_input_parses_and_classifies() {
        let c = resolve_candidate("  93.184.216.34:25570 ").await.unwrap();
        assert_eq!(c.resolved_ip, "93.184.216.34");
        assert_eq!(c.port, 25570);
        assert_eq!(c.hostname, None);
        assert_eq!(c.server_address, "93.184.216.34:25570");
    }

    #[test]
    fn history_prepends_newest_first_and_caps() {
        let stored = Value::Array(
            (0..HISTORY_CAP)
                .map(|i| json!({ "timestamp": i.to_string() }))
                .collect(),
        );
        let history = push_history(stored, json!({ "timestamp": "new" }));
        assert_eq!(history.len(), HISTORY_CAP);
        assert_eq!(history[0]["timestamp"], "new");
        // the oldest entry fell off the end
        assert_eq!(history[HISTORY_CAP - 1]["timestamp"], (HISTORY_CAP - 2).to_string());
    }

    #[test]
    fn corrupt_stored_history_resets_to_one_entry() {
        let history = push_history(Value::Null, json!({ "timestamp": "only" }));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn failure_entries_carry_message_and_null_result() {
        let entry = history_entry(
            "2026-08-01T00:00:00Z".to_string(),
            &None,
            &Some("processing timeout exceeded".to_string()),
        );
        assert_eq!(entry["result"], Value::Null);
        assert_eq!(entry["errorMessage"], "processing timeout exceeded");

        let ok = history_entry("2026-08-01T00:00:00Z".to_string(), &Some(json!({"success": true})), &None);
        assert_eq!(ok["result"]["success"], true);
        assert_eq!(ok["errorMessage"], Value::Null);
    }
}
