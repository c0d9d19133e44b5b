use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::socks::ProxyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Microsoft,
    Cracked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub ok: bool,
    pub agent_id: String,
    pub agent_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_queue_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub agent_id: String,
}

/// Minecraft credential leased alongside a proxy for one probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountLease {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: AccountKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub queue_id: Uuid,
    pub server_address: String,
    pub port: u16,
    pub proxy: ProxyConfig,
    pub account: AccountLease,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub result: ScanResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailRequest {
    pub error_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLogEntry {
    pub level: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLogsRequest {
    pub agent_id: String,
    pub logs: Vec<TaskLogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddServersRequest {
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedServer {
    pub id: Uuid,
    pub server_address: String,
    pub resolved_ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddServersResponse {
    pub added: usize,
    pub skipped: usize,
    pub queued: Vec<QueuedServer>,
}

/// Aggregate queue/server counters for the dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total_servers: i64,
}

/// Decoded status exchange. `raw` is always the verbatim JSON string the
/// server sent; `data` is its parse when the payload was valid JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub raw: String,
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub success: bool,
    pub host: String,
    pub port: u16,
    pub resolved_ip: Option<String>,
    pub status: Option<StatusPayload>,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_response_wire_shape() {
        let json = r#"{
            "queueId": "8f2e7b9a-4c31-4a1d-9a65-0f6a2b3c4d5e",
            "serverAddress": "mc.example.com:25565",
            "port": 25565,
            "proxy": {"host": "5.6.7.8", "port": 1080, "type": "socks5"},
            "account": {"id": "11111111-2222-3333-4444-555555555555", "type": "cracked", "username": "probe"}
        }"#;
        let claim: ClaimResponse = serde_json::from_str(json).unwrap();
        assert_eq!(claim.port, 25565);
        assert_eq!(claim.account.kind, AccountKind::Cracked);
    }

    #[test]
    fn scan_result_round_trip() {
        let result = ScanResult {
            success: true,
            host: "mc.example.com".to_string(),
            port: 25565,
            resolved_ip: Some("93.184.216.34".to_string()),
            status: Some(StatusPayload {
                raw: r#"{"players":{"online":1,"max":20}}"#.to_string(),
                data: serde_json::from_str(r#"{"players":{"online":1,"max":20}}"#).ok(),
                latency: Some(42),
            }),
            attempts: 1,
            timestamp: OffsetDateTime::UNIX_EPOCH,
            error: None,
        };
        let text = serde_json::to_string(&result).unwrap();
        assert!(text.contains("\"resolvedIp\""));
        let back: ScanResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back.status.unwrap().latency, Some(42));
    }
}
