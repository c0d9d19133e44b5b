//! Coordinator-client tests against a wiremock double of the HTTP API.

use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mc_scan_rs::agent_loop::CoordinatorClient;
use mc_scan_rs::types::{ScanResult, TaskLogEntry};

fn sample_result() -> ScanResult {
    ScanResult {
        success: true,
        host: "mc.example.com".to_string(),
        port: 25565,
        resolved_ip: Some("93.184.216.34".to_string()),
        status: None,
        attempts: 1,
        timestamp: OffsetDateTime::UNIX_EPOCH,
        error: None,
    }
}

#[tokio::test]
async fn register_parses_agent_name() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/agents/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true, "agentId": "agent-3", "agentName": "Agent 3"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = CoordinatorClient::new(&server.uri(), "agent-3");
    let resp = client.register().await.unwrap();
    assert_eq!(resp.agent_name, "Agent 3");
}

#[tokio::test]
async fn empty_queue_claim_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/queue/claim"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = CoordinatorClient::new(&server.uri(), "agent-1");
    assert!(client.claim().await.unwrap().is_none());
}

#[tokio::test]
async fn claim_decodes_lease() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/queue/claim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "queueId": "6a0b0c7e-1111-2222-3333-444455556666",
            "serverAddress": "mc.example.com",
            "port": 25565,
            "proxy": {"host": "5.6.7.8", "port": 1080, "type": "socks4", "username": "u", "password": "p"},
            "account": {"id": "9a0b0c7e-1111-2222-3333-444455556666", "type": "microsoft",
                        "username": "probe", "accessToken": "tok"}
        })))
        .mount(&server)
        .await;

    let client = CoordinatorClient::new(&server.uri(), "agent-1");
    let claim = client.claim().await.unwrap().unwrap();
    assert_eq!(claim.server_address, "mc.example.com");
    assert_eq!(claim.proxy.username.as_deref(), Some("u"));
    assert_eq!(claim.account.access_token.as_deref(), Some("tok"));
}

#[tokio::test]
async fn heartbeat_reports_expiry_as_false() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/agents/heartbeat"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "agent not found"})))
        .mount(&server)
        .await;

    let client = CoordinatorClient::new(&server.uri(), "agent-1");
    assert!(!client.heartbeat().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn complete_retries_transient_failures() {
    let queue_id = Uuid::new_v4();
    let server = MockServer::start().await;
    // two 500s, then success
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/{queue_id}/complete")))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/{queue_id}/complete")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let client = CoordinatorClient::new(&server.uri(), "agent-1");
    client
        .complete_with_retry(queue_id, &sample_result())
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn fail_report_gives_up_after_three_attempts() {
    let queue_id = Uuid::new_v4();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/api/queue/{queue_id}/fail")))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let client = CoordinatorClient::new(&server.uri(), "agent-1");
    assert!(client.fail_with_retry(queue_id, "boom").await.is_err());
}

#[tokio::test]
async fn log_shipping_posts_entries() {
    let queue_id = Uuid::new_v4();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/api/tasks/{queue_id}/logs")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let client = CoordinatorClient::new(&server.uri(), "agent-1");
    let logs = vec![TaskLogEntry {
        level: "info".to_string(),
        message: "claimed".to_string(),
        timestamp: OffsetDateTime::UNIX_EPOCH,
    }];
    client.push_logs(queue_id, &logs).await.unwrap();

    // empty batches are not shipped at all
    client.push_logs(queue_id, &[]).await.unwrap();
}
