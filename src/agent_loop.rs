use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use time::OffsetDateTime;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::resolver;
use crate::sanitize::{self, MAX_LOG_BYTES};
use crate::scanner::{self, ScanOptions};
use crate::types::{
    ClaimRequest, ClaimResponse, CompleteRequest, FailRequest, HeartbeatRequest, RegisterRequest,
    RegisterResponse, ScanResult, TaskLogEntry, TaskLogsRequest,
};

/// Terminal outcome reports get this many attempts before giving up.
const REPORT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub coordinator_url: String,
    pub agent_id: String,
    pub poll_interval: Duration,
    /// Hard cap racing the whole scan, SRV lookup and retries included.
    pub scan_deadline: Duration,
    pub heartbeat_interval: Duration,
}

impl AgentConfig {
    pub fn new(coordinator_url: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            coordinator_url: coordinator_url.into(),
            agent_id: agent_id.into(),
            poll_interval: Duration::from_millis(5000),
            scan_deadline: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Per-task log buffer, threaded explicitly through the dispatch loop and
/// shipped to the coordinator after the terminal report.
#[derive(Debug, Default)]
pub struct TaskLog {
    pub entries: Vec<TaskLogEntry>,
}

impl TaskLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, level: &str, message: impl AsRef<str>) {
        self.entries.push(TaskLogEntry {
            level: level.to_string(),
            message: sanitize::clean(message.as_ref(), MAX_LOG_BYTES),
            timestamp: OffsetDateTime::now_utc(),
        });
    }
}

/// Typed HTTP client for the coordinator's agent-facing API.
pub struct CoordinatorClient {
    http: reqwest::Client,
    base: String,
    agent_id: String,
}

impl CoordinatorClient {
    pub fn new(base: &str, agent_id: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("http client builds");
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            agent_id: agent_id.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub async fn register(&self) -> Result<RegisterResponse> {
        let resp = self
            .http
            .post(self.url("/api/agents/register"))
            .json(&RegisterRequest {
                agent_id: self.agent_id.clone(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// `Ok(false)` means the coordinator no longer knows this agent and a
    /// re-registration is due.
    pub async fn heartbeat(&self) -> Result<bool> {
        let resp = self
            .http
            .post(self.url("/api/agents/heartbeat"))
            .json(&HeartbeatRequest {
                agent_id: self.agent_id.clone(),
                status: None,
                current_queue_id: None,
            })
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.error_for_status()?;
        Ok(true)
    }

    pub async fn claim(&self) -> Result<Option<ClaimResponse>> {
        let resp = self
            .http
            .post(self.url("/api/queue/claim"))
            .json(&ClaimRequest {
                agent_id: self.agent_id.clone(),
            })
            .send()
            .await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        Ok(Some(resp.json().await?))
    }

    async fn complete_once(&self, queue_id: Uuid, result: &ScanResult) -> Result<()> {
        self.http
            .post(self.url(&format!("/api/queue/{queue_id}/complete")))
            .json(&CompleteRequest {
                result: result.clone(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn fail_once(&self, queue_id: Uuid, message: &str) -> Result<()> {
        self.http
            .post(self.url(&format!("/api/queue/{queue_id}/fail")))
            .json(&FailRequest {
                error_message: message.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn complete_with_retry(&self, queue_id: Uuid, result: &ScanResult) -> Result<()> {
        report_with_retry(|| self.complete_once(queue_id, result)).await
    }

    pub async fn fail_with_retry(&self, queue_id: Uuid, message: &str) -> Result<()> {
        report_with_retry(|| self.fail_once(queue_id, message)).await
    }

    pub async fn push_logs(&self, queue_id: Uuid, logs: &[TaskLogEntry]) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }
        self.http
            .post(self.url(&format!("/api/tasks/{queue_id}/logs")))
            .json(&TaskLogsRequest {
                agent_id: self.agent_id.clone(),
                logs: logs.to_vec(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Up to three attempts with 2·k-second pauses. Exactly one terminal report
/// must land; when all attempts are gone the caller logs CRITICAL and leaves
/// the item to the coordinator's sweep.
async fn report_with_retry<F, Fut>(mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut last_error = None;
    for attempt in 1..=REPORT_ATTEMPTS {
        match op().await {
            Ok(()) => return Ok(()),
            Err(err) => last_error = Some(err),
        }
        if attempt < REPORT_ATTEMPTS {
            sleep(Duration::from_secs(2 * attempt as u64)).await;
        }
    }
    Err(last_error.expect("at least one attempt ran"))
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("SIGTERM handler installs");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received, finishing current item");
        cancel.cancel();
    });
}

/// Dispatch loop: heartbeat in the background, poll → claim → scan → report
/// until a signal arrives. The in-flight item is always finished first.
pub async fn run(config: AgentConfig) -> Result<()> {
    let client = Arc::new(CoordinatorClient::new(
        &config.coordinator_url,
        &config.agent_id,
    ));
    let registered = client.register().await.context("registering with coordinator")?;
    tracing::info!(agent = %registered.agent_name, "registered");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let hb_client = client.clone();
    let hb_cancel = cancel.clone();
    let hb_interval = config.heartbeat_interval;
    let heartbeat = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hb_cancel.cancelled() => break,
                _ = sleep(hb_interval) => {}
            }
            match hb_client.heartbeat().await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!("coordinator expired this agent, re-registering");
                    if let Err(err) = hb_client.register().await {
                        tracing::warn!(error = %err, "re-registration failed");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "heartbeat failed"),
            }
        }
    });

    while !cancel.is_cancelled() {
        let claimed = tokio::select! {
            _ = cancel.cancelled() => break,
            r = client.claim() => r,
        };
        match claimed {
            Ok(Some(task)) => process_task(&client, &config, task).await,
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(config.poll_interval) => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "claim failed");
                if let Err(err) = client.register().await {
                    tracing::warn!(error = %err, "re-registration failed");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(config.poll_interval) => {}
                }
            }
        }
    }

    heartbeat.abort();
    tracing::info!("agent stopped");
    Ok(())
}

async fn process_task(client: &CoordinatorClient, config: &AgentConfig, task: ClaimResponse) {
    let mut log = TaskLog::new();
    let (host, _) = resolver::parse_server_address(&task.server_address);
    log.push(
        "info",
        format!(
            "scanning {host}:{} via {}:{}",
            task.port, task.proxy.host, task.proxy.port
        ),
    );

    let mut opts = ScanOptions::new(host, task.proxy.clone());
    opts.port = Some(task.port);

    let report = match timeout(config.scan_deadline, scanner::scan(&opts)).await {
        Ok(result) if result.success => {
            log.push("info", format!("status received in {} attempt(s)", result.attempts));
            client.complete_with_retry(task.queue_id, &result).await
        }
        Ok(result) => {
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| "scan failed".to_string());
            log.push("warn", &message);
            client.fail_with_retry(task.queue_id, &message).await
        }
        Err(_) => {
            let message = format!("scan exceeded {}s deadline", config.scan_deadline.as_secs());
            log.push("warn", &message);
            client.fail_with_retry(task.queue_id, &message).await
        }
    };

    if let Err(err) = report {
        // The coordinator sweep will reclaim the lease eventually.
        tracing::error!(queue_id = %task.queue_id, error = %err, "CRITICAL: terminal report failed");
        log.push("critical", format!("terminal report failed: {err}"));
    }
    if let Err(err) = client.push_logs(task.queue_id, &log.entries).await {
        tracing::debug!(error = %err, "task log shipping failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn report_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = report_with_retry(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    anyhow::bail!("transient")
                }
                Ok(())
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn report_gives_up_after_three() {
        let calls = AtomicU32::new(0);
        let result = report_with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("down") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn task_log_sanitizes() {
        let mut log = TaskLog::new();
        log.push("info", "line\nbreak");
        assert_eq!(log.entries[0].message, "linebreak");
    }
}
