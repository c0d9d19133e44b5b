use std::time::Duration;

use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout, Instant};

use crate::error::ScanError;
use crate::protocol::{self, FrameEvent, StatusFramer};
use crate::resolver::{self, DEFAULT_PORT};
use crate::socks::ProxyConfig;
use crate::types::{ScanResult, StatusPayload};

/// Retry backoff never sleeps longer than this.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Parameters for one probe. All scan traffic is tunneled through `proxy`.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub host: String,
    /// Explicit destination port. `None` means the default 25565 and makes
    /// the host eligible for SRV substitution.
    pub port: Option<u16>,
    /// Per-attempt deadline covering tunnel setup and the packet exchange.
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub protocol_version: i32,
    pub ping: bool,
    pub srv_lookup: bool,
    pub proxy: ProxyConfig,
}

impl ScanOptions {
    pub fn new(host: impl Into<String>, proxy: ProxyConfig) -> Self {
        Self {
            host: host.into(),
            port: None,
            timeout: Duration::from_secs(5),
            retries: 3,
            retry_delay: Duration::from_secs(1),
            protocol_version: protocol::PROTOCOL_VERSION,
            ping: true,
            srv_lookup: false,
            proxy,
        }
    }
}

/// Sleep before retry `attempt` (1-based): `retry_delay * 2^(attempt-1)`,
/// capped at 30 s.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << (attempt - 1).min(16)).min(MAX_BACKOFF)
}

/// Probe one server: SRV substitution, SOCKS tunnel, handshake/status
/// exchange, optional ping for latency. Never panics and never returns an
/// `Err` — failures are folded into the returned [`ScanResult`].
pub async fn scan(opts: &ScanOptions) -> ScanResult {
    let mut target = opts.host.clone();
    let mut target_port = opts.port;

    if opts.srv_lookup && opts.port.is_none() {
        if let Some((srv_target, srv_port)) = resolver::lookup_srv(&opts.host).await {
            tracing::debug!(host = %opts.host, target = %srv_target, port = srv_port, "srv record substituted");
            target = srv_target;
            target_port = Some(srv_port);
        }
    }
    let port = target_port.unwrap_or(DEFAULT_PORT);

    let resolved_ip = match resolver::resolve_server_ip(&target).await {
        Ok(ip) => ip.to_string(),
        Err(err) => {
            return ScanResult {
                success: false,
                host: opts.host.clone(),
                port,
                resolved_ip: None,
                status: None,
                attempts: 0,
                timestamp: OffsetDateTime::now_utc(),
                error: Some(err.to_string()),
            }
        }
    };

    let attempts = opts.retries.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match timeout(opts.timeout, attempt_probe(&target, port, opts)).await {
            Ok(Ok(status)) => {
                return ScanResult {
                    success: true,
                    host: opts.host.clone(),
                    port,
                    resolved_ip: Some(resolved_ip),
                    status: Some(status),
                    attempts: attempt,
                    timestamp: OffsetDateTime::now_utc(),
                    error: None,
                };
            }
            Ok(Err(err)) => last_error = Some(err),
            Err(_) => last_error = Some(ScanError::Timeout(opts.timeout)),
        }
        if attempt < attempts {
            sleep(backoff_delay(opts.retry_delay, attempt)).await;
        }
    }

    ScanResult {
        success: false,
        host: opts.host.clone(),
        port,
        resolved_ip: Some(resolved_ip),
        status: None,
        attempts,
        timestamp: OffsetDateTime::now_utc(),
        error: last_error.map(|e| e.to_string()),
    }
}

async fn attempt_probe(
    host: &str,
    port: u16,
    opts: &ScanOptions,
) -> Result<StatusPayload, ScanError> {
    let mut stream = crate::socks::connect_via_proxy(&opts.proxy, host, port, opts.timeout).await?;

    stream
        .write_all(&protocol::handshake_packet(opts.protocol_version, host, port))
        .await?;
    stream.write_all(&protocol::status_request_packet()).await?;

    let mut framer = StatusFramer::new();
    let mut chunk = [0u8; 4096];
    let raw = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ScanError::ConnectionClosed);
        }
        if let Some(FrameEvent::Status(json)) = framer.push(&chunk[..n])? {
            break json;
        }
    };

    let mut latency = None;
    if opts.ping {
        let echo = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        let sent = Instant::now();
        stream.write_all(&protocol::ping_packet(echo)).await?;
        latency = match framer.expect_pong()? {
            Some(FrameEvent::Pong) => Some(sent.elapsed().as_millis() as i64),
            _ => wait_for_pong(&mut stream, &mut framer, sent).await,
        };
    }

    // Parse failures are tolerated: raw is preserved and data stays None.
    let data = serde_json::from_str(&raw).ok();
    Ok(StatusPayload { raw, data, latency })
}

/// Read until the pong frame shows up. A close or frame error here does not
/// fail the probe — the status response is already in hand.
async fn wait_for_pong(
    stream: &mut crate::socks::TunnelStream,
    framer: &mut StatusFramer,
    sent: Instant,
) -> Option<i64> {
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        match framer.push(&chunk[..n]) {
            Ok(Some(FrameEvent::Pong)) => return Some(sent.elapsed().as_millis() as i64),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 6), Duration::from_secs(30));
        assert_eq!(backoff_delay(base, 31), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn private_destination_fails_without_attempts() {
        let proxy = ProxyConfig {
            host: "198.51.100.9".to_string(),
            port: 1080,
            kind: Default::default(),
            username: None,
            password: None,
        };
        let mut opts = ScanOptions::new("192.168.1.50", proxy);
        opts.retries = 1;
        let result = scan(&opts).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 0);
        assert!(result.error.unwrap().contains("private"));
    }
}
