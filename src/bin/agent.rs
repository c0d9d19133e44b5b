use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mc_scan_rs::agent_loop::{self, AgentConfig};

/// Ephemeral scan agent: polls the coordinator, claims one probe at a time,
/// scans through the leased SOCKS proxy, and reports back.
#[derive(Debug, Clone, Parser)]
#[command(name = "agent", version, about)]
struct Cli {
    /// Base URL of the coordinator, e.g. http://coordinator:3000
    #[arg(long, env = "COORDINATOR_URL")]
    coordinator_url: String,

    /// Stable agent identity; generated from the PID when unset.
    #[arg(long, env = "AGENT_ID")]
    agent_id: Option<String>,

    /// Sleep between empty claim polls.
    #[arg(long = "poll-interval-ms", env = "POLL_INTERVAL_MS", default_value_t = 5000)]
    poll_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let agent_id = cli
        .agent_id
        .unwrap_or_else(|| format!("agent-{}", std::process::id()));

    let mut config = AgentConfig::new(cli.coordinator_url, agent_id);
    config.poll_interval = Duration::from_millis(cli.poll_interval_ms.max(100));
    agent_loop::run(config).await
}
