use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mc_scan_rs::server::{self, AppState};
use mc_scan_rs::{db, queue};

/// Coordinator for the distributed Minecraft status scanner: owns the scan
/// queue, the proxy/account pools, and the agent registry.
#[derive(Debug, Clone, Parser)]
#[command(name = "coordinator", version, about)]
struct Cli {
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Bind address for the HTTP API.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Secret required in X-API-Key on operator endpoints.
    #[arg(long, env = "RECONMC_API_KEY")]
    api_key: Option<String>,

    /// Disable operator authentication entirely (development only).
    #[arg(long, env = "RECONMC_DISABLE_AUTH")]
    disable_auth: bool,

    /// Comma-separated list of allowed CORS origins; unset allows any.
    #[arg(long, env = "CORS_ORIGINS")]
    cors_origins: Option<String>,

    /// How often to sweep for stuck processing items.
    #[arg(long, default_value_t = 300)]
    sweep_interval_secs: u64,

    /// Processing items older than this are failed by the sweep.
    #[arg(long, default_value_t = 600)]
    stale_after_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let api_key = if cli.disable_auth {
        tracing::warn!("operator authentication is DISABLED");
        None
    } else {
        match cli.api_key {
            Some(key) if !key.is_empty() => Some(key),
            _ => bail!("RECONMC_API_KEY is required unless RECONMC_DISABLE_AUTH is set"),
        }
    };

    let pool = db::connect(&cli.database_url).await?;
    let state = AppState {
        pool: pool.clone(),
        api_key,
    };

    let sweep_interval = Duration::from_secs(cli.sweep_interval_secs.max(1));
    let stale_after = Duration::from_secs(cli.stale_after_secs.max(1));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(sweep_interval).await;
            match queue::fail_stale(&pool, stale_after).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(count = n, "sweep failed stale items"),
                Err(err) => tracing::warn!(error = %err, "stale sweep failed"),
            }
        }
    });

    let bind = format!("{}:{}", cli.host, cli.port);
    let cors = server::cors_layer(cli.cors_origins.as_deref());
    server::serve(state, &bind, cors, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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
    tracing::info!("shutting down");
}
