use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use feeder_mcp::config::{Config, Transport, DEFAULT_CONFIG_PATH};
use feeder_mcp::mcp::McpServer;
use feeder_mcp::telemetry::{init_tracing, shutdown_signal};
use feeder_mcp::Session;

#[derive(Debug, Parser)]
#[command(name = "feeder-mcp", version, about = "Distribution feeder analysis tools over MCP or HTTP")]
struct Cli {
    /// Configuration file (TOML). Missing files fall back to defaults.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override `server.transport`.
    #[arg(short, long)]
    transport: Option<Transport>,

    /// Override `server.port` (HTTP only).
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("failed to read .env: {e}");
        }
    }
    let cli = Cli::parse();

    let mut cfg = Config::load_from(&cli.config)?;
    if let Some(transport) = cli.transport {
        cfg.server.transport = transport;
    }
    if let Some(port) = cli.port {
        cfg.server.port = port;
    }
    init_tracing(&cfg.logging.filter);
    info!(
        config = %cli.config.display(),
        transport = %cfg.server.transport,
        "starting feeder-mcp"
    );

    let session = Session::with_config(cfg.clone()).shared();
    match cfg.server.transport {
        Transport::Stdio => McpServer::new(session).run_stdio(shutdown_signal()).await?,
        Transport::Http => serve_http(session, &cfg).await?,
    }

    info!("feeder-mcp stopped");
    Ok(())
}

#[cfg(feature = "http")]
async fn serve_http(session: feeder_mcp::session::SharedSession, cfg: &Config) -> Result<()> {
    if cfg.server.host == "0.0.0.0" {
        warn!("HTTP server binding to 0.0.0.0; tools are reachable from the network without authentication");
    }
    feeder_mcp::api::serve(feeder_mcp::api::AppState { session }, cfg, shutdown_signal()).await
}

#[cfg(not(feature = "http"))]
async fn serve_http(_session: feeder_mcp::session::SharedSession, _cfg: &Config) -> Result<()> {
    warn!("HTTP transport requested but this build has no `http` feature");
    anyhow::bail!("built without the `http` feature; use --transport stdio")
}
