//! microsandbox-gateway
//!
//! MCP server that multiplexes client requests onto a bounded pool of
//! reusable remote sandbox sessions. Configuration is read entirely from
//! `MSB_*` environment variables (see `config::GatewayConfig::from_env`).

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use microsandbox_gateway::{config::GatewayConfig, gateway::Gateway, mcp};

#[derive(Parser, Debug)]
#[command(name = "microsandbox-gateway")]
#[command(about = "Session manager and gateway for a remote microsandbox execution server")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with_writer(std::io::stderr)
        .init();

    let config = GatewayConfig::from_env().context("failed to load gateway configuration")?;
    info!(server_url = %config.server_url, "Loaded configuration");

    let gateway = Arc::new(Gateway::new(config));
    gateway.start();

    if args.stdio {
        mcp::serve_stdio(gateway).await?;
    } else {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    Ok(())
}
