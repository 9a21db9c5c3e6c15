//! Cloud Run MCP Server
//!
//! Serves MCP over HTTP until interrupted.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cloud_run_mcp::config::{Args, Config};
use cloud_run_mcp::error::Result;
use cloud_run_mcp::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize logging
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Build configuration from args
    let config: Config = args.into();

    info!("Cloud Run MCP Server v{}", VERSION);
    info!(
        "Project: {}, region: {}",
        config.project.as_deref().unwrap_or("(auto)"),
        config.region.as_deref().unwrap_or("(auto)")
    );

    tokio::select! {
        result = cloud_run_mcp::http::start_server(&config) => {
            if let Err(e) = &result {
                error!("Server error: {}", e);
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down server...");
            std::process::exit(0);
        }
    }
}
