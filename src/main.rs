//! GreptimeDB MCP Server Entry Point
//!
//! Parses configuration, wires the dispatcher, and runs the selected
//! transport. All logging goes to stderr; stdout belongs to the stdio
//! transport.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use greptime_mcp::config::{Config, Transport};
use greptime_mcp::db::GreptimeExecutor;
use greptime_mcp::gate::DenyPolicy;
use greptime_mcp::mcp::{self, McpServer};
use greptime_mcp::pipeline::HttpTransport;
use greptime_mcp::tools::Dispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    greptime_mcp::audit::set_enabled(config.audit_enabled);

    tracing::info!(
        host = %config.host,
        port = config.port,
        database = %config.database,
        mask_enabled = config.mask_enabled,
        "starting GreptimeDB MCP server"
    );

    let executor =
        GreptimeExecutor::new(&config.db_config()).context("failed to build connection pool")?;
    let transport =
        HttpTransport::new(&config.pipeline_config()).context("failed to build pipeline client")?;

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(executor),
        Box::new(transport),
        DenyPolicy::new(),
        config.masker(),
        config.identity(),
    ));
    let server = McpServer::new(dispatcher);

    match config.transport {
        Transport::Stdio => mcp::serve_stdio(server).await,
        Transport::StreamableHttp | Transport::Sse => {
            mcp::serve_http(server, &config.listen_host, config.listen_port).await
        }
    }
}
