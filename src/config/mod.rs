//! Server Configuration
//!
//! Every flag has an environment fallback so the server can be driven
//! either from an MCP client's `args` array or from its `env` map.
//! Configuration is parsed once at startup and immutable afterwards.

use clap::{ArgAction, Parser, ValueEnum};

use crate::db::DbConfig;
use crate::masking::{MaskRuleSet, Masker};
use crate::pipeline::PipelineConfig;
use crate::tools::ServerIdentity;

/// How the MCP endpoint is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// JSON-RPC over stdin/stdout (the default for desktop clients)
    Stdio,
    /// HTTP POST endpoint at /mcp
    StreamableHttp,
    /// Server-sent events at /sse with POST /messages
    Sse,
}

/// GreptimeDB MCP server configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "greptime-mcp")]
#[command(about = "MCP server for GreptimeDB with query admission control and result masking")]
#[command(version)]
pub struct Config {
    /// GreptimeDB host
    #[arg(long, env = "GREPTIMEDB_HOST", default_value = "localhost")]
    pub host: String,

    /// GreptimeDB MySQL protocol port
    #[arg(long, env = "GREPTIMEDB_PORT", default_value_t = 4002)]
    pub port: u16,

    /// GreptimeDB database name
    #[arg(long, env = "GREPTIMEDB_DATABASE", default_value = "public")]
    pub database: String,

    /// GreptimeDB username
    #[arg(long, env = "GREPTIMEDB_USER", default_value = "")]
    pub user: String,

    /// GreptimeDB password
    #[arg(long, env = "GREPTIMEDB_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,

    /// Session time zone, e.g. "+08:00" (empty leaves the server default)
    #[arg(long = "timezone", env = "GREPTIMEDB_TIMEZONE", default_value = "")]
    pub timezone: String,

    /// Connection pool size
    #[arg(long, env = "GREPTIMEDB_POOL_SIZE", default_value_t = 5)]
    pub pool_size: usize,

    /// Per-operation timeout in seconds (pool checkout and query)
    #[arg(long, env = "GREPTIMEDB_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// GreptimeDB HTTP API port (pipeline management)
    #[arg(long, env = "GREPTIMEDB_HTTP_PORT", default_value_t = 4000)]
    pub http_port: u16,

    /// Protocol for the HTTP API
    #[arg(long, env = "GREPTIMEDB_HTTP_PROTOCOL", default_value = "http",
          value_parser = ["http", "https"])]
    pub http_protocol: String,

    /// Mask sensitive columns in query results
    #[arg(long, env = "GREPTIMEDB_MASK_ENABLED", default_value_t = true,
          action = ArgAction::Set)]
    pub mask_enabled: bool,

    /// Additional sensitive column patterns (comma-separated)
    #[arg(long, env = "GREPTIMEDB_MASK_PATTERNS", default_value = "")]
    pub mask_patterns: String,

    /// Emit one audit line per tool invocation
    #[arg(long, env = "GREPTIMEDB_AUDIT_ENABLED", default_value_t = true,
          action = ArgAction::Set)]
    pub audit_enabled: bool,

    /// MCP transport
    #[arg(long, env = "MCP_TRANSPORT", value_enum, default_value_t = Transport::Stdio)]
    pub transport: Transport,

    /// Bind address for the HTTP transports
    #[arg(long, env = "MCP_LISTEN_HOST", default_value = "127.0.0.1")]
    pub listen_host: String,

    /// Bind port for the HTTP transports
    #[arg(long, env = "MCP_LISTEN_PORT", default_value_t = 8080)]
    pub listen_port: u16,
}

impl Config {
    #[must_use]
    pub fn db_config(&self) -> DbConfig {
        DbConfig {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            timezone: self.timezone.clone(),
            pool_size: self.pool_size,
            timeout_secs: self.timeout_secs,
        }
    }

    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            base_url: format!("{}://{}:{}", self.http_protocol, self.host, self.http_port),
            user: self.user.clone(),
            password: self.password.clone(),
            timeout_secs: self.timeout_secs,
        }
    }

    #[must_use]
    pub fn masker(&self) -> Masker {
        Masker::new(self.mask_enabled, MaskRuleSet::new(&self.mask_patterns))
    }

    #[must_use]
    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
        }
    }
}
