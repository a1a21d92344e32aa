//! GreptimeDB MCP Server
//!
//! An MCP (Model Context Protocol) server that gives AI agents read
//! access to GreptimeDB with defense in depth: every free-text query
//! passes a lexical admission gate before touching the database, and
//! every result passes a sensitive-column masking pass before leaving
//! the process.
//!
//! # Core Principles
//! - Fail closed: one denied statement rejects the whole request
//! - The gate is the single admission path for free-text SQL/TQL
//! - Masking is a binary switch over column names, never per-cell
//! - Stateless tool calls over an immutable startup configuration
//!
//! # Module Organization
//! - [`error`] - Error types with stable error codes
//! - [`gate`] - Statement classifier and security gate
//! - [`masking`] - Sensitive-column rule set and mask decisions
//! - [`output`] - Result set types and CSV/JSON/Markdown rendering
//! - [`db`] - Pooled query execution over the MySQL wire protocol
//! - [`pipeline`] - Pipeline management over the HTTP API
//! - [`tools`] - Tool argument contracts, validators, and dispatch
//! - [`audit`] - Per-invocation audit trail
//! - [`config`] - CLI flags with environment fallbacks
//! - [`mcp`] - JSON-RPC 2.0 protocol surface and transports

pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod gate;
pub mod masking;
pub mod mcp;
pub mod output;
pub mod pipeline;
pub mod tools;

// Re-export commonly used types for convenience
pub use config::{Config, Transport};
pub use db::{DbConfig, GreptimeExecutor, QueryExecutor, QueryOutcome};
pub use error::{Result, ServerError};
pub use gate::{classify, enforce, split_statements, ClassificationResult, DenyPolicy, RuleCategory};
pub use masking::{MaskRuleSet, Masker, MASK_LITERAL};
pub use output::{format_results, CellValue, OutputFormat, ResultSet};
pub use pipeline::{HttpTransport, PipelineClient, PipelineConfig, PipelineTransport};
pub use tools::{Dispatcher, ServerIdentity, MAX_QUERY_LIMIT, RESULTS_LIMIT};
