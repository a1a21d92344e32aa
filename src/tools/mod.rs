//! Tool Dispatcher
//!
//! Routes MCP tool calls to query execution and pipeline management.
//! Every path that carries free-text SQL or TQL goes through the
//! statement gate before a connection is touched; structured arguments
//! (table names, durations, clause fragments) are validated against
//! narrow grammars first, then the constructed query goes through the
//! gate like any other text.
//!
//! Dispatch is stateless per call. The dispatcher owns the executor,
//! the pipeline client, the deny policy, and the masking engine; all of
//! them are immutable after startup.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::db::{QueryExecutor, QueryOutcome};
use crate::error::{Result, ServerError};
use crate::gate::{enforce, split_statements, DenyPolicy, READ_VERBS};
use crate::masking::Masker;
use crate::output::{format_json, format_results, OutputFormat, ResultSet};
use crate::pipeline::{PipelineClient, PipelineTransport};

/// Row cap for the table data resource.
pub const RESULTS_LIMIT: usize = 100;

/// Hard ceiling on any per-request row limit.
pub const MAX_QUERY_LIMIT: i64 = 10_000;

const DEFAULT_LIMIT: i64 = 1000;

// ============================================================================
// Tool argument contracts
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SqlArgs {
    pub query: String,
    #[serde(default = "default_csv")]
    pub format: OutputFormat,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

#[derive(Debug, Deserialize)]
pub struct TqlArgs {
    pub query: String,
    pub start: String,
    pub end: String,
    pub step: String,
    #[serde(default)]
    pub lookback: Option<String>,
    #[serde(default = "default_json")]
    pub format: OutputFormat,
}

#[derive(Debug, Deserialize)]
pub struct RangeArgs {
    pub table: String,
    pub select: String,
    pub align: String,
    #[serde(default)]
    pub by: Option<String>,
    #[serde(default)]
    pub r#where: Option<String>,
    #[serde(default)]
    pub fill: Option<String>,
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default = "default_json")]
    pub format: OutputFormat,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

#[derive(Debug, Deserialize)]
pub struct DescribeArgs {
    pub table: String,
}

#[derive(Debug, Deserialize)]
pub struct ExplainArgs {
    pub query: String,
    #[serde(default)]
    pub analyze: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListPipelinesArgs {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePipelineArgs {
    pub name: String,
    /// Pipeline definition as YAML text.
    pub pipeline: String,
}

#[derive(Debug, Deserialize)]
pub struct DryrunPipelineArgs {
    pub pipeline_name: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct DeletePipelineArgs {
    pub name: String,
    pub version: String,
}

fn default_csv() -> OutputFormat {
    OutputFormat::Csv
}

fn default_json() -> OutputFormat {
    OutputFormat::Json
}

const fn default_limit() -> i64 {
    DEFAULT_LIMIT
}

/// Connection identity echoed by the health check.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub host: String,
    pub port: u16,
    pub database: String,
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct Dispatcher {
    executor: Arc<dyn QueryExecutor>,
    pipelines: PipelineClient<Box<dyn PipelineTransport>>,
    policy: DenyPolicy,
    masker: Masker,
    identity: ServerIdentity,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        transport: Box<dyn PipelineTransport>,
        policy: DenyPolicy,
        masker: Masker,
        identity: ServerIdentity,
    ) -> Self {
        Self { executor, pipelines: PipelineClient::new(transport), policy, masker, identity }
    }

    /// Route one tool call. Every invocation is audited with its
    /// outcome and duration.
    pub async fn handle(&self, tool: &str, args: &Value) -> Result<String> {
        let excerpt = crate::audit::arg_excerpt(args);
        let start = Instant::now();
        let result = self.route(tool, args).await;
        crate::audit::record(tool, &excerpt, result.is_ok(), start.elapsed());
        result
    }

    async fn route(&self, tool: &str, args: &Value) -> Result<String> {
        match tool {
            "execute_sql" => self.execute_sql(parse_args(args)?).await,
            "execute_tql" => self.execute_tql(parse_args(args)?).await,
            "query_range" => self.query_range(parse_args(args)?).await,
            "describe_table" => self.describe_table(parse_args(args)?).await,
            "explain_query" => self.explain_query(parse_args(args)?).await,
            "health_check" => self.health_check().await,
            "list_pipelines" => {
                let args: ListPipelinesArgs = parse_args(args)?;
                self.pipelines.list(args.name.as_deref()).await
            }
            "create_pipeline" => {
                let args: CreatePipelineArgs = parse_args(args)?;
                self.pipelines.create(&args.name, &args.pipeline).await
            }
            "dryrun_pipeline" => {
                let args: DryrunPipelineArgs = parse_args(args)?;
                self.pipelines.dryrun(&args.pipeline_name, &args.data).await
            }
            "delete_pipeline" => {
                let args: DeletePipelineArgs = parse_args(args)?;
                self.pipelines.delete(&args.name, &args.version).await
            }
            _ => Err(ServerError::invalid_input(format!("Unknown tool: {tool}"))),
        }
    }

    /// Free-form SQL. The only tool that accepts arbitrary statements,
    /// so everything rides on the gate.
    async fn execute_sql(&self, args: SqlArgs) -> Result<String> {
        let statements = split_statements(&args.query)?;
        enforce(&args.query, &self.policy)?;
        let limit = clamp_limit(args.limit);

        let first = statements.first().map(|s| s.verb.as_str()).unwrap_or("");
        let expect_rows = READ_VERBS.contains(&first);
        let folded = args.query.trim().to_uppercase();

        let start = Instant::now();
        let outcome = self.executor.execute(&args.query, expect_rows).await?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            QueryOutcome::Affected(count) => {
                Ok(format!("Query executed successfully. Rows affected: {count}"))
            }
            QueryOutcome::Rows(results) => {
                // Catalog listings read better as a plain name-per-line list
                if folded.starts_with("SHOW DATABASES") || folded.starts_with("SHOW TABLES") {
                    return Ok(render_name_list(&results));
                }
                let (results, truncated) = truncate_rows(results, limit);
                self.render(&results, args.format, truncated, elapsed_ms, None)
            }
        }
    }

    /// PromQL-compatible range evaluation via `TQL EVAL`.
    async fn execute_tql(&self, args: TqlArgs) -> Result<String> {
        if args.query.trim().is_empty() {
            return Err(ServerError::invalid_input("query is required"));
        }
        validate_tql_param(&args.start, "start")?;
        validate_tql_param(&args.end, "end")?;
        validate_tql_param(&args.step, "step")?;
        if let Some(lookback) = &args.lookback {
            validate_tql_param(lookback, "lookback")?;
        }
        enforce(&args.query, &self.policy)?;

        let tql = build_tql_query(
            &args.query,
            &args.start,
            &args.end,
            &args.step,
            args.lookback.as_deref(),
        );

        let start = Instant::now();
        let outcome = self.executor.execute(&tql, true).await?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let results = expect_result_set(outcome)?;
        let (results, truncated) = truncate_rows(results, MAX_QUERY_LIMIT as usize);
        self.render(&results, args.format, truncated, elapsed_ms, Some(("tql", &tql)))
    }

    /// Time-window aggregation via GreptimeDB's RANGE query syntax.
    async fn query_range(&self, args: RangeArgs) -> Result<String> {
        validate_table_name(&args.table)?;
        validate_duration(&args.align, "align")?;
        validate_fill(args.fill.as_deref())?;
        validate_query_component(&args.select, "select")?;
        validate_optional_component(args.r#where.as_deref(), "where")?;
        validate_optional_component(args.by.as_deref(), "by")?;
        validate_optional_component(args.order_by.as_deref(), "order_by")?;
        let limit = clamp_limit(args.limit);

        let query = build_range_query(&args, limit);
        enforce(&query, &self.policy)?;

        let start = Instant::now();
        let outcome = self.executor.execute(&query, true).await?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let results = expect_result_set(outcome)?;
        let (results, truncated) = truncate_rows(results, limit);
        self.render(&results, args.format, truncated, elapsed_ms, Some(("query", &query)))
    }

    /// Table schema as a Markdown table.
    async fn describe_table(&self, args: DescribeArgs) -> Result<String> {
        validate_table_name(&args.table)?;
        let outcome = self.executor.execute(&format!("DESCRIBE {}", args.table), true).await?;
        let results = expect_result_set(outcome)?;
        let mask = self.masker.column_mask(&results.columns);
        Ok(format_results(&results, OutputFormat::Markdown, &mask))
    }

    /// `EXPLAIN [ANALYZE]` for SQL; `TQL EXPLAIN`/`TQL ANALYZE` for TQL.
    async fn explain_query(&self, args: ExplainArgs) -> Result<String> {
        enforce(&args.query, &self.policy)?;
        let explain = build_explain_query(&args.query, args.analyze);
        let outcome = self.executor.execute(&explain, true).await?;
        let results = expect_result_set(outcome)?;
        let mask = self.masker.column_mask(&results.columns);
        Ok(format_results(&results, OutputFormat::Markdown, &mask))
    }

    /// Connection probe. Failures report an unhealthy payload rather
    /// than an error so agents can branch on `status`.
    async fn health_check(&self) -> Result<String> {
        let start = Instant::now();
        let payload = match self.executor.server_version().await {
            Ok(version) => json!({
                "status": "healthy",
                "host": self.identity.host,
                "port": self.identity.port,
                "database": self.identity.database,
                "version": version,
                "response_time_ms": (start.elapsed().as_secs_f64() * 100_000.0).round() / 100.0,
            }),
            Err(e) => json!({
                "status": "unhealthy",
                "error": e.to_string(),
                "host": self.identity.host,
                "port": self.identity.port,
            }),
        };
        serde_json::to_string_pretty(&payload)
            .map_err(|e| ServerError::query_failed(e.to_string()))
    }

    /// Table names for resource listing.
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let outcome = self.executor.execute("SHOW TABLES", true).await?;
        let results = expect_result_set(outcome)?;
        Ok(results
            .rows
            .iter()
            .filter_map(|row| match row.first() {
                Some(crate::output::CellValue::Text(name)) => Some(name.clone()),
                _ => None,
            })
            .collect())
    }

    /// Backing read for the `greptime://<table>/data` resource.
    pub async fn read_table(&self, table: &str) -> Result<String> {
        validate_table_name(table)?;
        let query = format!("SELECT * FROM {table} LIMIT {RESULTS_LIMIT}");
        let outcome = self.executor.execute(&query, true).await?;
        let results = expect_result_set(outcome)?;
        let mask = self.masker.column_mask(&results.columns);
        Ok(format_results(&results, OutputFormat::Csv, &mask))
    }

    fn render(
        &self,
        results: &ResultSet,
        format: OutputFormat,
        truncated: bool,
        elapsed_ms: f64,
        query_echo: Option<(&str, &str)>,
    ) -> Result<String> {
        let mask = self.masker.column_mask(&results.columns);
        match format {
            OutputFormat::Json => {
                let mut meta = serde_json::Map::new();
                if let Some((key, text)) = query_echo {
                    meta.insert(key.to_string(), Value::String(text.to_string()));
                }
                meta.insert("data".to_string(), format_json(results, &mask));
                meta.insert("row_count".to_string(), Value::from(results.rows.len()));
                meta.insert("truncated".to_string(), Value::Bool(truncated));
                meta.insert(
                    "execution_time_ms".to_string(),
                    Value::from((elapsed_ms * 100.0).round() / 100.0),
                );
                serde_json::to_string_pretty(&Value::Object(meta))
                    .map_err(|e| ServerError::query_failed(e.to_string()))
            }
            OutputFormat::Markdown => {
                let mut out = format_results(results, format, &mask);
                if truncated {
                    out.push_str(&format!("\n\n_Results truncated at {} rows_", results.rows.len()));
                }
                Ok(out)
            }
            OutputFormat::Csv => Ok(format_results(results, format, &mask)),
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T> {
    serde_json::from_value(args.clone())
        .map_err(|e| ServerError::invalid_input(format!("Invalid arguments: {e}")))
}

fn expect_result_set(outcome: QueryOutcome) -> Result<ResultSet> {
    match outcome {
        QueryOutcome::Rows(results) => Ok(results),
        QueryOutcome::Affected(_) => Err(ServerError::query_failed("Query returned no results")),
    }
}

fn clamp_limit(limit: i64) -> usize {
    limit.clamp(1, MAX_QUERY_LIMIT) as usize
}

fn truncate_rows(mut results: ResultSet, limit: usize) -> (ResultSet, bool) {
    let truncated = results.rows.len() > limit;
    results.rows.truncate(limit);
    (results, truncated)
}

/// `SHOW DATABASES` / `SHOW TABLES`: header plus one name per line.
fn render_name_list(results: &ResultSet) -> String {
    let header = results.columns.first().map_or("Name", String::as_str);
    let mut out = header.to_string();
    for row in &results.rows {
        if let Some(crate::output::CellValue::Text(name)) = row.first() {
            out.push('\n');
            out.push_str(name);
        }
    }
    out
}

// ============================================================================
// Query builders
// ============================================================================

/// `TQL EVAL ('<start>', '<end>', '<step>'[, '<lookback>']) <expr>`
fn build_tql_query(
    expr: &str,
    start: &str,
    end: &str,
    step: &str,
    lookback: Option<&str>,
) -> String {
    match lookback {
        Some(lookback) => format!("TQL EVAL ('{start}', '{end}', '{step}', '{lookback}') {expr}"),
        None => format!("TQL EVAL ('{start}', '{end}', '{step}') {expr}"),
    }
}

fn build_range_query(args: &RangeArgs, limit: usize) -> String {
    let mut parts = vec![format!("SELECT {}", args.select), format!("FROM {}", args.table)];
    if let Some(where_clause) = &args.r#where {
        parts.push(format!("WHERE {where_clause}"));
    }
    parts.push(format!("ALIGN '{}'", args.align));
    if let Some(by) = &args.by {
        parts.push(format!("BY ({by})"));
    }
    if let Some(fill) = &args.fill {
        parts.push(format!("FILL {fill}"));
    }
    if let Some(order_by) = &args.order_by {
        parts.push(format!("ORDER BY {order_by}"));
    }
    parts.push(format!("LIMIT {limit}"));
    parts.join(" ")
}

/// Wrap a query for plan inspection. A leading `TQL EVAL`/`TQL EVALUATE`
/// is rewritten in place; plain SQL gets an `EXPLAIN` prefix.
fn build_explain_query(query: &str, analyze: bool) -> String {
    let trimmed = query.trim_start();
    if let Some(rest) = strip_tql_eval_prefix(trimmed) {
        let keyword = if analyze { "TQL ANALYZE" } else { "TQL EXPLAIN" };
        return format!("{keyword}{rest}");
    }
    if analyze {
        format!("EXPLAIN ANALYZE {query}")
    } else {
        format!("EXPLAIN {query}")
    }
}

/// Strip a case-insensitive `TQL EVAL` or `TQL EVALUATE` prefix,
/// returning the remainder.
fn strip_tql_eval_prefix(query: &str) -> Option<&str> {
    let folded = query.to_uppercase();
    let rest = folded.strip_prefix("TQL")?;
    let after_ws = rest.trim_start();
    let keyword_len = if after_ws.starts_with("EVALUATE") {
        "EVALUATE".len()
    } else if after_ws.starts_with("EVAL") {
        "EVAL".len()
    } else {
        return None;
    };
    let consumed = folded.len() - after_ws.len() + keyword_len;
    Some(&query[consumed..])
}

// ============================================================================
// Structured-argument validators
// ============================================================================

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// Table names are interpolated into SQL, so only `ident` or
/// `ident.ident` is accepted.
pub fn validate_table_name(table: &str) -> Result<()> {
    let mut parts = table.split('.');
    let valid = match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, _) => is_identifier(name),
        (Some(schema), Some(name), None) => is_identifier(schema) && is_identifier(name),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ServerError::invalid_input(format!("Invalid table name: {table:?}")))
    }
}

/// Durations are digits plus a unit suffix (`s`, `m`, `h`, `d`).
pub fn validate_duration(value: &str, field: &str) -> Result<()> {
    let valid = value.len() >= 2
        && value[..value.len() - 1].bytes().all(|b| b.is_ascii_digit())
        && matches!(value.as_bytes()[value.len() - 1], b's' | b'm' | b'h' | b'd');
    if valid {
        Ok(())
    } else {
        Err(ServerError::invalid_input(format!("Invalid {field} duration: {value:?}")))
    }
}

/// FILL accepts NULL, PREV, LINEAR, or a numeric constant.
pub fn validate_fill(fill: Option<&str>) -> Result<()> {
    let Some(fill) = fill else { return Ok(()) };
    let folded = fill.to_uppercase();
    if matches!(folded.as_str(), "NULL" | "PREV" | "LINEAR") || fill.parse::<f64>().is_ok() {
        Ok(())
    } else {
        Err(ServerError::invalid_input(format!("Invalid fill strategy: {fill:?}")))
    }
}

/// TQL time parameters are interpolated inside single quotes, so they
/// must not contain anything that could close the quote.
pub fn validate_tql_param(value: &str, field: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ServerError::invalid_input(format!("{field} is required")));
    }
    let clean = !value.contains(['\'', '"', '`', '\\', ';'])
        && !value.contains("--")
        && !value.contains("/*")
        && !value.contains('#');
    if clean {
        Ok(())
    } else {
        Err(ServerError::invalid_input(format!("Invalid {field} parameter: {value:?}")))
    }
}

/// Clause fragments (select, where, by, order_by) may legitimately
/// contain quoted literals, so only statement-breaking sequences are
/// rejected here; the assembled query still passes the gate.
pub fn validate_query_component(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ServerError::invalid_input(format!("{field} is required")));
    }
    let clean = !value.contains([';', '\\'])
        && !value.contains("--")
        && !value.contains("/*")
        && !value.contains('#');
    if clean {
        Ok(())
    } else {
        Err(ServerError::invalid_input(format!("Invalid {field} component: {value:?}")))
    }
}

fn validate_optional_component(value: Option<&str>, field: &str) -> Result<()> {
    match value {
        Some(value) => validate_query_component(value, field),
        None => Ok(()),
    }
}
