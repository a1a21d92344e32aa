//! MCP (Model Context Protocol) Server
//!
//! Manual JSON-RPC 2.0 implementation of the MCP surface: `initialize`,
//! `tools/list`, `tools/call`, `resources/list`, and `resources/read`.
//! No MCP framework crate; the protocol is small enough to speak
//! directly with `serde_json`.
//!
//! # Transports
//! - stdio: one JSON-RPC message per line, responses on stdout, logs on
//!   stderr (the default for desktop clients)
//! - streamable-http: POST /mcp, response in the HTTP body
//! - sse: GET /sse opens the event stream and announces the message
//!   endpoint; POST /messages?session_id=... feeds requests, responses
//!   arrive as SSE events
//!
//! Each tool invocation is stateless; shared state is limited to the
//! dispatcher's immutable policy, masker, pool, and pipeline client.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::tools::Dispatcher;

const PROTOCOL_VERSION: &str = "2024-11-05";
const RESOURCE_PREFIX: &str = "greptime://";

// ============================================================================
// JSON-RPC 2.0 Structures
// ============================================================================

/// JSON-RPC 2.0 Request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    jsonrpc: String,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0".to_string(), id, result: Some(result), error: None }
    }

    fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError { code, message: message.into() }),
        }
    }
}

/// Text content block for MCP tool results
#[derive(Debug, Serialize)]
struct TextContent {
    #[serde(rename = "type")]
    content_type: String,
    text: String,
}

impl TextContent {
    fn new(text: String) -> Self {
        Self { content_type: "text".to_string(), text }
    }
}

/// MCP tool call result
#[derive(Debug, Serialize)]
struct CallToolResult {
    content: Vec<TextContent>,
    #[serde(rename = "isError")]
    is_error: bool,
}

impl CallToolResult {
    fn text(text: String, is_error: bool) -> Result<Value> {
        let result = Self { content: vec![TextContent::new(text)], is_error };
        Ok(serde_json::to_value(result)?)
    }
}

// ============================================================================
// MCP Server
// ============================================================================

pub struct McpServer {
    dispatcher: Arc<Dispatcher>,
}

impl McpServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Handle one JSON-RPC message. Notifications get no response.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.method.starts_with("notifications/") {
            return None;
        }

        let result = match request.method.as_str() {
            "initialize" => handle_initialize(),
            "ping" => Ok(json!({})),
            "tools/list" => handle_list_tools(),
            "tools/call" => self.handle_call_tool(request.params).await,
            "resources/list" => self.handle_list_resources().await,
            "resources/read" => self.handle_read_resource(request.params).await,
            _ => {
                return Some(JsonRpcResponse::error(
                    request.id,
                    -32601,
                    format!("Unknown method: {}", request.method),
                ))
            }
        };

        Some(match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(e) => JsonRpcResponse::error(request.id, -32603, e.to_string()),
        })
    }

    /// Route a tools/call request. Tool failures are reported as tool
    /// results with `isError`, not as JSON-RPC errors, so agents see
    /// the stable error code.
    async fn handle_call_tool(&self, params: Option<Value>) -> Result<Value> {
        let params = params.ok_or_else(|| anyhow!("Missing params"))?;
        let name = params["name"].as_str().ok_or_else(|| anyhow!("Missing tool name"))?;
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        match self.dispatcher.handle(name, &arguments).await {
            Ok(text) => CallToolResult::text(text, false),
            Err(e) => CallToolResult::text(format!("Error [{}]: {e}", e.error_code()), true),
        }
    }

    async fn handle_list_resources(&self) -> Result<Value> {
        let tables = self.dispatcher.list_tables().await?;
        let resources: Vec<Value> = tables
            .iter()
            .map(|table| {
                json!({
                    "uri": format!("{RESOURCE_PREFIX}{table}/data"),
                    "name": table,
                    "description": format!("First 100 rows of table {table} as CSV"),
                    "mimeType": "text/csv",
                })
            })
            .collect();
        Ok(json!({ "resources": resources }))
    }

    async fn handle_read_resource(&self, params: Option<Value>) -> Result<Value> {
        let params = params.ok_or_else(|| anyhow!("Missing params"))?;
        let uri = params["uri"].as_str().ok_or_else(|| anyhow!("Missing resource uri"))?;

        let table = uri
            .strip_prefix(RESOURCE_PREFIX)
            .and_then(|rest| rest.strip_suffix("/data"))
            .ok_or_else(|| anyhow!("Unknown resource: {uri}"))?;

        let csv = self.dispatcher.read_table(table).await.map_err(|e| anyhow!("{e}"))?;
        Ok(json!({
            "contents": [{
                "uri": uri,
                "mimeType": "text/csv",
                "text": csv,
            }]
        }))
    }
}

// ============================================================================
// Protocol handlers
// ============================================================================

fn handle_initialize() -> Result<Value> {
    Ok(json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": {},
            "resources": {}
        },
        "serverInfo": {
            "name": "greptime-mcp",
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

fn handle_list_tools() -> Result<Value> {
    let format_schema = |default: &str| {
        json!({
            "type": "string",
            "enum": ["csv", "json", "markdown"],
            "description": format!("Output format (default: {default})")
        })
    };
    let limit_schema = json!({
        "type": "number",
        "description": "Maximum number of rows to return (default: 1000, max: 10000)"
    });

    Ok(json!({
        "tools": [
            {
                "name": "execute_sql",
                "description": "Execute SQL query against GreptimeDB (MySQL dialect). \
                    Read-only: DDL, DML, dynamic execution, filesystem access, and \
                    hex/decoder obfuscation are blocked before execution.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "The SQL query to execute (using MySQL dialect)"
                        },
                        "format": format_schema("csv"),
                        "limit": limit_schema,
                    },
                    "required": ["query"]
                }
            },
            {
                "name": "execute_tql",
                "description": "Execute TQL query for time-series analysis. TQL is \
                    PromQL-compatible: rate(), increase(), sum(), histogram_quantile(), \
                    etc. Example: rate(http_requests_total[5m])",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "PromQL-compatible expression"
                        },
                        "start": {
                            "type": "string",
                            "description": "Start time (RFC3339, Unix timestamp, or relative like 'now-1h')"
                        },
                        "end": {
                            "type": "string",
                            "description": "End time (RFC3339, Unix timestamp, or relative like 'now')"
                        },
                        "step": {
                            "type": "string",
                            "description": "Query resolution step, e.g. '1m', '5m', '1h'"
                        },
                        "lookback": {
                            "type": "string",
                            "description": "Optional lookback delta for range queries"
                        },
                        "format": format_schema("json"),
                    },
                    "required": ["query", "start", "end", "step"]
                }
            },
            {
                "name": "query_range",
                "description": "Execute time-window aggregation using GreptimeDB's RANGE \
                    query syntax.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "table": {
                            "type": "string",
                            "description": "Table name to query (supports schema.table format)"
                        },
                        "select": {
                            "type": "string",
                            "description": "Columns and aggregations, e.g. \"ts, host, avg(cpu) RANGE '5m'\""
                        },
                        "align": {
                            "type": "string",
                            "description": "Alignment interval, e.g. '1m', '5m'"
                        },
                        "by": {
                            "type": "string",
                            "description": "Optional group-by columns, e.g. 'host'"
                        },
                        "where": {
                            "type": "string",
                            "description": "Optional WHERE clause conditions"
                        },
                        "fill": {
                            "type": "string",
                            "description": "Optional fill strategy: NULL, PREV, LINEAR, or a number"
                        },
                        "order_by": {
                            "type": "string",
                            "description": "Optional ORDER BY clause, e.g. 'ts DESC'"
                        },
                        "format": format_schema("json"),
                        "limit": limit_schema,
                    },
                    "required": ["table", "select", "align"]
                }
            },
            {
                "name": "describe_table",
                "description": "Get table schema information including column names, \
                    types, and constraints.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "table": {
                            "type": "string",
                            "description": "Table name to describe (supports schema.table format)"
                        }
                    },
                    "required": ["table"]
                }
            },
            {
                "name": "explain_query",
                "description": "Analyze a SQL or TQL query execution plan.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "SQL or TQL query to analyze"
                        },
                        "analyze": {
                            "type": "boolean",
                            "description": "Execute and show actual metrics (default: false)"
                        }
                    },
                    "required": ["query"]
                }
            },
            {
                "name": "health_check",
                "description": "Check GreptimeDB connection status and server version.",
                "inputSchema": { "type": "object", "properties": {} }
            },
            {
                "name": "list_pipelines",
                "description": "List log ingestion pipeline definitions.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "name": {
                            "type": "string",
                            "description": "Optional pipeline name filter"
                        }
                    }
                }
            },
            {
                "name": "create_pipeline",
                "description": "Create or version a log ingestion pipeline from a YAML \
                    definition. Creating under an existing name adds a new version.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "name": {
                            "type": "string",
                            "description": "Pipeline name"
                        },
                        "pipeline": {
                            "type": "string",
                            "description": "Pipeline definition in YAML (max 64 KiB)"
                        }
                    },
                    "required": ["name", "pipeline"]
                }
            },
            {
                "name": "dryrun_pipeline",
                "description": "Run sample data through a stored pipeline without \
                    ingesting anything.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "pipeline_name": {
                            "type": "string",
                            "description": "Pipeline name"
                        },
                        "data": {
                            "type": "string",
                            "description": "Sample input as a JSON value"
                        }
                    },
                    "required": ["pipeline_name", "data"]
                }
            },
            {
                "name": "delete_pipeline",
                "description": "Delete one version of a pipeline.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "name": {
                            "type": "string",
                            "description": "Pipeline name"
                        },
                        "version": {
                            "type": "string",
                            "description": "Exact version to delete"
                        }
                    },
                    "required": ["name", "version"]
                }
            }
        ]
    }))
}

// ============================================================================
// stdio transport
// ============================================================================

/// Run the stdio transport: one JSON-RPC message per line on stdin,
/// responses on stdout. Logs must stay on stderr.
pub async fn serve_stdio(server: McpServer) -> Result<()> {
    let stdin = io::stdin();
    let reader = stdin.lock();
    let mut stdout = io::stdout();

    for line in reader.lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                let response =
                    JsonRpcResponse::error(None, -32700, format!("Parse error: {e}"));
                writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
                stdout.flush()?;
                continue;
            }
        };

        if let Some(response) = server.handle_request(request).await {
            writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
            stdout.flush()?;
        }
    }

    Ok(())
}

// ============================================================================
// HTTP transports
// ============================================================================

struct HttpState {
    server: McpServer,
    /// SSE sessions awaiting responses, keyed by session id.
    sessions: RwLock<HashMap<String, mpsc::Sender<JsonRpcResponse>>>,
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session_id: Option<String>,
}

fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/mcp", post(handle_mcp_post))
        .route("/sse", get(handle_sse_open))
        .route("/messages", post(handle_sse_message))
        .route("/health", get(handle_http_health))
        .with_state(state)
}

/// Run the streamable-http / sse transports. Both routes are always
/// mounted; the flag only selects what clients are told to use.
pub async fn serve_http(server: McpServer, host: &str, port: u16) -> Result<()> {
    let state = Arc::new(HttpState { server, sessions: RwLock::new(HashMap::new()) });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    tracing::info!(%host, port, "MCP HTTP transport listening");

    axum::serve(listener, app).await.context("HTTP server terminated")?;
    Ok(())
}

/// POST /mcp: request in, response out (streamable-http).
async fn handle_mcp_post(
    State(state): State<Arc<HttpState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    match state.server.handle_request(request).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// GET /sse: open the event stream. The first event names the message
/// endpoint for this session. The session entry lives exactly as long
/// as the stream.
async fn handle_sse_open(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let session_id = new_session_id();
    let (tx, rx) = mpsc::channel::<JsonRpcResponse>(32);
    state.sessions.write().await.insert(session_id.clone(), tx);
    let guard = SessionGuard { state: Arc::clone(&state), session_id: session_id.clone() };

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?session_id={session_id}"));
    let responses = ReceiverStream::new(rx).map(move |response| {
        let _ = &guard;
        Event::default()
            .event("message")
            .data(serde_json::to_string(&response).unwrap_or_default())
    });
    let stream = tokio_stream::once(endpoint).chain(responses).map(Ok::<_, Infallible>);

    Sse::new(stream).keep_alive(
        KeepAlive::new().interval(std::time::Duration::from_secs(30)).text("ping"),
    )
}

/// Evicts a session entry when its SSE stream is dropped, so abandoned
/// connections do not accumulate in the session map.
struct SessionGuard {
    state: Arc<HttpState>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let state = Arc::clone(&self.state);
        let session_id = std::mem::take(&mut self.session_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                state.sessions.write().await.remove(&session_id);
            });
        }
    }
}

/// POST /messages?session_id=...: feed a request to an SSE session.
async fn handle_sse_message(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<SessionQuery>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let Some(session_id) = query.session_id else {
        return (StatusCode::BAD_REQUEST, "missing session_id").into_response();
    };
    let Some(tx) = state.sessions.read().await.get(&session_id).cloned() else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };

    if let Some(response) = state.server.handle_request(request).await {
        if tx.send(response).await.is_err() {
            state.sessions.write().await.remove(&session_id);
            return (StatusCode::GONE, "session closed").into_response();
        }
    }
    StatusCode::ACCEPTED.into_response()
}

async fn handle_http_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "greptime-mcp",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    use crate::db::{QueryExecutor, QueryOutcome};
    use crate::error::Result;
    use crate::gate::DenyPolicy;
    use crate::masking::Masker;
    use crate::output::ResultSet;
    use crate::pipeline::PipelineTransport;
    use crate::tools::ServerIdentity;

    struct EmptyExecutor;

    #[async_trait::async_trait]
    impl QueryExecutor for EmptyExecutor {
        async fn execute(&self, _sql: &str, _expect_rows: bool) -> Result<QueryOutcome> {
            Ok(QueryOutcome::Rows(ResultSet::default()))
        }

        async fn server_version(&self) -> Result<String> {
            Ok("8.4.2-GreptimeDB".to_string())
        }
    }

    struct NoopTransport;

    #[async_trait::async_trait]
    impl PipelineTransport for NoopTransport {
        async fn send(
            &self,
            _method: &str,
            _path: &str,
            _query: &[(String, String)],
            _body: Option<(&'static str, String)>,
        ) -> Result<(u16, String)> {
            Ok((200, "[]".to_string()))
        }
    }

    fn test_state() -> Arc<HttpState> {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(EmptyExecutor),
            Box::new(NoopTransport),
            DenyPolicy::new(),
            Masker::enabled_default(),
            ServerIdentity {
                host: "localhost".to_string(),
                port: 4002,
                database: "public".to_string(),
            },
        ));
        Arc::new(HttpState {
            server: McpServer::new(dispatcher),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    fn json_post(uri: &str, payload: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_mcp_post_answers_initialize() {
        let app = router(test_state());
        let response = app
            .oneshot(json_post(
                "/mcp",
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(body["result"]["serverInfo"]["name"], "greptime-mcp");
    }

    #[tokio::test]
    async fn test_sse_first_event_announces_message_endpoint() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let mut data = response.into_body().into_data_stream();
        let first = data.next().await.unwrap().unwrap();
        let text = String::from_utf8(first.to_vec()).unwrap();
        assert!(text.contains("event: endpoint"), "got: {text}");
        assert!(text.contains("data: /messages?session_id="), "got: {text}");
    }

    #[tokio::test]
    async fn test_sse_session_evicted_when_stream_drops() {
        let state = test_state();
        let app = router(Arc::clone(&state));
        let response = app
            .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(state.sessions.read().await.len(), 1);

        drop(response);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(state.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_messages_rejects_unknown_session() {
        let app = router(test_state());
        let response = app
            .oneshot(json_post(
                "/messages?session_id=nope",
                r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_messages_pushes_response_to_session_channel() {
        let state = test_state();
        let (tx, mut rx) = mpsc::channel(4);
        state.sessions.write().await.insert("s1".to_string(), tx);

        let app = router(Arc::clone(&state));
        let response = app
            .oneshot(json_post(
                "/messages?session_id=s1",
                r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed.id, Some(json!(7)));
    }

    #[test]
    fn test_session_ids_are_unique_uuids() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_pipeline_schemas_use_documented_argument_names() {
        let tools = handle_list_tools().unwrap();
        let find = |name: &str| {
            tools["tools"]
                .as_array()
                .unwrap()
                .iter()
                .find(|t| t["name"] == name)
                .unwrap()
                .clone()
        };
        assert_eq!(
            find("create_pipeline")["inputSchema"]["required"],
            json!(["name", "pipeline"])
        );
        assert_eq!(
            find("dryrun_pipeline")["inputSchema"]["required"],
            json!(["pipeline_name", "data"])
        );
    }

    #[test]
    fn test_tool_listing_is_complete() {
        let tools = handle_list_tools().unwrap();
        let names: Vec<&str> = tools["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "execute_sql",
                "execute_tql",
                "query_range",
                "describe_table",
                "explain_query",
                "health_check",
                "list_pipelines",
                "create_pipeline",
                "dryrun_pipeline",
                "delete_pipeline",
            ]
        );
    }

    #[test]
    fn test_initialize_shape() {
        let init = handle_initialize().unwrap();
        assert_eq!(init["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(init["serverInfo"]["name"], "greptime-mcp");
        assert!(init["capabilities"]["tools"].is_object());
        assert!(init["capabilities"]["resources"].is_object());
    }
}
