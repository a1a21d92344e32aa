//! Pipeline Management Client
//!
//! Thin client for GreptimeDB's pipeline HTTP API (port 4000). Pipeline
//! bodies are YAML programs, not SQL, so they bypass the statement gate;
//! instead they are validated locally (size cap, YAML well-formedness)
//! before anything touches the network. The server assigns versions:
//! creating a pipeline under an existing name yields a new version, it
//! never overwrites.
//!
//! The [`PipelineTransport`] trait isolates the HTTP round-trip so tests
//! run against a recording fake.

use async_trait::async_trait;
use serde_json::json;

use crate::error::{Result, ServerError};

/// Upper bound on a pipeline definition body.
pub const MAX_PIPELINE_BODY_BYTES: usize = 64 * 1024;

const PIPELINES_PATH: &str = "/v1/events/pipelines";

/// One HTTP round-trip: method, path, query pairs, optional body with
/// its content type. Returns status and response body.
#[async_trait]
pub trait PipelineTransport: Send + Sync {
    async fn send(
        &self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        body: Option<(&'static str, String)>,
    ) -> Result<(u16, String)>;
}

#[async_trait]
impl<T: PipelineTransport + ?Sized> PipelineTransport for Box<T> {
    async fn send(
        &self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        body: Option<(&'static str, String)>,
    ) -> Result<(u16, String)> {
        (**self).send(method, path, query, body).await
    }
}

/// Connection parameters for the pipeline HTTP endpoint.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub base_url: String,
    pub user: String,
    pub password: String,
    pub timeout_secs: u64,
}

/// `reqwest`-backed transport with basic auth. Never retries.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
}

impl HttpTransport {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServerError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }
}

#[async_trait]
impl PipelineTransport for HttpTransport {
    async fn send(
        &self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        body: Option<(&'static str, String)>,
    ) -> Result<(u16, String)> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ServerError::config(format!("unsupported HTTP method: {method}")))?;
        let url = format!("{}{path}", self.base_url);
        let mut request = self
            .client
            .request(method, &url)
            .basic_auth(&self.user, Some(&self.password))
            .query(query);
        if let Some((content_type, payload)) = body {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type).body(payload);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ServerError::transport(format!("pipeline API unreachable: {e}")))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ServerError::transport(format!("failed to read response: {e}")))?;
        Ok((status, text))
    }
}

/// Pipeline operations over an injected transport.
pub struct PipelineClient<T: PipelineTransport> {
    transport: T,
}

impl<T: PipelineTransport> PipelineClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// List pipeline definitions, optionally filtered by name.
    pub async fn list(&self, name: Option<&str>) -> Result<String> {
        let mut query = Vec::new();
        if let Some(name) = name {
            validate_pipeline_name(name)?;
            query.push(("name".to_string(), name.to_string()));
        }
        self.round_trip("GET", PIPELINES_PATH.to_string(), query, None).await
    }

    /// Upload a pipeline definition. The server assigns the version.
    pub async fn create(&self, name: &str, body: &str) -> Result<String> {
        validate_pipeline_name(name)?;
        validate_pipeline_body(body)?;
        self.round_trip(
            "POST",
            format!("{PIPELINES_PATH}/{name}"),
            Vec::new(),
            Some(("application/x-yaml", body.to_string())),
        )
        .await
    }

    /// Run sample data through a stored pipeline without ingesting.
    pub async fn dryrun(&self, name: &str, data: &str) -> Result<String> {
        validate_pipeline_name(name)?;
        let parsed: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| ServerError::invalid_input(format!("dryrun data is not valid JSON: {e}")))?;
        let payload = json!({ "pipeline_name": name, "data": parsed });
        self.round_trip(
            "POST",
            format!("{PIPELINES_PATH}/_dryrun"),
            Vec::new(),
            Some(("application/json", payload.to_string())),
        )
        .await
    }

    /// Delete one version of a pipeline. The version is required; there
    /// is no delete-all.
    pub async fn delete(&self, name: &str, version: &str) -> Result<String> {
        validate_pipeline_name(name)?;
        if version.trim().is_empty() {
            return Err(ServerError::invalid_input("Pipeline version is required"));
        }
        self.round_trip(
            "DELETE",
            format!("{PIPELINES_PATH}/{name}"),
            vec![("version".to_string(), version.to_string())],
            None,
        )
        .await
    }

    async fn round_trip(
        &self,
        method: &str,
        path: String,
        query: Vec<(String, String)>,
        body: Option<(&'static str, String)>,
    ) -> Result<String> {
        let (status, text) = self.transport.send(method, &path, &query, body).await?;
        if (200..300).contains(&status) {
            Ok(text)
        } else {
            Err(ServerError::pipeline_http(status, text))
        }
    }
}

/// Pipeline names travel in URL paths, so only identifier characters
/// are accepted.
pub fn validate_pipeline_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ServerError::invalid_input(format!("Invalid pipeline name: {name:?}")))
    }
}

fn validate_pipeline_body(body: &str) -> Result<()> {
    if body.trim().is_empty() {
        return Err(ServerError::invalid_input("Pipeline body is required"));
    }
    if body.len() > MAX_PIPELINE_BODY_BYTES {
        return Err(ServerError::invalid_input(format!(
            "Pipeline body exceeds {MAX_PIPELINE_BODY_BYTES} bytes"
        )));
    }
    serde_yaml::from_str::<serde_yaml::Value>(body)
        .map(|_| ())
        .map_err(|e| ServerError::invalid_input(format!("Pipeline body is not valid YAML: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Recorded {
        method: String,
        path: String,
        query: Vec<(String, String)>,
        body: Option<(&'static str, String)>,
    }

    struct FakeTransport {
        status: u16,
        response: String,
        calls: Mutex<Vec<Recorded>>,
    }

    impl FakeTransport {
        fn ok(response: &str) -> Self {
            Self { status: 200, response: response.to_string(), calls: Mutex::new(Vec::new()) }
        }

        fn failing(status: u16, response: &str) -> Self {
            Self { status, response: response.to_string(), calls: Mutex::new(Vec::new()) }
        }

        fn last_call(&self) -> Recorded {
            self.calls.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl PipelineTransport for FakeTransport {
        async fn send(
            &self,
            method: &str,
            path: &str,
            query: &[(String, String)],
            body: Option<(&'static str, String)>,
        ) -> Result<(u16, String)> {
            self.calls.lock().unwrap().push(Recorded {
                method: method.to_string(),
                path: path.to_string(),
                query: query.to_vec(),
                body,
            });
            Ok((self.status, self.response.clone()))
        }
    }

    #[tokio::test]
    async fn test_create_posts_yaml_to_named_path() {
        let client = PipelineClient::new(FakeTransport::ok("{\"version\":\"v1\"}"));
        let body = "processors:\n  - date:\n      fields:\n        - ts\n";
        let out = client.create("nginx_access", body).await.unwrap();
        assert_eq!(out, "{\"version\":\"v1\"}");
        let call = client.transport.last_call();
        assert_eq!(call.method, "POST");
        assert_eq!(call.path, "/v1/events/pipelines/nginx_access");
        assert_eq!(call.body.unwrap().0, "application/x-yaml");
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_yaml_before_network() {
        let client = PipelineClient::new(FakeTransport::ok(""));
        let err = client.create("p", "key: [unclosed").await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION");
        assert!(client.transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_oversized_body() {
        let client = PipelineClient::new(FakeTransport::ok(""));
        let body = "a".repeat(MAX_PIPELINE_BODY_BYTES + 1);
        let err = client.create("p", &body).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION");
    }

    #[tokio::test]
    async fn test_dryrun_wraps_data_in_json_payload() {
        let client = PipelineClient::new(FakeTransport::ok("{}"));
        client.dryrun("p", r#"[{"msg": "hello"}]"#).await.unwrap();
        let call = client.transport.last_call();
        assert_eq!(call.path, "/v1/events/pipelines/_dryrun");
        let (content_type, payload) = call.body.unwrap();
        assert_eq!(content_type, "application/json");
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["pipeline_name"], "p");
        assert_eq!(value["data"][0]["msg"], "hello");
    }

    #[tokio::test]
    async fn test_dryrun_rejects_non_json_data() {
        let client = PipelineClient::new(FakeTransport::ok("{}"));
        let err = client.dryrun("p", "not json").await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION");
    }

    #[tokio::test]
    async fn test_delete_requires_version() {
        let client = PipelineClient::new(FakeTransport::ok("{}"));
        let err = client.delete("p", "  ").await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION");

        client.delete("p", "2024-06-27 12:02:34Z").await.unwrap();
        let call = client.transport.last_call();
        assert_eq!(call.method, "DELETE");
        assert_eq!(call.query, vec![("version".to_string(), "2024-06-27 12:02:34Z".to_string())]);
    }

    #[tokio::test]
    async fn test_list_passes_name_filter() {
        let client = PipelineClient::new(FakeTransport::ok("[]"));
        client.list(Some("nginx")).await.unwrap();
        let call = client.transport.last_call();
        assert_eq!(call.method, "GET");
        assert_eq!(call.query, vec![("name".to_string(), "nginx".to_string())]);
    }

    #[tokio::test]
    async fn test_non_2xx_becomes_pipeline_http_error() {
        let client = PipelineClient::new(FakeTransport::failing(400, "bad pipeline"));
        let err = client.list(None).await.unwrap_err();
        assert_eq!(err.error_code(), "PIPELINE_HTTP");
        assert!(err.to_string().contains("400"));
    }

    #[test]
    fn test_pipeline_name_rules() {
        assert!(validate_pipeline_name("nginx_access").is_ok());
        assert!(validate_pipeline_name("p-2").is_ok());
        assert!(validate_pipeline_name("_private").is_ok());
        assert!(validate_pipeline_name("").is_err());
        assert!(validate_pipeline_name("2start").is_err());
        assert!(validate_pipeline_name("has space").is_err());
        assert!(validate_pipeline_name("a/b").is_err());
    }
}
