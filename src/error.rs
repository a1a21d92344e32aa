//! Error Handling Infrastructure
//!
//! All errors are structured and map to stable error codes suitable for
//! programmatic handling by agents.
//!
//! # Error Categories
//! - `InvalidInput`: malformed or missing arguments, rejected before the gate
//! - `SecurityViolation`: statement denied by the admission policy
//! - `QueryFailed`: the database rejected an allowed query
//! - `Transport`: pool exhaustion or network failure reaching the database
//! - `PipelineHttp`: non-2xx response from the pipeline management API
//! - `Config`: invalid server configuration

use thiserror::Error;

use crate::gate::RuleCategory;

/// Maximum length of a database error message surfaced to the caller.
const ERROR_EXCERPT_LEN: usize = 512;

/// Main error type for server operations
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Statement denied by the security gate.
    ///
    /// Carries the violated rule category only; the matched substring is
    /// deliberately not echoed back to the caller.
    #[error("Dangerous operation blocked: {0}")]
    SecurityViolation(RuleCategory),

    /// Query execution failed on the database side
    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    /// Pool checkout or network failure reaching the database
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Non-2xx response from the pipeline HTTP API
    #[error("Pipeline API error (HTTP {status}): {body}")]
    PipelineHttp { status: u16, body: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ServerError {
    /// Convert error to a stable error code string for tool output.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "VALIDATION",
            Self::SecurityViolation(_) => "SECURITY",
            Self::QueryFailed(_) => "EXECUTION",
            Self::Transport(_) => "TRANSPORT",
            Self::PipelineHttp { .. } => "PIPELINE_HTTP",
            Self::Config(_) => "CONFIG",
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a query failed error, truncating oversized database messages.
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::QueryFailed(truncate_excerpt(message.into(), true))
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a pipeline HTTP error with a bounded body excerpt.
    pub fn pipeline_http(status: u16, body: impl Into<String>) -> Self {
        Self::PipelineHttp { status, body: truncate_excerpt(body.into(), false) }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

fn truncate_excerpt(mut text: String, ellipsis: bool) -> String {
    if text.len() > ERROR_EXCERPT_LEN {
        let mut end = ERROR_EXCERPT_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        if ellipsis {
            text.push_str("...");
        }
    }
    text
}

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ServerError::invalid_input("x").error_code(), "VALIDATION");
        assert_eq!(ServerError::SecurityViolation(RuleCategory::Ddl).error_code(), "SECURITY");
        assert_eq!(ServerError::query_failed("x").error_code(), "EXECUTION");
        assert_eq!(ServerError::transport("x").error_code(), "TRANSPORT");
        assert_eq!(ServerError::pipeline_http(500, "x").error_code(), "PIPELINE_HTTP");
        assert_eq!(ServerError::config("x").error_code(), "CONFIG");
    }

    #[test]
    fn test_security_violation_reports_category_not_payload() {
        let err = ServerError::SecurityViolation(RuleCategory::EncodingBypass);
        let message = err.to_string();
        assert!(message.contains("blocked"));
        assert!(message.contains("encoding-bypass"));
        assert!(!message.contains("UNHEX"));
    }

    #[test]
    fn test_query_failed_truncates_long_messages() {
        let err = ServerError::query_failed("e".repeat(2000));
        let message = err.to_string();
        assert!(message.len() < 600);
        assert!(message.ends_with("..."));
    }

    #[test]
    fn test_pipeline_http_bounds_body() {
        let err = ServerError::pipeline_http(503, "b".repeat(4096));
        match err {
            ServerError::PipelineHttp { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body.len(), 512);
            }
            _ => panic!("wrong variant"),
        }
    }
}
