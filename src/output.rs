//! Result Set Rendering
//!
//! Renders a tabular result set into CSV, JSON, or Markdown text. The
//! formatter is purely presentational: it consumes the masking engine's
//! precomputed per-column decision and never re-evaluates the rules.
//!
//! # Output contracts
//! - CSV: header row, standard quoting (quote on comma/quote/newline,
//!   double embedded quotes), binary as base64, NULL as empty field
//! - JSON: array of objects, key order follows column order, NULL as
//!   null, binary as base64 string, temporals as ISO-8601 strings
//! - Markdown: pipe table with a separator row, `|` escaped, NULL as
//!   empty cell

use base64::Engine;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::masking::MASK_LITERAL;

/// Output encodings for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Json,
    Markdown,
}

impl OutputFormat {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Markdown => "markdown",
        }
    }
}

/// A single cell value with its primitive kind.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Binary(Vec<u8>),
    Temporal(NaiveDateTime),
}

impl CellValue {
    /// Plain-text rendering used by CSV and Markdown. NULL is the
    /// caller's business (formats render it differently).
    fn render_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Int(v) => v.to_string(),
            Self::UInt(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Text(v) => v.clone(),
            Self::Binary(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
            Self::Temporal(ts) => {
                if ts.and_utc().timestamp_subsec_micros() == 0 {
                    ts.format("%Y-%m-%d %H:%M:%S").to_string()
                } else {
                    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
                }
            }
        }
    }

    /// JSON rendering: numbers stay numbers, temporals become ISO-8601.
    fn render_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Int(v) => Value::from(*v),
            Self::UInt(v) => Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null), // NaN / infinity
            Self::Text(v) => Value::String(v.clone()),
            Self::Binary(bytes) => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            Self::Temporal(ts) => {
                let rendered = if ts.and_utc().timestamp_subsec_micros() == 0 {
                    ts.format("%Y-%m-%dT%H:%M:%S").to_string()
                } else {
                    ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
                };
                Value::String(rendered)
            }
        }
    }
}

/// An ordered tabular result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl ResultSet {
    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<Vec<CellValue>>) -> Self {
        Self { columns, rows }
    }
}

/// Render a result set in the requested format.
///
/// `column_mask` holds one decision per column (from
/// [`crate::masking::Masker::column_mask`]); every cell under a masked
/// column renders as the mask literal regardless of value type,
/// including NULL.
#[must_use]
pub fn format_results(results: &ResultSet, format: OutputFormat, column_mask: &[bool]) -> String {
    match format {
        OutputFormat::Csv => format_csv(results, column_mask),
        OutputFormat::Json => format_json(results, column_mask).to_string(),
        OutputFormat::Markdown => format_markdown(results, column_mask),
    }
}

/// JSON rendering as a `serde_json::Value`, for callers that wrap the
/// data with metadata before serializing.
#[must_use]
pub fn format_json(results: &ResultSet, column_mask: &[bool]) -> Value {
    let rows = results
        .rows
        .iter()
        .map(|row| {
            let mut object = serde_json::Map::new();
            for (idx, column) in results.columns.iter().enumerate() {
                let value = if masked(column_mask, idx) {
                    Value::String(MASK_LITERAL.to_string())
                } else {
                    row.get(idx).map_or(Value::Null, CellValue::render_json)
                };
                object.insert(column.clone(), value);
            }
            Value::Object(object)
        })
        .collect();
    Value::Array(rows)
}

fn format_csv(results: &ResultSet, column_mask: &[bool]) -> String {
    let mut out = String::new();
    out.push_str(
        &results.columns.iter().map(|c| csv_escape(c)).collect::<Vec<_>>().join(","),
    );
    for row in &results.rows {
        out.push_str("\r\n");
        let line = results
            .columns
            .iter()
            .enumerate()
            .map(|(idx, _)| {
                if masked(column_mask, idx) {
                    MASK_LITERAL.to_string()
                } else {
                    match row.get(idx) {
                        Some(CellValue::Null) | None => String::new(),
                        Some(value) => csv_escape(&value.render_text()),
                    }
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
    }
    out
}

fn format_markdown(results: &ResultSet, column_mask: &[bool]) -> String {
    let mut out = String::new();
    out.push_str("| ");
    out.push_str(
        &results.columns.iter().map(|c| md_escape(c)).collect::<Vec<_>>().join(" | "),
    );
    out.push_str(" |\n| ");
    out.push_str(&vec!["---"; results.columns.len()].join(" | "));
    out.push_str(" |");
    for row in &results.rows {
        out.push_str("\n| ");
        let line = results
            .columns
            .iter()
            .enumerate()
            .map(|(idx, _)| {
                if masked(column_mask, idx) {
                    MASK_LITERAL.to_string()
                } else {
                    match row.get(idx) {
                        Some(CellValue::Null) | None => String::new(),
                        Some(value) => md_escape(&value.render_text()),
                    }
                }
            })
            .collect::<Vec<_>>()
            .join(" | ");
        out.push_str(&line);
        out.push_str(" |");
    }
    out
}

fn masked(column_mask: &[bool], idx: usize) -> bool {
    column_mask.get(idx).copied().unwrap_or(false)
}

/// Standard CSV quoting: quote fields containing comma, quote, or
/// newline; double embedded quotes.
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn md_escape(cell: &str) -> String {
    cell.replace('|', "\\|").replace('\n', " ")
}
