//! GreptimeDB Query Execution
//!
//! GreptimeDB speaks the MySQL wire protocol, so all SQL and TQL goes
//! through `mysql_async` against the database's MySQL port (4002 by
//! default). Connections come from a shared pool sized at startup;
//! checkout failures surface as transport errors, query rejections as
//! execution errors.
//!
//! The [`QueryExecutor`] trait is the seam between the tool dispatcher
//! and the wire: tests substitute an in-memory fake.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use mysql_async::{prelude::*, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, Row, Value};

use crate::error::{Result, ServerError};
use crate::output::{CellValue, ResultSet};

/// Outcome of a statement: a row set or an affected-row count.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Rows(ResultSet),
    Affected(u64),
}

/// Connection parameters for the MySQL-protocol endpoint.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Session time zone, empty for the server default.
    pub timezone: String,
    pub pool_size: usize,
    pub timeout_secs: u64,
}

/// Executes admitted statements against the database.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run a single statement. `expect_rows` routes result handling
    /// only: a read statement yields [`QueryOutcome::Rows`] (possibly
    /// empty), anything else yields the affected-row count.
    async fn execute(&self, sql: &str, expect_rows: bool) -> Result<QueryOutcome>;

    /// Server version string, used by the health check.
    async fn server_version(&self) -> Result<String>;
}

/// Pool-backed executor for a live GreptimeDB instance.
pub struct GreptimeExecutor {
    pool: Pool,
    timeout: Duration,
}

impl GreptimeExecutor {
    /// Build the connection pool. The pool hands out connections
    /// lazily, so this does not touch the network.
    pub fn new(config: &DbConfig) -> Result<Self> {
        let constraints = PoolConstraints::new(1, config.pool_size.max(1)).ok_or_else(|| {
            ServerError::config(format!("invalid pool size: {}", config.pool_size))
        })?;
        let mut setup = Vec::new();
        if !config.timezone.is_empty() {
            setup.push(format!("SET time_zone = '{}'", config.timezone.replace('\'', "''")));
        }
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .db_name(Some(config.database.clone()))
            .setup(setup)
            .pool_opts(PoolOpts::default().with_constraints(constraints))
            .into();
        Ok(Self {
            pool: Pool::new(opts),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    async fn checkout(&self) -> Result<mysql_async::Conn> {
        tokio::time::timeout(self.timeout, self.pool.get_conn())
            .await
            .map_err(|_| ServerError::transport("timed out waiting for a pooled connection"))?
            .map_err(|e| ServerError::transport(format!("failed to acquire connection: {e}")))
    }
}

#[async_trait]
impl QueryExecutor for GreptimeExecutor {
    async fn execute(&self, sql: &str, expect_rows: bool) -> Result<QueryOutcome> {
        let mut conn = self.checkout().await?;
        let outcome = tokio::time::timeout(self.timeout, async {
            if expect_rows {
                let rows: Vec<Row> = conn
                    .query(sql)
                    .await
                    .map_err(|e| ServerError::query_failed(e.to_string()))?;
                Ok(QueryOutcome::Rows(rows_to_result_set(&rows)?))
            } else {
                let result = conn
                    .query_iter(sql)
                    .await
                    .map_err(|e| ServerError::query_failed(e.to_string()))?;
                let affected = result.affected_rows();
                drop(result);
                Ok(QueryOutcome::Affected(affected))
            }
        })
        .await
        .map_err(|_| {
            ServerError::query_failed(format!(
                "query exceeded timeout of {}s",
                self.timeout.as_secs()
            ))
        })??;
        Ok(outcome)
    }

    async fn server_version(&self) -> Result<String> {
        let mut conn = self.checkout().await?;
        let row: Option<Row> = tokio::time::timeout(self.timeout, conn.query_first("SELECT VERSION()"))
            .await
            .map_err(|_| ServerError::transport("version probe timed out"))?
            .map_err(|e| ServerError::query_failed(e.to_string()))?;
        row.and_then(|r| r.get::<String, _>(0))
            .ok_or_else(|| ServerError::query_failed("no version returned"))
    }
}

/// Convert driver rows into the formatter's result set. Column names
/// come from row metadata, so an empty result set has no columns.
fn rows_to_result_set(rows: &[Row]) -> Result<ResultSet> {
    let columns: Vec<String> = rows.first().map_or_else(Vec::new, |first| {
        first
            .columns_ref()
            .iter()
            .map(|col| col.name_str().to_string())
            .collect()
    });

    let mut converted = Vec::with_capacity(rows.len());
    for row in rows {
        let mut cells = Vec::with_capacity(columns.len());
        for idx in 0..row.columns_ref().len() {
            let value = row.as_ref(idx).ok_or_else(|| {
                ServerError::query_failed(format!("missing value at index {idx}"))
            })?;
            cells.push(mysql_value_to_cell(value)?);
        }
        converted.push(cells);
    }
    Ok(ResultSet::new(columns, converted))
}

/// Convert one driver value into a typed cell.
fn mysql_value_to_cell(value: &Value) -> Result<CellValue> {
    let cell = match value {
        Value::NULL => CellValue::Null,
        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => CellValue::Text(s.to_string()),
            Err(_) => CellValue::Binary(bytes.clone()),
        },
        Value::Int(i) => CellValue::Int(*i),
        Value::UInt(u) => CellValue::UInt(*u),
        Value::Float(f) => CellValue::Float(f64::from(*f)),
        Value::Double(d) => CellValue::Float(*d),
        Value::Date(year, month, day, hour, minute, second, micro) => {
            let ts = NaiveDate::from_ymd_opt(i32::from(*year), u32::from(*month), u32::from(*day))
                .and_then(|d| {
                    d.and_hms_micro_opt(
                        u32::from(*hour),
                        u32::from(*minute),
                        u32::from(*second),
                        *micro,
                    )
                })
                .ok_or_else(|| ServerError::query_failed("out-of-range temporal value"))?;
            CellValue::Temporal(ts)
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            CellValue::Text(format!(
                "{sign}{total_hours}:{minutes:02}:{seconds:02}.{micros:06}"
            ))
        }
    };
    Ok(cell)
}
