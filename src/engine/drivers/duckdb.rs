// SPDX-License-Identifier: Apache-2.0

//! DuckDB Driver
//!
//! Serves the `duckdb` scheme using the native `duckdb` crate.
//!
//! ## Paths
//!
//! The URI path is the database file: `duckdb:///rel.db` is relative to the
//! working directory, `duckdb:////abs/x.db` is absolute. An empty path or
//! `:memory:` opens an in-memory database. `read_only=true` opens the file
//! read-only; every other query parameter is passed to DuckDB as a
//! configuration option.
//!
//! ## Concurrency Model
//!
//! The `duckdb` crate provides a synchronous API. All operations are wrapped
//! in `tokio::task::spawn_blocking`. The `Connection` is `Send` but `!Sync`,
//! so it is protected by a `std::sync::Mutex`. A running statement holds that
//! lock, so cancel and disconnect go through the session's `InterruptHandle`
//! first to make it return.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use ::duckdb::types::{TimeUnit, Value as DuckValue};
use ::duckdb::{params_from_iter, AccessMode, Config, Connection, InterruptHandle};
use async_trait::async_trait;
use rela_core::{ColumnInfo, EngineError, EngineResult, QueryResult, Row as QRow, SessionId, Value};
use rela_sql::Dialect;
use tokio::sync::RwLock;

use crate::engine::target::ConnectTarget;
use crate::engine::traits::{EngineAdapter, SessionOptions};

/// Holds the connection state for a DuckDB session.
struct DuckDbSession {
    /// `None` once the session is closed.
    conn: std::sync::Mutex<Option<Connection>>,
    /// Aborts whatever runs on `conn` without taking the lock
    interrupt: Arc<InterruptHandle>,
    db_path: String,
}

/// DuckDB adapter implementation.
pub struct DuckDbAdapter {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<DuckDbSession>>>>,
}

impl DuckDbAdapter {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: SessionId) -> EngineResult<Arc<DuckDbSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session)
            .cloned()
            .ok_or_else(|| EngineError::execution_error(format!("unknown session {}", session)))
    }

    fn is_memory(path: &str) -> bool {
        path.is_empty() || path == ":memory:"
    }

    fn config(target: &ConnectTarget) -> EngineResult<Config> {
        let mut config = Config::default();
        if target.flag("read_only")?.unwrap_or(false) {
            config = config
                .access_mode(AccessMode::ReadOnly)
                .map_err(|e| EngineError::malformed_uri(e.to_string()))?;
        }
        for (key, value) in target.options() {
            if key == "read_only" {
                continue;
            }
            config = config.with(key, value).map_err(|e| {
                EngineError::malformed_uri(format!("Invalid DuckDB option '{}': {}", key, e))
            })?;
        }
        Ok(config)
    }

    /// Opens a DuckDB connection for the bound target.
    fn open_connection(path: &str, config: Config) -> EngineResult<Connection> {
        if Self::is_memory(path) {
            Connection::open_in_memory_with_flags(config).map_err(|e| {
                EngineError::connection_failed(format!("Failed to open DuckDB in-memory: {e}"))
            })
        } else {
            Connection::open_with_flags(path, config).map_err(|e| {
                EngineError::connection_failed(format!("Failed to open DuckDB file '{}': {e}", path))
            })
        }
    }

    /// Runs a synchronous closure on the session's connection inside spawn_blocking.
    async fn with_conn<F, R>(session: &Arc<DuckDbSession>, f: F) -> EngineResult<R>
    where
        F: FnOnce(&Connection) -> EngineResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let session = Arc::clone(session);
        tokio::task::spawn_blocking(move || {
            let guard = session.conn.lock().map_err(|e| {
                EngineError::execution_error(format!("Failed to lock DuckDB connection: {e}"))
            })?;
            match guard.as_ref() {
                Some(conn) => f(conn),
                None => Err(EngineError::execution_error("session is closed")),
            }
        })
        .await
        .map_err(|e| EngineError::execution_error(format!("DuckDB task panicked: {e}")))?
    }
}

impl Default for DuckDbAdapter {
    fn default() -> Self {
        Self::new()
    }
}

// ==================== Type Conversion ====================

/// Converts a Value to a DuckDB value for parameter binding.
fn value_to_duckdb(value: &Value) -> EngineResult<DuckValue> {
    Ok(match value {
        Value::Null => DuckValue::Null,
        Value::Bool(b) => DuckValue::Boolean(*b),
        Value::Int(i) => DuckValue::BigInt(*i),
        Value::Float(f) => DuckValue::Double(*f),
        // DuckDB casts the text to the parameter's inferred type
        Value::Text(s) | Value::Decimal(s) => DuckValue::Text(s.clone()),
        Value::Bytes(b) => DuckValue::Blob(b.clone()),
        Value::Json(j) => DuckValue::Text(j.to_string()),
        Value::Array(items) => DuckValue::List(
            items
                .iter()
                .map(value_to_duckdb)
                .collect::<EngineResult<Vec<_>>>()?,
        ),
    })
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

/// Converts a DuckDB value to a Value.
fn duckdb_to_value(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::Int(i as i64),
        DuckValue::SmallInt(i) => Value::Int(i as i64),
        DuckValue::Int(i) => Value::Int(i as i64),
        DuckValue::BigInt(i) => Value::Int(i),
        DuckValue::UTinyInt(u) => Value::Int(u as i64),
        DuckValue::USmallInt(u) => Value::Int(u as i64),
        DuckValue::UInt(u) => Value::Int(u as i64),
        DuckValue::UBigInt(u) => i64::try_from(u)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Decimal(u.to_string())),
        DuckValue::HugeInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Decimal(i.to_string())),
        DuckValue::Float(f) => Value::Float(f as f64),
        DuckValue::Double(f) => Value::Float(f),
        DuckValue::Decimal(d) => Value::Decimal(d.to_string()),
        DuckValue::Text(s) | DuckValue::Enum(s) => Value::Text(s),
        DuckValue::Blob(b) => Value::Bytes(b),
        DuckValue::Timestamp(unit, v) => {
            match chrono::DateTime::from_timestamp_micros(to_micros(unit, v)) {
                Some(dt) => Value::Text(dt.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string()),
                None => Value::Int(v),
            }
        }
        DuckValue::Date32(days) => {
            let date = chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
                .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days as i64)));
            match date {
                Some(d) => Value::Text(d.format("%Y-%m-%d").to_string()),
                None => Value::Int(days as i64),
            }
        }
        DuckValue::Time64(unit, v) => {
            let micros = to_micros(unit, v);
            let time = chrono::NaiveTime::from_num_seconds_from_midnight_opt(
                (micros / 1_000_000) as u32,
                ((micros % 1_000_000) * 1_000) as u32,
            );
            match time {
                Some(t) => Value::Text(t.format("%H:%M:%S%.f").to_string()),
                None => Value::Int(v),
            }
        }
        DuckValue::List(items) | DuckValue::Array(items) => {
            Value::Array(items.into_iter().map(duckdb_to_value).collect())
        }
        other => Value::Text(format!("{:?}", other)),
    }
}

/// Executes a row-returning statement.
///
/// NOTE: the duckdb crate only exposes column names once the statement has
/// been executed, so rows are collected first.
fn execute_query(
    conn: &Connection,
    sql: &str,
    params: Vec<DuckValue>,
    start: Instant,
) -> EngineResult<QueryResult> {
    let mut stmt = conn.prepare(sql).map_err(|e| classify_error(e.to_string()))?;

    let rows_iter = stmt
        .query_map(params_from_iter(params), |row| {
            let col_count = row.as_ref().column_count();
            let mut values = Vec::with_capacity(col_count);
            for i in 0..col_count {
                values.push(duckdb_to_value(row.get::<_, DuckValue>(i)?));
            }
            Ok(QRow { values })
        })
        .map_err(|e| classify_error(e.to_string()))?;

    let mut rows = Vec::new();
    for row_result in rows_iter {
        rows.push(row_result.map_err(|e| classify_error(e.to_string()))?);
    }

    let column_count = stmt.column_count();
    let columns: Vec<ColumnInfo> = (0..column_count)
        .map(|i| {
            let name = stmt
                .column_name(i)
                .map(|s| s.to_string())
                .unwrap_or_else(|_| format!("col_{}", i));
            ColumnInfo::new(name, stmt.column_type(i).to_string())
        })
        .collect();

    Ok(QueryResult {
        columns,
        rows,
        affected_rows: None,
        execution_time_ms: start.elapsed().as_micros() as f64 / 1000.0,
    })
}

/// Executes a statement that produces no rows and returns affected rows.
fn execute_statement(
    conn: &Connection,
    sql: &str,
    params: Vec<DuckValue>,
    start: Instant,
) -> EngineResult<QueryResult> {
    let affected = conn
        .execute(sql, params_from_iter(params))
        .map_err(|e| classify_error(e.to_string()))?;

    Ok(QueryResult::with_affected_rows(
        affected as u64,
        start.elapsed().as_micros() as f64 / 1000.0,
    ))
}

/// Classifies a DuckDB error message into syntax or execution error.
fn classify_error(msg: String) -> EngineError {
    let lower = msg.to_lowercase();
    if lower.contains("syntax") || lower.contains("parser") {
        EngineError::syntax_error(msg)
    } else if lower.contains("interrupted") {
        EngineError::execution_retryable(msg)
    } else {
        EngineError::execution_error(msg)
    }
}

#[async_trait]
impl EngineAdapter for DuckDbAdapter {
    fn engine_id(&self) -> &str {
        "duckdb"
    }

    async fn connect(
        &self,
        target: &ConnectTarget,
        _options: &SessionOptions,
    ) -> EngineResult<SessionId> {
        let db_path = target.path().trim().to_string();
        // duckdb::Config is not Send, so it is built on the blocking thread
        let target = target.clone();

        let path = db_path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let config = Self::config(&target)?;
            Self::open_connection(&path, config)
        })
            .await
            .map_err(|e| EngineError::connection_failed(format!("DuckDB task panicked: {e}")))??;

        let session_id = SessionId::new();
        let interrupt = conn.interrupt_handle();
        let session = Arc::new(DuckDbSession {
            conn: std::sync::Mutex::new(Some(conn)),
            interrupt,
            db_path,
        });
        let shown = if Self::is_memory(&session.db_path) {
            ":memory:"
        } else {
            session.db_path.as_str()
        };
        tracing::debug!(session = %session_id, path = shown, "DuckDB session opened");

        self.sessions.write().await.insert(session_id, session);
        Ok(session_id)
    }

    async fn execute(
        &self,
        session: SessionId,
        statement: &str,
        params: &[Value],
    ) -> EngineResult<QueryResult> {
        let session = self.get_session(session).await?;
        let sql = rela_sql::prepare(statement, Dialect::DuckDb, params)?;
        let returns_rows = rela_sql::returns_rows(&sql, Dialect::DuckDb);
        let values = params
            .iter()
            .map(value_to_duckdb)
            .collect::<EngineResult<Vec<_>>>()?;

        Self::with_conn(&session, move |conn| {
            let start = Instant::now();
            if returns_rows {
                execute_query(conn, &sql, values, start)
            } else {
                execute_statement(conn, &sql, values, start)
            }
        })
        .await
    }

    async fn ping(&self, session: SessionId) -> EngineResult<()> {
        let session = self.get_session(session).await?;
        Self::with_conn(&session, |conn| {
            conn.execute("SELECT 1", [])
                .map(|_| ())
                .map_err(|e| EngineError::connection_failed(e.to_string()))
        })
        .await
    }

    async fn cancel(&self, session: SessionId) -> EngineResult<()> {
        let session = self.get_session(session).await?;
        session.interrupt.interrupt();
        Ok(())
    }

    async fn disconnect(&self, session: SessionId) -> EngineResult<()> {
        let removed = self.sessions.write().await.remove(&session);
        if let Some(session) = removed {
            // a statement still running holds the lock until interrupted
            session.interrupt.interrupt();
            tokio::task::spawn_blocking(move || {
                if let Ok(mut guard) = session.conn.lock() {
                    // Dropping the connection closes it
                    guard.take();
                }
            })
            .await
            .map_err(|e| EngineError::execution_error(format!("DuckDB task panicked: {e}")))?;
        }
        Ok(())
    }
}
