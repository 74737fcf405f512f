//! ClickHouse Driver
//!
//! Talks to the ClickHouse HTTP interface. Each session gets a server-side
//! `session_id` so temporary tables and `SET` survive between statements.
//! Every statement carries its own `query_id`, which is what cancellation
//! targets with `KILL QUERY`.
//!
//! The native port 9000 is mapped to the HTTP port (8123, or 8443 when
//! secure) unless `http_port` says otherwise. Unrecognized query parameters
//! are forwarded as ClickHouse settings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use rela_core::{ColumnInfo, EngineError, EngineResult, QueryResult, Row as QRow, SessionId, Value};
use rela_sql::Dialect;
use serde::Deserialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::http::{self, CellKind};
use crate::engine::target::ConnectTarget;
use crate::engine::traits::{EngineAdapter, SessionOptions};

const NATIVE_PORT: u16 = 9000;
const RESERVED_OPTIONS: &[&str] = &["database", "secure", "ssl", "http_port"];

struct ClickHouseSession {
    client: Client,
    endpoint: String,
    user: String,
    password: Option<String>,
    database: Option<String>,
    session_id: String,
    settings: Vec<(String, String)>,
    running: parking_lot::Mutex<Option<String>>,
}

impl ClickHouseSession {
    fn request(&self, sql: String, query_id: &str, in_session: bool) -> RequestBuilder {
        let mut query: Vec<(&str, &str)> = vec![
            ("query_id", query_id),
            ("default_format", "JSONCompact"),
        ];
        if in_session {
            query.push(("session_id", self.session_id.as_str()));
        }
        if let Some(db) = &self.database {
            query.push(("database", db.as_str()));
        }
        for (key, value) in &self.settings {
            query.push((key.as_str(), value.as_str()));
        }

        let mut request = self
            .client
            .post(&self.endpoint)
            .query(&query)
            .header("X-ClickHouse-User", &self.user)
            .body(sql);
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }
        request
    }
}

#[derive(Debug, Deserialize)]
struct ColumnMeta {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
}

#[derive(Debug, Deserialize)]
struct CompactResult {
    meta: Vec<ColumnMeta>,
    data: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct Summary {
    #[serde(default)]
    written_rows: Option<String>,
}

/// ClickHouse adapter implementation
pub struct ClickHouseAdapter {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<ClickHouseSession>>>>,
}

impl ClickHouseAdapter {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: SessionId) -> EngineResult<Arc<ClickHouseSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session)
            .cloned()
            .ok_or_else(|| EngineError::execution_error(format!("unknown session {}", session)))
    }

    fn endpoint(target: &ConnectTarget) -> EngineResult<String> {
        if target.host().is_empty() {
            return Err(EngineError::malformed_uri("A host is required"));
        }
        let scheme = http::http_scheme(target, false)?;
        let port = match target.options().get("http_port") {
            Some(p) => p.parse::<u16>().map_err(|_| {
                EngineError::malformed_uri(format!("Invalid http_port '{}'", p))
            })?,
            None => match target.port() {
                Some(NATIVE_PORT) | None if scheme == "https" => 8443,
                Some(NATIVE_PORT) | None => 8123,
                Some(port) => port,
            },
        };
        Ok(format!("{}://{}:{}/", scheme, target.host(), port))
    }

    async fn run(
        session: &ClickHouseSession,
        sql: String,
        query_id: &str,
    ) -> EngineResult<Response> {
        let response = http::send(session.request(sql, query_id, true)).await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let code = response
            .headers()
            .get("X-ClickHouse-Exception-Code")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i32>().ok());
        let body = response.text().await.unwrap_or_default();
        let code = code.or_else(|| parse_error_code(&body));
        let message = body.trim().to_string();
        Err(match code {
            Some(code) => classify_code(code, message),
            None => http::status_error(status, message),
        })
    }
}

impl Default for ClickHouseAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts `N` from a `Code: N. DB::Exception: ...` body.
fn parse_error_code(body: &str) -> Option<i32> {
    let rest = body.trim_start().strip_prefix("Code:")?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn classify_code(code: i32, message: String) -> EngineError {
    match code {
        62 => EngineError::syntax_error(message),
        192 | 193 | 194 | 195 | 516 => EngineError::auth_failed(message),
        // TIMEOUT_EXCEEDED, QUERY_WAS_CANCELLED, TOO_MANY_SIMULTANEOUS_QUERIES
        159 | 202 | 394 => EngineError::execution_retryable(message),
        81 | 210 | 209 => EngineError::connection_failed(message),
        _ => EngineError::execution_error(message),
    }
}

fn convert_result(result: CompactResult) -> (Vec<ColumnInfo>, Vec<QRow>) {
    let kinds: Vec<CellKind> = result
        .meta
        .iter()
        .map(|m| CellKind::from_type_name(&m.type_name))
        .collect();
    let columns = result
        .meta
        .into_iter()
        .map(|m| ColumnInfo::new(m.name, m.type_name))
        .collect();
    let rows = result
        .data
        .into_iter()
        .map(|cells| QRow {
            values: cells
                .into_iter()
                .zip(kinds.iter())
                .map(|(cell, kind)| http::json_to_value(*kind, cell))
                .collect(),
        })
        .collect();
    (columns, rows)
}

#[async_trait]
impl EngineAdapter for ClickHouseAdapter {
    fn engine_id(&self) -> &str {
        "clickhouse"
    }

    async fn connect(
        &self,
        target: &ConnectTarget,
        options: &SessionOptions,
    ) -> EngineResult<SessionId> {
        let settings = target
            .options()
            .iter()
            .filter(|(k, _)| !RESERVED_OPTIONS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let session = ClickHouseSession {
            client: http::build_client(options)?,
            endpoint: Self::endpoint(target)?,
            user: target.user().unwrap_or("default").to_string(),
            password: target.password().map(str::to_string),
            database: target.param("database").map(str::to_string),
            session_id: Uuid::new_v4().to_string(),
            settings,
            running: parking_lot::Mutex::new(None),
        };

        // Validates credentials and the database before handing out a session
        let probe = Uuid::new_v4().to_string();
        Self::run(&session, "SELECT 1".to_string(), &probe)
            .await
            .map_err(|e| match e {
                EngineError::ExecutionError { message, .. } => {
                    EngineError::connection_failed(message)
                }
                other => other,
            })?;

        let session_id = SessionId::new();
        tracing::debug!(session = %session_id, endpoint = %session.endpoint, "ClickHouse session opened");
        self.sessions.write().await.insert(session_id, Arc::new(session));
        Ok(session_id)
    }

    async fn execute(
        &self,
        session: SessionId,
        statement: &str,
        params: &[Value],
    ) -> EngineResult<QueryResult> {
        let session = self.get_session(session).await?;
        let sql = rela_sql::prepare(statement, Dialect::ClickHouse, params)?;
        let returns_rows = rela_sql::returns_rows(&sql, Dialect::ClickHouse);

        let query_id = Uuid::new_v4().to_string();
        *session.running.lock() = Some(query_id.clone());
        let start = Instant::now();
        let outcome = Self::run(&session, sql, &query_id).await;
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                session.running.lock().take();
                return Err(e);
            }
        };

        let summary: Summary = response
            .headers()
            .get("X-ClickHouse-Summary")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        let body = response.text().await.map_err(http::transport_error);
        session.running.lock().take();
        let body = body?;

        let execution_time_ms = start.elapsed().as_micros() as f64 / 1000.0;
        if returns_rows && !body.trim().is_empty() {
            let result: CompactResult = serde_json::from_str(&body).map_err(|e| {
                EngineError::execution_error(format!("Invalid ClickHouse response: {}", e))
            })?;
            let (columns, rows) = convert_result(result);
            return Ok(QueryResult {
                columns,
                rows,
                affected_rows: None,
                execution_time_ms,
            });
        }

        let written = summary
            .written_rows
            .and_then(|w| w.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(QueryResult::with_affected_rows(written, execution_time_ms))
    }

    async fn cancel(&self, session: SessionId) -> EngineResult<()> {
        let session = self.get_session(session).await?;
        let Some(query_id) = session.running.lock().clone() else {
            return Ok(());
        };
        let kill = format!(
            "KILL QUERY WHERE query_id = {} ASYNC",
            Dialect::ClickHouse.format_literal(&Value::Text(query_id))?
        );
        // The session is locked by the running statement, so this goes outside it
        let probe = Uuid::new_v4().to_string();
        let response = http::send(session.request(kill, &probe, false)).await?;
        http::check(response).await.map(|_| ())
    }

    async fn disconnect(&self, session: SessionId) -> EngineResult<()> {
        // Server-side sessions expire on their own
        self.sessions.write().await.remove(&session);
        Ok(())
    }
}
