//! Databricks Driver
//!
//! Uses the SQL Statement Execution API (`/api/2.0/sql/statements`) against a
//! SQL warehouse. URIs look like
//! `databricks://:<token>@<workspace-host>/sql/1.0/warehouses/<id>?catalog=..&schema=..`;
//! the warehouse id is the last path segment. Parameters are sent as named
//! `:pN` markers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use rela_core::{ColumnInfo, EngineError, EngineResult, QueryResult, Row as QRow, SessionId, Value};
use rela_sql::Dialect;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use super::http::{self, CellKind};
use crate::engine::target::ConnectTarget;
use crate::engine::traits::{EngineAdapter, SessionOptions};

struct DatabricksSession {
    client: Client,
    base: String,
    token: String,
    warehouse_id: String,
    catalog: Option<String>,
    schema: Option<String>,
    running: parking_lot::Mutex<Option<String>>,
}

impl DatabricksSession {
    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }
}

#[derive(Debug, Deserialize)]
struct StatementError {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Status {
    state: String,
    #[serde(default)]
    error: Option<StatementError>,
}

#[derive(Debug, Deserialize)]
struct Column {
    name: String,
    #[serde(default)]
    type_name: String,
    #[serde(default)]
    type_text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestSchema {
    #[serde(default)]
    columns: Vec<Column>,
}

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    schema: ManifestSchema,
}

#[derive(Debug, Default, Deserialize)]
struct ResultChunk {
    #[serde(default)]
    data_array: Vec<Vec<Option<String>>>,
    #[serde(default)]
    next_chunk_internal_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    statement_id: String,
    status: Status,
    #[serde(default)]
    manifest: Option<Manifest>,
    #[serde(default)]
    result: Option<ResultChunk>,
}

/// Databricks adapter implementation
pub struct DatabricksAdapter {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<DatabricksSession>>>>,
}

impl DatabricksAdapter {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: SessionId) -> EngineResult<Arc<DatabricksSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session)
            .cloned()
            .ok_or_else(|| EngineError::execution_error(format!("unknown session {}", session)))
    }

    fn build_session(
        target: &ConnectTarget,
        options: &SessionOptions,
    ) -> EngineResult<DatabricksSession> {
        let token = target
            .password()
            .or_else(|| target.options().get("access_token").map(String::as_str))
            .ok_or_else(|| EngineError::malformed_uri("An access token is required"))?;
        let warehouse_id = target
            .path()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                EngineError::malformed_uri(
                    "The path must end with the SQL warehouse id, e.g. /sql/1.0/warehouses/<id>",
                )
            })?;

        Ok(DatabricksSession {
            client: http::build_client(options)?,
            base: http::base_url(target, true)?,
            token: token.to_string(),
            warehouse_id: warehouse_id.to_string(),
            catalog: target.options().get("catalog").cloned(),
            schema: target.options().get("schema").cloned(),
            running: parking_lot::Mutex::new(None),
        })
    }

    fn statement_body(
        session: &DatabricksSession,
        sql: &str,
        params: &[Value],
    ) -> EngineResult<serde_json::Value> {
        let mut body = json!({
            "statement": sql,
            "warehouse_id": session.warehouse_id,
            "wait_timeout": "30s",
            "on_wait_timeout": "CONTINUE",
            "disposition": "INLINE",
            "format": "JSON_ARRAY",
        });
        if let Some(catalog) = &session.catalog {
            body["catalog"] = json!(catalog);
        }
        if let Some(schema) = &session.schema {
            body["schema"] = json!(schema);
        }
        if !params.is_empty() {
            body["parameters"] = serde_json::Value::Array(
                params
                    .iter()
                    .enumerate()
                    .map(|(i, v)| named_parameter(i + 1, v))
                    .collect::<EngineResult<Vec<_>>>()?,
            );
        }
        Ok(body)
    }

    async fn run(
        &self,
        session: &DatabricksSession,
        sql: &str,
        params: &[Value],
    ) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let body = Self::statement_body(session, sql, params)?;
        let request = session
            .client
            .post(format!("{}/api/2.0/sql/statements", session.base))
            .json(&body);
        let mut response: StatementResponse = http::json(http::send(session.authorized(request)).await?).await?;

        *session.running.lock() = Some(response.statement_id.clone());
        let outcome = self.wait(session, &mut response).await;
        session.running.lock().take();
        outcome?;

        let columns = response.manifest.take().unwrap_or_default().schema.columns;
        let mut raw = Vec::new();
        let mut chunk = response.result.take();
        while let Some(mut current) = chunk {
            raw.append(&mut current.data_array);
            chunk = match current.next_chunk_internal_link {
                Some(link) => {
                    let request = session.client.get(format!("{}{}", session.base, link));
                    Some(http::json(http::send(session.authorized(request)).await?).await?)
                }
                None => None,
            };
        }

        let kinds: Vec<CellKind> = columns.iter().map(cell_kind).collect();
        let rows: Vec<QRow> = raw
            .into_iter()
            .map(|cells| QRow {
                values: cells
                    .into_iter()
                    .zip(kinds.iter())
                    .map(|(cell, kind)| match cell {
                        None => Value::Null,
                        Some(s) => http::text_to_value(*kind, s),
                    })
                    .collect(),
            })
            .collect();
        let execution_time_ms = start.elapsed().as_micros() as f64 / 1000.0;

        if !rela_sql::returns_rows(sql, Dialect::Databricks) {
            // DML answers with num_affected_rows / num_inserted_rows
            let affected = columns
                .iter()
                .position(|c| c.name == "num_affected_rows")
                .and_then(|idx| rows.first().and_then(|r| r.get(idx)).and_then(Value::as_i64))
                .unwrap_or(0);
            return Ok(QueryResult::with_affected_rows(
                affected.max(0) as u64,
                execution_time_ms,
            ));
        }

        Ok(QueryResult {
            columns: columns
                .into_iter()
                .map(|c| {
                    let data_type = c.type_text.unwrap_or(c.type_name);
                    ColumnInfo::new(c.name, data_type)
                })
                .collect(),
            rows,
            affected_rows: None,
            execution_time_ms,
        })
    }

    /// Polls until the statement leaves PENDING/RUNNING.
    async fn wait(
        &self,
        session: &DatabricksSession,
        response: &mut StatementResponse,
    ) -> EngineResult<()> {
        loop {
            match response.status.state.as_str() {
                "PENDING" | "RUNNING" => {
                    tokio::time::sleep(http::POLL_INTERVAL).await;
                    let request = session.client.get(format!(
                        "{}/api/2.0/sql/statements/{}",
                        session.base, response.statement_id
                    ));
                    *response = http::json(http::send(session.authorized(request)).await?).await?;
                }
                "SUCCEEDED" => return Ok(()),
                "CANCELED" | "CLOSED" => {
                    return Err(EngineError::execution_retryable(format!(
                        "statement {} was {}",
                        response.statement_id,
                        response.status.state.to_ascii_lowercase()
                    )))
                }
                _ => {
                    let error = response.status.error.take().unwrap_or(StatementError {
                        error_code: None,
                        message: format!("statement {} failed", response.statement_id),
                    });
                    return Err(classify_error(error));
                }
            }
        }
    }
}

impl Default for DatabricksAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_error(error: StatementError) -> EngineError {
    let code = error.error_code.as_deref().unwrap_or("");
    if error.message.contains("PARSE_SYNTAX_ERROR") || error.message.contains("Syntax error") {
        return EngineError::syntax_error(error.message);
    }
    match code {
        "PERMISSION_DENIED" | "UNAUTHENTICATED" => EngineError::auth_failed(error.message),
        "TEMPORARILY_UNAVAILABLE" | "RESOURCE_EXHAUSTED" | "DEADLINE_EXCEEDED" => {
            EngineError::execution_retryable(error.message)
        }
        _ => EngineError::execution_error(error.message),
    }
}

fn named_parameter(position: usize, value: &Value) -> EngineResult<serde_json::Value> {
    let name = format!("p{}", position);
    let kind = match value {
        Value::Null | Value::Text(_) | Value::Decimal(_) | Value::Json(_) => "STRING",
        Value::Bool(_) => "BOOLEAN",
        Value::Int(_) => "BIGINT",
        Value::Float(_) => "DOUBLE",
        Value::Bytes(_) | Value::Array(_) => {
            return Err(EngineError::unsupported(
                "Databricks parameters must be scalar and non-binary",
            ))
        }
    };
    Ok(match http::param_text(value) {
        Some(text) => json!({ "name": name, "type": kind, "value": text }),
        None => json!({ "name": name, "type": kind }),
    })
}

fn cell_kind(column: &Column) -> CellKind {
    match column.type_name.to_ascii_uppercase().as_str() {
        "BYTE" | "SHORT" | "INT" | "LONG" | "TINYINT" | "SMALLINT" | "BIGINT" => CellKind::Integer,
        "FLOAT" | "DOUBLE" => CellKind::Float,
        "DECIMAL" => CellKind::Decimal,
        "BOOLEAN" => CellKind::Boolean,
        "BINARY" => CellKind::Base64,
        "ARRAY" | "MAP" | "STRUCT" => CellKind::Json,
        _ => CellKind::Text,
    }
}

#[async_trait]
impl EngineAdapter for DatabricksAdapter {
    fn engine_id(&self) -> &str {
        "databricks"
    }

    async fn connect(
        &self,
        target: &ConnectTarget,
        options: &SessionOptions,
    ) -> EngineResult<SessionId> {
        let session = Arc::new(Self::build_session(target, options)?);
        self.run(&session, "SELECT 1", &[]).await.map_err(|e| match e {
            EngineError::ExecutionError { message, .. } => EngineError::connection_failed(message),
            other => other,
        })?;

        let session_id = SessionId::new();
        tracing::debug!(session = %session_id, warehouse = %session.warehouse_id, "Databricks session opened");
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
        let sql = rela_sql::prepare(statement, Dialect::Databricks, params)?;
        self.run(&session, &sql, params).await
    }

    async fn cancel(&self, session: SessionId) -> EngineResult<()> {
        let session = self.get_session(session).await?;
        let Some(statement_id) = session.running.lock().clone() else {
            return Ok(());
        };
        let request = session.client.post(format!(
            "{}/api/2.0/sql/statements/{}/cancel",
            session.base, statement_id
        ));
        http::check(http::send(session.authorized(request)).await?)
            .await
            .map(|_| ())
    }

    async fn disconnect(&self, session: SessionId) -> EngineResult<()> {
        self.sessions.write().await.remove(&session);
        Ok(())
    }
}
