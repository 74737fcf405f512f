//! BigQuery Driver
//!
//! Runs statements through the `jobs.query` REST endpoint with positional
//! query parameters, then pages with `getQueryResults` until the job is
//! complete and every page is read.
//!
//! URIs look like `bigquery://:<token>@<project>/<dataset>`. The access token
//! may also be given as `access_token=`; `location=` pins the job location and
//! `endpoint=` points at an emulator or a private endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Client, RequestBuilder, StatusCode};
use rela_core::{ColumnInfo, EngineError, EngineResult, QueryResult, Row as QRow, SessionId, Value};
use rela_sql::Dialect;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::http::{self, CellKind};
use crate::engine::target::ConnectTarget;
use crate::engine::traits::{EngineAdapter, SessionOptions};

const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";
/// Server-side wait per request before answering `jobComplete: false`.
const WAIT_MS: u64 = 10_000;

struct BigQuerySession {
    client: Client,
    endpoint: String,
    project: String,
    dataset: Option<String>,
    token: String,
    location: Option<String>,
    running: parking_lot::Mutex<Option<JobReference>>,
}

impl BigQuerySession {
    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Field {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Schema {
    #[serde(default)]
    fields: Vec<Field>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_reference: Option<JobReference>,
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    schema: Option<Schema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    num_dml_affected_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: String,
}

/// BigQuery adapter implementation
pub struct BigQueryAdapter {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<BigQuerySession>>>>,
}

impl BigQueryAdapter {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: SessionId) -> EngineResult<Arc<BigQuerySession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session)
            .cloned()
            .ok_or_else(|| EngineError::execution_error(format!("unknown session {}", session)))
    }

    fn build_session(
        target: &ConnectTarget,
        options: &SessionOptions,
    ) -> EngineResult<BigQuerySession> {
        let project = target.host();
        if project.is_empty() {
            return Err(EngineError::malformed_uri("A project id is required as the host"));
        }
        let token = target
            .password()
            .or_else(|| target.options().get("access_token").map(String::as_str))
            .ok_or_else(|| {
                EngineError::malformed_uri("An access token is required (password slot or access_token)")
            })?;
        let endpoint = target
            .options()
            .get("endpoint")
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        Ok(BigQuerySession {
            client: http::build_client(options)?,
            endpoint,
            project: project.to_string(),
            dataset: target.param("dataset").map(str::to_string),
            token: token.to_string(),
            location: target.options().get("location").cloned(),
            running: parking_lot::Mutex::new(None),
        })
    }

    fn query_body(session: &BigQuerySession, sql: &str, params: &[Value]) -> EngineResult<serde_json::Value> {
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": WAIT_MS,
            "requestId": Uuid::new_v4().to_string(),
        });
        if let Some(dataset) = &session.dataset {
            body["defaultDataset"] = json!({ "projectId": session.project, "datasetId": dataset });
        }
        if let Some(location) = &session.location {
            body["location"] = json!(location);
        }
        if !params.is_empty() {
            body["parameterMode"] = json!("POSITIONAL");
            body["queryParameters"] = serde_json::Value::Array(
                params
                    .iter()
                    .map(query_parameter)
                    .collect::<EngineResult<Vec<_>>>()?,
            );
        }
        Ok(body)
    }

    async fn send(request: RequestBuilder) -> EngineResult<QueryResponse> {
        let response = http::send(request).await?;
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(http::transport_error);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_error(status, &body))
    }

    async fn run(
        &self,
        session: &BigQuerySession,
        sql: &str,
        params: &[Value],
    ) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let body = Self::query_body(session, sql, params)?;
        let request = session
            .client
            .post(format!("{}/projects/{}/queries", session.endpoint, session.project))
            .json(&body);
        let mut page = Self::send(session.authorized(request)).await?;

        let job = page.job_reference.clone();
        *session.running.lock() = job.clone();
        let result = self.drain(session, job.as_ref(), &mut page).await;
        session.running.lock().take();
        let (fields, rows) = result?;

        let execution_time_ms = start.elapsed().as_micros() as f64 / 1000.0;
        if let Some(affected) = page.num_dml_affected_rows.as_deref() {
            return Ok(QueryResult::with_affected_rows(
                affected.parse().unwrap_or(0),
                execution_time_ms,
            ));
        }
        if fields.is_empty() {
            return Ok(QueryResult::with_affected_rows(0, execution_time_ms));
        }

        let kinds: Vec<CellKind> = fields.iter().map(cell_kind).collect();
        let rows = rows
            .into_iter()
            .map(|row| QRow {
                values: row
                    .f
                    .into_iter()
                    .zip(fields.iter().zip(kinds.iter()))
                    .map(|(cell, (field, kind))| convert_cell(field, *kind, cell.v))
                    .collect(),
            })
            .collect();
        Ok(QueryResult {
            columns: fields
                .into_iter()
                .map(|f| ColumnInfo::new(f.name, f.type_name))
                .collect(),
            rows,
            affected_rows: None,
            execution_time_ms,
        })
    }

    /// Waits for the job and reads every page.
    async fn drain(
        &self,
        session: &BigQuerySession,
        job: Option<&JobReference>,
        page: &mut QueryResponse,
    ) -> EngineResult<(Vec<Field>, Vec<TableRow>)> {
        let mut rows = Vec::new();
        let mut schema = page.schema.take();
        loop {
            if page.job_complete {
                rows.append(&mut page.rows);
                if schema.is_none() {
                    schema = page.schema.take();
                }
                if page.page_token.is_none() {
                    break;
                }
            }
            let Some(job) = job else {
                return Err(EngineError::execution_error("BigQuery returned no job reference"));
            };

            let mut query: Vec<(&str, String)> = vec![("timeoutMs", WAIT_MS.to_string())];
            if let Some(location) = job.location.as_ref().or(session.location.as_ref()) {
                query.push(("location", location.clone()));
            }
            if let Some(token) = page.page_token.take() {
                query.push(("pageToken", token));
            }
            let request = session
                .client
                .get(format!(
                    "{}/projects/{}/queries/{}",
                    session.endpoint, job.project_id, job.job_id
                ))
                .query(&query);
            let next = Self::send(session.authorized(request)).await?;
            let affected = page.num_dml_affected_rows.take();
            *page = next;
            if page.num_dml_affected_rows.is_none() {
                page.num_dml_affected_rows = affected;
            }
        }
        Ok((schema.map(|s| s.fields).unwrap_or_default(), rows))
    }
}

impl Default for BigQueryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_error(status: StatusCode, body: &str) -> EngineError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let (message, reason) = match parsed {
        Some(b) => {
            let reason = b.error.errors.first().map(|e| e.reason.clone()).unwrap_or_default();
            (b.error.message, reason)
        }
        None => (format!("HTTP {}: {}", status, body), String::new()),
    };
    match reason.as_str() {
        "invalidQuery" if message.starts_with("Syntax error") => EngineError::syntax_error(message),
        "rateLimitExceeded" | "backendError" | "internalError" | "jobBackendError" => {
            EngineError::execution_retryable(message)
        }
        "stopped" => EngineError::execution_retryable(message),
        "accessDenied" => EngineError::auth_failed(message),
        _ => http::status_error(status, message),
    }
}

fn parameter_type(value: &Value) -> serde_json::Value {
    let name = match value {
        Value::Null | Value::Text(_) => "STRING",
        Value::Bool(_) => "BOOL",
        Value::Int(_) => "INT64",
        Value::Float(_) => "FLOAT64",
        Value::Decimal(_) => "BIGNUMERIC",
        Value::Bytes(_) => "BYTES",
        Value::Json(_) => "JSON",
        Value::Array(items) => {
            let element = items
                .iter()
                .find(|v| !v.is_null())
                .map(parameter_type)
                .unwrap_or_else(|| json!({ "type": "STRING" }));
            return json!({ "type": "ARRAY", "arrayType": element });
        }
    };
    json!({ "type": name })
}

fn parameter_value(value: &Value) -> EngineResult<serde_json::Value> {
    Ok(match value {
        Value::Null => json!({}),
        Value::Bytes(b) => json!({ "value": base64::engine::general_purpose::STANDARD.encode(b) }),
        Value::Float(f) if !f.is_finite() => {
            let text = if f.is_nan() {
                "NaN"
            } else if *f > 0.0 {
                "Infinity"
            } else {
                "-Infinity"
            };
            json!({ "value": text })
        }
        Value::Array(items) => {
            if items.iter().any(Value::is_null) {
                return Err(EngineError::unsupported("BigQuery arrays cannot hold NULL"));
            }
            json!({
                "arrayValues": items
                    .iter()
                    .map(parameter_value)
                    .collect::<EngineResult<Vec<_>>>()?
            })
        }
        other => json!({ "value": http::param_text(other) }),
    })
}

fn query_parameter(value: &Value) -> EngineResult<serde_json::Value> {
    Ok(json!({
        "parameterType": parameter_type(value),
        "parameterValue": parameter_value(value)?,
    }))
}

fn cell_kind(field: &Field) -> CellKind {
    match field.type_name.to_ascii_uppercase().as_str() {
        "INTEGER" | "INT64" => CellKind::Integer,
        "FLOAT" | "FLOAT64" => CellKind::Float,
        "NUMERIC" | "BIGNUMERIC" => CellKind::Decimal,
        "BOOLEAN" | "BOOL" => CellKind::Boolean,
        "BYTES" => CellKind::Base64,
        "JSON" => CellKind::Json,
        _ => CellKind::Text,
    }
}

/// Converts a `v` cell. REPEATED fields carry `[{"v": ..}]`, RECORDs carry
/// `{"f": [..]}` and are kept as JSON.
fn convert_cell(field: &Field, kind: CellKind, v: serde_json::Value) -> Value {
    if field.mode.as_deref() == Some("REPEATED") {
        if let serde_json::Value::Array(items) = v {
            return Value::Array(
                items
                    .into_iter()
                    .map(|item| scalar_cell(field, kind, item.get("v").cloned().unwrap_or(item)))
                    .collect(),
            );
        }
    }
    scalar_cell(field, kind, v)
}

fn scalar_cell(field: &Field, kind: CellKind, v: serde_json::Value) -> Value {
    match (field.type_name.to_ascii_uppercase().as_str(), v) {
        (_, serde_json::Value::Null) => Value::Null,
        ("TIMESTAMP", serde_json::Value::String(s)) => {
            // Seconds since the epoch in float notation, e.g. "1.6E9"
            let micros = s.parse::<f64>().ok().map(|secs| (secs * 1_000_000.0).round() as i64);
            match micros.and_then(chrono::DateTime::from_timestamp_micros) {
                Some(dt) => Value::Text(dt.format("%Y-%m-%d %H:%M:%S%.f UTC").to_string()),
                None => Value::Text(s),
            }
        }
        ("RECORD" | "STRUCT", other) => Value::Json(other),
        (_, other) => http::json_to_value(kind, other),
    }
}

#[async_trait]
impl EngineAdapter for BigQueryAdapter {
    fn engine_id(&self) -> &str {
        "bigquery"
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
        tracing::debug!(session = %session_id, project = %session.project, "BigQuery session opened");
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
        let sql = rela_sql::prepare(statement, Dialect::BigQuery, params)?;
        self.run(&session, &sql, params).await
    }

    async fn cancel(&self, session: SessionId) -> EngineResult<()> {
        let session = self.get_session(session).await?;
        let Some(job) = session.running.lock().clone() else {
            return Ok(());
        };
        let mut request = session.client.post(format!(
            "{}/projects/{}/jobs/{}/cancel",
            session.endpoint, job.project_id, job.job_id
        ));
        if let Some(location) = job.location.as_ref().or(session.location.as_ref()) {
            request = request.query(&[("location", location)]);
        }
        let response = http::send(session.authorized(request)).await?;
        http::check(response).await.map(|_| ())
    }

    async fn disconnect(&self, session: SessionId) -> EngineResult<()> {
        // Stateless over REST
        self.sessions.write().await.remove(&session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::descriptor::{AuthMode, EngineDescriptor};

    fn target(uri: &str) -> ConnectTarget {
        let descriptor = EngineDescriptor::new("bigquery", "BigQuery", Dialect::BigQuery)
            .with_auth(AuthMode::Token)
            .with_path_params(&["dataset"]);
        ConnectTarget::bind(&rela_sql::parse(uri).unwrap(), &descriptor).unwrap()
    }

    #[test]
    fn test_build_session() {
        let session = BigQueryAdapter::build_session(
            &target("bigquery://:tok@my-project/analytics?location=EU"),
            &SessionOptions::default(),
        )
        .unwrap();
        assert_eq!(session.project, "my-project");
        assert_eq!(session.dataset.as_deref(), Some("analytics"));
        assert_eq!(session.token, "tok");
        assert_eq!(session.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(session.location.as_deref(), Some("EU"));

        let missing = BigQueryAdapter::build_session(
            &target("bigquery://my-project/analytics"),
            &SessionOptions::default(),
        );
        assert!(matches!(missing, Err(EngineError::MalformedUri { .. })));
    }

    #[test]
    fn test_query_parameters() {
        let p = query_parameter(&Value::Int(3)).unwrap();
        assert_eq!(p["parameterType"]["type"], "INT64");
        assert_eq!(p["parameterValue"]["value"], "3");

        let p = query_parameter(&Value::Null).unwrap();
        assert_eq!(p["parameterValue"], json!({}));

        let p = query_parameter(&Value::Array(vec![Value::Text("a".into())])).unwrap();
        assert_eq!(p["parameterType"]["arrayType"]["type"], "STRING");
        assert_eq!(p["parameterValue"]["arrayValues"][0]["value"], "a");

        let p = query_parameter(&Value::Bytes(vec![1, 2])).unwrap();
        assert_eq!(p["parameterValue"]["value"], "AQI=");
    }

    #[test]
    fn test_convert_cells() {
        let ints = Field { name: "n".into(), type_name: "INTEGER".into(), mode: Some("REPEATED".into()) };
        assert_eq!(
            convert_cell(&ints, cell_kind(&ints), json!([{ "v": "1" }, { "v": "2" }])),
            Value::Array(vec![Value::Int(1), Value::Int(2)])
        );

        let ts = Field { name: "t".into(), type_name: "TIMESTAMP".into(), mode: None };
        assert_eq!(
            convert_cell(&ts, cell_kind(&ts), json!("1.0E9")),
            Value::Text("2001-09-09 01:46:40 UTC".into())
        );

        let bytes = Field { name: "b".into(), type_name: "BYTES".into(), mode: None };
        assert_eq!(convert_cell(&bytes, cell_kind(&bytes), json!("AQI=")), Value::Bytes(vec![1, 2]));
    }

    #[test]
    fn test_error_classification() {
        let body = r#"{"error":{"code":400,"message":"Syntax error: Unexpected identifier","errors":[{"reason":"invalidQuery"}]}}"#;
        assert!(matches!(
            classify_error(StatusCode::BAD_REQUEST, body),
            EngineError::SyntaxError { .. }
        ));
        assert!(matches!(
            classify_error(StatusCode::UNAUTHORIZED, r#"{"error":{"message":"bad token","errors":[]}}"#),
            EngineError::AuthFailed { .. }
        ));
        assert!(classify_error(StatusCode::TOO_MANY_REQUESTS, "slow down").is_retryable());
    }
}
