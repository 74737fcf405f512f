//! Trino / Presto Driver
//!
//! Implements the client REST protocol: a statement is POSTed to
//! `/v1/statement` and the result is paged by following `nextUri` until the
//! server stops returning one. Session state the server hands back through
//! `Set-*`/`Clear-*` response headers is kept per session and replayed on the
//! next statement. Presto speaks the same protocol with `X-Presto-` headers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use rela_core::{ColumnInfo, EngineError, EngineResult, QueryResult, Row as QRow, SessionId, Value};
use rela_sql::Dialect;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};

use super::http::{self, CellKind};
use crate::engine::target::ConnectTarget;
use crate::engine::traits::{EngineAdapter, SessionOptions};

/// Attempts for a request answered with 502/503/504.
const MAX_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrinoFlavor {
    Trino,
    Presto,
}

impl TrinoFlavor {
    fn id(&self) -> &'static str {
        match self {
            TrinoFlavor::Trino => "trino",
            TrinoFlavor::Presto => "presto",
        }
    }

    fn dialect(&self) -> Dialect {
        match self {
            TrinoFlavor::Trino => Dialect::Trino,
            TrinoFlavor::Presto => Dialect::Presto,
        }
    }

    fn header(&self, name: &str) -> String {
        match self {
            TrinoFlavor::Trino => format!("X-Trino-{}", name),
            TrinoFlavor::Presto => format!("X-Presto-{}", name),
        }
    }
}

/// Client-side copy of the server session.
#[derive(Debug, Default, Clone)]
struct SessionState {
    catalog: Option<String>,
    schema: Option<String>,
    properties: BTreeMap<String, String>,
    transaction_id: Option<String>,
}

struct TrinoSession {
    client: Client,
    base: String,
    user: String,
    password: Option<String>,
    source: String,
    timezone_utc: bool,
    state: Mutex<SessionState>,
    next_uri: parking_lot::Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryColumn {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryError {
    message: String,
    #[serde(default)]
    error_name: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResults {
    #[serde(default)]
    next_uri: Option<String>,
    #[serde(default)]
    columns: Option<Vec<QueryColumn>>,
    #[serde(default)]
    data: Option<Vec<Vec<serde_json::Value>>>,
    #[serde(default)]
    error: Option<QueryError>,
    #[serde(default)]
    update_count: Option<u64>,
}

/// Trino/Presto adapter implementation
pub struct TrinoAdapter {
    flavor: TrinoFlavor,
    sessions: Arc<RwLock<HashMap<SessionId, Arc<TrinoSession>>>>,
}

impl TrinoAdapter {
    pub fn new(flavor: TrinoFlavor) -> Self {
        Self {
            flavor,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: SessionId) -> EngineResult<Arc<TrinoSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session)
            .cloned()
            .ok_or_else(|| EngineError::execution_error(format!("unknown session {}", session)))
    }

    fn authorize(&self, session: &TrinoSession, request: RequestBuilder) -> RequestBuilder {
        match &session.password {
            Some(password) => request.basic_auth(&session.user, Some(password)),
            None => request,
        }
    }

    fn statement_request(
        &self,
        session: &TrinoSession,
        state: &SessionState,
        sql: String,
    ) -> RequestBuilder {
        let h = |name: &str| self.flavor.header(name);
        let mut request = session
            .client
            .post(format!("{}/v1/statement", session.base))
            .header(h("User"), &session.user)
            .header(h("Source"), &session.source)
            .body(sql);
        if let Some(catalog) = &state.catalog {
            request = request.header(h("Catalog"), catalog);
        }
        if let Some(schema) = &state.schema {
            request = request.header(h("Schema"), schema);
        }
        if session.timezone_utc {
            request = request.header(h("Time-Zone"), "UTC");
        }
        if !state.properties.is_empty() {
            request = request.header(h("Session"), encode_properties(&state.properties));
        }
        if let Some(tx) = &state.transaction_id {
            request = request.header(h("Transaction-Id"), tx);
        }
        self.authorize(session, request)
    }

    /// Sends a request, retrying while the coordinator reports being busy.
    async fn send_with_retry<F>(&self, build: F) -> EngineResult<(HeaderMap, QueryResults)>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = http::send(build()).await?;
            let status = response.status();
            let busy = matches!(
                status,
                StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
            );
            if busy && attempt < MAX_ATTEMPTS {
                tokio::time::sleep(http::POLL_INTERVAL * attempt as u32).await;
                continue;
            }
            let response = http::check(response).await?;
            let headers = response.headers().clone();
            let results = response
                .json::<QueryResults>()
                .await
                .map_err(http::transport_error)?;
            return Ok((headers, results));
        }
    }

    /// Applies `Set-*`/`Clear-*` response headers to the session state.
    fn apply_headers(&self, state: &mut SessionState, headers: &HeaderMap) {
        let get_all = |name: &str| -> Vec<String> {
            headers
                .get_all(self.flavor.header(name))
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(str::to_string)
                .collect()
        };

        if let Some(catalog) = get_all("Set-Catalog").pop() {
            state.catalog = Some(catalog);
        }
        if let Some(schema) = get_all("Set-Schema").pop() {
            state.schema = Some(schema);
        }
        for pair in get_all("Set-Session") {
            if let Some((key, value)) = pair.split_once('=') {
                let value = percent_decode(value.trim());
                state.properties.insert(key.trim().to_string(), value);
            }
        }
        for key in get_all("Clear-Session") {
            state.properties.remove(key.trim());
        }
        if let Some(tx) = get_all("Started-Transaction-Id").pop() {
            state.transaction_id = Some(tx);
        }
        if !get_all("Clear-Transaction-Id").is_empty() {
            state.transaction_id = None;
        }
    }

    async fn run(&self, session: &TrinoSession, sql: String) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let mut state = session.state.lock().await;

        let snapshot = state.clone();
        let (headers, mut page) = self
            .send_with_retry(|| self.statement_request(session, &snapshot, sql.clone()))
            .await?;
        self.apply_headers(&mut state, &headers);

        let mut columns: Option<Vec<QueryColumn>> = None;
        let mut rows: Vec<Vec<serde_json::Value>> = Vec::new();
        let mut update_count = None;

        loop {
            if let Some(error) = page.error.take() {
                session.next_uri.lock().take();
                return Err(classify_error(error));
            }
            if columns.is_none() {
                columns = page.columns.take();
            }
            if let Some(data) = page.data.take() {
                rows.extend(data);
            }
            if page.update_count.is_some() {
                update_count = page.update_count;
            }

            let Some(next) = page.next_uri.take() else {
                break;
            };
            *session.next_uri.lock() = Some(next.clone());
            let (headers, next_page) = self
                .send_with_retry(|| self.authorize(session, session.client.get(&next)))
                .await?;
            self.apply_headers(&mut state, &headers);
            page = next_page;
        }
        session.next_uri.lock().take();

        let execution_time_ms = start.elapsed().as_micros() as f64 / 1000.0;
        let columns = columns.unwrap_or_default();
        if columns.is_empty() {
            return Ok(QueryResult::with_affected_rows(
                update_count.unwrap_or(0),
                execution_time_ms,
            ));
        }

        let kinds: Vec<CellKind> = columns
            .iter()
            .map(|c| CellKind::from_type_name(&c.type_name))
            .collect();
        let rows = rows
            .into_iter()
            .map(|cells| QRow {
                values: cells
                    .into_iter()
                    .zip(kinds.iter())
                    .map(|(cell, kind)| http::json_to_value(*kind, cell))
                    .collect(),
            })
            .collect();

        Ok(QueryResult {
            columns: columns
                .into_iter()
                .map(|c| ColumnInfo::new(c.name, c.type_name))
                .collect(),
            rows,
            affected_rows: update_count,
            execution_time_ms,
        })
    }
}

fn encode_properties(properties: &BTreeMap<String, String>) -> String {
    properties
        .iter()
        .map(|(k, v)| format!("{}={}", k, url::form_urlencoded::byte_serialize(v.as_bytes()).collect::<String>()))
        .collect::<Vec<_>>()
        .join(",")
}

fn percent_decode(value: &str) -> String {
    url::form_urlencoded::parse(format!("v={}", value).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| value.to_string())
}

fn classify_error(error: QueryError) -> EngineError {
    let name = error.error_name.as_deref().unwrap_or("");
    let kind = error.error_type.as_deref().unwrap_or("");
    match (name, kind) {
        ("SYNTAX_ERROR", _) => EngineError::syntax_error(error.message),
        ("PERMISSION_DENIED", _) => EngineError::auth_failed(error.message),
        ("USER_CANCELED", _) | ("ABANDONED_QUERY", _) => {
            EngineError::execution_retryable(error.message)
        }
        (_, "INSUFFICIENT_RESOURCES") => EngineError::execution_retryable(error.message),
        _ => EngineError::execution_error(error.message),
    }
}

#[async_trait]
impl EngineAdapter for TrinoAdapter {
    fn engine_id(&self) -> &str {
        self.flavor.id()
    }

    async fn connect(
        &self,
        target: &ConnectTarget,
        options: &SessionOptions,
    ) -> EngineResult<SessionId> {
        let user = target
            .user()
            .ok_or_else(|| EngineError::malformed_uri("A user is required"))?;
        let password = target.password().map(str::to_string);
        // Password auth defaults to https unless `secure=false`
        let base = http::base_url(target, password.is_some())?;

        let mut properties = BTreeMap::new();
        for (key, value) in target.options() {
            if matches!(key.as_str(), "secure" | "ssl" | "catalog" | "schema") {
                continue;
            }
            properties.insert(key.clone(), value.clone());
        }

        let session = Arc::new(TrinoSession {
            client: http::build_client(options)?,
            base,
            user: user.to_string(),
            password,
            source: options.application_name().to_string(),
            timezone_utc: options.timezone_utc,
            state: Mutex::new(SessionState {
                catalog: target.param("catalog").map(str::to_string),
                schema: target.param("schema").map(str::to_string),
                properties,
                transaction_id: None,
            }),
            next_uri: parking_lot::Mutex::new(None),
        });

        self.run(&session, "SELECT 1".to_string())
            .await
            .map_err(|e| match e {
                EngineError::ExecutionError { message, .. } => {
                    EngineError::connection_failed(message)
                }
                other => other,
            })?;

        let session_id = SessionId::new();
        tracing::debug!(session = %session_id, engine = self.flavor.id(), base = %session.base, "Session opened");
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
        let sql = rela_sql::prepare(statement, self.flavor.dialect(), params)?;
        self.run(&session, sql).await
    }

    async fn cancel(&self, session: SessionId) -> EngineResult<()> {
        let session = self.get_session(session).await?;
        let Some(next) = session.next_uri.lock().clone() else {
            return Ok(());
        };
        let request = self.authorize(&session, session.client.delete(&next));
        let response = http::send(request).await?;
        // 404/410 means the query already finished
        if response.status().is_success()
            || matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::GONE)
        {
            return Ok(());
        }
        http::check(response).await.map(|_| ())
    }

    async fn disconnect(&self, session: SessionId) -> EngineResult<()> {
        self.sessions.write().await.remove(&session);
        Ok(())
    }
}
