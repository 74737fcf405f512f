use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rela_connect::{
    Capability, ColumnInfo, ConnectTarget, Dialect, DispatchConfig, Dispatcher, EngineAdapter,
    EngineDescriptor, EngineError, EngineRegistry, EngineResult, ErrorKind, PoolConfig,
    QueryResult, Row, SessionId, SessionOptions, Value,
};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

// ==================== Mock engine ====================

#[derive(Default)]
struct MockState {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    cancels: AtomicUsize,
    open: Mutex<HashSet<SessionId>>,
    dead: Mutex<HashSet<SessionId>>,
    /// How `SET TIME ZONE` fails, if it does
    timezone_error: Mutex<Option<ErrorKind>>,
    timezone_set: AtomicUsize,
}

impl MockState {
    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn open_sessions(&self) -> usize {
        self.open.lock().len()
    }
}

/// Host `slow` stalls on connect, host `denied` rejects credentials.
/// Statement `SLEEP` never finishes, `FAIL` errors.
struct MockAdapter {
    id: &'static str,
    state: Arc<MockState>,
}

#[async_trait]
impl EngineAdapter for MockAdapter {
    fn engine_id(&self) -> &str {
        self.id
    }

    async fn connect(
        &self,
        target: &ConnectTarget,
        _options: &SessionOptions,
    ) -> EngineResult<SessionId> {
        match target.host() {
            "slow" => sleep(Duration::from_secs(30)).await,
            "denied" => return Err(EngineError::auth_failed("password authentication failed")),
            _ => {}
        }
        let session = SessionId::new();
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.open.lock().insert(session);
        Ok(session)
    }

    async fn execute(
        &self,
        session: SessionId,
        statement: &str,
        _params: &[Value],
    ) -> EngineResult<QueryResult> {
        if !self.state.open.lock().contains(&session) {
            return Err(EngineError::execution_error("session is closed"));
        }
        match statement {
            "SLEEP" => {
                sleep(Duration::from_secs(30)).await;
                Ok(QueryResult::empty())
            }
            "FAIL" => Err(EngineError::execution_error("relation does not exist")),
            "SET TIME ZONE 'UTC'" => match *self.state.timezone_error.lock() {
                Some(ErrorKind::UnsupportedCapability) => {
                    Err(EngineError::unsupported("time zones are fixed on this server"))
                }
                Some(_) => Err(EngineError::execution_error(
                    "permission denied to set parameter \"TimeZone\"",
                )),
                None => {
                    self.state.timezone_set.fetch_add(1, Ordering::SeqCst);
                    Ok(QueryResult::empty())
                }
            },
            _ => Ok(QueryResult {
                columns: vec![ColumnInfo::new("one", "integer")],
                rows: vec![Row::new(vec![Value::Int(1)])],
                affected_rows: None,
                execution_time_ms: 0.0,
            }),
        }
    }

    async fn ping(&self, session: SessionId) -> EngineResult<()> {
        if self.state.dead.lock().contains(&session) {
            Err(EngineError::connection_failed("server closed the connection"))
        } else {
            Ok(())
        }
    }

    async fn cancel(&self, _session: SessionId) -> EngineResult<()> {
        self.state.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self, session: SessionId) -> EngineResult<()> {
        if self.state.open.lock().remove(&session) {
            self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn mock_dispatcher(config: DispatchConfig) -> (Dispatcher, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let registry = EngineRegistry::with_builtin_engines();
    registry
        .register(
            EngineDescriptor::new("mock", "Mock", Dialect::Postgres)
                .with_schemes(&["mock", "mockdb"])
                .with_path_params(&["database?"])
                .with_capabilities(&[Capability::Cancellation]),
            Arc::new(MockAdapter {
                id: "mock",
                state: state.clone(),
            }),
        )
        .unwrap();
    registry
        .register(
            EngineDescriptor::new("mocktz", "Mock with time zones", Dialect::Postgres)
                .with_path_params(&["database?"])
                .with_capabilities(&[Capability::SessionTimezone]),
            Arc::new(MockAdapter {
                id: "mocktz",
                state: state.clone(),
            }),
        )
        .unwrap();
    (Dispatcher::new(Arc::new(registry), config).unwrap(), state)
}

fn pooled(max_open: usize, max_idle: usize, checkout_timeout_ms: Option<u64>) -> DispatchConfig {
    DispatchConfig::default().with_pool(PoolConfig {
        max_open,
        max_idle,
        checkout_timeout_ms,
    })
}

// ==================== URI resolution ====================

#[tokio::test]
async fn test_unknown_scheme() {
    let dispatcher = Dispatcher::with_defaults();
    let err = dispatcher.open("nosuchdb://host/db").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownEngine);
}

#[tokio::test]
async fn test_malformed_uri() {
    let dispatcher = Dispatcher::with_defaults();
    for uri in ["not a uri", "://host", "postgresql://host:notaport/db"] {
        let err = dispatcher.open(uri).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedUri, "{uri}");
    }
}

#[tokio::test]
async fn test_too_many_path_segments() {
    let dispatcher = Dispatcher::with_defaults();
    let err = dispatcher
        .open("trino://u@localhost/catalog/schema/extra")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedUri);
    assert!(err.message().contains("Expected format"));
}

#[tokio::test]
async fn test_engine_without_client() {
    let dispatcher = Dispatcher::with_defaults();
    let err = dispatcher.open("vertica://u:p@localhost/db").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedCapability);
}

#[tokio::test]
async fn test_refused_connection_is_retryable() {
    let dispatcher = Dispatcher::with_defaults();
    for uri in [
        "clickhouse://u:p@127.0.0.1:1/db",
        "postgresql://u:p@127.0.0.1:1/db",
        "mysql://u:p@127.0.0.1:1/db",
    ] {
        let err = dispatcher.open(uri).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed, "{uri}: {err}");
        assert!(err.is_retryable(), "{uri}");
        assert!(!err.to_string().contains(":p@"), "{uri}");
    }
}

#[test]
fn test_invalid_config_is_rejected() {
    let registry = Arc::new(EngineRegistry::with_builtin_engines());

    let Err(err) = Dispatcher::new(registry.clone(), pooled(0, 0, None)) else {
        panic!("max_open = 0 was accepted");
    };
    assert!(err.to_string().contains("max_open"), "{err}");

    let config = DispatchConfig {
        connect_timeout_ms: 0,
        ..DispatchConfig::default()
    };
    assert!(Dispatcher::new(registry.clone(), config).is_err());

    assert!(Dispatcher::new(registry, pooled(1, 1, None)).is_ok());
}

#[tokio::test]
async fn test_scheme_alias_and_case() {
    let (dispatcher, state) = mock_dispatcher(DispatchConfig::default());
    let mut conn = dispatcher.open("MOCKDB://u@localhost/db").await.unwrap();
    assert_eq!(conn.descriptor().id, "mock");
    conn.close().await;
    assert_eq!(state.disconnects(), 1);
}

#[test]
fn test_registry_conflict() {
    let registry = EngineRegistry::with_builtin_engines();
    let before = registry.len();
    let err = registry
        .register(
            EngineDescriptor::new("mock", "Mock", Dialect::Postgres)
                .with_schemes(&["mock", "postgresql"]),
            Arc::new(MockAdapter {
                id: "mock",
                state: Arc::new(MockState::default()),
            }),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineConflict);
    assert_eq!(registry.len(), before);
    // all-or-nothing: the non-conflicting scheme was not claimed either
    assert!(registry.resolve("mock").is_err());
}

// ==================== Capabilities ====================

#[test]
fn test_capability_branching() {
    let dispatcher = Dispatcher::with_defaults();

    let clickhouse = dispatcher.capabilities("clickhouse").unwrap();
    assert!(!clickhouse.contains(Capability::Transactions));
    assert!(clickhouse.contains(Capability::Cancellation));

    let postgres = dispatcher.capabilities("postgres").unwrap();
    assert!(postgres.contains(Capability::Transactions));

    assert_eq!(
        dispatcher.capabilities("nosuchdb").unwrap_err().kind(),
        ErrorKind::UnknownEngine
    );
}

#[tokio::test]
async fn test_transactions_require_capability() {
    let (dispatcher, _state) = mock_dispatcher(DispatchConfig::default());
    let mut conn = dispatcher.open("mock://u@localhost/db").await.unwrap();
    let err = conn.begin().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedCapability);
    assert!(conn.is_open());
    conn.close().await;
}

// ==================== Connection lifecycle ====================

#[tokio::test]
async fn test_close_is_idempotent() {
    let (dispatcher, state) = mock_dispatcher(DispatchConfig::default());
    let mut conn = dispatcher.open("mock://u@localhost/db").await.unwrap();
    conn.close().await;
    conn.close().await;
    assert!(!conn.is_open());
    assert_eq!(state.disconnects(), 1);

    let err = conn.execute("SELECT 1", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionError);
}

#[tokio::test]
async fn test_drop_closes_session() {
    let (dispatcher, state) = mock_dispatcher(DispatchConfig::default());
    let conn = dispatcher.open("mock://u@localhost/db").await.unwrap();
    assert_eq!(state.open_sessions(), 1);
    drop(conn);

    for _ in 0..50 {
        if state.open_sessions() == 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.open_sessions(), 0);
    assert_eq!(state.disconnects(), 1);
}

#[tokio::test]
async fn test_with_connection_closes_once() {
    let (dispatcher, state) = mock_dispatcher(DispatchConfig::default());

    let result = dispatcher
        .with_connection("mock://u@localhost/db", |conn| {
            Box::pin(async move { conn.execute("SELECT 1", &[]).await })
        })
        .await
        .unwrap();
    assert_eq!(result.scalar().and_then(Value::as_i64), Some(1));
    assert_eq!(state.disconnects(), 1);

    let err = dispatcher
        .with_connection("mock://u@localhost/db", |conn| {
            Box::pin(async move { conn.execute("FAIL", &[]).await })
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionError);
    assert!(!err.is_retryable());
    assert_eq!(state.connects(), 2);
    assert_eq!(state.disconnects(), 2);
    assert_eq!(state.open_sessions(), 0);
}

#[tokio::test]
async fn test_connect_errors_pass_through() {
    let (dispatcher, state) = mock_dispatcher(DispatchConfig::default());
    let err = dispatcher.open("mock://u@denied/db").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthFailed);
    assert!(err.message().contains("password authentication failed"));
    assert_eq!(state.connects(), 0);
}

#[tokio::test]
async fn test_connect_timeout() {
    let config = DispatchConfig {
        connect_timeout_ms: 50,
        ..DispatchConfig::default()
    };
    let (dispatcher, _state) = mock_dispatcher(config);
    let err = dispatcher.open("mock://u@slow/db").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_session_pinned_to_utc() {
    let (dispatcher, state) = mock_dispatcher(DispatchConfig::default());
    let mut conn = dispatcher.open("mocktz://u@localhost/db").await.unwrap();
    assert_eq!(state.timezone_set.load(Ordering::SeqCst), 1);
    conn.close().await;

    // engines without the capability are left alone
    let mut conn = dispatcher.open("mock://u@localhost/db").await.unwrap();
    assert_eq!(state.timezone_set.load(Ordering::SeqCst), 1);
    conn.close().await;
}

#[tokio::test]
async fn test_timezone_failure_fails_open() {
    let (dispatcher, state) = mock_dispatcher(DispatchConfig::default());
    *state.timezone_error.lock() = Some(ErrorKind::ExecutionError);

    let err = dispatcher.open("mocktz://u@localhost/db").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionError);
    assert!(err.message().contains("TimeZone"));
    assert_eq!(state.connects(), 1);
    assert_eq!(state.open_sessions(), 0);
}

#[tokio::test]
async fn test_timezone_unsupported_is_tolerated() {
    let (dispatcher, state) = mock_dispatcher(DispatchConfig::default());
    *state.timezone_error.lock() = Some(ErrorKind::UnsupportedCapability);

    let mut conn = dispatcher.open("mocktz://u@localhost/db").await.unwrap();
    assert!(conn.is_open());
    conn.close().await;
    assert_eq!(state.open_sessions(), 0);
}

#[tokio::test]
async fn test_timezone_pinning_can_be_disabled() {
    let config = DispatchConfig {
        session_timezone_utc: false,
        ..DispatchConfig::default()
    };
    let (dispatcher, state) = mock_dispatcher(config);
    *state.timezone_error.lock() = Some(ErrorKind::ExecutionError);

    let mut conn = dispatcher.open("mocktz://u@localhost/db").await.unwrap();
    conn.close().await;
}

#[tokio::test]
async fn test_execute_timeout_cancels_and_closes() {
    let config = DispatchConfig {
        execute_timeout_ms: Some(50),
        ..DispatchConfig::default()
    };
    let (dispatcher, state) = mock_dispatcher(config);
    let mut conn = dispatcher.open("mock://u@localhost/db").await.unwrap();

    let err = conn.execute("SLEEP", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(state.cancels(), 1);
    assert!(!conn.is_open());
    assert_eq!(state.disconnects(), 1);
}

#[tokio::test]
async fn test_execute_cancellable() {
    let (dispatcher, state) = mock_dispatcher(DispatchConfig::default());
    let mut conn = dispatcher.open("mock://u@localhost/db").await.unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let err = conn
        .execute_cancellable("SLEEP", &[], &token)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionError);
    assert!(err.is_retryable());
    assert_eq!(state.cancels(), 1);
    assert!(!conn.is_open());
}

#[tokio::test]
async fn test_with_connection_cancellable() {
    let (dispatcher, state) = mock_dispatcher(DispatchConfig::default());
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let err = dispatcher
        .with_connection_cancellable("mock://u@localhost/db", &token, |conn| {
            Box::pin(async move { conn.execute("SLEEP", &[]).await })
        })
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(state.open_sessions(), 0);
    assert_eq!(state.disconnects(), 1);
}

// ==================== Pooling ====================

#[tokio::test]
async fn test_pool_reuses_idle_connection() {
    let (dispatcher, state) = mock_dispatcher(pooled(2, 1, None));
    let uri = "mock://u@localhost/db";

    let conn = dispatcher.checkout(uri).await.unwrap();
    let first = conn.session_id();
    dispatcher.checkin(conn).await;
    assert_eq!(dispatcher.idle_connections(uri).unwrap(), 1);

    let conn = dispatcher.checkout(uri).await.unwrap();
    assert_eq!(conn.session_id(), first);
    assert_eq!(state.connects(), 1);
    dispatcher.checkin(conn).await;

    dispatcher.shutdown().await;
    assert_eq!(dispatcher.idle_connections(uri).unwrap(), 0);
    assert_eq!(state.open_sessions(), 0);
}

#[tokio::test]
async fn test_pool_is_keyed_by_uri() {
    let (dispatcher, state) = mock_dispatcher(pooled(2, 2, None));

    let a = dispatcher.checkout("mock://u@localhost/a").await.unwrap();
    dispatcher.checkin(a).await;
    let b = dispatcher.checkout("mock://u@localhost/b").await.unwrap();
    assert_eq!(state.connects(), 2);
    dispatcher.checkin(b).await;
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_pool_exhausted() {
    let (dispatcher, _state) = mock_dispatcher(pooled(1, 1, None));
    let uri = "mock://u@localhost/db";

    let held = dispatcher.try_checkout(uri).await.unwrap();
    let err = dispatcher.try_checkout(uri).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    assert!(err.is_retryable());

    dispatcher.checkin(held).await;
    let again = dispatcher.try_checkout(uri).await.unwrap();
    dispatcher.checkin(again).await;
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_pool_checkout_timeout() {
    let (dispatcher, _state) = mock_dispatcher(pooled(1, 1, Some(50)));
    let uri = "mock://u@localhost/db";

    let held = dispatcher.checkout(uri).await.unwrap();
    let err = dispatcher.checkout(uri).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    dispatcher.checkin(held).await;
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_pool_waiter_gets_released_slot() {
    let (dispatcher, _state) = mock_dispatcher(pooled(1, 1, Some(2_000)));
    let dispatcher = Arc::new(dispatcher);
    let uri = "mock://u@localhost/db";

    let held = dispatcher.checkout(uri).await.unwrap();
    let held_id = held.session_id();
    let waiter = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.checkout(uri).await.map(|c| c.session_id()) })
    };
    sleep(Duration::from_millis(30)).await;
    dispatcher.checkin(held).await;

    let got = waiter.await.unwrap().unwrap();
    assert_eq!(got, held_id);
}

#[tokio::test]
async fn test_pool_drops_dead_connections() {
    let (dispatcher, state) = mock_dispatcher(pooled(2, 2, None));
    let uri = "mock://u@localhost/db";

    let conn = dispatcher.checkout(uri).await.unwrap();
    let stale = conn.session_id();
    dispatcher.checkin(conn).await;
    state.dead.lock().insert(stale);

    let conn = dispatcher.checkout(uri).await.unwrap();
    assert_ne!(conn.session_id(), stale);
    assert_eq!(state.connects(), 2);
    assert_eq!(state.disconnects(), 1);
    dispatcher.checkin(conn).await;
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_pool_discards_closed_connection() {
    let (dispatcher, _state) = mock_dispatcher(pooled(2, 2, None));
    let uri = "mock://u@localhost/db";

    let mut conn = dispatcher.checkout(uri).await.unwrap();
    conn.close().await;
    dispatcher.checkin(conn).await;
    assert_eq!(dispatcher.idle_connections(uri).unwrap(), 0);
}

// ==================== DuckDB end to end ====================

#[tokio::test]
async fn test_duckdb_select_one() {
    let dispatcher = Dispatcher::with_defaults();
    let mut conn = dispatcher.open("duckdb://").await.unwrap();

    let result = conn.execute("SELECT 1", &[]).await.unwrap();
    assert_eq!(result.scalar().and_then(Value::as_i64), Some(1));

    conn.close().await;
    assert!(!conn.is_open());
}

#[tokio::test]
async fn test_duckdb_syntax_error() {
    let dispatcher = Dispatcher::with_defaults();
    let err = dispatcher
        .with_connection("duckdb:///:memory:", |conn| {
            Box::pin(async move { conn.execute("SELEC 1", &[]).await })
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SyntaxError);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_duckdb_parameters_and_transactions() {
    let dispatcher = Dispatcher::with_defaults();
    let mut conn = dispatcher.open("duckdb://").await.unwrap();
    assert!(conn.supports(Capability::Transactions));
    assert_eq!(conn.quote_ident("odd\"name"), "\"odd\"\"name\"");

    conn.execute("CREATE TABLE items (id INTEGER, label VARCHAR)", &[])
        .await
        .unwrap();

    conn.begin().await.unwrap();
    conn.execute(
        "INSERT INTO items VALUES (?, ?)",
        &[Value::Int(1), Value::Text("kept".into())],
    )
    .await
    .unwrap();
    conn.commit().await.unwrap();

    conn.begin().await.unwrap();
    conn.execute(
        "INSERT INTO items VALUES (?, ?)",
        &[Value::Int(2), Value::Text("discarded".into())],
    )
    .await
    .unwrap();
    conn.rollback().await.unwrap();

    let result = conn
        .execute("SELECT label FROM items WHERE id >= ? ORDER BY id", &[Value::Int(0)])
        .await
        .unwrap();
    assert_eq!(result.column_names(), vec!["label"]);
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].values[0], Value::Text("kept".into()));

    let err = conn
        .execute("SELECT ?", &[Value::Int(1), Value::Int(2)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionError);

    conn.close().await;
}

#[tokio::test]
async fn test_duckdb_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let uri = format!("duckdb:///{}", dir.path().join("dispatch.duckdb").display());
    let dispatcher = Dispatcher::with_defaults();

    dispatcher
        .with_connection(&uri, |conn| {
            Box::pin(async move {
                conn.execute("CREATE TABLE t AS SELECT 7 AS n", &[]).await?;
                Ok(())
            })
        })
        .await
        .unwrap();

    let n = dispatcher
        .with_connection(&uri, |conn| {
            Box::pin(async move {
                let result = conn.execute("SELECT n FROM t", &[]).await?;
                Ok(result.scalar().and_then(Value::as_i64))
            })
        })
        .await
        .unwrap();
    assert_eq!(n, Some(7));
}

#[tokio::test]
async fn test_duckdb_execute_timeout_returns_promptly() {
    let registry = Arc::new(EngineRegistry::with_builtin_engines());
    let config = DispatchConfig {
        execute_timeout_ms: Some(200),
        ..DispatchConfig::default()
    };
    let dispatcher = Dispatcher::new(registry, config).unwrap();
    let mut conn = dispatcher.open("duckdb://").await.unwrap();

    let started = Instant::now();
    let err = conn
        .execute(
            "SELECT sum(a.range * b.range) FROM range(1000000000) a CROSS JOIN range(1000) b",
            &[],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_retryable());
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    assert!(!conn.is_open());
}
