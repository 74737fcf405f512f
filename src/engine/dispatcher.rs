//! Connection Dispatcher
//!
//! Entry point of the crate: turns a URI into a live [`Connection`] by
//! parsing it, resolving the engine, binding the path against the engine's
//! layout, and asking the adapter for a session under a connect timeout.
//!
//! The dispatcher holds no per-connection state unless pooling is
//! configured, and is safe to share across tasks.

use std::sync::Arc;

use futures::future::BoxFuture;
use rela_core::{
    Capability, CapabilitySet, ConnectionSpec, EngineError, EngineResult, ErrorKind, SessionId,
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::{ConfigError, DispatchConfig};
use crate::engine::connection::Connection;
use crate::engine::descriptor::EngineDescriptor;
use crate::engine::negotiator;
use crate::engine::pool::{Pool, Wait};
use crate::engine::registry::EngineRegistry;
use crate::engine::target::ConnectTarget;
use crate::engine::traits::{EngineAdapter, SessionOptions};
use crate::metrics;

pub struct Dispatcher {
    registry: Arc<EngineRegistry>,
    config: DispatchConfig,
    pool: Option<Pool>,
}

impl Dispatcher {
    /// Fails when `config` does not pass [`DispatchConfig::validate`].
    pub fn new(registry: Arc<EngineRegistry>, config: DispatchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(registry, config))
    }

    fn build(registry: Arc<EngineRegistry>, config: DispatchConfig) -> Self {
        let pool = config.pool.clone().map(Pool::new);
        Self {
            registry,
            config,
            pool,
        }
    }

    /// Dispatcher over every builtin engine with default settings.
    pub fn with_defaults() -> Self {
        Self::build(
            Arc::new(EngineRegistry::with_builtin_engines()),
            DispatchConfig::default(),
        )
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn resolve(&self, scheme: &str) -> EngineResult<Arc<EngineDescriptor>> {
        self.registry.resolve(scheme)
    }

    /// Capabilities of the engine selected by `scheme`.
    pub fn capabilities(&self, scheme: &str) -> EngineResult<CapabilitySet> {
        self.resolve(scheme).map(|d| negotiator::capabilities(&d))
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            timezone_utc: self.config.session_timezone_utc,
            application_name: self.config.application_name.clone(),
        }
    }

    /// Opens a new connection for `uri`.
    pub async fn open(&self, uri: &str) -> EngineResult<Connection> {
        let spec = rela_sql::parse(uri)?;
        self.open_spec(&spec).await
    }

    #[instrument(skip(self, spec), fields(engine = %spec.scheme, host = %spec.host))]
    pub async fn open_spec(&self, spec: &ConnectionSpec) -> EngineResult<Connection> {
        let (descriptor, adapter) = self.registry.lookup(&spec.scheme)?;
        let target = ConnectTarget::bind(spec, &descriptor)?;
        let options = self.session_options();
        let limit = self.config.connect_timeout();

        tracing::debug!(uri = %spec, "Connecting");
        let session = match tokio::time::timeout(limit, adapter.connect(&target, &options)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                metrics::record_connect(false);
                tracing::info!(error = %e, "Connect failed");
                return Err(e);
            }
            Err(_) => {
                metrics::record_connect(false);
                return Err(EngineError::timeout(
                    format!("connecting to {} timed out", spec),
                    self.config.connect_timeout_ms,
                ));
            }
        };

        if options.timezone_utc {
            if let Err(e) = Self::pin_utc(&descriptor, adapter.as_ref(), session).await {
                metrics::record_connect(false);
                if let Err(close) = adapter.disconnect(session).await {
                    tracing::warn!(session = %session, error = %close, "Failed to close session");
                }
                return Err(e);
            }
        }

        metrics::record_connect(true);
        tracing::info!(session = %session, "Connected");

        Ok(Connection::new(
            session,
            descriptor,
            adapter,
            spec.clone(),
            self.config.execute_timeout(),
        ))
    }

    /// Sets the session time zone to UTC on engines that take a statement for
    /// it. Only an engine reporting the statement as unsupported is tolerated.
    async fn pin_utc(
        descriptor: &EngineDescriptor,
        adapter: &dyn EngineAdapter,
        session: SessionId,
    ) -> EngineResult<()> {
        if !negotiator::supports(descriptor, Capability::SessionTimezone) {
            return Ok(());
        }
        let Some(statement) = descriptor.dialect.set_timezone_utc() else {
            return Ok(());
        };
        match adapter.execute(session, statement, &[]).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnsupportedCapability => {
                tracing::debug!(engine = %descriptor.id, error = %e, "Session time zone left unchanged");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Runs `f` with a connection for `uri` and releases it afterwards.
    ///
    /// The connection is closed (or returned to the pool) exactly once,
    /// whether `f` succeeds or fails. If the returned future is dropped
    /// early, the connection's drop guard closes the session.
    ///
    /// ```no_run
    /// # async fn demo(dispatcher: &rela_connect::Dispatcher) -> rela_connect::EngineResult<()> {
    /// let one = dispatcher
    ///     .with_connection("duckdb://", |conn| {
    ///         Box::pin(async move { conn.execute("SELECT 1", &[]).await })
    ///     })
    ///     .await?;
    /// assert_eq!(one.scalar().and_then(|v| v.as_i64()), Some(1));
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_connection<T, F>(&self, uri: &str, f: F) -> EngineResult<T>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, EngineResult<T>>,
    {
        let mut conn = self.acquire(uri).await?;
        let result = f(&mut conn).await;
        self.release(conn).await;
        result
    }

    /// Like [`with_connection`](Self::with_connection), aborting when `token`
    /// is cancelled. The in-flight statement is cancelled server-side when the
    /// engine allows it and the connection is discarded.
    pub async fn with_connection_cancellable<T, F>(
        &self,
        uri: &str,
        token: &CancellationToken,
        f: F,
    ) -> EngineResult<T>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, EngineResult<T>>,
    {
        let mut conn = tokio::select! {
            conn = self.acquire(uri) => conn?,
            _ = token.cancelled() => {
                return Err(EngineError::execution_retryable("cancelled before a connection was acquired"));
            }
        };

        let outcome = tokio::select! {
            result = f(&mut conn) => Some(result),
            _ = token.cancelled() => None,
        };

        match outcome {
            Some(result) => {
                self.release(conn).await;
                result
            }
            None => {
                metrics::record_cancel();
                conn.abort().await;
                self.release(conn).await;
                Err(EngineError::execution_retryable("operation was cancelled"))
            }
        }
    }

    async fn acquire(&self, uri: &str) -> EngineResult<Connection> {
        match &self.pool {
            Some(_) => self.checkout(uri).await,
            None => self.open(uri).await,
        }
    }

    async fn release(&self, mut conn: Connection) {
        match &self.pool {
            Some(pool) => pool.release(conn).await,
            None => conn.close().await,
        }
    }

    /// Takes a pooled connection for `uri`, waiting for a free slot as
    /// configured. Without a pool this opens a fresh connection.
    pub async fn checkout(&self, uri: &str) -> EngineResult<Connection> {
        let spec = rela_sql::parse(uri)?;
        match &self.pool {
            Some(pool) => self.checkout_spec(pool, &spec, pool.default_wait()).await,
            None => self.open_spec(&spec).await,
        }
    }

    /// Like [`checkout`](Self::checkout) but fails with `PoolExhausted`
    /// instead of waiting.
    pub async fn try_checkout(&self, uri: &str) -> EngineResult<Connection> {
        let spec = rela_sql::parse(uri)?;
        match &self.pool {
            Some(pool) => self.checkout_spec(pool, &spec, Wait::Never).await,
            None => self.open_spec(&spec).await,
        }
    }

    async fn checkout_spec(
        &self,
        pool: &Pool,
        spec: &ConnectionSpec,
        wait: Wait,
    ) -> EngineResult<Connection> {
        let permit = pool.acquire(spec, wait).await?;

        while let Some(mut conn) = pool.take_idle(spec) {
            match conn.ping().await {
                Ok(()) => {
                    metrics::record_pool_reuse();
                    conn.attach_permit(permit);
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::debug!(uri = %spec, error = %e, "Discarding dead pooled connection");
                    conn.close().await;
                }
            }
        }

        match self.open_spec(spec).await {
            Ok(mut conn) => {
                conn.attach_permit(permit);
                Ok(conn)
            }
            Err(e) => {
                drop(permit);
                pool.evict_unused(spec);
                Err(e)
            }
        }
    }

    /// Returns a checked-out connection. Without a pool the connection is closed.
    pub async fn checkin(&self, conn: Connection) {
        self.release(conn).await;
    }

    /// Idle connections currently pooled for `uri`.
    pub fn idle_connections(&self, uri: &str) -> EngineResult<usize> {
        let spec = rela_sql::parse(uri)?;
        Ok(self
            .pool
            .as_ref()
            .map(|pool| pool.idle_count(&spec))
            .unwrap_or(0))
    }

    /// Closes every idle pooled connection.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            let idle = pool.drain();
            tracing::debug!(count = idle.len(), max_open = pool.config().max_open, "Closing pooled connections");
            for mut conn in idle {
                conn.close().await;
            }
        }
    }
}
