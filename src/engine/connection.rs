//! Live connections
//!
//! A [`Connection`] owns one adapter session. It is used by one caller at a
//! time (`&mut self`) and is closed exactly once: explicitly through
//! [`Connection::close`], or by the drop guard when it goes out of scope
//! while still open.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rela_core::{
    Capability, CapabilitySet, ConnectionSpec, EngineError, EngineResult, QueryResult, SessionId,
    Value,
};
use rela_sql::Dialect;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

use crate::engine::descriptor::EngineDescriptor;
use crate::engine::negotiator;
use crate::engine::traits::EngineAdapter;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

enum Interrupt {
    Timeout(Duration),
    Cancelled,
}

pub struct Connection {
    session: SessionId,
    descriptor: Arc<EngineDescriptor>,
    adapter: Arc<dyn EngineAdapter>,
    spec: ConnectionSpec,
    state: ConnectionState,
    execute_timeout: Option<Duration>,
    /// Pool slot held while checked out; released on checkin or drop
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("engine", &self.descriptor.id)
            .field("session", &self.session)
            .field("spec", &self.spec.redacted())
            .field("state", &self.state)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        session: SessionId,
        descriptor: Arc<EngineDescriptor>,
        adapter: Arc<dyn EngineAdapter>,
        spec: ConnectionSpec,
        execute_timeout: Option<Duration>,
    ) -> Self {
        Self {
            session,
            descriptor,
            adapter,
            spec,
            state: ConnectionState::Open,
            execute_timeout,
            permit: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn descriptor(&self) -> &EngineDescriptor {
        &self.descriptor
    }

    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    pub fn dialect(&self) -> Dialect {
        self.descriptor.dialect
    }

    pub fn capabilities(&self) -> CapabilitySet {
        negotiator::capabilities(&self.descriptor)
    }

    pub fn supports(&self, capability: Capability) -> bool {
        negotiator::supports(&self.descriptor, capability)
    }

    /// Quote an identifier for this engine
    pub fn quote_ident(&self, name: &str) -> String {
        self.descriptor.dialect.quote_ident(name)
    }

    pub(crate) fn attach_permit(&mut self, permit: OwnedSemaphorePermit) {
        self.permit = Some(permit);
    }

    pub(crate) fn take_permit(&mut self) -> Option<OwnedSemaphorePermit> {
        self.permit.take()
    }

    fn ensure_open(&self) -> EngineResult<()> {
        match self.state {
            ConnectionState::Open => Ok(()),
            ConnectionState::Closed => Err(EngineError::execution_error(format!(
                "connection to {} is closed",
                self.descriptor.name
            ))),
        }
    }

    /// Executes one statement with positional `?` parameters.
    pub async fn execute(&mut self, statement: &str, params: &[Value]) -> EngineResult<QueryResult> {
        self.run(statement, params, None).await
    }

    /// Like [`execute`](Self::execute), but aborts when `token` is cancelled.
    ///
    /// An aborted statement is cancelled on the server when the engine allows
    /// it, and the connection is closed since its session state is unknown.
    pub async fn execute_cancellable(
        &mut self,
        statement: &str,
        params: &[Value],
        token: &CancellationToken,
    ) -> EngineResult<QueryResult> {
        self.run(statement, params, Some(token)).await
    }

    async fn run(
        &mut self,
        statement: &str,
        params: &[Value],
        token: Option<&CancellationToken>,
    ) -> EngineResult<QueryResult> {
        self.ensure_open()?;

        let adapter = self.adapter.clone();
        let session = self.session;
        let limit = self.execute_timeout;
        let start = Instant::now();

        let work = async {
            let exec = adapter.execute(session, statement, params);
            match limit {
                Some(d) => tokio::time::timeout(d, exec)
                    .await
                    .map_err(|_| Interrupt::Timeout(d)),
                None => Ok(exec.await),
            }
        };

        let outcome = match token {
            Some(token) => tokio::select! {
                result = work => result,
                _ = token.cancelled() => Err(Interrupt::Cancelled),
            },
            None => work.await,
        };

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(result) => {
                metrics::record_query(elapsed_ms, result.is_ok());
                if let Err(e) = &result {
                    tracing::debug!(engine = %self.descriptor.id, error = %e, "Statement failed");
                }
                result
            }
            Err(interrupt) => {
                self.abort().await;
                match interrupt {
                    Interrupt::Timeout(d) => {
                        metrics::record_timeout();
                        Err(EngineError::timeout(
                            format!("statement on {} exceeded its time limit", self.descriptor.name),
                            d.as_millis() as u64,
                        ))
                    }
                    Interrupt::Cancelled => {
                        metrics::record_cancel();
                        Err(EngineError::execution_retryable(format!(
                            "statement on {} was cancelled",
                            self.descriptor.name
                        )))
                    }
                }
            }
        }
    }

    /// Cancels whatever runs on the session, then invalidates the connection.
    pub(crate) async fn abort(&mut self) {
        if self.supports(Capability::Cancellation) {
            if let Err(e) = self.adapter.cancel(self.session).await {
                tracing::debug!(engine = %self.descriptor.id, error = %e, "Server-side cancel failed");
            }
        }
        self.close().await;
    }

    /// Liveness probe.
    pub async fn ping(&mut self) -> EngineResult<()> {
        self.ensure_open()?;
        self.adapter.ping(self.session).await
    }

    pub async fn begin(&mut self) -> EngineResult<()> {
        negotiator::require(&self.descriptor, Capability::Transactions)?;
        let statement = self.dialect().begin_statement();
        self.execute(statement, &[]).await.map(|_| ())
    }

    pub async fn commit(&mut self) -> EngineResult<()> {
        negotiator::require(&self.descriptor, Capability::Transactions)?;
        let statement = self.dialect().commit_statement();
        self.execute(statement, &[]).await.map(|_| ())
    }

    pub async fn rollback(&mut self) -> EngineResult<()> {
        negotiator::require(&self.descriptor, Capability::Transactions)?;
        let statement = self.dialect().rollback_statement();
        self.execute(statement, &[]).await.map(|_| ())
    }

    /// Releases the session. Idempotent; failures are logged, never returned.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Err(e) = self.adapter.disconnect(self.session).await {
            tracing::warn!(
                engine = %self.descriptor.id,
                session = %self.session,
                error = %e,
                "Failed to close session"
            );
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;

        let adapter = self.adapter.clone();
        let session = self.session;
        let engine = self.descriptor.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = adapter.disconnect(session).await {
                        tracing::warn!(engine = %engine, session = %session, error = %e, "Failed to close dropped session");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(engine = %engine, session = %session, "Connection dropped outside a runtime; session not closed");
            }
        }
    }
}
