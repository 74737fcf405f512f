//! EngineAdapter trait definition
//!
//! This is the seam every engine client plugs into. Adapters own their native
//! handles and hand out [`SessionId`]s; the dispatch layer never touches a
//! native client directly.

use async_trait::async_trait;
use rela_core::{EngineError, EngineResult, QueryResult, SessionId, Value};

use crate::engine::target::ConnectTarget;

/// Settings applied to every new session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Pin the session time zone to UTC when the engine supports it
    pub timezone_utc: bool,
    /// Client name reported to engines that accept one
    pub application_name: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timezone_utc: true,
            application_name: None,
        }
    }
}

impl SessionOptions {
    pub fn application_name(&self) -> &str {
        self.application_name.as_deref().unwrap_or("rela-connect")
    }
}

/// Core trait that all engine adapters implement
///
/// A session is used by one caller at a time; adapters may still receive
/// `cancel` concurrently with an in-flight `execute` on the same session.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Identifier of the engine descriptor this adapter serves
    fn engine_id(&self) -> &str;

    /// Establishes a session with the engine
    ///
    /// Fails with `ConnectionFailed`, `AuthFailed` or `Timeout`. Statement
    /// based UTC pinning runs in the dispatcher after connect; adapters read
    /// `options.timezone_utc` only when the zone travels as a request header.
    async fn connect(
        &self,
        target: &ConnectTarget,
        options: &SessionOptions,
    ) -> EngineResult<SessionId>;

    /// Executes one statement with positional `?` parameters
    async fn execute(
        &self,
        session: SessionId,
        statement: &str,
        params: &[Value],
    ) -> EngineResult<QueryResult>;

    /// Cheap liveness probe
    async fn ping(&self, session: SessionId) -> EngineResult<()> {
        self.execute(session, "SELECT 1", &[]).await.map(|_| ())
    }

    /// Aborts the statement currently running on `session`, best effort
    async fn cancel(&self, _session: SessionId) -> EngineResult<()> {
        Err(EngineError::unsupported(format!(
            "{} does not support cancellation",
            self.engine_id()
        )))
    }

    /// Releases the session; unknown sessions are ignored
    async fn disconnect(&self, session: SessionId) -> EngineResult<()>;
}
