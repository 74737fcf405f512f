//! Placeholder adapter for engines whose client is not compiled in.
//!
//! The descriptor stays registered so URIs resolve and capabilities can be
//! queried; connecting reports which client is missing.

use async_trait::async_trait;
use rela_core::{EngineError, EngineResult, QueryResult, SessionId, Value};

use crate::engine::target::ConnectTarget;
use crate::engine::traits::{EngineAdapter, SessionOptions};

pub struct UnavailableAdapter {
    id: &'static str,
    name: &'static str,
}

impl UnavailableAdapter {
    pub fn new(id: &'static str, name: &'static str) -> Self {
        Self { id, name }
    }

    fn error(&self) -> EngineError {
        EngineError::unsupported(format!(
            "no {} client is compiled into this build",
            self.name
        ))
    }
}

#[async_trait]
impl EngineAdapter for UnavailableAdapter {
    fn engine_id(&self) -> &str {
        self.id
    }

    async fn connect(
        &self,
        _target: &ConnectTarget,
        _options: &SessionOptions,
    ) -> EngineResult<SessionId> {
        Err(self.error())
    }

    async fn execute(
        &self,
        _session: SessionId,
        _statement: &str,
        _params: &[Value],
    ) -> EngineResult<QueryResult> {
        Err(self.error())
    }

    async fn disconnect(&self, _session: SessionId) -> EngineResult<()> {
        Ok(())
    }
}
