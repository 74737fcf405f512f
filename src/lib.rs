// rela-connect
// Connection-URI driven dispatch layer over many SQL engines

pub mod config;
pub mod engine;
pub mod metrics;
pub mod observability;

pub use config::{ConfigError, DispatchConfig, PoolConfig};
pub use engine::negotiator;
pub use engine::{
    AuthMode, ConnectTarget, Connection, ConnectionState, Dispatcher, EngineAdapter,
    EngineDescriptor, EngineRegistry, SessionOptions,
};
pub use rela_core::{
    Capability, CapabilitySet, ColumnInfo, ConnectionSpec, EngineError, EngineResult, ErrorKind,
    QueryResult, Row, Sensitive, SessionId, Value,
};
pub use rela_sql::{Dialect, QuoteStyle};

/// Parses a connection URI into its engine-agnostic parts.
pub fn parse_uri(uri: &str) -> EngineResult<ConnectionSpec> {
    rela_sql::parse(uri)
}
