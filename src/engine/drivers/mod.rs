// Engine adapters
// One module per native client; the builtin table below wires each adapter
// to its descriptor.

use std::sync::Arc;

use rela_core::Capability::{
    Cancellation, NativeParameters, ServerSideCursors, SessionTimezone, Transactions,
};
use rela_sql::Dialect;

use crate::engine::descriptor::{AuthMode, EngineDescriptor};
use crate::engine::traits::EngineAdapter;

pub mod bigquery;
pub mod clickhouse;
pub mod databricks;
pub mod duckdb;
pub mod http;
pub mod mysql;
pub mod postgres;
pub mod snowflake;
pub mod trino;
pub mod unavailable;

pub use self::bigquery::BigQueryAdapter;
pub use self::clickhouse::ClickHouseAdapter;
pub use self::databricks::DatabricksAdapter;
pub use self::duckdb::DuckDbAdapter;
pub use self::mysql::MySqlAdapter;
pub use self::postgres::PostgresAdapter;
pub use self::snowflake::SnowflakeAdapter;
pub use self::trino::{TrinoAdapter, TrinoFlavor};
pub use self::unavailable::UnavailableAdapter;

/// Descriptors and adapters of every engine compiled into the crate.
pub fn builtin() -> Vec<(EngineDescriptor, Arc<dyn EngineAdapter>)> {
    vec![
        (
            EngineDescriptor::new("postgresql", "PostgreSQL", Dialect::Postgres)
                .with_schemes(&["postgresql", "postgres"])
                .with_default_port(5432)
                .with_path_params(&["database?"])
                .with_capabilities(&[
                    Transactions,
                    NativeParameters,
                    ServerSideCursors,
                    Cancellation,
                    SessionTimezone,
                ]),
            Arc::new(PostgresAdapter::new("postgresql", Dialect::Postgres)),
        ),
        (
            EngineDescriptor::new("redshift", "Redshift", Dialect::Redshift)
                .with_default_port(5439)
                .with_path_params(&["database?"])
                .with_capabilities(&[
                    Transactions,
                    NativeParameters,
                    ServerSideCursors,
                    Cancellation,
                    SessionTimezone,
                ]),
            Arc::new(PostgresAdapter::new("redshift", Dialect::Redshift)),
        ),
        (
            EngineDescriptor::new("mysql", "MySQL", Dialect::MySql)
                .with_default_port(3306)
                .with_path_params(&["database?"])
                .with_capabilities(&[
                    Transactions,
                    NativeParameters,
                    ServerSideCursors,
                    Cancellation,
                    SessionTimezone,
                ]),
            Arc::new(MySqlAdapter::new()),
        ),
        (
            EngineDescriptor::new("duckdb", "DuckDB", Dialect::DuckDb)
                .with_auth(AuthMode::None)
                .with_raw_path()
                .with_capabilities(&[Transactions, NativeParameters, Cancellation]),
            Arc::new(DuckDbAdapter::new()),
        ),
        (
            EngineDescriptor::new("clickhouse", "ClickHouse", Dialect::ClickHouse)
                .with_default_port(8123)
                .with_path_params(&["database?"])
                .with_capabilities(&[Cancellation]),
            Arc::new(ClickHouseAdapter::new()),
        ),
        (
            EngineDescriptor::new("trino", "Trino", Dialect::Trino)
                .with_default_port(8080)
                .with_path_params(&["catalog", "schema"])
                .with_capabilities(&[ServerSideCursors, Cancellation, SessionTimezone]),
            Arc::new(TrinoAdapter::new(TrinoFlavor::Trino)),
        ),
        (
            EngineDescriptor::new("presto", "Presto", Dialect::Presto)
                .with_default_port(8080)
                .with_path_params(&["catalog", "schema"])
                .with_capabilities(&[ServerSideCursors, Cancellation, SessionTimezone]),
            Arc::new(TrinoAdapter::new(TrinoFlavor::Presto)),
        ),
        (
            EngineDescriptor::new("snowflake", "Snowflake", Dialect::Snowflake)
                .with_path_params(&["database", "schema"])
                .with_keywords(&["warehouse"])
                .with_capabilities(&[
                    Transactions,
                    NativeParameters,
                    Cancellation,
                    SessionTimezone,
                ]),
            Arc::new(SnowflakeAdapter::new()),
        ),
        (
            EngineDescriptor::new("bigquery", "BigQuery", Dialect::BigQuery)
                .with_auth(AuthMode::Token)
                .with_path_params(&["dataset"])
                .with_capabilities(&[NativeParameters, Cancellation]),
            Arc::new(BigQueryAdapter::new()),
        ),
        (
            EngineDescriptor::new("databricks", "Databricks", Dialect::Databricks)
                .with_auth(AuthMode::Token)
                .with_raw_path()
                .with_capabilities(&[NativeParameters, Cancellation]),
            Arc::new(DatabricksAdapter::new()),
        ),
        (
            EngineDescriptor::new("vertica", "Vertica", Dialect::Vertica)
                .with_default_port(5433)
                .with_path_params(&["database?"])
                .with_capabilities(&[Transactions, SessionTimezone]),
            Arc::new(UnavailableAdapter::new("vertica", "Vertica")),
        ),
        (
            EngineDescriptor::new("oracle", "Oracle", Dialect::Oracle)
                .with_default_port(1521)
                .with_path_params(&["database?"])
                .with_capabilities(&[Transactions, SessionTimezone]),
            Arc::new(UnavailableAdapter::new("oracle", "Oracle")),
        ),
    ]
}
