//! Statement classification
//!
//! Adapters whose client distinguishes "query" from "execute" calls need to
//! know up front whether a statement produces a result set.

use sqlparser::ast::Statement;
use sqlparser::dialect::{
    BigQueryDialect, ClickHouseDialect, DatabricksDialect, Dialect as ParserDialect,
    DuckDbDialect, GenericDialect, MySqlDialect, PostgreSqlDialect, RedshiftSqlDialect,
    SnowflakeDialect,
};
use sqlparser::parser::Parser;

use crate::dialect::Dialect;

fn parser_dialect(dialect: Dialect) -> Box<dyn ParserDialect> {
    match dialect {
        Dialect::Postgres => Box::new(PostgreSqlDialect {}),
        Dialect::Redshift => Box::new(RedshiftSqlDialect {}),
        Dialect::MySql => Box::new(MySqlDialect {}),
        Dialect::DuckDb => Box::new(DuckDbDialect {}),
        Dialect::ClickHouse => Box::new(ClickHouseDialect {}),
        Dialect::Snowflake => Box::new(SnowflakeDialect {}),
        Dialect::BigQuery => Box::new(BigQueryDialect {}),
        Dialect::Databricks => Box::new(DatabricksDialect {}),
        Dialect::Trino | Dialect::Presto | Dialect::Vertica | Dialect::Oracle => {
            Box::new(GenericDialect {})
        }
    }
}

/// Whether `sql` (its last statement, when several are given) returns rows.
///
/// Statements the parser does not understand fall back to a keyword check,
/// so engine-specific syntax still classifies sensibly.
pub fn returns_rows(sql: &str, dialect: Dialect) -> bool {
    let parser_dialect = parser_dialect(dialect);
    match Parser::parse_sql(parser_dialect.as_ref(), sql) {
        Ok(statements) => match statements.last() {
            Some(statement) => is_row_returning(statement),
            None => false,
        },
        Err(_) => keyword_returns_rows(sql),
    }
}

fn is_row_returning(statement: &Statement) -> bool {
    matches!(
        statement,
        Statement::Query(_)
            | Statement::ShowTables { .. }
            | Statement::ShowColumns { .. }
            | Statement::ShowCreate { .. }
            | Statement::ShowVariable { .. }
            | Statement::ShowVariables { .. }
            | Statement::Explain { .. }
            | Statement::ExplainTable { .. }
            | Statement::Pragma { .. }
    )
}

fn keyword_returns_rows(sql: &str) -> bool {
    let first = first_keyword(sql).to_ascii_uppercase();
    matches!(
        first.as_str(),
        "SELECT"
            | "WITH"
            | "VALUES"
            | "SHOW"
            | "DESCRIBE"
            | "DESC"
            | "EXPLAIN"
            | "TABLE"
            | "PRAGMA"
            | "FROM"
            | "SUMMARIZE"
            | "CALL"
    )
}

/// First word of the statement after leading whitespace, comments and parentheses.
fn first_keyword(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            break;
        }
    }
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    &rest[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queries_return_rows() {
        assert!(returns_rows("SELECT 1", Dialect::Postgres));
        assert!(returns_rows("WITH t AS (SELECT 1) SELECT * FROM t", Dialect::DuckDb));
        assert!(returns_rows("SHOW TABLES", Dialect::MySql));
        assert!(returns_rows("EXPLAIN SELECT 1", Dialect::Postgres));
    }

    #[test]
    fn test_dml_and_ddl_do_not() {
        assert!(!returns_rows("INSERT INTO t VALUES (1)", Dialect::Postgres));
        assert!(!returns_rows("CREATE TABLE t (id INT)", Dialect::MySql));
        assert!(!returns_rows("SET TIME ZONE 'UTC'", Dialect::Postgres));
    }

    #[test]
    fn test_fallback_on_unparseable_sql() {
        // invalid SQL still gets a verdict; the engine reports the real error
        assert!(!returns_rows("SELEC 1", Dialect::DuckDb));
        assert!(returns_rows("/* hint */ SUMMARIZE SELECT 1 AS x", Dialect::Trino));
        assert_eq!(first_keyword("  -- note\n (select 1)"), "select");
    }
}
