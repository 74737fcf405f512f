//! SQL dialects
//!
//! Per-engine rules for quoting identifiers, rendering literals, and the few
//! session statements the dispatch layer issues on its own (transaction
//! control, pinning the session time zone).

use rela_core::{EngineError, EngineResult, Value};
use serde::{Deserialize, Serialize};

/// SQL dialect of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Postgres,
    Redshift,
    MySql,
    DuckDb,
    ClickHouse,
    Trino,
    Presto,
    Snowflake,
    BigQuery,
    Databricks,
    Vertica,
    Oracle,
}

/// Identifier quoting convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStyle {
    /// `"name"`, embedded quotes doubled
    DoubleQuote,
    /// `` `name` ``, embedded backticks doubled
    Backtick,
}

impl QuoteStyle {
    pub fn quote_char(&self) -> char {
        match self {
            QuoteStyle::DoubleQuote => '"',
            QuoteStyle::Backtick => '`',
        }
    }
}

/// How positional parameters reach the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderStyle {
    /// `$1, $2, ...`
    Dollar,
    /// `?` kept as written
    QuestionMark,
    /// `:p1, :p2, ...`
    Colon,
    /// No native binding; values are rendered as literals
    Inline,
}

impl Dialect {
    pub fn quote_style(&self) -> QuoteStyle {
        match self {
            Dialect::MySql | Dialect::BigQuery | Dialect::Databricks => QuoteStyle::Backtick,
            _ => QuoteStyle::DoubleQuote,
        }
    }

    /// Quote an identifier according to the dialect
    pub fn quote_ident(&self, name: &str) -> String {
        let q = self.quote_style().quote_char();
        let doubled: String = [q, q].iter().collect();
        format!("{q}{}{q}", name.replace(q, &doubled))
    }

    pub fn placeholder_style(&self) -> PlaceholderStyle {
        match self {
            Dialect::Postgres | Dialect::Redshift => PlaceholderStyle::Dollar,
            Dialect::MySql | Dialect::DuckDb | Dialect::BigQuery | Dialect::Snowflake => {
                PlaceholderStyle::QuestionMark
            }
            Dialect::Databricks => PlaceholderStyle::Colon,
            Dialect::ClickHouse
            | Dialect::Trino
            | Dialect::Presto
            | Dialect::Vertica
            | Dialect::Oracle => PlaceholderStyle::Inline,
        }
    }

    /// Whether a backslash escapes the next character inside string literals.
    pub fn backslash_escapes(&self) -> bool {
        matches!(
            self,
            Dialect::MySql
                | Dialect::ClickHouse
                | Dialect::BigQuery
                | Dialect::Databricks
                | Dialect::Redshift
        )
    }

    /// Whether `$tag$ ... $tag$` strings exist in this dialect.
    pub fn dollar_quotes(&self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::DuckDb | Dialect::Snowflake)
    }

    /// Statement pinning the session time zone to UTC, if the engine has one.
    pub fn set_timezone_utc(&self) -> Option<&'static str> {
        match self {
            Dialect::Postgres | Dialect::Redshift => Some("SET TIME ZONE 'UTC'"),
            Dialect::MySql => Some("SET @@session.time_zone = '+00:00'"),
            Dialect::Snowflake => Some("ALTER SESSION SET TIMEZONE = 'UTC'"),
            Dialect::Vertica => Some("SET TIME ZONE TO 'UTC'"),
            Dialect::Oracle => Some("ALTER SESSION SET TIME_ZONE = 'UTC'"),
            // Trino and Presto take the zone as a request header
            _ => None,
        }
    }

    pub fn begin_statement(&self) -> &'static str {
        match self {
            Dialect::MySql => "START TRANSACTION",
            Dialect::Snowflake => "BEGIN TRANSACTION",
            _ => "BEGIN",
        }
    }

    pub fn commit_statement(&self) -> &'static str {
        "COMMIT"
    }

    pub fn rollback_statement(&self) -> &'static str {
        "ROLLBACK"
    }

    /// Format a value as a SQL literal
    pub fn format_literal(&self, value: &Value) -> EngineResult<String> {
        match value {
            Value::Null => Ok("NULL".to_string()),
            Value::Bool(b) => Ok(match self {
                Dialect::Oracle => if *b { "1" } else { "0" }.to_string(),
                _ => if *b { "TRUE" } else { "FALSE" }.to_string(),
            }),
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) => {
                if !f.is_finite() {
                    return Err(EngineError::unsupported(format!(
                        "non-finite float {} cannot be written as a literal",
                        f
                    )));
                }
                Ok(format!("{:?}", f))
            }
            Value::Decimal(s) => {
                if !is_numeric_literal(s) {
                    return Err(EngineError::unsupported(format!(
                        "'{}' is not a decimal number",
                        s
                    )));
                }
                Ok(s.trim().to_string())
            }
            Value::Text(s) => self.escape_string(s),
            Value::Bytes(b) => Ok(self.format_bytes(b)),
            Value::Json(j) => {
                let json_str = serde_json::to_string(j)
                    .map_err(|e| EngineError::execution_error(e.to_string()))?;
                let literal = self.escape_string(&json_str)?;
                Ok(match self {
                    Dialect::Trino | Dialect::Presto => format!("JSON {}", literal),
                    _ => literal,
                })
            }
            Value::Array(items) => {
                let elements = items
                    .iter()
                    .map(|v| self.format_literal(v))
                    .collect::<EngineResult<Vec<_>>>()?;
                let joined = elements.join(", ");
                match self {
                    Dialect::Postgres
                    | Dialect::Redshift
                    | Dialect::DuckDb
                    | Dialect::Trino
                    | Dialect::Presto
                    | Dialect::Vertica => Ok(format!("ARRAY[{}]", joined)),
                    Dialect::ClickHouse | Dialect::BigQuery => Ok(format!("[{}]", joined)),
                    Dialect::Snowflake => Ok(format!("ARRAY_CONSTRUCT({})", joined)),
                    Dialect::Databricks => Ok(format!("array({})", joined)),
                    Dialect::MySql => {
                        // No array type; stored as JSON
                        let json = value.to_json().to_string();
                        self.escape_string(&json)
                    }
                    Dialect::Oracle => Err(EngineError::unsupported(
                        "array literals are not supported for oracle",
                    )),
                }
            }
        }
    }

    /// Escape a string for SQL
    fn escape_string(&self, s: &str) -> EngineResult<String> {
        if s.contains('\0') && !self.backslash_escapes() {
            return Err(EngineError::unsupported(
                "strings containing NUL cannot be written as a literal",
            ));
        }

        match self {
            Dialect::Postgres => {
                let mut escaped = String::with_capacity(s.len());
                let mut needs_e_prefix = false;

                for ch in s.chars() {
                    match ch {
                        '\\' => {
                            needs_e_prefix = true;
                            escaped.push_str("\\\\");
                        }
                        '\'' => escaped.push_str("''"),
                        '\n' => {
                            needs_e_prefix = true;
                            escaped.push_str("\\n");
                        }
                        '\r' => {
                            needs_e_prefix = true;
                            escaped.push_str("\\r");
                        }
                        '\t' => {
                            needs_e_prefix = true;
                            escaped.push_str("\\t");
                        }
                        _ => escaped.push(ch),
                    }
                }

                if needs_e_prefix {
                    Ok(format!("E'{}'", escaped))
                } else {
                    Ok(format!("'{}'", escaped))
                }
            }
            Dialect::MySql | Dialect::ClickHouse | Dialect::Redshift => {
                let escaped = s
                    .replace('\\', "\\\\")
                    .replace('\'', "''")
                    .replace('\n', "\\n")
                    .replace('\r', "\\r")
                    .replace('\t', "\\t")
                    .replace('\0', "\\0");
                Ok(format!("'{}'", escaped))
            }
            Dialect::BigQuery | Dialect::Databricks => {
                let escaped = s
                    .replace('\\', "\\\\")
                    .replace('\'', "\\'")
                    .replace('\n', "\\n")
                    .replace('\r', "\\r")
                    .replace('\t', "\\t")
                    .replace('\0', "\\0");
                Ok(format!("'{}'", escaped))
            }
            _ => Ok(format!("'{}'", s.replace('\'', "''"))),
        }
    }

    /// Format bytes as a SQL literal
    fn format_bytes(&self, bytes: &[u8]) -> String {
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        match self {
            Dialect::Postgres => format!("'\\x{}'::bytea", hex),
            Dialect::Redshift => format!("from_hex('{}')", hex),
            Dialect::DuckDb => format!("from_hex('{}')", hex),
            Dialect::ClickHouse => format!("unhex('{}')", hex),
            Dialect::Snowflake => format!("TO_BINARY('{}', 'HEX')", hex),
            Dialect::BigQuery => format!("FROM_HEX('{}')", hex),
            Dialect::Vertica => format!("HEX_TO_BINARY('{}')", hex),
            Dialect::Oracle => format!("HEXTORAW('{}')", hex),
            Dialect::MySql | Dialect::Trino | Dialect::Presto | Dialect::Databricks => {
                format!("X'{}'", hex)
            }
        }
    }
}

fn is_numeric_literal(s: &str) -> bool {
    let s = s.trim();
    let digits = s.strip_prefix(['-', '+']).unwrap_or(s);
    let (mantissa, exponent) = match digits.split_once(['e', 'E']) {
        Some((m, e)) => (m, Some(e)),
        None => (digits, None),
    };
    let mantissa_ok = !mantissa.is_empty()
        && mantissa.chars().filter(|c| *c == '.').count() <= 1
        && mantissa.chars().all(|c| c.is_ascii_digit() || c == '.')
        && mantissa.chars().any(|c| c.is_ascii_digit());
    let exponent_ok = exponent.map_or(true, |e| {
        let e = e.strip_prefix(['-', '+']).unwrap_or(e);
        !e.is_empty() && e.chars().all(|c| c.is_ascii_digit())
    });
    mantissa_ok && exponent_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(Dialect::Postgres.quote_ident("my\"table"), "\"my\"\"table\"");
        assert_eq!(Dialect::Trino.quote_ident("Orders"), "\"Orders\"");
        assert_eq!(Dialect::MySql.quote_ident("my`table"), "`my``table`");
        assert_eq!(Dialect::BigQuery.quote_ident("ds"), "`ds`");
        assert_eq!(Dialect::Databricks.quote_style(), QuoteStyle::Backtick);
        assert_eq!(Dialect::Snowflake.quote_style(), QuoteStyle::DoubleQuote);
    }

    #[test]
    fn test_string_literals() {
        assert_eq!(
            Dialect::Postgres.format_literal(&Value::Text("O'Brien".into())).unwrap(),
            "'O''Brien'"
        );
        assert_eq!(
            Dialect::Postgres.format_literal(&Value::Text("a\\b".into())).unwrap(),
            "E'a\\\\b'"
        );
        assert_eq!(
            Dialect::MySql.format_literal(&Value::Text("a\\'b".into())).unwrap(),
            "'a\\\\''b'"
        );
        assert_eq!(
            Dialect::Trino.format_literal(&Value::Text("it's".into())).unwrap(),
            "'it''s'"
        );
        assert_eq!(
            Dialect::Databricks.format_literal(&Value::Text("it's".into())).unwrap(),
            "'it\\'s'"
        );
    }

    #[test]
    fn test_scalar_literals() {
        assert_eq!(Dialect::Trino.format_literal(&Value::Null).unwrap(), "NULL");
        assert_eq!(Dialect::Trino.format_literal(&Value::Bool(true)).unwrap(), "TRUE");
        assert_eq!(Dialect::Oracle.format_literal(&Value::Bool(true)).unwrap(), "1");
        assert_eq!(Dialect::ClickHouse.format_literal(&Value::Int(-7)).unwrap(), "-7");
        assert_eq!(Dialect::ClickHouse.format_literal(&Value::Float(1.5)).unwrap(), "1.5");
        assert_eq!(
            Dialect::Trino.format_literal(&Value::Decimal("12.340".into())).unwrap(),
            "12.340"
        );
        assert_eq!(
            Dialect::Trino.format_literal(&Value::Bytes(vec![0xde, 0xad])).unwrap(),
            "X'dead'"
        );
        assert_eq!(
            Dialect::ClickHouse
                .format_literal(&Value::Array(vec![Value::Int(1), Value::Int(2)]))
                .unwrap(),
            "[1, 2]"
        );
        assert_eq!(
            Dialect::MySql
                .format_literal(&Value::Array(vec![Value::Int(1), Value::Text("a".into())]))
                .unwrap(),
            r#"'[1,"a"]'"#
        );
    }

    #[test]
    fn test_unrepresentable_values_rejected() {
        let err = Dialect::Trino.format_literal(&Value::Float(f64::NAN)).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedCapability { .. }));

        let err = Dialect::Trino
            .format_literal(&Value::Decimal("1; DROP TABLE t".into()))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedCapability { .. }));

        let err = Dialect::Trino.format_literal(&Value::Text("a\0b".into())).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedCapability { .. }));
    }

    #[test]
    fn test_numeric_literal_check() {
        assert!(is_numeric_literal("1"));
        assert!(is_numeric_literal("-1.25"));
        assert!(is_numeric_literal("6.02e23"));
        assert!(!is_numeric_literal("."));
        assert!(!is_numeric_literal("1.2.3"));
        assert!(!is_numeric_literal("1e"));
        assert!(!is_numeric_literal("abc"));
    }

    #[test]
    fn test_session_statements() {
        assert_eq!(Dialect::Postgres.set_timezone_utc(), Some("SET TIME ZONE 'UTC'"));
        assert!(Dialect::Trino.set_timezone_utc().is_none());
        assert_eq!(Dialect::MySql.begin_statement(), "START TRANSACTION");
    }
}
