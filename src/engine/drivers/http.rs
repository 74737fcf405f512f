//! Shared plumbing for engines reached over HTTP
//!
//! ClickHouse, Trino/Presto, Snowflake, BigQuery and Databricks all speak
//! JSON over HTTP. This module holds the client builder, error mapping and
//! the conversion from JSON cells to [`Value`].

use std::time::Duration;

use base64::Engine as _;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rela_core::{EngineError, EngineResult, Value};
use serde::de::DeserializeOwned;

use crate::engine::target::ConnectTarget;
use crate::engine::traits::SessionOptions;

/// Delay between polls of a statement that is still running.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub fn build_client(options: &SessionOptions) -> EngineResult<Client> {
    Client::builder()
        .user_agent(options.application_name())
        .gzip(true)
        .build()
        .map_err(|e| EngineError::connection_failed(format!("Failed to build HTTP client: {}", e)))
}

/// `http` or `https`, from the `secure`/`ssl` flags or a 443 port.
pub fn http_scheme(target: &ConnectTarget, secure_by_default: bool) -> EngineResult<&'static str> {
    let secure = match target.flag("secure")? {
        Some(flag) => flag,
        None => match target.flag("ssl")? {
            Some(flag) => flag,
            None => secure_by_default || target.port() == Some(443),
        },
    };
    Ok(if secure { "https" } else { "http" })
}

/// Base URL `scheme://host[:port]` for the target.
pub fn base_url(target: &ConnectTarget, secure_by_default: bool) -> EngineResult<String> {
    if target.host().is_empty() {
        return Err(EngineError::malformed_uri("A host is required"));
    }
    Ok(format!(
        "{}://{}",
        http_scheme(target, secure_by_default)?,
        target.authority()
    ))
}

/// Sends a request, mapping transport failures.
pub async fn send(request: RequestBuilder) -> EngineResult<Response> {
    request.send().await.map_err(transport_error)
}

pub fn transport_error(err: reqwest::Error) -> EngineError {
    if err.is_connect() || err.is_timeout() {
        EngineError::connection_failed(err.to_string())
    } else if err.is_decode() || err.is_body() {
        EngineError::execution_retryable(err.to_string())
    } else {
        EngineError::execution_error(err.to_string())
    }
}

/// Maps a non-success status to an error, keeping the server's message.
pub fn status_error(status: StatusCode, message: String) -> EngineError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EngineError::auth_failed(message),
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => EngineError::execution_retryable(message),
        _ => EngineError::execution_error(message),
    }
}

/// Returns the response if successful, otherwise the mapped error.
pub async fn check(response: Response) -> EngineResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let msg = extract_api_error(&body).unwrap_or_else(|| format!("HTTP {}: {}", status, body));
    Err(status_error(status, msg))
}

/// Decodes a successful JSON body.
pub async fn json<T: DeserializeOwned>(response: Response) -> EngineResult<T> {
    check(response).await?.json::<T>().await.map_err(transport_error)
}

/// Error message from the common JSON error envelopes.
pub fn extract_api_error(body: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
    parsed["error"]["message"]
        .as_str()
        .or_else(|| parsed["message"].as_str())
        .or_else(|| parsed["error"].as_str())
        .map(|s| s.to_string())
}

/// How a JSON cell should be read, derived from the engine's column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Integer,
    Float,
    Decimal,
    Boolean,
    Base64,
    Hex,
    Json,
    Text,
}

impl CellKind {
    /// Best guess from a SQL type name such as `BIGINT` or `DECIMAL(10,2)`.
    pub fn from_type_name(type_name: &str) -> Self {
        let lower = type_name.to_ascii_lowercase();
        let base = lower
            .trim_start_matches("nullable(")
            .trim_start_matches("lowcardinality(")
            .split(|c: char| c == '(' || c == ')' || c == ' ')
            .next()
            .unwrap_or("");
        match base {
            "tinyint" | "smallint" | "integer" | "int" | "bigint" | "int8" | "int16" | "int32"
            | "int64" | "uint8" | "uint16" | "uint32" | "long" | "short" | "byte" => {
                CellKind::Integer
            }
            "real" | "float" | "double" | "float32" | "float64" | "float4" | "float8" => {
                CellKind::Float
            }
            "decimal" | "numeric" | "bignumeric" | "uint64" | "int128" | "uint128" | "int256"
            | "uint256" | "hugeint" => CellKind::Decimal,
            "boolean" | "bool" => CellKind::Boolean,
            "json" | "map" | "struct" | "row" | "object" | "variant" => CellKind::Json,
            _ => CellKind::Text,
        }
    }
}

/// Converts a JSON cell to a Value using the column's kind.
///
/// HTTP engines often ship numbers as strings; the kind decides how they are
/// read back. Arrays are converted element-wise.
pub fn json_to_value(kind: CellKind, cell: serde_json::Value) -> Value {
    use serde_json::Value as J;
    match (kind, cell) {
        (_, J::Null) => Value::Null,
        (CellKind::Json, other) => match other {
            J::String(s) => serde_json::from_str(&s).map(Value::Json).unwrap_or(Value::Text(s)),
            other => Value::Json(other),
        },
        (_, J::Bool(b)) => Value::Bool(b),
        (CellKind::Integer, J::Number(n)) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Decimal(n.to_string()),
        },
        (CellKind::Float, J::Number(n)) => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
        (CellKind::Decimal, J::Number(n)) => Value::Decimal(n.to_string()),
        (_, J::Number(n)) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
        },
        (kind, J::String(s)) => text_to_value(kind, s),
        (kind, J::Array(items)) => {
            Value::Array(items.into_iter().map(|v| json_to_value(kind, v)).collect())
        }
        (_, other @ J::Object(_)) => Value::Json(other),
    }
}

/// Converts a string-encoded cell. Unparseable text is kept as text.
pub fn text_to_value(kind: CellKind, s: String) -> Value {
    match kind {
        CellKind::Integer => match s.parse::<i64>() {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Decimal(s),
        },
        CellKind::Float => match s.as_str() {
            "inf" | "Infinity" => Value::Float(f64::INFINITY),
            "-inf" | "-Infinity" => Value::Float(f64::NEG_INFINITY),
            "nan" | "NaN" => Value::Float(f64::NAN),
            _ => s.parse::<f64>().map(Value::Float).unwrap_or(Value::Text(s)),
        },
        CellKind::Decimal => Value::Decimal(s),
        CellKind::Boolean => match s.to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => Value::Text(s),
        },
        CellKind::Base64 => base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map(Value::Bytes)
            .unwrap_or(Value::Text(s)),
        CellKind::Hex => decode_hex(&s).map(Value::Bytes).unwrap_or(Value::Text(s)),
        CellKind::Json => serde_json::from_str(&s).map(Value::Json).unwrap_or(Value::Text(s)),
        CellKind::Text => Value::Text(s),
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| s.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect()
}

/// JSON rendering of a bound parameter for engines taking typed JSON bindings.
pub fn param_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Text(s) | Value::Decimal(s) => Some(s.clone()),
        Value::Bytes(b) => Some(base64::engine::general_purpose::STANDARD.encode(b)),
        Value::Json(j) => Some(j.to_string()),
        Value::Array(_) => Some(value.to_json().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_from_type_name() {
        assert_eq!(CellKind::from_type_name("BIGINT"), CellKind::Integer);
        assert_eq!(CellKind::from_type_name("Nullable(Int32)"), CellKind::Integer);
        assert_eq!(CellKind::from_type_name("decimal(10,2)"), CellKind::Decimal);
        assert_eq!(CellKind::from_type_name("double precision"), CellKind::Float);
        assert_eq!(CellKind::from_type_name("varchar"), CellKind::Text);
        assert_eq!(CellKind::from_type_name("row(a integer)"), CellKind::Json);
    }

    #[test]
    fn test_json_cells() {
        assert_eq!(json_to_value(CellKind::Integer, json!("42")), Value::Int(42));
        assert_eq!(
            json_to_value(CellKind::Integer, json!("18446744073709551615")),
            Value::Decimal("18446744073709551615".into())
        );
        assert_eq!(
            json_to_value(CellKind::Decimal, json!("1.10")),
            Value::Decimal("1.10".into())
        );
        assert_eq!(json_to_value(CellKind::Float, json!(1.5)), Value::Float(1.5));
        assert_eq!(json_to_value(CellKind::Boolean, json!("true")), Value::Bool(true));
        assert_eq!(json_to_value(CellKind::Text, json!(null)), Value::Null);
        assert_eq!(
            json_to_value(CellKind::Integer, json!([1, null])),
            Value::Array(vec![Value::Int(1), Value::Null])
        );
        assert_eq!(
            json_to_value(CellKind::Base64, json!("AQI=")),
            Value::Bytes(vec![1, 2])
        );
        assert_eq!(json_to_value(CellKind::Hex, json!("0a0b")), Value::Bytes(vec![10, 11]));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "no".into()),
            EngineError::AuthFailed { .. }
        ));
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "busy".into()).is_retryable());
        assert!(!status_error(StatusCode::BAD_REQUEST, "bad".into()).is_retryable());
    }

    #[test]
    fn test_extract_api_error() {
        assert_eq!(
            extract_api_error(r#"{"error":{"message":"boom"}}"#).as_deref(),
            Some("boom")
        );
        assert_eq!(extract_api_error(r#"{"message":"m"}"#).as_deref(), Some("m"));
        assert_eq!(extract_api_error("plain"), None);
    }
}
