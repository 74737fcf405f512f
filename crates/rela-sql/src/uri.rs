//! Connection URI parsing
//!
//! Decomposes `scheme://[user[:password]@]host[:port]/path[?param=value&...]`
//! into a [`ConnectionSpec`]. The parser knows nothing about engines: path
//! interpretation and default ports are applied later, once the scheme has
//! been resolved against the registry.

use std::collections::BTreeMap;

use rela_core::{ConnectionSpec, EngineError, EngineResult, Sensitive};
use url::Url;

/// Parses a connection URI.
///
/// Every failure is reported as [`EngineError::MalformedUri`]. The scheme is
/// lower-cased; host case is preserved (Snowflake accounts, BigQuery projects).
pub fn parse(uri: &str) -> EngineResult<ConnectionSpec> {
    let trimmed = uri.trim();
    if trimmed.is_empty() {
        return Err(EngineError::malformed_uri("connection URI is empty"));
    }

    let scheme_end = trimmed
        .find("://")
        .ok_or_else(|| EngineError::malformed_uri("connection URI must have the form scheme://..."))?;
    if scheme_end == 0 {
        return Err(EngineError::malformed_uri("connection URI has no scheme"));
    }

    let url = Url::parse(trimmed).map_err(|e| match e {
        url::ParseError::InvalidPort => EngineError::malformed_uri("invalid port in connection URI"),
        url::ParseError::RelativeUrlWithoutBase => {
            EngineError::malformed_uri("connection URI has no scheme")
        }
        other => EngineError::malformed_uri(format!("invalid connection URI: {}", other)),
    })?;

    if url.fragment().is_some() {
        return Err(EngineError::malformed_uri(
            "connection URI must not contain a fragment (percent-encode '#' in credentials)",
        ));
    }

    let scheme = url.scheme().to_ascii_lowercase();

    let user = if url.username().is_empty() {
        None
    } else {
        Some(decode(url.username(), "user")?)
    };

    let password = url
        .password()
        .map(|p| decode(p, "password"))
        .transpose()?
        .map(Sensitive::new);

    let host = url.host_str().unwrap_or_default().to_string();

    let path = match url.path().strip_prefix('/') {
        Some(rest) => decode(rest, "path")?,
        None => decode(url.path(), "path")?,
    };

    let mut parameters = BTreeMap::new();
    for (key, value) in url.query_pairs() {
        if key.is_empty() {
            return Err(EngineError::malformed_uri("query parameter with an empty name"));
        }
        if parameters.contains_key(key.as_ref()) {
            return Err(EngineError::malformed_uri(format!(
                "query parameter '{}' is given more than once",
                key
            )));
        }
        parameters.insert(key.into_owned(), value.into_owned());
    }

    Ok(ConnectionSpec {
        scheme,
        user,
        password,
        host,
        port: url.port(),
        path,
        parameters,
    })
}

fn decode(s: &str, component: &str) -> EngineResult<String> {
    percent_encoding::percent_decode_str(s)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| EngineError::malformed_uri(format!("invalid {} encoding", component)))
}
