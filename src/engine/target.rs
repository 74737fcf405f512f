//! Binding a parsed URI to an engine
//!
//! A [`ConnectTarget`] is a [`ConnectionSpec`] whose path has been matched
//! against the engine's [`PathLayout`]. Adapters read everything they need to
//! connect from it.

use std::collections::BTreeMap;

use rela_core::{ConnectionSpec, EngineError, EngineResult};

use crate::engine::descriptor::{AuthMode, EngineDescriptor, PathLayout};

#[derive(Debug, Clone)]
pub struct ConnectTarget {
    spec: ConnectionSpec,
    default_port: Option<u16>,
    /// Named path parameters, including ones supplied as query parameters
    params: BTreeMap<String, String>,
    /// Query parameters not consumed by the path layout
    options: BTreeMap<String, String>,
}

impl ConnectTarget {
    pub fn bind(spec: &ConnectionSpec, descriptor: &EngineDescriptor) -> EngineResult<Self> {
        if descriptor.auth == AuthMode::Token && spec.user.as_deref().is_some_and(|u| !u.is_empty())
        {
            return Err(EngineError::malformed_uri(format!(
                "{} takes an access token in the password slot and no user. Expected format: {}",
                descriptor.name,
                descriptor.uri_help()
            )));
        }

        let mut params = BTreeMap::new();
        let mut options = spec.parameters.clone();

        if let PathLayout::Params {
            params: declared,
            keywords,
        } = &descriptor.path
        {
            let segments = spec.path_segments();
            if segments.len() > declared.len() {
                return Err(EngineError::malformed_uri(format!(
                    "Too many parts to path. Expected format: {}",
                    descriptor.uri_help()
                )));
            }

            for (i, param) in declared.iter().enumerate() {
                match segments.get(i) {
                    Some(segment) => {
                        if options.contains_key(&param.name) {
                            return Err(EngineError::malformed_uri(format!(
                                "Parameter '{}' provided both in the path and as a query parameter",
                                param.name
                            )));
                        }
                        params.insert(param.name.clone(), segment.to_string());
                    }
                    None => {
                        if let Some(value) = options.remove(&param.name) {
                            params.insert(param.name.clone(), value);
                        } else if !param.optional {
                            return Err(EngineError::malformed_uri(format!(
                                "Missing required parameter '{}'. Expected format: {}",
                                param.name,
                                descriptor.uri_help()
                            )));
                        }
                    }
                }
            }

            for keyword in keywords {
                if !options.contains_key(keyword) {
                    return Err(EngineError::malformed_uri(format!(
                        "Missing required parameter '{}'. Expected format: {}",
                        keyword,
                        descriptor.uri_help()
                    )));
                }
            }
        }

        Ok(Self {
            spec: spec.clone(),
            default_port: descriptor.default_port,
            params,
            options,
        })
    }

    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    pub fn host(&self) -> &str {
        &self.spec.host
    }

    /// Explicit port, falling back to the engine default.
    pub fn port(&self) -> Option<u16> {
        self.spec.port.or(self.default_port)
    }

    pub fn user(&self) -> Option<&str> {
        self.spec.user.as_deref().filter(|u| !u.is_empty())
    }

    pub fn password(&self) -> Option<&str> {
        self.spec.password()
    }

    /// Raw decoded path (for engines with a raw path layout).
    pub fn path(&self) -> &str {
        &self.spec.path
    }

    /// Named path parameter, or any query parameter of that name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .or_else(|| self.options.get(name))
            .map(String::as_str)
    }

    pub fn require_param(&self, name: &str) -> EngineResult<&str> {
        self.param(name).ok_or_else(|| {
            EngineError::malformed_uri(format!("Missing required parameter '{}'", name))
        })
    }

    /// Query parameters not consumed by the path layout.
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// Boolean query parameter (`true/false`, `1/0`, `yes/no`, `on/off`).
    pub fn flag(&self, name: &str) -> EngineResult<Option<bool>> {
        match self.options.get(name) {
            None => Ok(None),
            Some(value) => parse_bool_param(value).map(Some).ok_or_else(|| {
                EngineError::malformed_uri(format!(
                    "Invalid boolean '{}' for parameter '{}'",
                    value, name
                ))
            }),
        }
    }

    /// `host:port` authority, IPv6 brackets preserved.
    pub fn authority(&self) -> String {
        match self.port() {
            Some(port) => format!("{}:{}", self.host(), port),
            None => self.host().to_string(),
        }
    }
}

fn parse_bool_param(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}
