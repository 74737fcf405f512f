//! Engine descriptors
//!
//! Static metadata about an engine: which URI schemes select it, how its URI
//! path is laid out, which capabilities it offers, and which SQL dialect it
//! speaks. Descriptors carry no connection state.

use rela_core::{Capability, CapabilitySet};
use rela_sql::Dialect;
use serde::{Deserialize, Serialize};

/// Where an engine takes its credentials from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// No credentials (embedded engines)
    None,
    /// `user:password` in the URI
    Basic,
    /// An access token in the password slot; the user must be empty
    Token,
}

/// A named parameter taken from one URI path segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathParam {
    pub name: String,
    pub optional: bool,
}

impl PathParam {
    /// Parses `"schema"` or `"database?"` (trailing `?` marks it optional).
    pub fn parse(spec: &str) -> Self {
        match spec.strip_suffix('?') {
            Some(name) => Self {
                name: name.to_string(),
                optional: true,
            },
            None => Self {
                name: spec.to_string(),
                optional: false,
            },
        }
    }
}

/// How the URI path of an engine is interpreted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathLayout {
    /// Each segment fills one named parameter; `keywords` are required query parameters
    Params {
        params: Vec<PathParam>,
        keywords: Vec<String>,
    },
    /// The path is used verbatim (file path, HTTP path)
    Raw,
}

/// Static description of an engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDescriptor {
    pub id: String,
    pub name: String,
    /// Lower-cased URI schemes selecting this engine
    pub schemes: Vec<String>,
    pub default_port: Option<u16>,
    pub auth: AuthMode,
    pub capabilities: CapabilitySet,
    pub dialect: Dialect,
    pub path: PathLayout,
}

impl EngineDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, dialect: Dialect) -> Self {
        let id = id.into();
        Self {
            schemes: vec![id.to_ascii_lowercase()],
            id,
            name: name.into(),
            default_port: None,
            auth: AuthMode::Basic,
            capabilities: CapabilitySet::EMPTY,
            dialect,
            path: PathLayout::Params {
                params: Vec::new(),
                keywords: Vec::new(),
            },
        }
    }

    pub fn with_schemes(mut self, schemes: &[&str]) -> Self {
        self.schemes = schemes.iter().map(|s| s.to_ascii_lowercase()).collect();
        self
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = Some(port);
        self
    }

    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities = capabilities.iter().copied().collect();
        self
    }

    pub fn with_path_params(mut self, params: &[&str]) -> Self {
        let keywords = match self.path {
            PathLayout::Params { keywords, .. } => keywords,
            PathLayout::Raw => Vec::new(),
        };
        self.path = PathLayout::Params {
            params: params.iter().map(|p| PathParam::parse(p)).collect(),
            keywords,
        };
        self
    }

    pub fn with_keywords(mut self, required: &[&str]) -> Self {
        let params = match self.path {
            PathLayout::Params { params, .. } => params,
            PathLayout::Raw => Vec::new(),
        };
        self.path = PathLayout::Params {
            params,
            keywords: required.iter().map(|k| k.to_string()).collect(),
        };
        self
    }

    pub fn with_raw_path(mut self) -> Self {
        self.path = PathLayout::Raw;
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn primary_scheme(&self) -> &str {
        self.schemes.first().map(String::as_str).unwrap_or(&self.id)
    }

    /// Human-readable URI template, used in binding errors.
    pub fn uri_help(&self) -> String {
        let credentials = match self.auth {
            AuthMode::None => "",
            AuthMode::Basic => "<user>:<password>@",
            AuthMode::Token => ":<access_token>@",
        };
        let path = match &self.path {
            PathLayout::Raw => "/<path>".to_string(),
            PathLayout::Params { params, keywords } => {
                let mut path: String = params
                    .iter()
                    .map(|p| {
                        if p.optional {
                            format!("[/<{}>]", p.name)
                        } else {
                            format!("/<{}>", p.name)
                        }
                    })
                    .collect();
                if !keywords.is_empty() {
                    let query: Vec<String> =
                        keywords.iter().map(|k| format!("{}=<{}>", k, k)).collect();
                    path.push('?');
                    path.push_str(&query.join("&"));
                }
                path
            }
        };
        format!("{}://{}<host>{}", self.primary_scheme(), credentials, path)
    }
}
