//! Catalog document model and configuration-directory resolution.
//!
//! The on-disk catalog is a JSON document shaped like
//! `{ "mcpServers": { "<name>": { "type": "stdio|http|sse", ... } } }`.
//! `${VAR}` references in any string value are expanded from the process
//! environment before deserialization; an unset variable expands to the
//! empty string.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::ProxyError;

pub const CONFIG_FILE_NAME: &str = "mcp.json";

/// Name the proxy advertises about itself; an outbound server identifying
/// itself with this name is a self-loop.
pub const PROXY_SERVER_NAME: &str = "1mcp";

pub const SESSIONS_DIR_NAME: &str = "sessions";
pub const PRESETS_FILE_NAME: &str = "presets.json";

const MAX_SERVER_NAME_LEN: usize = 50;
const MAX_TAG_LEN: usize = 20;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[A-Za-z0-9_-]+$").unwrap()
});

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpServerTransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env: Option<HashMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
    },
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct McpServerConfig {
    #[serde(flatten)]
    pub transport: McpServerTransportConfig,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Per-request timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CatalogDocument {
    #[serde(default)]
    mcp_servers: BTreeMap<String, McpServerConfig>,
}

/// A parsed, validated catalog. Server iteration order is name order, which
/// pins every "deterministic order" guarantee downstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogSnapshot {
    pub servers: BTreeMap<String, McpServerConfig>,
}

impl CatalogSnapshot {
    /// Enabled entries only, in name order.
    pub fn enabled(&self) -> impl Iterator<Item = (&String, &McpServerConfig)> {
        self.servers.iter().filter(|(_, cfg)| !cfg.disabled)
    }
}

/// Parse a catalog document, expanding `${VAR}` references on the way in.
pub fn parse_catalog(text: &str) -> Result<CatalogSnapshot, ProxyError> {
    let mut value: Value = serde_json::from_str(text)
        .map_err(|err| ProxyError::validation(format!("catalog is not valid JSON: {err}")))?;
    expand_env_vars(&mut value);
    let document: CatalogDocument = serde_json::from_value(value)
        .map_err(|err| ProxyError::validation(format!("catalog has an invalid shape: {err}")))?;

    for (name, config) in &document.mcp_servers {
        validate_server_name(name)?;
        validate_tags(name, &config.tags)?;
    }

    Ok(CatalogSnapshot {
        servers: document.mcp_servers,
    })
}

pub fn validate_server_name(name: &str) -> Result<(), ProxyError> {
    if name.is_empty() || name.len() > MAX_SERVER_NAME_LEN || !NAME_RE.is_match(name) {
        return Err(ProxyError::validation(format!(
            "invalid server name `{name}`: must match [A-Za-z0-9_-]{{1,{MAX_SERVER_NAME_LEN}}}"
        )));
    }
    Ok(())
}

pub fn validate_tag(tag: &str) -> Result<(), ProxyError> {
    if tag.is_empty() || tag.len() > MAX_TAG_LEN || !NAME_RE.is_match(tag) {
        return Err(ProxyError::validation(format!(
            "invalid tag `{tag}`: must match [A-Za-z0-9_-]{{1,{MAX_TAG_LEN}}}"
        )));
    }
    Ok(())
}

fn validate_tags(server: &str, tags: &[String]) -> Result<(), ProxyError> {
    let mut seen = std::collections::BTreeSet::new();
    for tag in tags {
        validate_tag(tag).map_err(|err| {
            ProxyError::validation(format!("server `{server}`: {err}"))
        })?;
        if !seen.insert(tag.as_str()) {
            return Err(ProxyError::validation(format!(
                "server `{server}`: duplicate tag `{tag}`"
            )));
        }
    }
    Ok(())
}

/// Replace `${VAR}` in every string leaf with the value from the process
/// environment. Unset variables expand to the empty string.
pub fn expand_env_vars(value: &mut Value) {
    static VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap()
    });

    match value {
        Value::String(s) => {
            if s.contains("${") {
                let mut out = String::with_capacity(s.len());
                let mut last = 0;
                for caps in VAR_RE.captures_iter(s) {
                    #[allow(clippy::unwrap_used)]
                    let whole = caps.get(0).unwrap();
                    #[allow(clippy::unwrap_used)]
                    let name = caps.get(1).unwrap().as_str();
                    out.push_str(&s[last..whole.start()]);
                    out.push_str(&std::env::var(name).unwrap_or_default());
                    last = whole.end();
                }
                out.push_str(&s[last..]);
                *s = out;
            }
        }
        Value::Array(items) => {
            for item in items {
                expand_env_vars(item);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                expand_env_vars(item);
            }
        }
        _ => {}
    }
}

/// Resolve the configuration directory. `ONE_MCP_CONFIG_DIR` wins; otherwise
/// the default lives under the home directory. Failing to resolve a home
/// directory is fatal at startup.
pub fn resolve_config_dir() -> std::io::Result<PathBuf> {
    if let Ok(dir) = std::env::var("ONE_MCP_CONFIG_DIR")
        && !dir.is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| std::io::Error::other("could not resolve a home directory"))?;
    Ok(home.join(".onemcp"))
}

/// Resolve the catalog file path. `ONE_MCP_CONFIG` overrides the default
/// `<config_dir>/mcp.json`.
pub fn resolve_config_file() -> std::io::Result<PathBuf> {
    if let Ok(path) = std::env::var("ONE_MCP_CONFIG")
        && !path.is_empty()
    {
        return Ok(PathBuf::from(path));
    }
    Ok(resolve_config_dir()?.join(CONFIG_FILE_NAME))
}
