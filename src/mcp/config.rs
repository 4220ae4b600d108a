use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use url::Url;

use crate::error::BridgeError;

/// Registry snapshot: server name to descriptor, enumerated in name order.
pub type ServerMap = BTreeMap<String, ServerDescriptor>;

/// On-disk shape of the registry file.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: ServerMap,
}

/// How to reach one MCP server.
///
/// Serialized untagged so the JSON matches the familiar `mcpServers` layout:
/// `{ "command", "args", "env" }` for a spawned process, `{ "url" }` for a
/// streamable HTTP endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ServerDescriptor {
    Process {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Network {
        url: String,
    },
}

impl ServerDescriptor {
    /// Parse and validate a descriptor received from the settings surface.
    pub fn from_value(server: &str, value: serde_json::Value) -> Result<Self, BridgeError> {
        let descriptor: Self = serde_json::from_value(value).map_err(|e| {
            BridgeError::config(
                server,
                format!("expected {{ command, args, env }} or {{ url }} ({e})"),
            )
        })?;
        descriptor.validate(server)?;
        Ok(descriptor)
    }

    /// Reject descriptors that could never connect.
    pub fn validate(&self, server: &str) -> Result<(), BridgeError> {
        match self {
            Self::Process { command, .. } => {
                if command.trim().is_empty() {
                    return Err(BridgeError::config(server, "command must not be empty"));
                }
            }
            Self::Network { url } => {
                // Placeholders are resolved at connect time, so validate the expanded form.
                let parsed = Url::parse(&expand_env_placeholders(url))
                    .map_err(|e| BridgeError::config(server, format!("invalid url: {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(BridgeError::config(
                        server,
                        format!("unsupported url scheme '{}'", parsed.scheme()),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Transport label for logs.
    #[must_use]
    pub fn transport(&self) -> &'static str {
        match self {
            Self::Process { .. } => "stdio",
            Self::Network { .. } => "streamable-http",
        }
    }
}

/// Validate a registry key.
pub fn validate_server_name(name: &str) -> Result<(), BridgeError> {
    if name.trim().is_empty() {
        return Err(BridgeError::config(name, "server name must not be empty"));
    }
    Ok(())
}

/// Expand "${VAR}" placeholders from the process environment.
/// Missing variables leave the placeholder unchanged.
pub fn expand_env_placeholders(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match std::env::var(key) {
                    Ok(v) => out.push_str(&v),
                    Err(_) => {
                        out.push_str("${");
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn expand_env_map(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), expand_env_placeholders(v)))
        .collect()
}
