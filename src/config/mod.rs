//! Bridge configuration: validated shapes, file loading, upstream resolution.

pub mod diff;
pub mod watcher;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{BridgeError, Result};

/// Substring that marks a config entry as a reference to this bridge itself.
///
/// Entries read from `mcpServers` / `context_servers` whose command line
/// contains it are dropped so the bridge never spawns itself recursively.
pub const SELF_EXCLUDE_MARKER: &str = "crabeye-mcp-bridge";

/// Environment variable providing the default config path.
pub const CONFIG_PATH_ENV: &str = "MCP_BRIDGE_CONFIG";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Per-tool call policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ToolPolicy {
    #[default]
    Always,
    Prompt,
    Never,
}

/// HTTP transport sub-variant. Unknown strings are rejected at parse time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum HttpTransportKind {
    #[default]
    StreamableHttp,
    Sse,
}

/// Per-server `_bridge` metadata block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerBridgeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_policy: Option<ToolPolicy>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, ToolPolicy>,
    /// OAuth2 configuration passthrough; the bridge never interprets it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<serde_json::Value>,
}

/// STDIO upstream: spawn `command args...` with the merged environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioServerConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(rename = "_bridge", skip_serializing_if = "Option::is_none")]
    pub bridge: Option<ServerBridgeConfig>,
}

/// HTTP upstream: streamable-http (default) or sse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpServerConfig {
    #[serde(rename = "type", default)]
    pub transport: HttpTransportKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(rename = "_bridge", skip_serializing_if = "Option::is_none")]
    pub bridge: Option<ServerBridgeConfig>,
}

/// One upstream server entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerConfig {
    Http(HttpServerConfig),
    Stdio(StdioServerConfig),
}

impl ServerConfig {
    pub fn bridge(&self) -> Option<&ServerBridgeConfig> {
        match self {
            Self::Http(http) => http.bridge.as_ref(),
            Self::Stdio(stdio) => stdio.bridge.as_ref(),
        }
    }

    pub fn category(&self) -> Option<&str> {
        self.bridge().and_then(|bridge| bridge.category.as_deref())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(http) => match http.transport {
                HttpTransportKind::StreamableHttp => "streamable-http",
                HttpTransportKind::Sse => "sse",
            },
            Self::Stdio(_) => "stdio",
        }
    }

    /// Human-readable connection target for status output.
    pub fn target(&self) -> String {
        match self {
            Self::Http(http) => http.url.clone(),
            Self::Stdio(stdio) => {
                if stdio.args.is_empty() {
                    stdio.command.clone()
                } else {
                    format!("{} {}", stdio.command, stdio.args.join(" "))
                }
            }
        }
    }

    /// The fields whose change requires tearing down and re-opening the
    /// connection, as a stable JSON value. `_bridge` metadata is excluded.
    pub fn connection_identity(&self) -> serde_json::Value {
        match self {
            Self::Http(http) => serde_json::json!({
                "type": http.transport,
                "url": http.url,
                "headers": http.headers,
            }),
            Self::Stdio(stdio) => serde_json::json!({
                "command": stdio.command,
                "args": stdio.args,
                "env": stdio.env,
            }),
        }
    }

    fn references_bridge_binary(&self) -> bool {
        match self {
            Self::Stdio(stdio) => {
                stdio.command.contains(SELF_EXCLUDE_MARKER)
                    || stdio.args.iter().any(|arg| arg.contains(SELF_EXCLUDE_MARKER))
            }
            Self::Http(_) => false,
        }
    }
}

fn default_port() -> u16 {
    19875
}
fn default_health_check_interval() -> u64 {
    30
}
fn default_max_upstream_connections() -> usize {
    20
}
fn default_connection_timeout() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    600
}

/// Global `_bridge` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSettings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub tool_policy: ToolPolicy,
    /// Health check period in seconds; 0 disables the health loop.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    #[serde(default = "default_max_upstream_connections")]
    pub max_upstream_connections: usize,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
            tool_policy: ToolPolicy::default(),
            health_check_interval: default_health_check_interval(),
            max_upstream_connections: default_max_upstream_connections(),
            connection_timeout: default_connection_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// Raw config file shape before upstream resolution.
#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(rename = "mcpUpstreams")]
    mcp_upstreams: Option<BTreeMap<String, ServerConfig>>,
    servers: Option<BTreeMap<String, ServerConfig>>,
    context_servers: Option<BTreeMap<String, ServerConfig>>,
    #[serde(rename = "mcpServers")]
    mcp_servers: Option<BTreeMap<String, ServerConfig>>,
    #[serde(rename = "_bridge")]
    bridge: Option<BridgeSettings>,
}

/// The validated configuration the core consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct BridgeConfig {
    pub upstreams: BTreeMap<String, ServerConfig>,
    pub settings: BridgeSettings,
}

impl BridgeConfig {
    /// Key-sorted JSON used for the reload short-circuit.
    pub fn stable_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a config document and resolve the upstream set.
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(raw)
            .map_err(|e| BridgeError::Configuration(format!("malformed config: {e}")))?;
        Self::resolve(file)
    }

    /// Load and validate the config file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Merge the four upstream keys, earlier key wins on duplicate names.
    ///
    /// `mcpServers` and `context_servers` are assumed to be shared with other
    /// MCP clients, so entries referencing the bridge binary itself are
    /// dropped there.
    fn resolve(file: ConfigFile) -> Result<Self> {
        let mut upstreams: BTreeMap<String, ServerConfig> = BTreeMap::new();

        let sources: [(Option<BTreeMap<String, ServerConfig>>, bool); 4] = [
            (file.mcp_upstreams, false),
            (file.servers, false),
            (file.context_servers, true),
            (file.mcp_servers, true),
        ];

        for (entries, filter_self) in sources {
            let Some(entries) = entries else { continue };
            for (name, server) in entries {
                if filter_self && server.references_bridge_binary() {
                    tracing::debug!(server = %name, "skipping self-referencing config entry");
                    continue;
                }
                upstreams.entry(name).or_insert(server);
            }
        }

        let config = Self {
            upstreams,
            settings: file.bridge.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, server) in &self.upstreams {
            if name.trim().is_empty() {
                return Err(BridgeError::Configuration(
                    "upstream name must not be empty".into(),
                ));
            }
            if name.contains("__") {
                return Err(BridgeError::Configuration(format!(
                    "upstream name \"{name}\" must not contain \"__\" (reserved as the namespace separator)"
                )));
            }
            match server {
                ServerConfig::Stdio(stdio) if stdio.command.trim().is_empty() => {
                    return Err(BridgeError::Configuration(format!(
                        "upstream \"{name}\": command must not be empty"
                    )));
                }
                ServerConfig::Http(http) if http.url.trim().is_empty() => {
                    return Err(BridgeError::Configuration(format!(
                        "upstream \"{name}\": url must not be empty"
                    )));
                }
                _ => {}
            }
        }

        if self.upstreams.len() > self.settings.max_upstream_connections {
            return Err(BridgeError::Configuration(format!(
                "{} upstreams configured, maxUpstreamConnections is {}",
                self.upstreams.len(),
                self.settings.max_upstream_connections
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> BridgeConfig {
        BridgeConfig::from_json(raw).expect("config should parse")
    }

    #[test]
    fn stdio_and_http_entries_parse() {
        let config = parse(
            r#"{
                "mcpUpstreams": {
                    "github": { "command": "node", "args": ["server.js"] },
                    "linear": { "type": "streamable-http", "url": "http://u1" }
                }
            }"#,
        );
        assert_eq!(config.upstreams.len(), 2);
        assert_eq!(config.upstreams["github"].kind(), "stdio");
        assert_eq!(config.upstreams["linear"].kind(), "streamable-http");
        assert_eq!(config.upstreams["linear"].target(), "http://u1");
    }

    #[test]
    fn http_type_defaults_to_streamable_http() {
        let config = parse(r#"{ "servers": { "a": { "url": "http://x" } } }"#);
        assert_eq!(config.upstreams["a"].kind(), "streamable-http");
    }

    #[test]
    fn unknown_http_type_is_rejected() {
        let result =
            BridgeConfig::from_json(r#"{ "servers": { "a": { "type": "ws", "url": "http://x" } } }"#);
        assert!(result.is_err());
    }

    #[test]
    fn earlier_key_wins_on_duplicate_upstream_names() {
        let config = parse(
            r#"{
                "mcpUpstreams": { "a": { "url": "http://priority" } },
                "servers": { "a": { "url": "http://ignored" }, "b": { "url": "http://b" } },
                "mcpServers": { "b": { "command": "ignored" }, "c": { "command": "kept" } }
            }"#,
        );
        assert_eq!(config.upstreams["a"].target(), "http://priority");
        assert_eq!(config.upstreams["b"].target(), "http://b");
        assert_eq!(config.upstreams["c"].kind(), "stdio");
    }

    #[test]
    fn self_references_are_dropped_from_shared_keys_only() {
        let config = parse(
            r#"{
                "servers": {
                    "kept": { "command": "npx", "args": ["crabeye-mcp-bridge", "--config", "x"] }
                },
                "mcpServers": {
                    "by_command": { "command": "/usr/bin/crabeye-mcp-bridge" },
                    "by_arg": { "command": "npx", "args": ["-y", "crabeye-mcp-bridge"] },
                    "other": { "command": "node" }
                }
            }"#,
        );
        assert!(config.upstreams.contains_key("kept"));
        assert!(config.upstreams.contains_key("other"));
        assert!(!config.upstreams.contains_key("by_command"));
        assert!(!config.upstreams.contains_key("by_arg"));
    }

    #[test]
    fn bridge_settings_defaults_apply() {
        let config = parse(r#"{ "mcpUpstreams": {} }"#);
        assert_eq!(config.settings.port, 19875);
        assert_eq!(config.settings.log_level, LogLevel::Info);
        assert_eq!(config.settings.log_format, LogFormat::Text);
        assert_eq!(config.settings.tool_policy, ToolPolicy::Always);
        assert_eq!(config.settings.max_upstream_connections, 20);
        assert_eq!(config.settings.connection_timeout, 30);
        assert_eq!(config.settings.idle_timeout, 600);
    }

    #[test]
    fn per_server_bridge_block_parses() {
        let config = parse(
            r#"{
                "mcpUpstreams": {
                    "linear": {
                        "url": "http://u1",
                        "_bridge": {
                            "category": "issue-tracking",
                            "toolPolicy": "prompt",
                            "tools": { "delete_issue": "never" }
                        }
                    }
                }
            }"#,
        );
        let bridge = config.upstreams["linear"].bridge().expect("bridge block");
        assert_eq!(bridge.category.as_deref(), Some("issue-tracking"));
        assert_eq!(bridge.tool_policy, Some(ToolPolicy::Prompt));
        assert_eq!(bridge.tools["delete_issue"], ToolPolicy::Never);
    }

    #[test]
    fn upstream_name_with_namespace_separator_is_rejected() {
        let result =
            BridgeConfig::from_json(r#"{ "servers": { "a__b": { "url": "http://x" } } }"#);
        assert!(matches!(result, Err(BridgeError::Configuration(_))));
    }

    #[test]
    fn connection_identity_ignores_bridge_metadata() {
        let with_meta = parse(
            r#"{ "servers": { "a": { "url": "http://x", "_bridge": { "category": "c" } } } }"#,
        );
        let without_meta = parse(r#"{ "servers": { "a": { "url": "http://x" } } }"#);
        assert_eq!(
            with_meta.upstreams["a"].connection_identity(),
            without_meta.upstreams["a"].connection_identity()
        );
    }

    #[test]
    fn stable_json_is_deterministic() {
        let raw = r#"{ "servers": { "b": { "url": "http://b" }, "a": { "url": "http://a" } } }"#;
        assert_eq!(parse(raw).stable_json(), parse(raw).stable_json());
    }

    #[test]
    fn too_many_upstreams_is_a_config_error() {
        let result = BridgeConfig::from_json(
            r#"{
                "servers": { "a": { "url": "http://a" }, "b": { "url": "http://b" } },
                "_bridge": { "maxUpstreamConnections": 1 }
            }"#,
        );
        assert!(matches!(result, Err(BridgeError::Configuration(_))));
    }
}
