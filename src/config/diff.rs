//! Structural diff between two resolved configurations.

use super::{BridgeConfig, LogLevel, ToolPolicy};

/// Changes to the upstream server set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Connection-identifying fields changed; close and re-open.
    pub reconnect: Vec<String>,
    /// Only `_bridge` metadata changed; no connection churn.
    pub updated: Vec<String>,
}

impl ServerDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.reconnect.is_empty()
            && self.updated.is_empty()
    }
}

/// Hot-reloadable bridge-level changes plus the ones that are not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeSettingsDiff {
    pub log_level: Option<LogLevel>,
    pub health_check_interval: Option<u64>,
    pub tool_policy: Option<ToolPolicy>,
    /// Changed fields that only take effect after a restart; reported, never applied.
    pub requires_restart: Vec<&'static str>,
}

impl BridgeSettingsDiff {
    pub fn is_empty(&self) -> bool {
        self.log_level.is_none()
            && self.health_check_interval.is_none()
            && self.tool_policy.is_none()
            && self.requires_restart.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDiff {
    pub servers: ServerDiff,
    pub bridge: BridgeSettingsDiff,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty() && self.bridge.is_empty()
    }
}

/// Compute the diff driving [`crate::upstream::manager::UpstreamManager::apply_config_diff`].
///
/// Upstream names come out in sorted order (the resolved set is a `BTreeMap`),
/// so the diff is deterministic for a given pair of configs.
pub fn diff_configs(old: &BridgeConfig, new: &BridgeConfig) -> ConfigDiff {
    let mut servers = ServerDiff::default();

    for (name, new_server) in &new.upstreams {
        match old.upstreams.get(name) {
            None => servers.added.push(name.clone()),
            Some(old_server) => {
                if old_server.connection_identity() != new_server.connection_identity() {
                    servers.reconnect.push(name.clone());
                } else if old_server.bridge() != new_server.bridge() {
                    servers.updated.push(name.clone());
                }
            }
        }
    }
    for name in old.upstreams.keys() {
        if !new.upstreams.contains_key(name) {
            servers.removed.push(name.clone());
        }
    }

    let mut bridge = BridgeSettingsDiff::default();
    let (old_settings, new_settings) = (&old.settings, &new.settings);

    if old_settings.log_level != new_settings.log_level {
        bridge.log_level = Some(new_settings.log_level);
    }
    if old_settings.health_check_interval != new_settings.health_check_interval {
        bridge.health_check_interval = Some(new_settings.health_check_interval);
    }
    if old_settings.tool_policy != new_settings.tool_policy {
        bridge.tool_policy = Some(new_settings.tool_policy);
    }
    if old_settings.port != new_settings.port {
        bridge.requires_restart.push("port");
    }
    if old_settings.log_format != new_settings.log_format {
        bridge.requires_restart.push("logFormat");
    }
    if old_settings.max_upstream_connections != new_settings.max_upstream_connections {
        bridge.requires_restart.push("maxUpstreamConnections");
    }
    if old_settings.connection_timeout != new_settings.connection_timeout {
        bridge.requires_restart.push("connectionTimeout");
    }
    if old_settings.idle_timeout != new_settings.idle_timeout {
        bridge.requires_restart.push("idleTimeout");
    }

    ConfigDiff { servers, bridge }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(raw: &str) -> BridgeConfig {
        BridgeConfig::from_json(raw).expect("config should parse")
    }

    #[test]
    fn diff_of_identical_configs_is_empty() {
        let raw = r#"{
            "servers": {
                "linear": { "url": "http://a", "_bridge": { "category": "pm" } },
                "github": { "command": "node", "args": ["server.js"] }
            },
            "_bridge": { "logLevel": "debug" }
        }"#;
        assert!(diff_configs(&config(raw), &config(raw)).is_empty());
    }

    #[test]
    fn added_and_removed_by_name_membership() {
        let old = config(r#"{ "servers": { "a": { "url": "http://a" } } }"#);
        let new = config(r#"{ "servers": { "b": { "url": "http://b" } } }"#);
        let diff = diff_configs(&old, &new);
        assert_eq!(diff.servers.added, vec!["b"]);
        assert_eq!(diff.servers.removed, vec!["a"]);
        assert!(diff.servers.reconnect.is_empty());
    }

    #[test]
    fn url_change_requires_reconnect() {
        let old = config(r#"{ "servers": { "linear": { "url": "http://A" } } }"#);
        let new = config(r#"{ "servers": { "linear": { "url": "http://B" } } }"#);
        let diff = diff_configs(&old, &new);
        assert_eq!(diff.servers.reconnect, vec!["linear"]);
        assert!(diff.servers.updated.is_empty());
    }

    #[test]
    fn env_change_requires_reconnect_for_stdio() {
        let old = config(r#"{ "servers": { "s": { "command": "node" } } }"#);
        let new =
            config(r#"{ "servers": { "s": { "command": "node", "env": { "K": "v" } } } }"#);
        assert_eq!(diff_configs(&old, &new).servers.reconnect, vec!["s"]);
    }

    #[test]
    fn metadata_only_change_is_updated() {
        let old = config(r#"{ "servers": { "s": { "url": "http://x" } } }"#);
        let new = config(
            r#"{ "servers": { "s": { "url": "http://x", "_bridge": { "category": "c" } } } }"#,
        );
        let diff = diff_configs(&old, &new);
        assert_eq!(diff.servers.updated, vec!["s"]);
        assert!(diff.servers.reconnect.is_empty());
    }

    #[test]
    fn transport_kind_change_requires_reconnect() {
        let old = config(r#"{ "servers": { "s": { "url": "http://x" } } }"#);
        let new = config(r#"{ "servers": { "s": { "type": "sse", "url": "http://x" } } }"#);
        assert_eq!(diff_configs(&old, &new).servers.reconnect, vec!["s"]);
    }

    #[test]
    fn hot_reloadable_bridge_fields_are_reported_individually() {
        let old = config(r#"{ "_bridge": { "logLevel": "info", "healthCheckInterval": 30 } }"#);
        let new = config(
            r#"{ "_bridge": { "logLevel": "warn", "healthCheckInterval": 10, "toolPolicy": "prompt" } }"#,
        );
        let diff = diff_configs(&old, &new);
        assert_eq!(diff.bridge.log_level, Some(LogLevel::Warn));
        assert_eq!(diff.bridge.health_check_interval, Some(10));
        assert_eq!(diff.bridge.tool_policy, Some(ToolPolicy::Prompt));
        assert!(diff.bridge.requires_restart.is_empty());
    }

    #[test]
    fn restart_only_fields_are_reported_not_applied() {
        let old = config(r#"{ "_bridge": { "port": 19875 } }"#);
        let new = config(r#"{ "_bridge": { "port": 20000, "logFormat": "json", "idleTimeout": 10 } }"#);
        let diff = diff_configs(&old, &new);
        assert_eq!(
            diff.bridge.requires_restart,
            vec!["port", "logFormat", "idleTimeout"]
        );
        assert!(diff.bridge.log_level.is_none());
    }
}
