//! Per-tool / per-server / global call policy resolution and enforcement.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use futures::future::BoxFuture;

use crate::config::{ServerConfig, ToolPolicy};
use crate::error::{BridgeError, Result};

/// What the downstream user chose when prompted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElicitOutcome {
    Accept,
    Decline,
    Cancel,
}

/// Asks the downstream client for confirmation. Fails when the client does
/// not implement elicitation.
pub type ElicitFn<'a> = &'a (dyn Fn(String) -> BoxFuture<'static, Result<ElicitOutcome>> + Sync);

#[derive(Debug, Clone, Default)]
struct ServerPolicy {
    default: Option<ToolPolicy>,
    tools: HashMap<String, ToolPolicy>,
}

#[derive(Debug, Default)]
struct PolicyState {
    global: ToolPolicy,
    servers: HashMap<String, ServerPolicy>,
}

/// Cascade: per-tool entry, else per-server `toolPolicy`, else global.
#[derive(Default)]
pub struct PolicyEngine {
    state: RwLock<PolicyState>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the whole policy table.
    pub fn update(&self, global: ToolPolicy, servers: &BTreeMap<String, ServerConfig>) {
        let mut next = PolicyState {
            global,
            servers: HashMap::with_capacity(servers.len()),
        };
        for (name, server) in servers {
            let Some(bridge) = server.bridge() else { continue };
            if bridge.tool_policy.is_none() && bridge.tools.is_empty() {
                continue;
            }
            next.servers.insert(
                name.clone(),
                ServerPolicy {
                    default: bridge.tool_policy,
                    tools: bridge
                        .tools
                        .iter()
                        .map(|(tool, policy)| (tool.clone(), *policy))
                        .collect(),
                },
            );
        }
        *self.state.write().expect("policy lock poisoned") = next;
    }

    pub fn resolve(&self, source: &str, tool: &str) -> ToolPolicy {
        let state = self.state.read().expect("policy lock poisoned");
        if let Some(server) = state.servers.get(source) {
            if let Some(policy) = server.tools.get(tool) {
                return *policy;
            }
            if let Some(policy) = server.default {
                return policy;
            }
        }
        state.global
    }

    /// Enforce the resolved policy for one call; `prompt` goes through
    /// `elicit` with the pretty-printed arguments.
    pub async fn enforce(
        &self,
        source: &str,
        tool: &str,
        arguments: Option<&serde_json::Map<String, serde_json::Value>>,
        elicit: ElicitFn<'_>,
    ) -> Result<()> {
        let namespaced = crate::registry::namespaced_name(source, tool);
        match self.resolve(source, tool) {
            ToolPolicy::Always => Ok(()),
            ToolPolicy::Never => Err(BridgeError::PolicyDenied { tool: namespaced }),
            ToolPolicy::Prompt => {
                let rendered_args = match arguments {
                    Some(map) if !map.is_empty() => {
                        serde_json::to_string_pretty(map).unwrap_or_else(|_| "{}".into())
                    }
                    _ => "{}".into(),
                };
                let message = format!(
                    "Allow tool call \"{namespaced}\" with arguments:\n{rendered_args}"
                );
                match elicit(message).await {
                    Ok(ElicitOutcome::Accept) => Ok(()),
                    Ok(_) => Err(BridgeError::PolicyDeclined { tool: namespaced }),
                    Err(e) => {
                        tracing::debug!(tool = %namespaced, error = %e, "elicitation unavailable");
                        Err(BridgeError::ElicitationUnsupported { tool: namespaced })
                    }
                }
            }
        }
    }
}
