//! The authoritative, observable, multi-source tool index.
//!
//! Names are opaque keys here: the upstream manager namespaces tool names
//! (`<source>__<tool>`) before registering them, so two sources can contend
//! for the same key and last writer wins.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::util::{ObserverSet, Subscription};

/// Two-character separator between an upstream name and its tool name.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// `create_issue` from upstream `linear` becomes `linear__create_issue`.
pub fn namespaced_name(source: &str, tool: &str) -> String {
    format!("{source}{NAMESPACE_SEPARATOR}{tool}")
}

/// Split a namespaced name on the **first** `__`; the remainder is the
/// original tool name and may itself contain `__`.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
}

/// A tool definition. The input schema is passed through opaquely; the
/// bridge never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

impl ToolInfo {
    /// The same tool under its namespaced external name.
    pub fn namespaced(&self, source: &str) -> ToolInfo {
        ToolInfo {
            name: namespaced_name(source, &self.name),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// A registry entry: the owning upstream plus the registered tool.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredTool {
    pub source: String,
    pub tool: ToolInfo,
}

#[derive(Default)]
struct RegistryState {
    /// Registered (namespaced) name → entry.
    tools: HashMap<String, RegisteredTool>,
    /// Source → names it currently owns.
    by_source: HashMap<String, HashSet<String>>,
    categories: HashMap<String, String>,
}

/// Maps every registered tool name to the upstream that owns it, with a
/// change-notification fan-out.
#[derive(Default)]
pub struct ToolRegistry {
    state: Mutex<RegistryState>,
    observers: ObserverSet<()>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace every tool owned by `source` with `tools`.
    ///
    /// A name currently owned by a different source is taken over (last
    /// writer wins) and dropped from the prior owner's name-set. Fires one
    /// change notification when the effective tool set changed.
    pub fn set_tools_for_source(&self, source: &str, tools: Vec<ToolInfo>) {
        let changed = {
            let mut state = self.state.lock().expect("registry lock poisoned");

            let old_names = state.by_source.remove(source).unwrap_or_default();
            let mut old_entries: HashMap<String, ToolInfo> =
                HashMap::with_capacity(old_names.len());
            for name in old_names {
                if let Some(entry) = state.tools.remove(&name) {
                    old_entries.insert(name, entry.tool);
                }
            }

            let mut owned = HashSet::with_capacity(tools.len());
            let mut changed = false;
            for tool in tools {
                let name = tool.name.clone();
                if old_entries.get(&name) != Some(&tool) {
                    changed = true;
                }
                let entry = RegisteredTool {
                    source: source.to_string(),
                    tool,
                };
                if let Some(previous) = state.tools.insert(name.clone(), entry) {
                    // Own entries were drained above, so this takes the name
                    // over from another source; keep its name-set consistent.
                    if let Some(previous_set) = state.by_source.get_mut(&previous.source) {
                        previous_set.remove(&name);
                    }
                    changed = true;
                }
                owned.insert(name);
            }

            if old_entries.keys().any(|name| !owned.contains(name)) {
                changed = true;
            }
            if !owned.is_empty() {
                state.by_source.insert(source.to_string(), owned);
            }
            changed
        };

        if changed {
            self.observers.emit(&());
        }
    }

    /// Remove entries whose current owner is still `source`. Entries taken
    /// over by another source are left alone.
    pub fn remove_source(&self, source: &str) {
        let removed_any = {
            let mut state = self.state.lock().expect("registry lock poisoned");
            let names = state.by_source.remove(source).unwrap_or_default();
            let mut removed_any = false;
            for name in names {
                let still_owned = state
                    .tools
                    .get(&name)
                    .map(|entry| entry.source == source)
                    .unwrap_or(false);
                if still_owned {
                    state.tools.remove(&name);
                    removed_any = true;
                }
            }
            removed_any
        };

        if removed_any {
            self.observers.emit(&());
        }
    }

    /// Category lifetime is independent of whether the source has tools.
    pub fn set_category_for_source(&self, source: &str, category: &str) {
        let changed = {
            let mut state = self.state.lock().expect("registry lock poisoned");
            state
                .categories
                .insert(source.to_string(), category.to_string())
                .as_deref()
                != Some(category)
        };
        if changed {
            self.observers.emit(&());
        }
    }

    pub fn get_category_for_source(&self, source: &str) -> Option<String> {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .categories
            .get(source)
            .cloned()
    }

    pub fn remove_category_for_source(&self, source: &str) {
        let changed = {
            let mut state = self.state.lock().expect("registry lock poisoned");
            state.categories.remove(source).is_some()
        };
        if changed {
            self.observers.emit(&());
        }
    }

    pub fn get_tool(&self, name: &str) -> Option<RegisteredTool> {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .tools
            .get(name)
            .cloned()
    }

    /// Tool definitions sorted by registered name, ready for a downstream
    /// `tools/list` answer.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let state = self.state.lock().expect("registry lock poisoned");
        let mut tools: Vec<ToolInfo> = state
            .tools
            .values()
            .map(|entry| entry.tool.clone())
            .collect();
        tools.sort_by(|left, right| left.name.cmp(&right.name));
        tools
    }

    /// Full entries keyed by registered name, sorted by name.
    pub fn list_registered_tools(&self) -> Vec<(String, RegisteredTool)> {
        let state = self.state.lock().expect("registry lock poisoned");
        let mut entries: Vec<(String, RegisteredTool)> = state
            .tools
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();
        entries.sort_by(|left, right| left.0.cmp(&right.0));
        entries
    }

    pub fn list_sources(&self) -> Vec<String> {
        let state = self.state.lock().expect("registry lock poisoned");
        let mut sources: Vec<String> = state.by_source.keys().cloned().collect();
        sources.sort();
        sources
    }

    pub fn tool_count_for_source(&self, source: &str) -> usize {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .by_source
            .get(source)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn on_changed(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.observers.subscribe(move |_| callback())
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.observers.unsubscribe(subscription);
    }
}
