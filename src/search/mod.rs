//! Compact, searchable view of all upstream tools and the visible subset
//! exposed downstream.

pub mod index;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::ToolPolicy;
use crate::policy::PolicyEngine;
use crate::registry::{split_namespaced, ToolInfo, ToolRegistry};
use crate::util::{ObserverSet, Subscription};
use index::{IndexedTool, SearchIndex};

pub const SEARCH_TOOLS_NAME: &str = "search_tools";
pub const RUN_TOOL_NAME: &str = "run_tool";

/// Auto-enabled tools are capped at this many across all queries.
pub const MAX_ENABLED_TOOLS: usize = 50;

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 50;
const MAX_REGEX_LEN: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand_tools: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

impl SearchQuery {
    pub fn has_filter(&self) -> bool {
        self.tool.is_some() || self.provider.is_some() || self.category.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchToolsParams {
    pub queries: Vec<SearchQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub source: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResult {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub tool_count: usize,
    pub tools: Vec<ToolResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub providers: Vec<ProviderResult>,
    pub total: usize,
    pub count: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchToolsResponse {
    pub results: Vec<QueryResult>,
}

/// A `tool` / `provider` / `category` filter string, parsed once.
enum PatternFilter {
    /// `regex:…` or `/pattern/flags`.
    Regex(regex::Regex),
    /// A regex form that failed to compile or exceeded the length cap;
    /// matches nothing.
    Invalid,
    /// Plain text: case-insensitive prefix match (or full-text query for
    /// the `tool` filter).
    Plain(String),
}

fn parse_pattern(raw: &str) -> PatternFilter {
    let (pattern, flags) = if let Some(rest) = raw.strip_prefix("regex:") {
        (rest.to_string(), String::new())
    } else if raw.len() >= 2 && raw.starts_with('/') {
        match raw.rfind('/') {
            Some(end) if end > 0 => {
                (raw[1..end].to_string(), raw[end + 1..].to_string())
            }
            _ => return PatternFilter::Plain(raw.to_string()),
        }
    } else {
        return PatternFilter::Plain(raw.to_string());
    };

    if pattern.len() > MAX_REGEX_LEN {
        return PatternFilter::Invalid;
    }
    match regex::RegexBuilder::new(&pattern)
        .case_insensitive(flags.contains('i'))
        .build()
    {
        Ok(re) => PatternFilter::Regex(re),
        Err(_) => PatternFilter::Invalid,
    }
}

impl PatternFilter {
    /// Prefix-or-regex matching used for `provider` and `category`.
    fn matches_name(&self, value: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(value),
            Self::Invalid => false,
            Self::Plain(prefix) => value.to_lowercase().starts_with(&prefix.to_lowercase()),
        }
    }
}

struct SearchState {
    search_index: SearchIndex,
    /// Auto-enabled tool ids in insertion order.
    enabled: Vec<String>,
}

/// Maintains the search index in lock-step with the registry and tracks the
/// visible subset exposed to the downstream client.
pub struct ToolSearchService {
    registry: Arc<ToolRegistry>,
    policy: Arc<PolicyEngine>,
    state: Arc<Mutex<SearchState>>,
    visible_observers: Arc<ObserverSet<()>>,
    registry_sub: Subscription,
}

impl ToolSearchService {
    pub fn new(registry: Arc<ToolRegistry>, policy: Arc<PolicyEngine>) -> Self {
        let state = Arc::new(Mutex::new(SearchState {
            search_index: build_index(&registry),
            enabled: Vec::new(),
        }));
        let visible_observers = Arc::new(ObserverSet::new());

        let handler_registry = Arc::clone(&registry);
        let handler_state = Arc::clone(&state);
        let handler_observers = Arc::clone(&visible_observers);
        let registry_sub = registry.on_changed(move || {
            let pruned = {
                let mut state = handler_state.lock().expect("search lock poisoned");
                state.search_index = build_index(&handler_registry);
                let registered: HashSet<String> = state
                    .search_index
                    .docs()
                    .iter()
                    .map(|doc| doc.id.clone())
                    .collect();
                let before = state.enabled.len();
                state.enabled.retain(|id| registered.contains(id));
                state.enabled.len() != before
            };
            if pruned {
                handler_observers.emit(&());
            }
        });

        Self {
            registry,
            policy,
            state,
            visible_observers,
            registry_sub,
        }
    }

    /// Unhook from the registry; used on shutdown.
    pub fn detach(&self) {
        self.registry.unsubscribe(self.registry_sub);
    }

    pub fn on_visible_tools_changed(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.visible_observers.subscribe(move |_| callback())
    }

    pub fn unsubscribe_visible(&self, subscription: Subscription) {
        self.visible_observers.unsubscribe(subscription);
    }

    /// The two synthetic tools followed by the auto-enabled set.
    pub fn visible_tools(&self) -> Vec<ToolInfo> {
        let mut tools = vec![search_tools_definition(), run_tool_definition()];
        let enabled = {
            let state = self.state.lock().expect("search lock poisoned");
            state.enabled.clone()
        };
        for id in enabled {
            if let Some(entry) = self.registry.get_tool(&id) {
                tools.push(entry.tool);
            }
        }
        tools
    }

    pub fn enabled_tools(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("search lock poisoned")
            .enabled
            .clone()
    }

    /// Run a multi-query search and replace the auto-enabled set with the
    /// union of non-disabled paged tools (earlier queries win at the cap).
    pub fn search(&self, params: &SearchToolsParams) -> SearchToolsResponse {
        let mut results = Vec::with_capacity(params.queries.len());
        let mut seen: HashSet<String> = HashSet::new();
        let mut auto_enable: Vec<String> = Vec::new();
        let mut auto_enable_set: HashSet<String> = HashSet::new();

        let changed = {
            let mut state = self.state.lock().expect("search lock poisoned");

            for query in &params.queries {
                if !query.has_filter() {
                    results.push(QueryResult {
                        providers: Vec::new(),
                        total: 0,
                        count: 0,
                        remaining: 0,
                    });
                    continue;
                }

                let expand = query.expand_tools.unwrap_or(false);
                if query.tool.is_none() && !expand {
                    results.push(self.summary_query(query));
                    continue;
                }

                results.push(self.detail_query(
                    &state.search_index,
                    query,
                    &mut seen,
                    &mut auto_enable,
                    &mut auto_enable_set,
                ));
            }

            auto_enable.truncate(MAX_ENABLED_TOOLS);
            if auto_enable != state.enabled {
                state.enabled = auto_enable;
                true
            } else {
                false
            }
        };

        if changed {
            self.visible_observers.emit(&());
        }
        SearchToolsResponse { results }
    }

    /// Provider counts only; never marks tools seen, never auto-enables.
    fn summary_query(&self, query: &SearchQuery) -> QueryResult {
        let provider_filter = query.provider.as_deref().map(parse_pattern);
        let category_filter = query.category.as_deref().map(parse_pattern);

        let mut providers = Vec::new();
        let mut total = 0;
        for source in self.registry.list_sources() {
            if let Some(filter) = &provider_filter {
                if !filter.matches_name(&source) {
                    continue;
                }
            }
            let category = self.registry.get_category_for_source(&source);
            if let Some(filter) = &category_filter {
                let matches = category
                    .as_deref()
                    .map(|c| filter.matches_name(c))
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }
            let tool_count = self.registry.tool_count_for_source(&source);
            total += tool_count;
            providers.push(ProviderResult {
                name: source,
                category,
                tool_count,
                tools: Vec::new(),
            });
        }

        QueryResult {
            providers,
            total,
            count: 0,
            remaining: 0,
        }
    }

    fn detail_query(
        &self,
        search_index: &SearchIndex,
        query: &SearchQuery,
        seen: &mut HashSet<String>,
        auto_enable: &mut Vec<String>,
        auto_enable_set: &mut HashSet<String>,
    ) -> QueryResult {
        let docs = search_index.docs();

        // Candidates from the tool filter define the ranking; the other
        // filters only narrow the set down.
        let mut ordered: Vec<usize> = match query.tool.as_deref() {
            Some(raw) => match parse_pattern(raw) {
                PatternFilter::Regex(re) => (0..docs.len())
                    .filter(|&i| {
                        let doc = &docs[i];
                        re.is_match(&doc.name)
                            || re.is_match(&doc.original_name)
                            || re.is_match(&doc.description)
                            || re.is_match(&doc.source)
                    })
                    .collect(),
                PatternFilter::Invalid => Vec::new(),
                PatternFilter::Plain(text) => {
                    let ranked = search_index.query(&text);
                    let top = ranked.first().map(|(_, score)| *score).unwrap_or(0.0);
                    ranked
                        .into_iter()
                        .filter(|(_, score)| *score >= 0.3 * top)
                        .map(|(doc, _)| doc)
                        .collect()
                }
            },
            None => (0..docs.len()).collect(),
        };

        if let Some(raw) = query.provider.as_deref() {
            let filter = parse_pattern(raw);
            ordered.retain(|&i| filter.matches_name(&docs[i].source));
        }
        if let Some(raw) = query.category.as_deref() {
            let filter = parse_pattern(raw);
            ordered.retain(|&i| {
                docs[i]
                    .category
                    .as_deref()
                    .map(|category| filter.matches_name(category))
                    .unwrap_or(false)
            });
        }

        ordered.retain(|&i| !seen.contains(&docs[i].id));

        let total = ordered.len();
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let page: Vec<usize> = ordered.into_iter().skip(offset).take(limit).collect();
        let count = page.len();

        let mut providers: Vec<ProviderResult> = Vec::new();
        for doc_index in page {
            let doc = &docs[doc_index];
            seen.insert(doc.id.clone());

            let disabled =
                self.policy.resolve(&doc.source, &doc.original_name) == ToolPolicy::Never;
            let tool_result = if disabled {
                ToolResult {
                    tool_name: doc.id.clone(),
                    source: doc.source.clone(),
                    description: String::new(),
                    input_schema: serde_json::json!({}),
                    disabled: true,
                }
            } else {
                if auto_enable_set.insert(doc.id.clone()) {
                    auto_enable.push(doc.id.clone());
                }
                let schema = self
                    .registry
                    .get_tool(&doc.id)
                    .map(|entry| entry.tool.input_schema)
                    .unwrap_or_else(|| serde_json::json!({}));
                ToolResult {
                    tool_name: doc.id.clone(),
                    source: doc.source.clone(),
                    description: doc.description.clone(),
                    input_schema: schema,
                    disabled: false,
                }
            };

            match providers.iter_mut().find(|p| p.name == doc.source) {
                Some(bucket) => bucket.tools.push(tool_result),
                None => providers.push(ProviderResult {
                    name: doc.source.clone(),
                    category: doc.category.clone(),
                    tool_count: self.registry.tool_count_for_source(&doc.source),
                    tools: vec![tool_result],
                }),
            }
        }

        QueryResult {
            providers,
            total,
            count,
            remaining: total.saturating_sub(offset + count),
        }
    }
}

fn build_index(registry: &ToolRegistry) -> SearchIndex {
    let docs = registry
        .list_registered_tools()
        .into_iter()
        .map(|(name, entry)| {
            let original_name = split_namespaced(&name)
                .map(|(_, tool)| tool.to_string())
                .unwrap_or_else(|| name.clone());
            IndexedTool {
                id: name.clone(),
                name,
                original_name,
                description: entry.tool.description.unwrap_or_default(),
                category: registry.get_category_for_source(&entry.source),
                source: entry.source,
            }
        })
        .collect();
    SearchIndex::build(docs)
}

/// Fixed definition of the `search_tools` meta-tool.
pub fn search_tools_definition() -> ToolInfo {
    ToolInfo {
        name: SEARCH_TOOLS_NAME.into(),
        description: Some(
            "Search the tools available across all connected MCP servers. Accepts multiple \
             queries; each query filters by tool (text or regex), provider, and/or category. \
             Matching tools become callable until the next search."
                .into(),
        ),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "queries": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "tool": {
                                "type": "string",
                                "description": "Tool name or description to search for; prefix with regex: for a regular expression"
                            },
                            "provider": {
                                "type": "string",
                                "description": "Provider (upstream server) name prefix or regex"
                            },
                            "category": {
                                "type": "string",
                                "description": "Provider category prefix or regex"
                            },
                            "expand_tools": {
                                "type": "boolean",
                                "description": "Return full tool definitions instead of provider summaries"
                            },
                            "limit": {
                                "type": "integer",
                                "description": "Maximum tools per query (default 10, max 50)"
                            },
                            "offset": {
                                "type": "integer",
                                "description": "Pagination offset into the result list"
                            }
                        }
                    }
                }
            },
            "required": ["queries"]
        }),
    }
}

/// Fixed definition of the `run_tool` meta-tool.
pub fn run_tool_definition() -> ToolInfo {
    ToolInfo {
        name: RUN_TOOL_NAME.into(),
        description: Some(
            "Invoke any tool found via search_tools by its namespaced name \
             (<server>__<tool>), passing arguments through unchanged."
                .into(),
        ),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Namespaced tool name, e.g. linear__create_issue"
                },
                "arguments": {
                    "type": "object",
                    "description": "Arguments forwarded to the tool"
                }
            },
            "required": ["name"]
        }),
    }
}
