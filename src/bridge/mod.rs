//! Downstream MCP face: terminates the client session, serves the two
//! meta-tools plus direct tool calls, and forwards list-changed events.

use std::sync::Arc;

use futures::future::BoxFuture;
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, ErrorData, Implementation, JsonObject,
    ListToolsResult, PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::Peer;

use crate::error::{BridgeError, Result};
use crate::policy::{ElicitFn, ElicitOutcome, PolicyEngine};
use crate::registry::{split_namespaced, ToolInfo, ToolRegistry};
use crate::search::{
    SearchToolsParams, ToolSearchService, RUN_TOOL_NAME, SEARCH_TOOLS_NAME,
};
use crate::upstream::UpstreamManager;
use crate::util::Subscription;

/// The MCP server the downstream client talks to.
#[derive(Clone)]
pub struct BridgeServer {
    registry: Arc<ToolRegistry>,
    search: Option<Arc<ToolSearchService>>,
    manager: UpstreamManager,
    policy: Arc<PolicyEngine>,
}

impl BridgeServer {
    pub fn new(
        registry: Arc<ToolRegistry>,
        search: Option<Arc<ToolSearchService>>,
        manager: UpstreamManager,
        policy: Arc<PolicyEngine>,
    ) -> Self {
        Self {
            registry,
            search,
            manager,
            policy,
        }
    }

    /// Emit `tools/list_changed` downstream whenever the active tool view
    /// changes. Errors (e.g. no client connected yet) are swallowed.
    pub fn forward_list_changed(&self, peer: Peer<RoleServer>) -> Subscription {
        let notify = move || {
            let peer = peer.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.notify_tool_list_changed().await {
                    tracing::debug!(error = %e, "tools/list_changed notification dropped");
                }
            });
        };
        match &self.search {
            Some(search) => search.on_visible_tools_changed(notify),
            None => self.registry.on_changed(notify),
        }
    }

    fn current_tools(&self) -> Vec<ToolInfo> {
        match &self.search {
            Some(search) => search.visible_tools(),
            None => self.registry.list_tools(),
        }
    }

    /// `search_tools`: parameter problems come back as `isError` content,
    /// not protocol errors.
    pub fn handle_search_tools(&self, arguments: Option<JsonObject>) -> CallToolResult {
        let search = match &self.search {
            Some(search) => search,
            None => {
                return error_text("search_tools is not available: tool search is disabled");
            }
        };
        let params = match validate_search_params(arguments) {
            Ok(params) => params,
            Err(message) => return error_text(message),
        };

        let response = search.search(&params);
        match serde_json::to_string(&response) {
            Ok(encoded) => CallToolResult::success(vec![Content::text(encoded)]),
            Err(e) => error_text(format!("failed to encode search response: {e}")),
        }
    }

    /// `run_tool` unwraps `{name, arguments}` and routes like a direct call.
    pub async fn handle_run_tool(
        &self,
        arguments: Option<JsonObject>,
        elicit: ElicitFn<'_>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let arguments = arguments.unwrap_or_default();
        let name = arguments
            .get("name")
            .and_then(|value| value.as_str())
            .ok_or_else(|| {
                ErrorData::invalid_params("run_tool requires a string \"name\" parameter", None)
            })?
            .to_string();
        let tool_arguments = match arguments.get("arguments") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Object(map)) => Some(map.clone()),
            Some(_) => {
                return Err(ErrorData::invalid_params(
                    "run_tool \"arguments\" must be an object",
                    None,
                ));
            }
        };

        self.route_call(&name, tool_arguments, elicit)
            .await
            .map_err(|e| e.to_error_data())
    }

    /// Split the namespaced name, enforce policy, and delegate to the
    /// owning upstream with the original tool name.
    pub async fn route_call(
        &self,
        namespaced: &str,
        arguments: Option<JsonObject>,
        elicit: ElicitFn<'_>,
    ) -> Result<CallToolResult> {
        let (source, tool) = split_namespaced(namespaced)
            .ok_or_else(|| BridgeError::InvalidToolName(namespaced.to_string()))?;

        self.policy
            .enforce(source, tool, arguments.as_ref(), elicit)
            .await?;

        let client = self
            .manager
            .get_client(source)
            .ok_or_else(|| BridgeError::UnknownUpstream(source.to_string()))?;

        tracing::debug!(server = %source, tool = %tool, "routing tool call");
        client.call_tool(tool, arguments).await
    }
}

impl ServerHandler for BridgeServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            server_info: Implementation {
                name: "crabeye-mcp-bridge".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                website_url: None,
                icons: None,
            },
            instructions: Some(
                "Aggregating MCP bridge. Use search_tools to discover tools across all \
                 connected servers, then call them directly or via run_tool."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListToolsResult, ErrorData> {
        let tools = self
            .current_tools()
            .iter()
            .map(rmcp_tool)
            .collect::<Vec<_>>();
        Ok(ListToolsResult {
            tools,
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let peer = context.peer.clone();
        let elicit = move |message: String| -> BoxFuture<'static, Result<ElicitOutcome>> {
            let peer = peer.clone();
            Box::pin(async move { elicit_via_peer(&peer, message).await })
        };

        let name = request.name.as_ref();
        match name {
            SEARCH_TOOLS_NAME => Ok(self.handle_search_tools(request.arguments)),
            RUN_TOOL_NAME => self.handle_run_tool(request.arguments, &elicit).await,
            _ => {
                if self.registry.get_tool(name).is_none() {
                    return Err(BridgeError::UnknownTool(name.to_string()).to_error_data());
                }
                self.route_call(name, request.arguments, &elicit)
                    .await
                    .map_err(|e| e.to_error_data())
            }
        }
    }
}

/// Ask the downstream user to confirm via MCP elicitation.
async fn elicit_via_peer(peer: &Peer<RoleServer>, message: String) -> Result<ElicitOutcome> {
    use rmcp::model::{CreateElicitationRequestParam, ElicitationAction};

    let params: CreateElicitationRequestParam = serde_json::from_value(serde_json::json!({
        "message": message,
        "requestedSchema": { "type": "object", "properties": {} }
    }))
    .map_err(BridgeError::from)?;

    let result = peer
        .create_elicitation(params)
        .await
        .map_err(|e| BridgeError::Transport {
            server: "downstream".into(),
            message: format!("elicitation failed: {e}"),
        })?;

    Ok(match result.action {
        ElicitationAction::Accept => ElicitOutcome::Accept,
        ElicitationAction::Decline => ElicitOutcome::Decline,
        ElicitationAction::Cancel => ElicitOutcome::Cancel,
    })
}

fn validate_search_params(
    arguments: Option<JsonObject>,
) -> std::result::Result<SearchToolsParams, String> {
    let arguments = arguments.unwrap_or_default();
    let params: SearchToolsParams =
        serde_json::from_value(serde_json::Value::Object(arguments))
            .map_err(|e| format!("invalid search_tools parameters: {e}"))?;
    if params.queries.is_empty() {
        return Err("search_tools requires a non-empty \"queries\" array".into());
    }
    for (position, query) in params.queries.iter().enumerate() {
        if !query.has_filter() {
            return Err(format!(
                "queries[{position}] must include at least one of \"tool\", \"provider\", \"category\""
            ));
        }
    }
    Ok(params)
}

fn error_text(message: impl Into<String>) -> CallToolResult {
    CallToolResult::error(vec![Content::text(message.into())])
}

fn rmcp_tool(info: &ToolInfo) -> rmcp::model::Tool {
    let schema = match &info.input_schema {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    let mut tool = rmcp::model::Tool::new(
        info.name.clone(),
        info.description.clone().unwrap_or_default(),
        schema,
    );
    tool.description = info.description.clone().map(Into::into);
    tool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_params_require_a_query_array() {
        let error = validate_search_params(None).expect_err("missing queries must fail");
        assert!(error.contains("queries"));
    }

    #[test]
    fn search_params_reject_empty_queries() {
        let arguments = serde_json::json!({ "queries": [] });
        let error = validate_search_params(arguments.as_object().cloned())
            .expect_err("empty queries must fail");
        assert!(error.contains("non-empty"));
    }

    #[test]
    fn search_params_reject_filterless_query() {
        let arguments = serde_json::json!({ "queries": [{ "limit": 5 }] });
        let error = validate_search_params(arguments.as_object().cloned())
            .expect_err("filterless query must fail");
        assert!(error.contains("queries[0]"));
    }

    #[test]
    fn search_params_accept_each_filter_kind() {
        for query in [
            serde_json::json!({ "tool": "create" }),
            serde_json::json!({ "provider": "linear" }),
            serde_json::json!({ "category": "issues" }),
        ] {
            let arguments = serde_json::json!({ "queries": [query] });
            validate_search_params(arguments.as_object().cloned())
                .expect("query with one filter should validate");
        }
    }

    #[test]
    fn rmcp_tool_conversion_keeps_optional_description() {
        let with = ToolInfo {
            name: "linear__create_issue".into(),
            description: Some("Create an issue".into()),
            input_schema: serde_json::json!({"type": "object"}),
        };
        let tool = rmcp_tool(&with);
        assert_eq!(tool.name.as_ref(), "linear__create_issue");
        assert_eq!(tool.description.as_deref(), Some("Create an issue"));

        let without = ToolInfo {
            name: "t".into(),
            description: None,
            input_schema: serde_json::json!({}),
        };
        assert!(rmcp_tool(&without).description.is_none());
    }
}
