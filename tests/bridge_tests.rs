//! Downstream-face scenarios: meta-tool handling and call routing.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crabeye_mcp_bridge::bridge::BridgeServer;
use crabeye_mcp_bridge::config::ToolPolicy;
use crabeye_mcp_bridge::error::BridgeError;
use crabeye_mcp_bridge::policy::{ElicitOutcome, PolicyEngine};
use crabeye_mcp_bridge::registry::ToolRegistry;
use crabeye_mcp_bridge::search::{SearchToolsResponse, ToolSearchService};
use crabeye_mcp_bridge::upstream::UpstreamManager;
use futures::future::BoxFuture;
use serde_json::json;
use support::{arguments, bridge_config, tool, MockNetwork};

struct Harness {
    registry: Arc<ToolRegistry>,
    policy: Arc<PolicyEngine>,
    search: Arc<ToolSearchService>,
    bridge: BridgeServer,
    network: Arc<MockNetwork>,
}

async fn harness() -> Harness {
    let network = MockNetwork::new();
    network.add_server("linear", vec![tool("create_issue"), tool("delete_issue")]);
    network.add_server("github", vec![tool("create_issue")]);

    let registry = Arc::new(ToolRegistry::new());
    let policy = Arc::new(PolicyEngine::new());
    let manager = UpstreamManager::new(
        Arc::clone(&registry),
        network.clone(),
        bridge_config(
            r#"{
                "mcpUpstreams": {
                    "linear": { "url": "http://u1" },
                    "github": { "command": "node", "args": ["server.js"] }
                }
            }"#,
        ),
    );
    let search = Arc::new(ToolSearchService::new(
        Arc::clone(&registry),
        Arc::clone(&policy),
    ));
    let bridge = BridgeServer::new(
        Arc::clone(&registry),
        Some(Arc::clone(&search)),
        manager.clone(),
        Arc::clone(&policy),
    );
    manager.connect_all().await;

    Harness {
        registry,
        policy,
        search,
        bridge,
        network,
    }
}

type Elicit = Box<dyn Fn(String) -> BoxFuture<'static, crabeye_mcp_bridge::Result<ElicitOutcome>> + Sync>;

fn elicit_returning(outcome: ElicitOutcome, counter: Arc<AtomicUsize>) -> Elicit {
    Box::new(move |_message| -> BoxFuture<'static, crabeye_mcp_bridge::Result<ElicitOutcome>> {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(outcome) })
    })
}

fn accepting() -> Elicit {
    elicit_returning(ElicitOutcome::Accept, Arc::new(AtomicUsize::new(0)))
}

#[tokio::test]
async fn route_call_splits_the_namespace_and_delegates() {
    let h = harness().await;
    let elicit = accepting();

    let result = h
        .bridge
        .route_call(
            "linear__create_issue",
            arguments(json!({"title": "X"})),
            &elicit,
        )
        .await
        .expect("routed call should succeed");

    let calls = h.network.calls("linear");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "create_issue");
    assert_eq!(calls[0].1, arguments(json!({"title": "X"})));

    let encoded = serde_json::to_value(&result).expect("result serializes");
    assert_eq!(encoded["content"][0]["text"], "linear:create_issue");
}

#[tokio::test]
async fn tool_names_containing_the_separator_split_on_the_first_occurrence() {
    let h = harness().await;
    h.network.set_tools("github", vec![tool("repo__create")]);
    let elicit = accepting();

    h.bridge
        .route_call("github__repo__create", None, &elicit)
        .await
        .expect("nested separator should route");

    let calls = h.network.calls("github");
    assert_eq!(calls.last().expect("one call").0, "repo__create");
}

#[tokio::test]
async fn unnamespaced_names_are_invalid_params() {
    let h = harness().await;
    let elicit = accepting();

    let error = h
        .bridge
        .route_call("create_issue", None, &elicit)
        .await
        .expect_err("unnamespaced name must fail");
    assert!(matches!(error, BridgeError::InvalidToolName(_)));
}

#[tokio::test]
async fn unknown_upstreams_are_internal_errors() {
    let h = harness().await;
    let elicit = accepting();

    let error = h
        .bridge
        .route_call("missing__tool", None, &elicit)
        .await
        .expect_err("unknown upstream must fail");
    assert!(matches!(error, BridgeError::UnknownUpstream(name) if name == "missing"));
}

#[tokio::test]
async fn policy_prompt_cascade_is_enforced_at_call_time() {
    let h = harness().await;
    h.policy.update(
        ToolPolicy::Always,
        &serde_json::from_value(json!({
            "linear": {
                "url": "http://u1",
                "_bridge": {
                    "toolPolicy": "prompt",
                    "tools": { "delete_issue": "never" }
                }
            }
        }))
        .expect("server configs"),
    );

    // `never` fails without prompting.
    let prompts = Arc::new(AtomicUsize::new(0));
    let elicit = elicit_returning(ElicitOutcome::Accept, Arc::clone(&prompts));
    let error = h
        .bridge
        .route_call("linear__delete_issue", None, &elicit)
        .await
        .expect_err("never policy must fail");
    assert!(matches!(error, BridgeError::PolicyDenied { .. }));
    assert_eq!(prompts.load(Ordering::SeqCst), 0);

    // `prompt` + accept passes through.
    h.bridge
        .route_call("linear__create_issue", None, &elicit)
        .await
        .expect("accepted prompt should pass");
    assert_eq!(prompts.load(Ordering::SeqCst), 1);

    // `prompt` + decline fails.
    let declining = elicit_returning(ElicitOutcome::Decline, Arc::new(AtomicUsize::new(0)));
    let error = h
        .bridge
        .route_call("linear__create_issue", None, &declining)
        .await
        .expect_err("declined prompt must fail");
    assert!(matches!(error, BridgeError::PolicyDeclined { .. }));
}

#[tokio::test]
async fn search_tools_returns_json_text_content() {
    let h = harness().await;

    let result = h.bridge.handle_search_tools(arguments(json!({
        "queries": [{ "tool": "create" }]
    })));
    let encoded = serde_json::to_value(&result).expect("result serializes");
    assert_ne!(encoded["isError"], true);

    let payload = encoded["content"][0]["text"]
        .as_str()
        .expect("text content");
    let response: SearchToolsResponse =
        serde_json::from_str(payload).expect("payload is a search response");
    assert_eq!(response.results.len(), 1);
    assert!(response.results[0].count >= 2);
}

#[tokio::test]
async fn search_tools_parameter_errors_are_result_level() {
    let h = harness().await;

    for bad in [
        json!({}),
        json!({ "queries": [] }),
        json!({ "queries": [{ "limit": 3 }] }),
        json!({ "queries": "not-an-array" }),
    ] {
        let result = h.bridge.handle_search_tools(arguments(bad));
        let encoded = serde_json::to_value(&result).expect("result serializes");
        assert_eq!(encoded["isError"], true, "expected isError for bad params");
    }
}

#[tokio::test]
async fn run_tool_unwraps_name_and_arguments() {
    let h = harness().await;
    let elicit = accepting();

    let result = h
        .bridge
        .handle_run_tool(
            arguments(json!({
                "name": "github__create_issue",
                "arguments": { "title": "Y" }
            })),
            &elicit,
        )
        .await
        .expect("run_tool should route");

    let calls = h.network.calls("github");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "create_issue");
    assert_eq!(calls[0].1, arguments(json!({"title": "Y"})));

    let encoded = serde_json::to_value(&result).expect("result serializes");
    assert_eq!(encoded["content"][0]["text"], "github:create_issue");
}

#[tokio::test]
async fn run_tool_requires_a_name() {
    let h = harness().await;
    let elicit = accepting();

    let error = h
        .bridge
        .handle_run_tool(arguments(json!({ "arguments": {} })), &elicit)
        .await
        .expect_err("missing name must fail");
    assert_eq!(error.code, rmcp::model::ErrorCode::INVALID_PARAMS);
}

#[tokio::test]
async fn disconnected_upstreams_surface_as_not_connected() {
    let network = MockNetwork::new();
    network.add_server("linear", Vec::new());
    network.set_fail_connect("linear", true);

    let registry = Arc::new(ToolRegistry::new());
    let policy = Arc::new(PolicyEngine::new());
    let manager = UpstreamManager::new(
        Arc::clone(&registry),
        network.clone(),
        bridge_config(r#"{ "mcpUpstreams": { "linear": { "url": "http://u1" } } }"#),
    );
    let bridge = BridgeServer::new(Arc::clone(&registry), None, manager.clone(), policy);
    manager.connect_all().await;

    let elicit = accepting();
    let error = bridge
        .route_call("linear__create_issue", None, &elicit)
        .await
        .expect_err("disconnected upstream must fail");
    assert!(matches!(error, BridgeError::NotConnected { server } if server == "linear"));

    manager.close_all().await;
}

#[tokio::test]
async fn search_driven_searches_update_the_visible_set() {
    let h = harness().await;

    h.bridge.handle_search_tools(arguments(json!({
        "queries": [{ "tool": "create" }]
    })));
    let visible: Vec<String> = h
        .search
        .visible_tools()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert!(visible.contains(&"linear__create_issue".to_string()));
    assert!(visible.contains(&"github__create_issue".to_string()));

    // Full registry remains reachable for direct calls even when a tool is
    // not part of the visible set.
    assert!(h.registry.get_tool("linear__delete_issue").is_some());
}
