//! Hot-reload pipeline end to end: file write → watcher → diff → manager.

mod support;

use std::sync::Arc;
use std::time::Duration;

use crabeye_mcp_bridge::config::watcher::{ConfigWatcher, ReloadEvent, ReloadListener};
use crabeye_mcp_bridge::config::BridgeConfig;
use crabeye_mcp_bridge::registry::ToolRegistry;
use crabeye_mcp_bridge::upstream::UpstreamManager;
use support::{tool, MockNetwork};

fn apply_listener(manager: UpstreamManager) -> ReloadListener {
    Arc::new(move |event: ReloadEvent| {
        let manager = manager.clone();
        Box::pin(async move {
            manager.apply_config_diff(&event.diff, event.config).await;
            Ok(())
        })
    })
}

async fn wait_for<F: Fn() -> bool>(condition: F, label: &str) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {label}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn editing_the_config_file_reconnects_the_changed_upstream() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bridge.json");
    std::fs::write(
        &path,
        r#"{ "mcpUpstreams": { "linear": { "url": "http://A" } } }"#,
    )
    .expect("write initial config");

    let network = MockNetwork::new();
    network.add_server("linear", vec![tool("create_issue")]);

    let registry = Arc::new(ToolRegistry::new());
    let config = BridgeConfig::load(&path).expect("initial config loads");
    let manager = UpstreamManager::new(Arc::clone(&registry), network.clone(), config.clone());
    manager.connect_all().await;
    assert_eq!(network.connects("linear"), 1);

    let watcher = ConfigWatcher::start_with_debounce(
        path.clone(),
        Duration::from_millis(50),
        config,
        apply_listener(manager.clone()),
    )
    .expect("watcher starts");

    network.set_tools("linear", vec![tool("list_issues")]);
    std::fs::write(
        &path,
        r#"{ "mcpUpstreams": { "linear": { "url": "http://B" } } }"#,
    )
    .expect("write changed config");

    wait_for(|| network.connects("linear") == 2, "reconnect after reload").await;
    wait_for(
        || registry.get_tool("linear__list_issues").is_some(),
        "registry refresh after reload",
    )
    .await;
    assert!(registry.get_tool("linear__create_issue").is_none());

    watcher.stop();
    manager.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rewriting_identical_content_causes_no_churn() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bridge.json");
    let raw = r#"{ "mcpUpstreams": { "linear": { "url": "http://A" } } }"#;
    std::fs::write(&path, raw).expect("write initial config");

    let network = MockNetwork::new();
    network.add_server("linear", vec![tool("create_issue")]);

    let registry = Arc::new(ToolRegistry::new());
    let config = BridgeConfig::load(&path).expect("initial config loads");
    let manager = UpstreamManager::new(Arc::clone(&registry), network.clone(), config.clone());
    manager.connect_all().await;

    let watcher = ConfigWatcher::start_with_debounce(
        path.clone(),
        Duration::from_millis(50),
        config,
        apply_listener(manager.clone()),
    )
    .expect("watcher starts");

    // Touch the file twice with byte-identical content.
    std::fs::write(&path, raw).expect("rewrite config");
    std::fs::write(&path, raw).expect("rewrite config again");
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(network.connects("linear"), 1, "no reconnect for no-op reload");
    assert_eq!(network.closes("linear"), 0);

    watcher.stop();
    manager.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn adding_an_upstream_on_disk_brings_it_online() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bridge.json");
    std::fs::write(
        &path,
        r#"{ "mcpUpstreams": { "linear": { "url": "http://A" } } }"#,
    )
    .expect("write initial config");

    let network = MockNetwork::new();
    network.add_server("linear", vec![tool("create_issue")]);
    network.add_server("github", vec![tool("merge_pr")]);

    let registry = Arc::new(ToolRegistry::new());
    let config = BridgeConfig::load(&path).expect("initial config loads");
    let manager = UpstreamManager::new(Arc::clone(&registry), network.clone(), config.clone());
    manager.connect_all().await;

    let watcher = ConfigWatcher::start_with_debounce(
        path.clone(),
        Duration::from_millis(50),
        config,
        apply_listener(manager.clone()),
    )
    .expect("watcher starts");

    std::fs::write(
        &path,
        r#"{
            "mcpUpstreams": {
                "linear": { "url": "http://A" },
                "github": { "command": "node", "args": ["server.js"] }
            }
        }"#,
    )
    .expect("write expanded config");

    wait_for(
        || registry.get_tool("github__merge_pr").is_some(),
        "added upstream comes online",
    )
    .await;
    assert_eq!(network.connects("linear"), 1, "existing upstream untouched");

    watcher.stop();
    manager.close_all().await;
}
