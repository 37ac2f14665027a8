//! Shared mock upstream network for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::CallToolResult;
use serde_json::json;
use tokio::sync::mpsc;

use crabeye_mcp_bridge::config::{BridgeConfig, ServerConfig};
use crabeye_mcp_bridge::error::{BridgeError, Result};
use crabeye_mcp_bridge::registry::ToolInfo;
use crabeye_mcp_bridge::upstream::{SessionEvent, SessionFactory, SessionHandle, UpstreamSession};

pub type JsonObject = serde_json::Map<String, serde_json::Value>;
pub type CallLog = Vec<(String, Option<JsonObject>)>;

pub fn tool(name: &str) -> ToolInfo {
    ToolInfo {
        name: name.into(),
        description: Some(format!("{name} description")),
        input_schema: json!({"type": "object", "properties": {}}),
    }
}

pub fn bridge_config(raw: &str) -> BridgeConfig {
    BridgeConfig::from_json(raw).expect("test config should parse")
}

pub fn arguments(raw: serde_json::Value) -> Option<JsonObject> {
    match raw {
        serde_json::Value::Object(map) => Some(map),
        serde_json::Value::Null => None,
        other => panic!("arguments fixture must be an object, got {other}"),
    }
}

#[derive(Clone)]
struct ServerScript {
    tools: Arc<Mutex<Vec<ToolInfo>>>,
    fail_connect: Arc<AtomicBool>,
    ping_fails: Arc<AtomicBool>,
    ping_delay: Arc<Mutex<Option<Duration>>>,
    pings: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    calls: Arc<Mutex<CallLog>>,
    event_tx: Arc<Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>>,
}

impl ServerScript {
    fn new(tools: Vec<ToolInfo>) -> Self {
        Self {
            tools: Arc::new(Mutex::new(tools)),
            fail_connect: Arc::new(AtomicBool::new(false)),
            ping_fails: Arc::new(AtomicBool::new(false)),
            ping_delay: Arc::new(Mutex::new(None)),
            pings: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
            event_tx: Arc::new(Mutex::new(None)),
        }
    }
}

struct MockSession {
    server: String,
    script: ServerScript,
}

#[async_trait]
impl UpstreamSession for MockSession {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        Ok(self.script.tools.lock().expect("tools lock").clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult> {
        self.script
            .calls
            .lock()
            .expect("call log lock")
            .push((name.to_string(), arguments.clone()));

        let raw = json!({
            "content": [{ "type": "text", "text": format!("{}:{name}", self.server) }],
            "structuredContent": {
                "server": self.server,
                "tool": name,
                "arguments": arguments.map(serde_json::Value::Object).unwrap_or(serde_json::Value::Null)
            },
            "isError": false
        });
        Ok(serde_json::from_value(raw).expect("mock call result should deserialize"))
    }

    async fn ping(&self) -> Result<()> {
        self.script.pings.fetch_add(1, Ordering::SeqCst);
        let delay = *self.script.ping_delay.lock().expect("ping delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.script.ping_fails.load(Ordering::SeqCst) {
            Err(BridgeError::Transport {
                server: self.server.clone(),
                message: "ping failed".into(),
            })
        } else {
            Ok(())
        }
    }

    async fn close(&self) {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A scriptable set of fake upstream servers behind the factory seam.
pub struct MockNetwork {
    servers: Mutex<HashMap<String, ServerScript>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(HashMap::new()),
        })
    }

    fn script(&self, server: &str) -> ServerScript {
        self.servers
            .lock()
            .expect("servers lock")
            .entry(server.to_string())
            .or_insert_with(|| ServerScript::new(Vec::new()))
            .clone()
    }

    pub fn add_server(&self, server: &str, tools: Vec<ToolInfo>) {
        let script = self.script(server);
        *script.tools.lock().expect("tools lock") = tools;
    }

    /// Replace the live tool list; pair with `send_event` to announce it.
    pub fn set_tools(&self, server: &str, tools: Vec<ToolInfo>) {
        self.add_server(server, tools);
    }

    pub fn set_fail_connect(&self, server: &str, fail: bool) {
        self.script(server).fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_ping_fails(&self, server: &str, fails: bool) {
        self.script(server).ping_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, server: &str, delay: Option<Duration>) {
        *self.script(server).ping_delay.lock().expect("ping delay lock") = delay;
    }

    pub fn send_event(&self, server: &str, event: SessionEvent) {
        let sender = self
            .script(server)
            .event_tx
            .lock()
            .expect("event sender lock")
            .clone()
            .expect("server has no live session");
        sender.send(event).expect("event should send");
    }

    pub fn connects(&self, server: &str) -> usize {
        self.script(server).connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self, server: &str) -> usize {
        self.script(server).closes.load(Ordering::SeqCst)
    }

    pub fn pings(&self, server: &str) -> usize {
        self.script(server).pings.load(Ordering::SeqCst)
    }

    pub fn calls(&self, server: &str) -> CallLog {
        self.script(server).calls.lock().expect("call log lock").clone()
    }
}

#[async_trait]
impl SessionFactory for MockNetwork {
    async fn connect(&self, server: &str, _config: &ServerConfig) -> Result<SessionHandle> {
        let script = self.script(server);
        script.connects.fetch_add(1, Ordering::SeqCst);
        if script.fail_connect.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport {
                server: server.to_string(),
                message: "connection refused".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *script.event_tx.lock().expect("event sender lock") = Some(tx);
        Ok(SessionHandle {
            session: Arc::new(MockSession {
                server: server.to_string(),
                script,
            }),
            events: rx,
        })
    }
}
