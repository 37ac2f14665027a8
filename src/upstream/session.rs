//! The MCP session seam: object-safe traits over one live upstream
//! connection, plus the rmcp-backed implementation with its three
//! transports (stdio child process, streamable-http, sse).
//!
//! Everything above this module (client state machine, manager, bridge)
//! depends only on [`UpstreamSession`] / [`SessionFactory`], which is what
//! makes the upstream stack testable with mock sessions.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ClientCapabilities, ClientInfo, ClientRequest,
    Implementation, ProtocolVersion,
};
use rmcp::service::{NotificationContext, RoleClient, ServiceError};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{ClientHandler, Peer, ServiceExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{HttpServerConfig, HttpTransportKind, ServerConfig, StdioServerConfig};
use crate::error::{BridgeError, Result};
use crate::registry::ToolInfo;

/// Asynchronous events surfaced by a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The upstream sent `notifications/tools/list_changed`.
    ToolListChanged,
    /// The transport closed (peer went away or the session was cancelled).
    Closed,
}

/// One live MCP session with one upstream.
#[async_trait]
pub trait UpstreamSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>>;

    /// Delegate a tool call and return the upstream result unmodified.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult>;

    /// One MCP ping round-trip; resolves on success.
    async fn ping(&self) -> Result<()>;

    async fn close(&self);
}

/// A freshly connected session plus its event stream.
pub struct SessionHandle {
    pub session: Arc<dyn UpstreamSession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Creates sessions from server configs. The upstream client calls this
/// exactly once per logical connection attempt.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, server: &str, config: &ServerConfig) -> Result<SessionHandle>;
}

/// Client-role handler: advertises the bridge identity and forwards
/// `tools/list_changed` notifications into the session event stream.
#[derive(Clone)]
struct UpstreamClientHandler {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ClientHandler for UpstreamClientHandler {
    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "crabeye-mcp-bridge".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                website_url: None,
                icons: None,
            },
        }
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        let _ = self.events.send(SessionEvent::ToolListChanged);
    }
}

/// The rmcp-backed session: a cloneable peer for requests and a
/// cancellation token for teardown.
struct RmcpSession {
    server: String,
    peer: Peer<RoleClient>,
    cancel: CancellationToken,
}

#[async_trait]
impl UpstreamSession for RmcpSession {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let tools = match self.peer.list_all_tools().await {
            Ok(tools) => tools,
            // Some servers reject pagination cursors; fall back to one page.
            Err(ServiceError::UnexpectedResponse) => {
                self.peer
                    .list_tools(None)
                    .await
                    .map_err(|e| map_service_error(&self.server, "tools/list", e))?
                    .tools
            }
            Err(e) => return Err(map_service_error(&self.server, "tools/list", e)),
        };
        Ok(tools.into_iter().map(tool_info_from_rmcp).collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult> {
        self.peer
            .call_tool(CallToolRequestParam {
                name: name.to_owned().into(),
                arguments,
            })
            .await
            .map_err(|e| map_service_error(&self.server, "tools/call", e))
    }

    async fn ping(&self) -> Result<()> {
        self.peer
            .send_request(ClientRequest::PingRequest(Default::default()))
            .await
            .map_err(|e| map_service_error(&self.server, "ping", e))?;
        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

fn tool_info_from_rmcp(tool: rmcp::model::Tool) -> ToolInfo {
    ToolInfo {
        name: tool.name.to_string(),
        description: tool.description.map(|d| d.to_string()),
        input_schema: serde_json::Value::Object((*tool.input_schema).clone()),
    }
}

fn map_service_error(server: &str, context: &str, error: ServiceError) -> BridgeError {
    match error {
        ServiceError::McpError(error) => BridgeError::Upstream {
            server: server.to_string(),
            message: format!("{context}: {} ({})", error.message, error.code.0),
        },
        ServiceError::TransportSend(error) => BridgeError::Transport {
            server: server.to_string(),
            message: format!("{context}: transport send failed: {error}"),
        },
        ServiceError::TransportClosed => BridgeError::Transport {
            server: server.to_string(),
            message: format!("{context}: transport closed"),
        },
        ServiceError::Timeout { timeout } => BridgeError::Timeout(timeout.as_millis() as u64),
        other => BridgeError::Transport {
            server: server.to_string(),
            message: format!("{context}: {other}"),
        },
    }
}

/// Production factory: dials real MCP servers with rmcp.
pub struct RmcpSessionFactory {
    connect_timeout: Duration,
}

impl RmcpSessionFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl SessionFactory for RmcpSessionFactory {
    async fn connect(&self, server: &str, config: &ServerConfig) -> Result<SessionHandle> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handler = UpstreamClientHandler {
            events: event_tx.clone(),
        };

        let cancel = CancellationToken::new();
        let serve_ct = cancel.clone();
        let serve = async {
            match config {
                ServerConfig::Stdio(stdio) => {
                    let (transport, stderr) = stdio_transport(server, stdio)?;
                    if let Some(stderr) = stderr {
                        forward_stderr(server.to_string(), stderr);
                    }
                    handler
                        .serve_with_ct(transport, serve_ct)
                        .await
                        .map_err(|e| BridgeError::Transport {
                            server: server.to_string(),
                            message: format!("initialize failed: {e}"),
                        })
                }
                ServerConfig::Http(http) => match http.transport {
                    HttpTransportKind::StreamableHttp => {
                        let transport = streamable_http_transport(server, http)?;
                        handler
                            .serve_with_ct(transport, serve_ct)
                            .await
                            .map_err(|e| BridgeError::Transport {
                                server: server.to_string(),
                                message: format!("initialize failed: {e}"),
                            })
                    }
                    HttpTransportKind::Sse => {
                        let transport = sse_transport(server, http).await?;
                        handler
                            .serve_with_ct(transport, serve_ct)
                            .await
                            .map_err(|e| BridgeError::Transport {
                                server: server.to_string(),
                                message: format!("initialize failed: {e}"),
                            })
                    }
                },
            }
        };

        let running = tokio::time::timeout(self.connect_timeout, serve)
            .await
            .map_err(|_| BridgeError::Timeout(self.connect_timeout.as_millis() as u64))??;

        let peer = running.peer().clone();

        // The running service resolves when the transport goes away; surface
        // that as a session event so the client can schedule a reconnect.
        tokio::spawn(async move {
            let _ = running.waiting().await;
            let _ = event_tx.send(SessionEvent::Closed);
        });

        Ok(SessionHandle {
            session: Arc::new(RmcpSession {
                server: server.to_string(),
                peer,
                cancel,
            }),
            events: event_rx,
        })
    }
}

/// Spawn the child with the configured env merged over the process env and
/// stderr piped back for log forwarding.
fn stdio_transport(
    server: &str,
    config: &StdioServerConfig,
) -> Result<(TokioChildProcess, Option<tokio::process::ChildStderr>)> {
    let mut command = Command::new(&config.command);
    command.args(&config.args);
    for (key, value) in &config.env {
        command.env(key, value);
    }

    TokioChildProcess::builder(command)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BridgeError::Transport {
            server: server.to_string(),
            message: format!("failed to spawn \"{}\": {e}", config.command),
        })
}

/// Line-forward a child's stderr to the log at debug level.
fn forward_stderr(server: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server, "stderr: {line}");
        }
    });
}

fn streamable_http_transport(
    server: &str,
    config: &HttpServerConfig,
) -> Result<StreamableHttpClientTransport<reqwest::Client>> {
    let transport_config = StreamableHttpClientTransportConfig::with_uri(config.url.clone());
    let headers = parse_headers(server, &config.headers)?;
    let mut header_map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        header_map.insert(name, value);
    }
    let client = reqwest::Client::builder()
        .default_headers(header_map)
        .build()
        .map_err(|e| BridgeError::Transport {
            server: server.to_string(),
            message: format!("failed to build http client: {e}"),
        })?;
    Ok(StreamableHttpClientTransport::with_client(
        client,
        transport_config,
    ))
}

async fn sse_transport(
    server: &str,
    config: &HttpServerConfig,
) -> Result<SseClientTransport<reqwest::Client>> {
    let headers = parse_headers(server, &config.headers)?;
    let mut header_map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        header_map.insert(name, value);
    }
    let client = reqwest::Client::builder()
        .default_headers(header_map)
        .build()
        .map_err(|e| BridgeError::Transport {
            server: server.to_string(),
            message: format!("failed to build http client: {e}"),
        })?;

    SseClientTransport::start_with_client(
        client,
        rmcp::transport::sse_client::SseClientConfig {
            sse_endpoint: config.url.clone().into(),
            ..Default::default()
        },
    )
    .await
    .map_err(|e| BridgeError::Transport {
        server: server.to_string(),
        message: format!("sse connect failed: {e}"),
    })
}

fn parse_headers(
    server: &str,
    headers: &std::collections::BTreeMap<String, String>,
) -> Result<HashMap<reqwest::header::HeaderName, reqwest::header::HeaderValue>> {
    let mut parsed = HashMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name =
            reqwest::header::HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                BridgeError::Configuration(format!(
                    "upstream \"{server}\": invalid header name \"{name}\": {e}"
                ))
            })?;
        let header_value = reqwest::header::HeaderValue::from_str(value).map_err(|e| {
            BridgeError::Configuration(format!(
                "upstream \"{server}\": invalid header value for \"{name}\": {e}"
            ))
        })?;
        parsed.insert(header_name, header_value);
    }
    Ok(parsed)
}
