//! One stateful connection to one upstream MCP server.
//!
//! The client is a cooperative state machine: connect → discover tools →
//! serve calls/pings → reconnect with exponential backoff. An epoch counter
//! voids callbacks left over from previous connection attempts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use rmcp::model::CallToolResult;
use tokio::task::JoinHandle;

use super::session::{SessionEvent, SessionFactory, UpstreamSession};
use super::{ConnectionStatus, StatusChange};
use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};
use crate::registry::ToolInfo;
use crate::util::{ObserverSet, Subscription};

/// Exponential backoff schedule for transport-initiated reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Consecutive failed reconnects before the client parks in `Error`.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }
}

type ConnectOutcome = std::result::Result<(), Arc<BridgeError>>;
type SharedConnect = Shared<BoxFuture<'static, ConnectOutcome>>;

struct ClientState {
    status: ConnectionStatus,
    epoch: u64,
    closed: bool,
    tools: Vec<ToolInfo>,
    session: Option<Arc<dyn UpstreamSession>>,
    pending_connect: Option<SharedConnect>,
    reconnect_attempts: u32,
    reconnect_timer: Option<JoinHandle<()>>,
    event_pump: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            epoch: 0,
            closed: false,
            tools: Vec::new(),
            session: None,
            pending_connect: None,
            reconnect_attempts: 0,
            reconnect_timer: None,
            event_pump: None,
            last_error: None,
        }
    }
}

/// Record the transition; the caller emits the change outside the lock.
fn transition(
    state: &mut ClientState,
    current: ConnectionStatus,
    error: Option<String>,
) -> Option<StatusChange> {
    if state.status == current {
        return None;
    }
    let change = StatusChange {
        previous: state.status,
        current,
        error,
    };
    state.status = current;
    Some(change)
}

struct ClientInner {
    name: String,
    config: ServerConfig,
    policy: ReconnectPolicy,
    factory: Arc<dyn SessionFactory>,
    state: Mutex<ClientState>,
    status_observers: ObserverSet<StatusChange>,
    tools_observers: ObserverSet<Vec<ToolInfo>>,
}

/// Handle to one upstream connection. Cheap to clone.
#[derive(Clone)]
pub struct UpstreamClient {
    inner: Arc<ClientInner>,
}

impl UpstreamClient {
    pub fn new(name: impl Into<String>, config: ServerConfig, factory: Arc<dyn SessionFactory>) -> Self {
        Self::with_policy(name, config, factory, ReconnectPolicy::default())
    }

    pub fn with_policy(
        name: impl Into<String>,
        config: ServerConfig,
        factory: Arc<dyn SessionFactory>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                name: name.into(),
                config,
                policy,
                factory,
                state: Mutex::new(ClientState::default()),
                status_observers: ObserverSet::new(),
                tools_observers: ObserverSet::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().expect("client lock poisoned").status
    }

    pub fn tools(&self) -> Vec<ToolInfo> {
        self.inner
            .state
            .lock()
            .expect("client lock poisoned")
            .tools
            .clone()
    }

    pub fn tool_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("client lock poisoned")
            .tools
            .len()
    }

    #[cfg(test)]
    fn reconnect_attempts(&self) -> u32 {
        self.inner
            .state
            .lock()
            .expect("client lock poisoned")
            .reconnect_attempts
    }

    pub fn on_status_change(
        &self,
        callback: impl Fn(&StatusChange) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.status_observers.subscribe(callback)
    }

    pub fn unsubscribe_status(&self, subscription: Subscription) {
        self.inner.status_observers.unsubscribe(subscription);
    }

    pub fn on_tools_changed(
        &self,
        callback: impl Fn(&Vec<ToolInfo>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.tools_observers.subscribe(callback)
    }

    pub fn unsubscribe_tools(&self, subscription: Subscription) {
        self.inner.tools_observers.unsubscribe(subscription);
    }

    /// Establish the connection and run tool discovery.
    ///
    /// Concurrent calls coalesce onto one in-flight attempt: the session
    /// factory runs exactly once per logical attempt.
    pub async fn connect(&self) -> Result<()> {
        let (pending, change) = {
            let mut state = self.inner.state.lock().expect("client lock poisoned");
            if state.status == ConnectionStatus::Connected {
                return Ok(());
            }
            if let Some(pending) = &state.pending_connect {
                (pending.clone(), None)
            } else {
                state.closed = false;
                state.epoch += 1;
                let epoch = state.epoch;
                if let Some(timer) = state.reconnect_timer.take() {
                    timer.abort();
                }
                let change = transition(&mut state, ConnectionStatus::Connecting, None);

                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move { ClientInner::do_connect(inner, epoch).await });
                let pending: SharedConnect = async move {
                    match task.await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(Arc::new(BridgeError::Transport {
                            server: String::new(),
                            message: format!("connect task failed: {e}"),
                        })),
                    }
                }
                .boxed()
                .shared();
                state.pending_connect = Some(pending.clone());
                (pending, change)
            }
        };

        if let Some(change) = change {
            self.inner.status_observers.emit(&change);
        }

        pending.await.map_err(|e| BridgeError::Transport {
            server: self.inner.name.clone(),
            message: e.to_string(),
        })
    }

    /// Tear down the current session (if any) and dial again.
    ///
    /// Used by the health loop after the unhealthy threshold; also clears
    /// a terminal `Error` state.
    pub async fn reconnect(&self) -> Result<()> {
        let (session, change) = {
            let mut state = self.inner.state.lock().expect("client lock poisoned");
            state.epoch += 1;
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            if let Some(pump) = state.event_pump.take() {
                pump.abort();
            }
            state.pending_connect = None;
            let session = state.session.take();
            let change = transition(&mut state, ConnectionStatus::Disconnected, None);
            (session, change)
        };

        if let Some(change) = change {
            self.inner.status_observers.emit(&change);
        }
        if let Some(session) = session {
            session.close().await;
        }
        self.connect().await
    }

    /// Permanently close: suppresses reconnects and empties the tool list.
    pub async fn close(&self) {
        let (session, change) = {
            let mut state = self.inner.state.lock().expect("client lock poisoned");
            state.closed = true;
            state.epoch += 1;
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            if let Some(pump) = state.event_pump.take() {
                pump.abort();
            }
            state.pending_connect = None;
            state.tools.clear();
            let session = state.session.take();
            let change = transition(&mut state, ConnectionStatus::Disconnected, None);
            (session, change)
        };

        if let Some(change) = change {
            self.inner.status_observers.emit(&change);
        }
        self.inner.tools_observers.emit(&Vec::new());
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// Delegate a tool call; fails fast when not connected.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult> {
        let session = self.connected_session()?;
        session.call_tool(name, arguments).await
    }

    /// One ping round-trip with a deadline.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let session = self.connected_session()?;
        tokio::time::timeout(timeout, session.ping())
            .await
            .map_err(|_| BridgeError::Timeout(timeout.as_millis() as u64))?
    }

    fn connected_session(&self) -> Result<Arc<dyn UpstreamSession>> {
        let state = self.inner.state.lock().expect("client lock poisoned");
        if state.status != ConnectionStatus::Connected {
            return Err(BridgeError::NotConnected {
                server: self.inner.name.clone(),
            });
        }
        state.session.clone().ok_or_else(|| BridgeError::NotConnected {
            server: self.inner.name.clone(),
        })
    }
}

impl ClientInner {
    async fn do_connect(inner: Arc<ClientInner>, epoch: u64) -> ConnectOutcome {
        match inner.factory.connect(&inner.name, &inner.config).await {
            Ok(handle) => {
                let session = handle.session;
                let (superseded, change) = {
                    let mut state = inner.state.lock().expect("client lock poisoned");
                    if state.epoch != epoch || state.closed {
                        (true, None)
                    } else {
                        state.session = Some(Arc::clone(&session));
                        state.reconnect_attempts = 0;
                        state.last_error = None;
                        state.event_pump = Some(Self::spawn_event_pump(
                            Arc::clone(&inner),
                            epoch,
                            handle.events,
                        ));
                        state.pending_connect = None;
                        let change = transition(&mut state, ConnectionStatus::Connected, None);
                        (false, change)
                    }
                };
                if superseded {
                    session.close().await;
                    return Err(Arc::new(BridgeError::Transport {
                        server: inner.name.clone(),
                        message: "connection superseded".into(),
                    }));
                }
                if let Some(change) = change {
                    inner.status_observers.emit(&change);
                }
                tracing::info!(server = %inner.name, "upstream connected");

                inner.refresh_tools(epoch, &session).await;
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                let (change, schedule) = {
                    let mut state = inner.state.lock().expect("client lock poisoned");
                    if state.epoch != epoch || state.closed {
                        (None, false)
                    } else {
                        state.pending_connect = None;
                        state.last_error = Some(message.clone());
                        (
                            transition(
                                &mut state,
                                ConnectionStatus::Disconnected,
                                Some(message.clone()),
                            ),
                            true,
                        )
                    }
                };
                if let Some(change) = change {
                    inner.status_observers.emit(&change);
                }
                if schedule {
                    tracing::warn!(server = %inner.name, error = %message, "upstream connect failed");
                    Self::schedule_reconnect(&inner);
                }
                Err(Arc::new(e))
            }
        }
    }

    fn spawn_event_pump(
        inner: Arc<ClientInner>,
        epoch: u64,
        mut events: tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                {
                    let state = inner.state.lock().expect("client lock poisoned");
                    if state.epoch != epoch || state.closed {
                        return;
                    }
                }
                match event {
                    SessionEvent::ToolListChanged => {
                        let session = {
                            let state = inner.state.lock().expect("client lock poisoned");
                            state.session.clone()
                        };
                        if let Some(session) = session {
                            inner.refresh_tools(epoch, &session).await;
                        }
                    }
                    SessionEvent::Closed => {
                        let (change, schedule) = {
                            let mut state = inner.state.lock().expect("client lock poisoned");
                            if state.epoch != epoch || state.closed {
                                return;
                            }
                            state.session = None;
                            state.pending_connect = None;
                            (
                                transition(
                                    &mut state,
                                    ConnectionStatus::Disconnected,
                                    Some("transport closed".into()),
                                ),
                                true,
                            )
                        };
                        if let Some(change) = change {
                            inner.status_observers.emit(&change);
                        }
                        if schedule {
                            tracing::warn!(server = %inner.name, "upstream transport closed");
                            Self::schedule_reconnect(&inner);
                        }
                        return;
                    }
                }
            }
        })
    }

    async fn refresh_tools(&self, epoch: u64, session: &Arc<dyn UpstreamSession>) {
        match session.list_tools().await {
            Ok(tools) => self.store_tools(epoch, tools),
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "tool discovery failed");
            }
        }
    }

    fn store_tools(&self, epoch: u64, tools: Vec<ToolInfo>) {
        {
            let mut state = self.state.lock().expect("client lock poisoned");
            if state.epoch != epoch || state.closed {
                return;
            }
            state.tools = tools.clone();
        }
        tracing::debug!(server = %self.name, count = tools.len(), "tool list updated");
        self.tools_observers.emit(&tools);
    }

    fn schedule_reconnect(inner: &Arc<ClientInner>) {
        let change = {
            let mut state = inner.state.lock().expect("client lock poisoned");
            if state.closed || state.reconnect_timer.is_some() {
                return;
            }
            if state.reconnect_attempts >= inner.policy.max_attempts {
                state.tools.clear();
                let error = state.last_error.clone();
                transition(&mut state, ConnectionStatus::Error, error)
            } else {
                let attempt = state.reconnect_attempts;
                let delay = inner.policy.delay(attempt);
                state.reconnect_attempts += 1;
                let epoch = state.epoch;
                let timer_inner = Arc::clone(inner);
                tracing::info!(
                    server = %inner.name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                state.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let proceed = {
                        let mut state = timer_inner.state.lock().expect("client lock poisoned");
                        if state.epoch != epoch || state.closed {
                            false
                        } else {
                            state.reconnect_timer = None;
                            true
                        }
                    };
                    if proceed {
                        let client = UpstreamClient { inner: timer_inner };
                        let _ = client.connect().await;
                    }
                }));
                None
            }
        };

        if let Some(change) = change {
            tracing::error!(
                server = %inner.name,
                "reconnect attempts exhausted, upstream parked in error state"
            );
            inner.status_observers.emit(&change);
        }
    }
}
