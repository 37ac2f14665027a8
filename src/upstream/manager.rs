//! Owns the set of upstream clients: fan-out connect/close, the periodic
//! health loop, and surgical application of config diffs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;

use super::client::{ReconnectPolicy, UpstreamClient};
use super::session::SessionFactory;
use super::{ConnectionStatus, HealthState};
use crate::config::diff::ConfigDiff;
use crate::config::{BridgeConfig, ServerConfig};
use crate::registry::{ToolInfo, ToolRegistry};
use crate::util::Subscription;

pub const PING_TIMEOUT: Duration = Duration::from_secs(5);
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// Result of a `connect_all` fan-out.
#[derive(Debug, Clone, Default)]
pub struct ConnectSummary {
    pub total: usize,
    pub connected: usize,
    pub failed: Vec<(String, String)>,
}

/// One row of `get_statuses`.
#[derive(Debug, Clone)]
pub struct UpstreamStatus {
    pub name: String,
    pub status: ConnectionStatus,
    pub health: HealthState,
    pub tool_count: usize,
    pub last_ping_at: Option<DateTime<Utc>>,
}

struct ClientEntry {
    client: UpstreamClient,
    status_sub: Subscription,
    tools_sub: Subscription,
}

#[derive(Default)]
struct HealthRecord {
    health: HealthState,
    consecutive_failures: u32,
    last_ping_at: Option<DateTime<Utc>>,
    ping_in_flight: bool,
}

struct ManagerInner {
    registry: Arc<ToolRegistry>,
    factory: Arc<dyn SessionFactory>,
    reconnect_policy: ReconnectPolicy,
    clients: Mutex<HashMap<String, ClientEntry>>,
    config: Mutex<BridgeConfig>,
    health_records: Mutex<HashMap<String, HealthRecord>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

/// The set of upstream clients and their health loop.
#[derive(Clone)]
pub struct UpstreamManager {
    inner: Arc<ManagerInner>,
}

impl UpstreamManager {
    pub fn new(
        registry: Arc<ToolRegistry>,
        factory: Arc<dyn SessionFactory>,
        config: BridgeConfig,
    ) -> Self {
        Self::with_reconnect_policy(registry, factory, config, ReconnectPolicy::default())
    }

    pub fn with_reconnect_policy(
        registry: Arc<ToolRegistry>,
        factory: Arc<dyn SessionFactory>,
        config: BridgeConfig,
        reconnect_policy: ReconnectPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                factory,
                reconnect_policy,
                clients: Mutex::new(HashMap::new()),
                config: Mutex::new(config),
                health_records: Mutex::new(HashMap::new()),
                health_task: Mutex::new(None),
            }),
        }
    }

    /// Build a client per configured upstream and connect them all
    /// concurrently. Individual failures never abort the others.
    pub async fn connect_all(&self) -> ConnectSummary {
        let upstreams = {
            let config = self.inner.config.lock().expect("config lock poisoned");
            config.upstreams.clone()
        };

        let mut clients = Vec::with_capacity(upstreams.len());
        for (name, server) in upstreams {
            let client = self.add_client(&name, &server);
            clients.push((name, client));
        }

        let results = join_all(clients.into_iter().map(|(name, client)| async move {
            let result = client.connect().await;
            (name, result)
        }))
        .await;

        let mut summary = ConnectSummary {
            total: results.len(),
            ..Default::default()
        };
        for (name, result) in results {
            match result {
                Ok(()) => summary.connected += 1,
                Err(e) => summary.failed.push((name, e.to_string())),
            }
        }
        tracing::info!(
            total = summary.total,
            connected = summary.connected,
            failed = summary.failed.len(),
            "upstream connect fan-out finished"
        );
        for (name, error) in &summary.failed {
            tracing::warn!(server = %name, error = %error, "upstream failed to connect");
        }
        summary
    }

    /// Stop the health loop, close every client concurrently, and purge the
    /// registry. Close errors are ignored.
    pub async fn close_all(&self) {
        self.stop_health_checks();

        let entries: Vec<(String, ClientEntry)> = {
            let mut clients = self.inner.clients.lock().expect("clients lock poisoned");
            clients.drain().collect()
        };

        let mut names = Vec::with_capacity(entries.len());
        let mut closers = Vec::with_capacity(entries.len());
        for (name, entry) in entries {
            entry.client.unsubscribe_status(entry.status_sub);
            entry.client.unsubscribe_tools(entry.tools_sub);
            closers.push(async move { entry.client.close().await });
            names.push(name);
        }
        join_all(closers).await;

        for name in names {
            self.inner.registry.remove_source(&name);
        }
        self.inner
            .health_records
            .lock()
            .expect("health lock poisoned")
            .clear();
    }

    /// Apply a config diff in phases: remove, reconnect, add, then
    /// metadata-only updates. Stores the new config.
    pub async fn apply_config_diff(&self, diff: &ConfigDiff, new_config: BridgeConfig) {
        // Phase 1: drop removed upstreams.
        for name in &diff.servers.removed {
            tracing::info!(server = %name, "removing upstream");
            self.remove_client(name).await;
            self.inner.registry.remove_category_for_source(name);
        }

        // Phase 2: connection-identifying fields changed; replace the client.
        for name in &diff.servers.reconnect {
            let Some(server) = new_config.upstreams.get(name).cloned() else {
                continue;
            };
            tracing::info!(server = %name, "reconnecting upstream with new config");
            self.remove_client(name).await;
            let client = self.add_client(name, &server);
            self.apply_category(name, &server);
            if let Err(e) = client.connect().await {
                tracing::warn!(server = %name, error = %e, "reconnect after config change failed");
            }
        }

        // Phase 3: new upstreams.
        for name in &diff.servers.added {
            let Some(server) = new_config.upstreams.get(name).cloned() else {
                continue;
            };
            tracing::info!(server = %name, "adding upstream");
            let client = self.add_client(name, &server);
            self.apply_category(name, &server);
            if let Err(e) = client.connect().await {
                tracing::warn!(server = %name, error = %e, "connect of added upstream failed");
            }
        }

        // Phase 4: metadata only; never touches the connection.
        for name in &diff.servers.updated {
            let Some(server) = new_config.upstreams.get(name) else {
                continue;
            };
            tracing::info!(server = %name, "updating upstream metadata");
            self.apply_category(name, server);
        }

        *self.inner.config.lock().expect("config lock poisoned") = new_config;
    }

    pub fn get_client(&self, name: &str) -> Option<UpstreamClient> {
        self.inner
            .clients
            .lock()
            .expect("clients lock poisoned")
            .get(name)
            .map(|entry| entry.client.clone())
    }

    pub fn get_statuses(&self) -> Vec<UpstreamStatus> {
        let clients = self.inner.clients.lock().expect("clients lock poisoned");
        let records = self
            .inner
            .health_records
            .lock()
            .expect("health lock poisoned");

        let mut statuses: Vec<UpstreamStatus> = clients
            .iter()
            .map(|(name, entry)| {
                let record = records.get(name);
                UpstreamStatus {
                    name: name.clone(),
                    status: entry.client.status(),
                    health: record.map(|r| r.health).unwrap_or_default(),
                    tool_count: entry.client.tool_count(),
                    last_ping_at: record.and_then(|r| r.last_ping_at),
                }
            })
            .collect();
        statuses.sort_by(|left, right| left.name.cmp(&right.name));
        statuses
    }

    /// Start the periodic ping loop. An interval of 0 disables it entirely.
    pub fn start_health_checks(&self, interval_secs: u64) {
        if interval_secs == 0 {
            tracing::debug!("health checks disabled");
            return;
        }
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of `interval` fires immediately; skip it so the
            // first check lands one full period after startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                ManagerInner::run_health_tick(&inner);
            }
        });

        let mut slot = self.inner.health_task.lock().expect("health task lock");
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
        tracing::debug!(interval_secs, "health checks started");
    }

    pub fn stop_health_checks(&self) {
        let mut slot = self.inner.health_task.lock().expect("health task lock");
        if let Some(task) = slot.take() {
            task.abort();
        }
    }

    pub fn restart_health_checks(&self, interval_secs: u64) {
        self.stop_health_checks();
        self.start_health_checks(interval_secs);
    }

    fn add_client(&self, name: &str, server: &ServerConfig) -> UpstreamClient {
        let client = UpstreamClient::with_policy(
            name,
            server.clone(),
            Arc::clone(&self.inner.factory),
            self.inner.reconnect_policy.clone(),
        );

        let registry = Arc::clone(&self.inner.registry);
        let source = name.to_string();
        let tools_sub = client.on_tools_changed(move |tools: &Vec<ToolInfo>| {
            let namespaced: Vec<ToolInfo> =
                tools.iter().map(|tool| tool.namespaced(&source)).collect();
            registry.set_tools_for_source(&source, namespaced);
        });

        let registry = Arc::clone(&self.inner.registry);
        let source = name.to_string();
        let status_sub = client.on_status_change(move |change| {
            if change.current == ConnectionStatus::Error {
                registry.remove_source(&source);
            }
        });

        self.apply_category(name, server);

        let entry = ClientEntry {
            client: client.clone(),
            status_sub,
            tools_sub,
        };
        self.inner
            .clients
            .lock()
            .expect("clients lock poisoned")
            .insert(name.to_string(), entry);
        self.inner
            .health_records
            .lock()
            .expect("health lock poisoned")
            .insert(name.to_string(), HealthRecord::default());
        client
    }

    async fn remove_client(&self, name: &str) {
        let entry = {
            let mut clients = self.inner.clients.lock().expect("clients lock poisoned");
            clients.remove(name)
        };
        if let Some(entry) = entry {
            entry.client.unsubscribe_status(entry.status_sub);
            entry.client.unsubscribe_tools(entry.tools_sub);
            entry.client.close().await;
        }
        self.inner.registry.remove_source(name);
        self.inner
            .health_records
            .lock()
            .expect("health lock poisoned")
            .remove(name);
    }

    fn apply_category(&self, name: &str, server: &ServerConfig) {
        match server.category() {
            Some(category) => self
                .inner
                .registry
                .set_category_for_source(name, category),
            None => self.inner.registry.remove_category_for_source(name),
        }
    }
}

impl ManagerInner {
    /// One health tick: fire a ping per connected client, skipping clients
    /// with a ping still in flight.
    fn run_health_tick(inner: &Arc<ManagerInner>) {
        let clients: Vec<(String, UpstreamClient)> = {
            let clients = inner.clients.lock().expect("clients lock poisoned");
            clients
                .iter()
                .map(|(name, entry)| (name.clone(), entry.client.clone()))
                .collect()
        };

        for (name, client) in clients {
            if client.status() != ConnectionStatus::Connected {
                continue;
            }
            {
                let mut records = inner.health_records.lock().expect("health lock poisoned");
                let record = records.entry(name.clone()).or_default();
                if record.ping_in_flight {
                    continue;
                }
                record.ping_in_flight = true;
            }

            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let result = client.ping(PING_TIMEOUT).await;
                let reconnect_needed = {
                    let mut records = inner.health_records.lock().expect("health lock poisoned");
                    let record = records.entry(name.clone()).or_default();
                    record.ping_in_flight = false;
                    match result {
                        Ok(()) => {
                            if record.health == HealthState::Unhealthy {
                                tracing::info!(server = %name, "upstream recovered");
                            }
                            record.consecutive_failures = 0;
                            record.health = HealthState::Healthy;
                            record.last_ping_at = Some(Utc::now());
                            false
                        }
                        Err(e) => {
                            record.consecutive_failures += 1;
                            record.health = HealthState::Unhealthy;
                            tracing::warn!(
                                server = %name,
                                failures = record.consecutive_failures,
                                error = %e,
                                "health ping failed"
                            );
                            if record.consecutive_failures >= UNHEALTHY_THRESHOLD {
                                record.consecutive_failures = 0;
                                record.health = HealthState::Unknown;
                                true
                            } else {
                                false
                            }
                        }
                    }
                };

                if reconnect_needed {
                    tracing::error!(
                        server = %name,
                        threshold = UNHEALTHY_THRESHOLD,
                        "unhealthy threshold reached, forcing reconnect"
                    );
                    if let Err(e) = client.reconnect().await {
                        tracing::warn!(server = %name, error = %e, "forced reconnect failed");
                    }
                }
            });
        }
    }
}
