//! Bridge binary entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rmcp::transport::io::stdio;
use rmcp::ServiceExt;

use crabeye_mcp_bridge::bridge::BridgeServer;
use crabeye_mcp_bridge::cli::{Cli, Commands, CredentialArgs, CredentialCommands};
use crabeye_mcp_bridge::config::watcher::{ConfigWatcher, ReloadEvent, ReloadListener};
use crabeye_mcp_bridge::config::{BridgeConfig, CONFIG_PATH_ENV};
use crabeye_mcp_bridge::credentials::{Credential, CredentialStore};
use crabeye_mcp_bridge::logging;
use crabeye_mcp_bridge::policy::PolicyEngine;
use crabeye_mcp_bridge::registry::ToolRegistry;
use crabeye_mcp_bridge::search::ToolSearchService;
use crabeye_mcp_bridge::upstream::{RmcpSessionFactory, SessionFactory, UpstreamManager};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Credential(args)) => handle_credential(args),
        None => run_bridge(cli).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn resolve_config_path(cli_path: Option<PathBuf>) -> Result<PathBuf, String> {
    if let Some(path) = cli_path {
        return Ok(path);
    }
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => Ok(PathBuf::from(path)),
        _ => Err(format!(
            "no configuration file given (use --config or {CONFIG_PATH_ENV})"
        )),
    }
}

async fn run_bridge(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let path = resolve_config_path(cli.config)?;
    let config = BridgeConfig::load(&path)?;

    if cli.validate {
        print_validation(&config);
        return Ok(());
    }

    let settings = config.settings.clone();
    let log_handle = logging::init(settings.log_level, settings.log_format);
    tracing::info!(
        config = %path.display(),
        upstreams = config.upstreams.len(),
        "starting crabeye-mcp-bridge"
    );

    let registry = Arc::new(ToolRegistry::new());
    let policy = Arc::new(PolicyEngine::new());
    policy.update(settings.tool_policy, &config.upstreams);

    let factory: Arc<dyn SessionFactory> = Arc::new(RmcpSessionFactory::new(
        Duration::from_secs(settings.connection_timeout),
    ));
    let manager = UpstreamManager::new(Arc::clone(&registry), factory, config.clone());
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

    let summary = manager.connect_all().await;
    tracing::info!(
        total = summary.total,
        connected = summary.connected,
        "upstream startup complete"
    );
    manager.start_health_checks(settings.health_check_interval);

    let listener: ReloadListener = {
        let manager = manager.clone();
        let policy = Arc::clone(&policy);
        let log_handle = log_handle.clone();
        Arc::new(move |event: ReloadEvent| {
            let manager = manager.clone();
            let policy = Arc::clone(&policy);
            let log_handle = log_handle.clone();
            Box::pin(async move {
                let diff = &event.diff;
                if let Some(level) = diff.bridge.log_level {
                    tracing::info!(level = %level, "applying new log level");
                    log_handle.set_level(level);
                }
                policy.update(event.config.settings.tool_policy, &event.config.upstreams);
                manager.apply_config_diff(diff, event.config.clone()).await;
                if let Some(interval) = diff.bridge.health_check_interval {
                    manager.restart_health_checks(interval);
                }
                if !diff.bridge.requires_restart.is_empty() {
                    tracing::warn!(
                        fields = ?diff.bridge.requires_restart,
                        "changed config fields require a restart to take effect"
                    );
                }
                Ok(())
            })
        })
    };
    let watcher = ConfigWatcher::start(path.clone(), config, listener)?;

    let running = bridge
        .clone()
        .serve(stdio())
        .await
        .map_err(|e| format!("downstream session failed to initialize: {e}"))?;
    let _forwarding = bridge.forward_list_changed(running.peer().clone());
    tracing::info!("downstream client connected on stdio");

    let _ = running.waiting().await;
    tracing::info!("downstream session ended, shutting down");

    watcher.stop();
    search.detach();
    manager.close_all().await;
    Ok(())
}

fn print_validation(config: &BridgeConfig) {
    println!("{} upstream(s) resolved:", config.upstreams.len());
    for (name, server) in &config.upstreams {
        let category = server.category().unwrap_or("-");
        println!(
            "  {:<20} {:<16} {:<12} {}",
            name,
            server.kind(),
            category,
            server.target()
        );
    }
    let settings = &config.settings;
    println!(
        "bridge: port={} logLevel={} logFormat={} toolPolicy={} healthCheckInterval={}s",
        settings.port,
        settings.log_level,
        settings.log_format,
        settings.tool_policy,
        settings.health_check_interval
    );
}

fn handle_credential(args: CredentialArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = CredentialStore::open_default()?;
    match args.command {
        CredentialCommands::Set(set) => {
            let credential = match (set.token, set.oauth2) {
                (Some(token), None) => Credential::Bearer { token },
                (None, Some(raw)) => {
                    let config: serde_json::Value = serde_json::from_str(&raw)
                        .map_err(|e| format!("--oauth2 must be a JSON object: {e}"))?;
                    if !config.is_object() {
                        return Err("--oauth2 must be a JSON object".into());
                    }
                    Credential::Oauth2 { config }
                }
                _ => return Err("provide either a token or --oauth2".into()),
            };
            store.set(&set.key, credential)?;
            println!("stored credential \"{}\"", set.key);
        }
        CredentialCommands::Get(get) => match store.get(&get.key)? {
            Some(credential) => println!("{}", serde_json::to_string_pretty(&credential)?),
            None => return Err(format!("no credential stored under \"{}\"", get.key).into()),
        },
        CredentialCommands::Delete(delete) => {
            if store.delete(&delete.key)? {
                println!("deleted credential \"{}\"", delete.key);
            } else {
                return Err(format!("no credential stored under \"{}\"", delete.key).into());
            }
        }
        CredentialCommands::List => {
            for key in store.list()? {
                println!("{key}");
            }
        }
    }
    Ok(())
}
