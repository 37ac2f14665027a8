//! Command-line surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Aggregating MCP bridge: one server downstream, many upstreams behind it.
#[derive(Parser, Debug)]
#[command(name = "crabeye-mcp-bridge", version, about)]
pub struct Cli {
    /// Path to the JSON configuration file (or set MCP_BRIDGE_CONFIG)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Parse and resolve the configuration, print the upstream table, exit
    #[arg(long)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage the encrypted credential store
    Credential(CredentialArgs),
}

/// Arguments for the `credential` subcommand group.
#[derive(Parser, Debug)]
pub struct CredentialArgs {
    #[command(subcommand)]
    pub command: CredentialCommands,
}

#[derive(Subcommand, Debug)]
pub enum CredentialCommands {
    /// Store a credential under a key
    Set(CredentialSetArgs),
    /// Print a stored credential as JSON
    Get(CredentialKeyArgs),
    /// Remove a stored credential
    Delete(CredentialKeyArgs),
    /// List stored credential keys
    List,
}

/// Arguments for `credential set`.
#[derive(Parser, Debug)]
pub struct CredentialSetArgs {
    /// Credential key, e.g. the upstream name
    pub key: String,

    /// Bearer token value
    #[arg(required_unless_present = "oauth2", conflicts_with = "oauth2")]
    pub token: Option<String>,

    /// Store an OAuth2 config instead, passed as a JSON object
    #[arg(long, value_name = "JSON")]
    pub oauth2: Option<String>,
}

/// Key-only arguments for `credential get` / `credential delete`.
#[derive(Parser, Debug)]
pub struct CredentialKeyArgs {
    pub key: String,
}
