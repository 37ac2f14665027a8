//! Aggregating proxy for the Model Context Protocol.
//!
//! Presents one MCP server to a downstream client while multiplexing many
//! upstream MCP servers behind it. Tool names are namespaced as
//! `<server>__<tool>`; instead of advertising the full union of tools, the
//! bridge exposes two meta-tools (`search_tools`, `run_tool`) and a small
//! auto-enabled subset, keeping the downstream context window compact.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod policy;
pub mod registry;
pub mod search;
pub mod upstream;
pub mod util;

pub use error::{BridgeError, Result};
