//! Structured logging to stderr.
//!
//! Stdout is the downstream MCP transport, so every log line goes to
//! stderr, in either human text or JSON-lines format. The level filter sits
//! behind a reload handle so a hot-reloaded `logLevel` takes effect
//! process-wide immediately.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::config::{LogFormat, LogLevel};

/// Handle for changing the process-wide log level at runtime.
#[derive(Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    pub fn set_level(&self, level: LogLevel) {
        if let Err(e) = self.filter.reload(filter_for(level)) {
            eprintln!("failed to update log level: {e}");
        }
    }
}

fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::new(level.to_string())
}

/// Initialise the global subscriber. `RUST_LOG` overrides the configured
/// level when set. Re-initialisation (tests) is a no-op.
pub fn init(level: LogLevel, format: LogFormat) -> LogHandle {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(level));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let result = match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("logging already initialised");
    }

    LogHandle { filter: handle }
}
