//! Logging initialization: a console layer whose verbosity follows the
//! `-v/-q/-s` flags, plus an optional debug-level file layer.

use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::conf::LogLevel;

fn console_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Verbose => "tlmerge=debug,info",
        LogLevel::Default => "info",
        LogLevel::Quiet => "warn",
        LogLevel::Silent => "off",
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the console level
/// when set. Returns an error if the log file cannot be opened.
pub fn configure(log_file: Option<&Path>, level: LogLevel) -> anyhow::Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directive(level)));
    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(EnvFilter::new("tlmerge=debug,info")),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .init();
    Ok(())
}
