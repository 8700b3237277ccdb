use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::Context;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::Config;

/// Installs the global subscriber: stdout, plus the log file when enabled.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.node.log_level))?;

    if let Some(path) = &config.logging.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        let file_layer = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_writer(Mutex::new(file));

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stdout_layer(config))
            .try_init()?;
    } else {
        tracing_subscriber::registry().with(filter).with(stdout_layer(config)).try_init()?;
    }
    Ok(())
}

fn stdout_layer<S>(config: &Config) -> tracing_subscriber::fmt::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_ansi(config.logging.ansi)
}
