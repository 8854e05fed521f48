//! Tracing subscriber setup: an env filter, an optional console layer and
//! an optional plain-text file layer.

use std::fs::{self, OpenOptions};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingSettings;

/// Install the global subscriber. `RUST_LOG` overrides `settings.level`.
pub fn init(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .with_context(|| format!("invalid log filter '{}'", settings.level))?;

    let console = settings.console.then(|| fmt::layer().with_target(false));

    let file = if settings.file {
        if let Some(dir) = settings.file_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;
        }
        let sink = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.file_path)
            .with_context(|| format!("opening log file {}", settings.file_path.display()))?;
        Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(sink)))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}
