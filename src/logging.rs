use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_FILE: &str = "vpnclient.log";

/// `--log-level` beats `RUST_LOG`, which beats the config file.
pub fn filter_directive(cli: Option<&str>, env: Option<&str>, config: &LoggingConfig) -> String {
    [cli, env]
        .into_iter()
        .flatten()
        .find(|d| !d.trim().is_empty())
        .unwrap_or(config.level.as_str())
        .to_string()
}

pub fn log_file_path() -> PathBuf {
    crate::platform::logs_dir().join(LOG_FILE)
}

/// Installs the global subscriber: stderr always, plus a plain-text file when enabled.
pub fn init(config: &LoggingConfig, cli_level: Option<&str>) -> anyhow::Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = filter_directive(cli_level, env.as_deref(), config);
    let filter = EnvFilter::try_new(&directive)?;

    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let file = if config.file {
        let path = log_file_path();
        if let Some(dir) = path.parent() {
            crate::platform::ensure_dir(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init()?;
    Ok(())
}
