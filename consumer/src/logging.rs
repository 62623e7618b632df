//! Installs the leveled sink the consumers log into.
//!
//! Everything in this crate logs through `tracing`. A critical failure is an
//! `error!` event carrying `severity = "critical"`.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use serde_derive::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::ConsumerError;

static LOGGER: OnceCell<()> = OnceCell::new();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Console filter directive; `RUST_LOG` overrides it when set.
    pub console_level: String,
    /// Optional log file, appended to.
    pub file: Option<PathBuf>,
    pub file_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            console_level: "warn".to_string(),
            file: None,
            file_level: "trace".to_string(),
        }
    }
}

/// Installs the global subscriber once; later calls are no-ops.
pub fn init_logging(cfg: &LogConfig) -> Result<(), ConsumerError> {
    LOGGER.get_or_try_init(|| install(cfg)).map(|_| ())
}

fn install(cfg: &LogConfig) -> Result<(), ConsumerError> {
    let console_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.console_level)
            .map_err(|e| ConsumerError::InvalidConfig(format!("console_level: {}", e)))?,
    };
    let console = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_filter(console_filter);

    let file = match &cfg.file {
        Some(path) => {
            let level = LevelFilter::from_str(&cfg.file_level)
                .map_err(|e| ConsumerError::InvalidConfig(format!("file_level: {}", e)))?;
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_thread_names(true)
                    .with_writer(Mutex::new(file))
                    .with_filter(level),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| ConsumerError::InvalidConfig(format!("logger already installed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_file_level() {
        let cfg = LogConfig {
            file: Some(PathBuf::from("unused.log")),
            file_level: "loud".to_string(),
            ..LogConfig::default()
        };
        assert!(matches!(install(&cfg), Err(ConsumerError::InvalidConfig(_))));
    }
}
