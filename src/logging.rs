//! Tracing subscriber setup
//!
//! Console output always goes through a fmt layer filtered by `RUST_LOG` (or
//! the configured default filter). When `log_dir` is set, a daily rolling file
//! is written as well; keep the returned guard alive for as long as logs
//! should be flushed.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "info,nodexec=debug";

/// Log file prefix inside `log_dir`
pub const LOG_FILE_PREFIX: &str = "nodexec.log";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Optional directory for rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_filter() -> String {
    DEFAULT_FILTER.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            log_dir: None,
        }
    }
}

/// Install the global subscriber
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter))
    };

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let installed = tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .try_init()
                .is_ok();
            installed.then_some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer())
                .try_init();
            None
        }
    }
}
