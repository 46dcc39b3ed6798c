//! ---
//! hive_section: "01-core-functionality"
//! hive_subsection: "module"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Shared primitives and utilities for Hive components."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "HIVE_LOG";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static CONSOLE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Output formats for the stdout layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
}

/// Install a baseline subscriber for command line tools and tests.
pub fn init() {
    let _ = Registry::default()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn env_filter() -> EnvFilter {
    filter_from(std::env::var(LOG_ENV).ok(), std::env::var("RUST_LOG").ok())
}

/// `HIVE_LOG` wins over `RUST_LOG`; an unset or invalid directive means `info`.
fn filter_from(hive_log: Option<String>, rust_log: Option<String>) -> EnvFilter {
    if let Some(directive) = hive_log {
        match EnvFilter::try_new(&directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!(
                "invalid {} directive ({}); defaulting to info logging",
                LOG_ENV, err
            ),
        }
        return EnvFilter::new("info");
    }
    rust_log
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Initialise the tracing subscriber for a long-running process.
///
/// * `HIVE_LOG` overrides the filter (e.g. `info`, `debug,hive_bus=trace`).
///   When unset `RUST_LOG` is honoured, defaulting to `info`.
/// * When `config.directory` is set a daily rolling JSON file is written
///   alongside the console layer.
/// * The console layer goes to stderr when `config.stderr` is set.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let (console_writer, console_guard) = if config.stderr {
        tracing_appender::non_blocking(std::io::stderr())
    } else {
        tracing_appender::non_blocking(std::io::stdout())
    };
    let _ = CONSOLE_GUARD.set(console_guard);

    let filter = env_filter();

    let fmt_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(console_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(console_writer)
            .boxed(),
    };

    let file_layer = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let prefix = config
                .file_prefix
                .clone()
                .unwrap_or_else(|| service_name.to_owned());
            let file_appender = daily(directory, format!("{}.log", prefix));
            let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
            let _ = FILE_GUARD.set(file_guard);
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .json()
                    .with_writer(file_writer)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(service = %service_name, log_dir = ?config.directory, format = ?config.format, "tracing initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
        tracing::info!(client_id = "discord", "logging after repeated init");
    }

    #[test]
    fn rust_log_level_is_honoured() {
        let filter = filter_from(None, Some("debug".into()));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn hive_log_wins_and_defaults_to_info() {
        let filter = filter_from(Some("warn".into()), Some("debug".into()));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::WARN));
        assert_eq!(
            filter_from(None, None).max_level_hint(),
            Some(LevelFilter::INFO)
        );
        assert_eq!(
            filter_from(Some("hive_bus=loud".into()), None).max_level_hint(),
            Some(LevelFilter::INFO)
        );
    }

    #[test]
    fn init_tracing_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let config = LoggingConfig {
            directory: Some(logs.clone()),
            format: LogFormat::StructuredJson,
            file_prefix: Some("bus".into()),
            stderr: true,
        };
        init_tracing("hive-bus-test", &config).unwrap();
        assert!(logs.is_dir());
    }
}
