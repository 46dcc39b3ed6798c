//! ---
//! hive_section: "05-networking-external-interfaces"
//! hive_subsection: "binary"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Operator CLI for publishing to and listening on the message bus."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use hive_bus::config::{ENV_CLIENT_ID, ENV_EXCHANGE, ENV_RECONNECT_MS, ENV_URL};
use hive_bus::{BusConfig, ConnectionState, MessageBus};
use hive_common::{LogFormat, LoggingConfig, Validate};
use tokio::signal;
use tracing::{info, warn};

mod listen;
mod publish;

const CONFIG_ENV: &str = "HIVE_BUS_CONFIG";
const CONFIG_CANDIDATES: [&str; 2] = ["hive-bus.toml", "/etc/hive/bus.toml"];

#[derive(Debug, Parser)]
#[command(author, version, about = "Hive message bus operator utility", long_about = None)]
struct Cli {
    #[command(flatten)]
    bus: BusArgs,
    #[command(flatten)]
    logging: LogArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Publish a single envelope and print it as sent.
    Publish(publish::PublishCommand),
    /// Print every inbound envelope as one JSON line until interrupted.
    Listen(listen::ListenCommand),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    StructuredJson,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::StructuredJson => LogFormat::StructuredJson,
        }
    }
}

#[derive(Debug, Args)]
struct LogArgs {
    /// Also write daily rolling JSON logs to this directory.
    #[arg(long = "log-dir", global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Format of the stderr log layer; enables structured logging when set.
    #[arg(long = "log-format", global = true, value_enum)]
    log_format: Option<LogFormatArg>,
}

impl LogArgs {
    fn init(&self) -> Result<()> {
        if self.log_dir.is_none() && self.log_format.is_none() {
            hive_common::init();
            return Ok(());
        }
        let config = LoggingConfig {
            directory: self.log_dir.clone(),
            format: self.log_format.map(LogFormat::from).unwrap_or_default(),
            file_prefix: None,
            stderr: true,
        };
        hive_common::init_tracing("hive-busctl", &config)
    }
}

/// Connection flags shared by every subcommand. Flags beat the config file.
#[derive(Debug, Args)]
pub struct BusArgs {
    /// TOML bus configuration file. Without it `hive-bus.toml`,
    /// `/etc/hive/bus.toml` or `$HIVE_BUS_CONFIG` are tried unless both
    /// `--url` and `--client-id` are given.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL.
    #[arg(long, global = true, value_name = "URL", env = ENV_URL)]
    url: Option<String>,

    /// Topic exchange name.
    #[arg(long, global = true, value_name = "NAME", env = ENV_EXCHANGE)]
    exchange: Option<String>,

    /// Client identifier for this process.
    #[arg(long = "client-id", global = true, value_name = "ID", env = ENV_CLIENT_ID)]
    client_id: Option<String>,

    /// Reconnect interval in milliseconds.
    #[arg(long = "reconnect-ms", global = true, value_name = "MS", env = ENV_RECONNECT_MS)]
    reconnect_ms: Option<u64>,

    /// How long to wait for the first connection, in milliseconds.
    #[arg(long = "connect-timeout", global = true, value_name = "MS", default_value_t = 5_000)]
    connect_timeout_ms: u64,
}

impl BusArgs {
    /// Merge the config file (if any) with flag and environment overrides.
    pub fn resolve(&self) -> Result<BusConfig> {
        let mut config = match (&self.config, &self.url, &self.client_id) {
            (Some(path), _, _) => BusConfig::from_path(path)
                .with_context(|| format!("loading bus config {}", path.display()))?,
            (None, Some(url), Some(client_id)) => BusConfig::new(url.clone(), client_id.clone()),
            (None, _, _) => {
                let loaded = hive_common::load_with_source::<BusConfig, _>(
                    &CONFIG_CANDIDATES,
                    CONFIG_ENV,
                )
                .with_context(|| {
                    format!(
                        "no bus configuration: pass --url ({ENV_URL}) and --client-id \
                         ({ENV_CLIENT_ID}), or --config"
                    )
                })?;
                info!(source = %loaded.source.display(), "bus configuration loaded");
                loaded.config
            }
        };
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(client_id) = &self.client_id {
            config.client_id = client_id.clone();
        }
        if let Some(exchange) = &self.exchange {
            config.exchange = exchange.clone();
        }
        if let Some(ms) = self.reconnect_ms {
            config.reconnect_interval = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Connect `bus` and wait until it is connected or `limit` passes.
pub async fn connect_within(bus: &MessageBus, limit: Duration) -> Result<()> {
    if bus.connect().await? != ConnectionState::Connected {
        tokio::time::timeout(limit, bus.wait_for_state(ConnectionState::Connected))
            .await
            .map_err(|_| {
                anyhow!(
                    "could not connect to {} within {} ms",
                    bus.config().url,
                    limit.as_millis()
                )
            })??;
    }
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.init()?;
    match cli.command {
        Commands::Publish(cmd) => cmd.execute(&cli.bus).await?,
        Commands::Listen(cmd) => cmd.execute(&cli.bus).await?,
    }
    Ok(())
}
