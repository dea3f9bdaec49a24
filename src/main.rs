//! RelayMQ - MQTT v3.1/v3.1.1 broker
//!
//! Usage:
//!   relaymq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      Address of the default TCP listener
//!   --ledger <FILE>        Credential ledger (enables ledger auth)
//!   --data-dir <DIR>       Enable persistence in this directory
//!   --max-packet-size <N>  Maximum packet size
//!   --max-qos <N>          Maximum granted QoS
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use relaymq::broker::Broker;
use relaymq::config::{AuthMode, Config, ListenerConfig, ListenerProtocol};
use relaymq::hooks::auth::{AllowHook, Ledger, LedgerHook, LedgerOptions};
use relaymq::hooks::debug::{DebugHook, DebugOptions};
use relaymq::hooks::storage::{FjallStorage, StorageOptions};
use relaymq::listeners;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// RelayMQ - MQTT broker
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(version)]
#[command(about = "MQTT v3.1/v3.1.1 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address of the TCP listener "tcp", replacing its configured address
    #[arg(short, long)]
    bind: Option<String>,

    /// Credential ledger file (TOML or JSON); switches to ledger auth
    #[arg(long)]
    ledger: Option<String>,

    /// Directory for persisted sessions and retained messages
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Maximum QoS level (0, 1, or 2)
    #[arg(long)]
    max_qos: Option<u8>,

    /// Log every hook event at debug level
    #[arg(long)]
    debug_hooks: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    /// CLI flags override file values
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            match config.listeners.iter_mut().find(|l| l.id == "tcp") {
                Some(listener) => listener.address = bind.clone(),
                None => config.listeners.push(ListenerConfig {
                    id: "tcp".to_string(),
                    protocol: ListenerProtocol::Tcp,
                    address: bind.clone(),
                    ..Default::default()
                }),
            }
        }
        if let Some(ledger) = &self.ledger {
            config.auth.mode = AuthMode::Ledger;
            config.auth.ledger = Some(ledger.clone());
        }
        if let Some(dir) = &self.data_dir {
            config.persistence.enabled = true;
            config.persistence.path = dir.clone();
        }
        if let Some(size) = self.max_packet_size {
            config.limits.max_packet_size = size;
        }
        if let Some(qos) = self.max_qos {
            config.mqtt.max_qos = qos;
        }
        if self.debug_hooks {
            config.debug.enabled = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::from_env()?,
    };
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // RUST_LOG wins over the CLI, the CLI over the config file
    let level = args
        .log_level
        .map(LogLevel::as_str)
        .unwrap_or(config.log.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let broker_config = config.to_broker_config();
    info!("Starting RelayMQ MQTT Broker");
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!("  Max QoS: {:?}", broker_config.max_qos);
    info!("  Max in-flight: {}", broker_config.max_inflight);
    match broker_config.session_expiry {
        Some(expiry) => info!("  Session expiry: {:?}", expiry),
        None => info!("  Session expiry: never"),
    }

    let broker = Arc::new(Broker::new(broker_config));

    match (config.auth.mode, config.auth.ledger.as_deref()) {
        (AuthMode::Ledger, Some(path)) => {
            let ledger = Ledger::load(path)?;
            info!(
                "  Authentication: ledger {} ({} auth rules, {} acl rules)",
                path,
                ledger.auth.len(),
                ledger.acl.len()
            );
            let options = LedgerOptions {
                ledger: Some(ledger),
                data: None,
            };
            broker.add_hook(LedgerHook::new(), Some(&options))?;
        }
        _ => {
            info!("  Authentication: allow all");
            broker.add_hook(AllowHook, None)?;
        }
    }

    if config.debug.enabled {
        let options = DebugOptions {
            show_payloads: config.debug.show_payloads,
        };
        broker.add_hook(DebugHook::new(), Some(&options))?;
        info!("  Debug hook: enabled");
    }

    if config.persistence.enabled {
        let options = StorageOptions {
            path: config.persistence.path.clone(),
        };
        broker.add_hook(FjallStorage::new(), Some(&options))?;
        info!("  Persistence: {}", config.persistence.path.display());
    } else {
        info!("  Persistence: disabled");
    }

    for listener_config in &config.listeners {
        let listener = listeners::from_config(listener_config)?;
        broker.add_listener(listener).await?;
    }

    broker.serve().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
    broker.close().await;

    Ok(())
}
