//! Configuration Module
//!
//! TOML configuration for RelayMQ:
//! - Listeners (tcp, tls, ws, unix)
//! - Session and in-flight limits
//! - MQTT feature flags
//! - Authentication mode and credential ledger
//! - Debug logging and persistence hooks
//! - Environment variable overrides (RELAYMQ__* prefix)

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use listeners::{ListenerConfig, ListenerProtocol, TlsConfig};
pub use persistence::PersistenceConfig;

use crate::broker::BrokerConfig;
use crate::protocol::QoS;

mod listeners;
mod persistence;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    let substituted = re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    });
    Ok(substituted.into_owned())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Network listeners
    pub listeners: Vec<ListenerConfig>,
    /// Per-session and per-connection limits
    pub limits: LimitsConfig,
    /// Session lifetime and retry timing
    pub session: SessionConfig,
    /// MQTT feature configuration
    pub mqtt: MqttConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Debug hook
    pub debug: DebugConfig,
    /// Storage hook
    pub persistence: PersistenceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            listeners: vec![ListenerConfig::default()],
            limits: LimitsConfig::default(),
            session: SessionConfig::default(),
            mqtt: MqttConfig::default(),
            auth: AuthConfig::default(),
            debug: DebugConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Connection and session limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum packet size in bytes
    pub max_packet_size: usize,
    /// Outbound QoS 1/2 packet ids in use per session (0 = 65535)
    pub max_inflight: u16,
    /// Queued messages per session (0 = never queue)
    pub max_queued_messages: usize,
    /// Inbound QoS 2 exchanges awaiting PUBREL (0 = unbounded)
    pub max_awaiting_rel: usize,
    /// Per-connection outbound packet queue capacity
    pub outbound_channel_capacity: usize,
    /// Time allowed between accept and CONNECT
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let broker = BrokerConfig::default();
        Self {
            max_packet_size: broker.max_packet_size,
            max_inflight: broker.max_inflight,
            max_queued_messages: broker.max_queued_messages,
            max_awaiting_rel: broker.max_awaiting_rel,
            outbound_channel_capacity: broker.outbound_capacity,
            connect_timeout: broker.connect_timeout,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a disconnected persistent session is kept; unset keeps it
    /// until the next clean connect
    #[serde(with = "humantime_serde")]
    pub expiry: Option<Duration>,
    /// How often sessions are checked for expiry
    #[serde(with = "humantime_serde")]
    pub expiry_check_interval: Duration,
    /// Force the clean session flag of every CONNECT
    pub clean_session_default: Option<bool>,
    /// Base delay before an unacknowledged message is resent
    #[serde(with = "humantime_serde")]
    pub inflight_ttl: Duration,
    /// Upper bound of the retry backoff
    #[serde(with = "humantime_serde")]
    pub max_retry_backoff: Duration,
    /// How often in-flight tables are scanned
    #[serde(with = "humantime_serde")]
    pub retry_check_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let broker = BrokerConfig::default();
        Self {
            expiry: broker.session_expiry,
            expiry_check_interval: broker.expiry_check_interval,
            clean_session_default: broker.clean_session_default,
            inflight_ttl: broker.inflight_ttl,
            max_retry_backoff: broker.max_retry_backoff,
            retry_check_interval: broker.retry_check_interval,
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level granted to subscriptions (0, 1, or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
    /// Whether retained messages are stored
    #[serde(default = "default_true")]
    pub retain_available: bool,
}

fn default_max_qos() -> u8 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
            retain_available: true,
        }
    }
}

/// How clients are authenticated and authorised
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Every client may connect and access every topic
    #[default]
    AllowAll,
    /// Rules from a credential ledger file
    Ledger,
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Ledger file (TOML or JSON), required in ledger mode
    pub ledger: Option<String>,
}

/// Debug hook configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DebugConfig {
    /// Log every hook event at debug level
    pub enabled: bool,
    /// Include message payloads in the log
    pub show_payloads: bool,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `RELAYMQ__` prefix with double underscores for nesting:
    ///    - `RELAYMQ__LIMITS__MAX_INFLIGHT=64` overrides `limits.max_inflight`
    ///    - `RELAYMQ__AUTH__MODE=ledger` overrides `auth.mode`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?
            .set_default("auth.mode", "allow_all")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // No file: defaults and environment only
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore is kept
        let cfg = builder
            .add_source(
                Environment::with_prefix("RELAYMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration from defaults and environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }

        if self.limits.outbound_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "outbound_channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.limits.connect_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "connect_timeout must be greater than 0".to_string(),
            ));
        }

        if self.session.retry_check_interval.is_zero()
            || self.session.expiry_check_interval.is_zero()
        {
            return Err(ConfigError::Validation(
                "check intervals must be greater than 0".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for listener in &self.listeners {
            listener.validate()?;
            if !ids.insert(listener.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate listener id '{}'",
                    listener.id
                )));
            }
        }

        if self.auth.mode == AuthMode::Ledger
            && self.auth.ledger.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::Validation(
                "auth.ledger is required when auth.mode is ledger".to_string(),
            ));
        }

        if self.persistence.enabled && self.persistence.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "persistence.path is required when persistence is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Broker settings derived from the limits, session and mqtt sections
    pub fn to_broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            inflight_ttl: self.session.inflight_ttl,
            max_retry_backoff: self.session.max_retry_backoff,
            max_inflight: self.limits.max_inflight,
            max_queued_messages: self.limits.max_queued_messages,
            max_awaiting_rel: self.limits.max_awaiting_rel,
            max_qos: QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            clean_session_default: self.session.clean_session_default,
            session_expiry: self.session.expiry,
            retain_available: self.mqtt.retain_available,
            outbound_capacity: self.limits.outbound_channel_capacity,
            max_packet_size: self.limits.max_packet_size,
            connect_timeout: self.limits.connect_timeout,
            retry_check_interval: self.session.retry_check_interval,
            expiry_check_interval: self.session.expiry_check_interval,
        }
    }
}
