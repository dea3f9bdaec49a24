//! Listener configuration.

use serde::Deserialize;

use super::ConfigError;

/// Transport of a listener
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProtocol {
    #[default]
    Tcp,
    Tls,
    #[serde(rename = "ws")]
    Websocket,
    Unix,
}

/// One `[[listeners]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Unique listener id
    pub id: String,
    #[serde(rename = "type", default)]
    pub protocol: ListenerProtocol,
    /// `host:port`, or the socket path for unix listeners
    pub address: String,
    /// Certificates, required for tls listeners
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// HTTP path of the WebSocket upgrade
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

fn default_ws_path() -> String {
    "/mqtt".to_string()
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            id: "tcp".to_string(),
            protocol: ListenerProtocol::Tcp,
            address: "0.0.0.0:1883".to_string(),
            tls: None,
            ws_path: default_ws_path(),
        }
    }
}

impl ListenerConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::Validation("listener id must not be empty".to_string()));
        }
        if self.address.is_empty() {
            return Err(ConfigError::Validation(format!(
                "listener '{}' has no address",
                self.id
            )));
        }

        match (&self.protocol, &self.tls) {
            (ListenerProtocol::Tls, None) => Err(ConfigError::Validation(format!(
                "listener '{}': tls section is required for tls listeners",
                self.id
            ))),
            (ListenerProtocol::Tls, Some(tls))
                if tls.cert_path.is_empty() || tls.key_path.is_empty() =>
            {
                Err(ConfigError::Validation(format!(
                    "listener '{}': tls.cert and tls.key are required",
                    self.id
                )))
            }
            (ListenerProtocol::Websocket, _) if !self.ws_path.starts_with('/') => {
                Err(ConfigError::Validation(format!(
                    "listener '{}': ws_path must start with '/'",
                    self.id
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Server certificates of a tls listener (PEM files)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsConfig {
    /// Certificate chain
    #[serde(rename = "cert")]
    pub cert_path: String,
    /// Private key
    #[serde(rename = "key")]
    pub key_path: String,
    /// CA for client certificates
    #[serde(rename = "ca_cert", default)]
    pub ca_cert_path: Option<String>,
    /// Reject clients without a valid certificate
    #[serde(default)]
    pub require_client_cert: bool,
}
