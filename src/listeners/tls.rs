//! TLS listener
//!
//! Certificates and keys are loaded from PEM files once, when the listener
//! is built. The handshake runs on the connection's own task.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use super::tcp::bind;
use super::{log_establish_error, CloseFn, CloseSignal, EstablishFn, Listener};
use crate::config::TlsConfig;
use crate::error::BrokerError;

/// Error type for TLS configuration
#[derive(Debug)]
pub enum TlsError {
    /// IO error reading files
    Io(std::io::Error),
    /// Certificate parsing error
    CertificateError(String),
    /// Private key error
    PrivateKeyError(String),
    /// TLS configuration error
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {}", e),
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKeyError(msg) => write!(f, "Private key error: {}", msg),
            TlsError::ConfigError(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

/// Load certificates from a PEM file
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(format!(
            "No certificates found in {}",
            path
        )));
    }

    Ok(certs)
}

/// Load private key from a PEM file
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    PrivateKeyDer::from_pem_reader(reader)
        .map_err(|e| TlsError::PrivateKeyError(format!("Failed to parse private key: {}", e)))
}

/// Load CA certificates into a root store
fn load_ca_certs(path: &str) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();
    let certs = load_certs(path)?;

    for cert in certs {
        root_store.add(cert).map_err(|e| {
            TlsError::CertificateError(format!("Failed to add CA certificate: {}", e))
        })?;
    }

    Ok(root_store)
}

fn client_verifier(
    ca_path: &str,
    allow_unauthenticated: bool,
) -> Result<Arc<dyn tokio_rustls::rustls::server::danger::ClientCertVerifier>, TlsError> {
    let root_store = load_ca_certs(ca_path)?;
    let builder = WebPkiClientVerifier::builder(Arc::new(root_store));
    let builder = if allow_unauthenticated {
        builder.allow_unauthenticated()
    } else {
        builder
    };
    builder
        .build()
        .map_err(|e| TlsError::ConfigError(format!("Failed to build client verifier: {}", e)))
}

/// Build an acceptor from the listener's TLS section
pub fn load_tls_config(config: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    let builder = ServerConfig::builder();
    let builder = if config.require_client_cert {
        let ca_path = config.ca_cert_path.as_ref().ok_or_else(|| {
            TlsError::ConfigError(
                "ca_cert_path is required when require_client_cert is true".to_string(),
            )
        })?;

        builder.with_client_cert_verifier(client_verifier(ca_path, false)?)
    } else if let Some(ca_path) = &config.ca_cert_path {
        // Verify a client certificate when one is presented
        builder.with_client_cert_verifier(client_verifier(ca_path, true)?)
    } else {
        builder.with_no_client_auth()
    };

    let server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::ConfigError(format!("Failed to build TLS config: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

pub struct TlsListener {
    id: String,
    address: String,
    acceptor: TlsAcceptor,
    listener: Mutex<Option<tokio::net::TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    signal: CloseSignal,
}

impl TlsListener {
    pub fn new(id: impl Into<String>, address: impl Into<String>, acceptor: TlsAcceptor) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            acceptor,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            signal: CloseSignal::new(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

#[async_trait]
impl Listener for TlsListener {
    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> String {
        match self.local_addr() {
            Some(addr) => addr.to_string(),
            None => self.address.clone(),
        }
    }

    fn protocol(&self) -> &str {
        "tls"
    }

    async fn init(&self) -> Result<(), BrokerError> {
        let listener = bind(&self.id, &self.address).await?;
        *self.local_addr.lock() = listener.local_addr().ok();
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    async fn serve(&self, establish: EstablishFn) {
        let Some(listener) = self.listener.lock().take() else {
            warn!(listener = %self.id, "serve called without a bound socket");
            return;
        };
        let id: Arc<str> = Arc::from(self.id.as_str());

        loop {
            tokio::select! {
                biased;

                _ = self.signal.closed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if self.signal.is_closed() {
                            break;
                        }
                        let _ = stream.set_nodelay(true);
                        let acceptor = self.acceptor.clone();
                        let establish = establish.clone();
                        let id = id.clone();
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls) => {
                                    let remote = addr.to_string();
                                    if let Err(e) = establish(id.clone(), Box::new(tls), remote).await {
                                        log_establish_error(&id, &e);
                                    }
                                }
                                Err(e) => debug!(
                                    listener = %id,
                                    remote = %addr,
                                    error = %e,
                                    "tls handshake failed"
                                ),
                            }
                        });
                    }
                    Err(e) => warn!(listener = %self.id, error = %e, "accept failed"),
                },
            }
        }
    }

    fn close(&self, close_clients: CloseFn) {
        if self.signal.close() {
            self.listener.lock().take();
            close_clients(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cert_file_is_io_error() {
        let config = TlsConfig {
            cert_path: "/nonexistent/server.crt".into(),
            key_path: "/nonexistent/server.key".into(),
            ca_cert_path: None,
            require_client_cert: false,
        };
        assert!(matches!(load_tls_config(&config), Err(TlsError::Io(_))));
    }

    #[test]
    fn test_empty_cert_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("empty.crt");
        std::fs::write(&cert, b"").unwrap();
        let result = load_certs(cert.to_str().unwrap());
        assert!(matches!(result, Err(TlsError::CertificateError(_))));
    }

    #[test]
    fn test_tls_error_display() {
        let err = TlsError::CertificateError("test error".to_string());
        assert!(err.to_string().contains("Certificate error"));

        let err = TlsError::PrivateKeyError("key error".to_string());
        assert!(err.to_string().contains("Private key error"));

        let err = TlsError::ConfigError("config error".to_string());
        assert!(err.to_string().contains("TLS config error"));
    }
}
