//! Broker error taxonomy

use std::fmt;
use std::io;

use crate::protocol::{DecodeError, EncodeError};

/// Errors raised by the broker engine
#[derive(Debug)]
pub enum BrokerError {
    /// The peer broke the protocol; the connection is closed immediately
    ProtocolViolation(String),
    /// CONNECT refused by the authentication hooks
    AuthenticationRejected,
    /// PUBLISH or SUBSCRIBE refused by the ACL hooks
    AclRejected,
    /// No free packet id for an outbound QoS 1/2 message
    IdSpaceExhausted,
    /// A hook returned an error or panicked
    HookFailure(String),
    /// A listener could not bind its address
    ListenerBindFailure { listener: String, source: io::Error },
    /// Socket read or write failed
    Transport(io::Error),
    /// No CONNECT within the connect timeout
    ConnectTimeout,
    /// Nothing received within 1.5 times the keep-alive interval
    KeepAliveTimeout,
    /// Another connection with the same client id took the session
    SessionTakenOver,
    /// The broker is shutting down
    ServerClosing,
    /// A listener with this id is already registered
    DuplicateListener(String),
    /// Invalid broker configuration
    Config(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            BrokerError::AuthenticationRejected => write!(f, "authentication rejected"),
            BrokerError::AclRejected => write!(f, "rejected by acl"),
            BrokerError::IdSpaceExhausted => write!(f, "packet id space exhausted"),
            BrokerError::HookFailure(msg) => write!(f, "hook failure: {}", msg),
            BrokerError::ListenerBindFailure { listener, source } => {
                write!(f, "listener {} failed to bind: {}", listener, source)
            }
            BrokerError::Transport(e) => write!(f, "transport error: {}", e),
            BrokerError::ConnectTimeout => write!(f, "connect timeout"),
            BrokerError::KeepAliveTimeout => write!(f, "keep alive timeout"),
            BrokerError::SessionTakenOver => write!(f, "session taken over"),
            BrokerError::ServerClosing => write!(f, "server closing"),
            BrokerError::DuplicateListener(id) => write!(f, "listener {} already exists", id),
            BrokerError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::ListenerBindFailure { source, .. } => Some(source),
            BrokerError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for BrokerError {
    fn from(e: io::Error) -> Self {
        BrokerError::Transport(e)
    }
}

impl From<DecodeError> for BrokerError {
    fn from(e: DecodeError) -> Self {
        BrokerError::ProtocolViolation(e.to_string())
    }
}

impl From<EncodeError> for BrokerError {
    fn from(e: EncodeError) -> Self {
        BrokerError::ProtocolViolation(e.to_string())
    }
}

