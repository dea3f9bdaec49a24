//! RelayMQ - MQTT v3.1/v3.1.1 broker
//!
//! The broker core (topic index, sessions, retained messages, dispatch)
//! knows listeners and hooks only through the [`listeners::Listener`] and
//! [`hooks::Hook`] traits.

pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod hooks;
pub mod listeners;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod topic;

pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use error::BrokerError;
pub use hooks::{ClientInfo, Hook, HookEvent, Hooks};
pub use listeners::Listener;
pub use protocol::{ProtocolVersion, QoS};
