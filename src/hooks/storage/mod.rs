//! Persistence hook backed by fjall.
//!
//! Keeps two partitions in one keyspace:
//! - `sessions`: persistent session snapshots keyed by client id
//! - `retained`: retained messages keyed by topic
//!
//! Values are encoded with bincode. State is loaded back through the
//! `StoredSessions` and `StoredRetainedMessages` events when the broker
//! starts serving.

mod models;

pub use models::{
    StoredInflight, StoredPublish, StoredRetainedMessage, StoredSession, StoredSubscription,
};

use std::any::Any;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tracing::{debug, info};

use super::{ClientInfo, Hook, HookError, HookEvent, HookResult};
use crate::error::BrokerError;
use crate::retained::{RetainAction, RetainedMessage};
use crate::session::SessionSnapshot;

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// Storage backend error
    Storage(String),
    /// Serialization error
    Serialize(String),
    /// Deserialization error
    Deserialize(String),
    /// The keyspace was not opened by `init`
    NotOpen,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Serialize(e) => write!(f, "serialization error: {}", e),
            Self::Deserialize(e) => write!(f, "deserialization error: {}", e),
            Self::NotOpen => write!(f, "storage not open"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<fjall::Error> for StorageError {
    fn from(err: fjall::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for StorageError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Serialize(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for StorageError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Deserialize(err.to_string())
    }
}

impl From<StorageError> for HookError {
    fn from(err: StorageError) -> Self {
        HookError::Internal(err.to_string())
    }
}

type Result<T> = std::result::Result<T, StorageError>;

/// Options for [`FjallStorage`]
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Directory of the keyspace
    pub path: PathBuf,
}

struct Db {
    keyspace: Keyspace,
    sessions: PartitionHandle,
    retained: PartitionHandle,
}

/// Fjall-based persistence hook
#[derive(Default)]
pub struct FjallStorage {
    db: Option<Db>,
}

impl FjallStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn db(&self) -> Result<&Db> {
        self.db.as_ref().ok_or(StorageError::NotOpen)
    }

    /// Serialize a value using bincode
    fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(StorageError::from)
    }

    /// Deserialize a value using bincode
    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(StorageError::from)
    }

    fn set_session(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let bytes = Self::serialize(&StoredSession::from(snapshot))?;
        self.db()?.sessions.insert(&snapshot.client_id, bytes)?;
        Ok(())
    }

    fn delete_session(&self, client_id: &str) -> Result<()> {
        self.db()?.sessions.remove(client_id)?;
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<SessionSnapshot>> {
        let mut result = Vec::new();
        for item in self.db()?.sessions.iter() {
            let (_, value) = item?;
            let session: StoredSession = Self::deserialize(&value)?;
            result.push(SessionSnapshot::from(session));
        }
        Ok(result)
    }

    fn set_retained(&self, message: &RetainedMessage) -> Result<()> {
        let bytes = Self::serialize(&StoredRetainedMessage::from(message))?;
        self.db()?.retained.insert(message.topic.as_bytes(), bytes)?;
        Ok(())
    }

    fn delete_retained(&self, topic: &str) -> Result<()> {
        self.db()?.retained.remove(topic)?;
        Ok(())
    }

    fn list_retained(&self) -> Result<Vec<RetainedMessage>> {
        let mut result = Vec::new();
        for item in self.db()?.retained.iter() {
            let (_, value) = item?;
            let message: StoredRetainedMessage = Self::deserialize(&value)?;
            result.push(RetainedMessage::from(message));
        }
        Ok(result)
    }

    fn flush(&self) -> Result<()> {
        self.db()?.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

#[async_trait]
impl Hook for FjallStorage {
    fn id(&self) -> &str {
        "fjall-storage"
    }

    fn provides(&self, event: HookEvent) -> bool {
        matches!(
            event,
            HookEvent::OnSessionPersist
                | HookEvent::OnDisconnect
                | HookEvent::OnClientExpired
                | HookEvent::OnRetainMessage
                | HookEvent::OnStopped
                | HookEvent::StoredSessions
                | HookEvent::StoredRetainedMessages
        )
    }

    fn init(&mut self, options: Option<&(dyn Any + Send + Sync)>) -> HookResult<()> {
        let options = options
            .and_then(|o| o.downcast_ref::<StorageOptions>())
            .ok_or_else(|| HookError::InvalidOptions("expected StorageOptions".into()))?;

        let keyspace = Config::new(&options.path)
            .open()
            .map_err(StorageError::from)?;
        let sessions = keyspace
            .open_partition("sessions", PartitionCreateOptions::default())
            .map_err(StorageError::from)?;
        let retained = keyspace
            .open_partition("retained", PartitionCreateOptions::default())
            .map_err(StorageError::from)?;

        info!(path = %options.path.display(), "storage opened");
        self.db = Some(Db {
            keyspace,
            sessions,
            retained,
        });
        Ok(())
    }

    async fn stop(&self) -> HookResult<()> {
        self.flush()?;
        Ok(())
    }

    async fn on_stopped(&self) -> HookResult<()> {
        self.flush()?;
        Ok(())
    }

    async fn on_session_persist(&self, snapshot: &SessionSnapshot) -> HookResult<()> {
        self.set_session(snapshot)?;
        Ok(())
    }

    async fn on_disconnect(
        &self,
        client: &ClientInfo,
        _error: Option<&BrokerError>,
        expire: bool,
    ) -> HookResult<()> {
        if expire {
            self.delete_session(&client.id)?;
        }
        Ok(())
    }

    async fn on_client_expired(&self, client_id: &str) -> HookResult<()> {
        self.delete_session(client_id)?;
        Ok(())
    }

    async fn on_retain_message(
        &self,
        message: &RetainedMessage,
        action: RetainAction,
    ) -> HookResult<()> {
        match action {
            RetainAction::Stored => self.set_retained(message)?,
            RetainAction::Cleared => self.delete_retained(&message.topic)?,
        }
        Ok(())
    }

    async fn stored_sessions(&self) -> HookResult<Vec<SessionSnapshot>> {
        let sessions = self.list_sessions()?;
        debug!(count = sessions.len(), "sessions loaded from storage");
        Ok(sessions)
    }

    async fn stored_retained_messages(&self) -> HookResult<Vec<RetainedMessage>> {
        let messages = self.list_retained()?;
        debug!(count = messages.len(), "retained messages loaded from storage");
        Ok(messages)
    }
}
