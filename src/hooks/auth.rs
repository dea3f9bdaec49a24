//! Authentication and ACL hooks
//!
//! - [`AllowHook`] lets every client connect, publish and subscribe.
//! - [`LedgerHook`] decides from a ledger of auth and ACL rules loaded from
//!   TOML or JSON. Passwords may be stored in plaintext or as argon2 PHC
//!   hashes.

use std::any::Any;
use std::path::Path;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{Access, ClientInfo, Hook, HookError, HookEvent, HookResult};
use crate::protocol::Connect;
use crate::topic::topic_matches_filter;

/// Hook that allows everything
#[derive(Debug, Default)]
pub struct AllowHook;

#[async_trait]
impl Hook for AllowHook {
    fn id(&self) -> &str {
        "allow-all-auth"
    }

    fn provides(&self, event: HookEvent) -> bool {
        matches!(event, HookEvent::OnConnectAuthenticate | HookEvent::OnAclCheck)
    }

    async fn on_connect_authenticate(&self, _client: &ClientInfo, _connect: &Connect) -> bool {
        true
    }

    async fn on_acl_check(&self, _client: &ClientInfo, _topic: &str, _access: Access) -> bool {
        true
    }
}

/// Access granted by an ACL filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Deny,
    Read,
    Write,
    ReadWrite,
}

impl Permission {
    fn allows(self, access: Access) -> bool {
        matches!(
            (self, access),
            (Permission::ReadWrite, _)
                | (Permission::Read, Access::Read)
                | (Permission::Write, Access::Write)
        )
    }
}

/// Authentication rule
#[derive(Debug, Clone, Deserialize)]
pub struct AuthRule {
    /// Username to match; any username when unset
    #[serde(default)]
    pub username: Option<String>,
    /// Client id to match; any client when unset
    #[serde(default)]
    pub client: Option<String>,
    /// Plaintext password
    #[serde(default)]
    pub password: Option<String>,
    /// Password hash (argon2 PHC format: $argon2id$v=19$...)
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default = "default_allow")]
    pub allow: bool,
}

fn default_allow() -> bool {
    true
}

/// One topic filter of an ACL rule
#[derive(Debug, Clone, Deserialize)]
pub struct AclFilter {
    pub filter: String,
    pub access: Permission,
}

/// ACL rule
#[derive(Debug, Clone, Deserialize)]
pub struct AclRule {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub filters: Vec<AclFilter>,
}

/// Ordered auth and ACL rules
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ledger {
    #[serde(default)]
    pub auth: Vec<AuthRule>,
    #[serde(default)]
    pub acl: Vec<AclRule>,
}

fn matches_client(
    username: &Option<String>,
    client: &Option<String>,
    info: &ClientInfo,
    connect_username: Option<&str>,
) -> bool {
    let username_ok = match username {
        Some(expected) => connect_username == Some(expected.as_str()),
        None => true,
    };
    let client_ok = match client {
        Some(expected) => info.id.as_ref() == expected.as_str(),
        None => true,
    };
    username_ok && client_ok
}

impl Ledger {
    /// Parse a ledger from TOML, or JSON when the data starts with `{`
    pub fn parse(data: &str) -> HookResult<Self> {
        let ledger = if data.trim_start().starts_with('{') {
            serde_json::from_str(data).map_err(|e| HookError::InvalidOptions(e.to_string()))?
        } else {
            toml::from_str(data).map_err(|e| HookError::InvalidOptions(e.to_string()))?
        };
        Ok(ledger)
    }

    /// Read and parse a ledger file
    pub fn load(path: impl AsRef<Path>) -> HookResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            HookError::InvalidOptions(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&data)
    }

    fn validate(&self) -> HookResult<()> {
        for rule in &self.auth {
            if let Some(hash) = &rule.password_hash {
                PasswordHash::new(hash).map_err(|e| {
                    HookError::InvalidOptions(format!("invalid password_hash: {}", e))
                })?;
            }
        }
        Ok(())
    }

    /// The first rule matching the client decides
    pub fn authenticate(&self, client: &ClientInfo, connect: &Connect) -> bool {
        let username = connect.username.as_deref();
        let Some(rule) = self
            .auth
            .iter()
            .find(|r| matches_client(&r.username, &r.client, client, username))
        else {
            return false;
        };

        if !rule.allow {
            return false;
        }

        let password = connect.password.as_deref().unwrap_or_default();
        match (&rule.password, &rule.password_hash) {
            (Some(expected), _) => expected.as_bytes() == password,
            (None, Some(hash)) => verify_hash(password, hash),
            (None, None) => true,
        }
    }

    /// The first filter matching the topic, in the first rule having one, decides
    pub fn check_acl(&self, client: &ClientInfo, topic: &str, access: Access) -> bool {
        let username = client.username.as_deref();
        self.acl
            .iter()
            .filter(|r| matches_client(&r.username, &r.client, client, username))
            .find_map(|r| {
                r.filters
                    .iter()
                    .find(|f| topic_matches_filter(topic, &f.filter))
            })
            .is_some_and(|f| f.access.allows(access))
    }
}

fn verify_hash(password: &[u8], hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password, &parsed).is_ok(),
        Err(_) => false,
    }
}

/// Options for [`LedgerHook`]
#[derive(Debug, Clone, Default)]
pub struct LedgerOptions {
    /// Ready-made ledger
    pub ledger: Option<Ledger>,
    /// Raw TOML or JSON, used when `ledger` is unset
    pub data: Option<String>,
}

/// Hook deciding authentication and ACL from a [`Ledger`]
#[derive(Debug, Default)]
pub struct LedgerHook {
    ledger: Ledger,
}

impl LedgerHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }
}

#[async_trait]
impl Hook for LedgerHook {
    fn id(&self) -> &str {
        "ledger-auth"
    }

    fn provides(&self, event: HookEvent) -> bool {
        matches!(event, HookEvent::OnConnectAuthenticate | HookEvent::OnAclCheck)
    }

    fn init(&mut self, options: Option<&(dyn Any + Send + Sync)>) -> HookResult<()> {
        let options = options
            .and_then(|o| o.downcast_ref::<LedgerOptions>())
            .ok_or_else(|| HookError::InvalidOptions("expected LedgerOptions".into()))?;

        let ledger = match (&options.ledger, &options.data) {
            (Some(ledger), _) => ledger.clone(),
            (None, Some(data)) => Ledger::parse(data)?,
            (None, None) => return Err(HookError::InvalidOptions("no ledger given".into())),
        };
        ledger.validate()?;

        debug!(
            auth_rules = ledger.auth.len(),
            acl_rules = ledger.acl.len(),
            "ledger loaded"
        );
        self.ledger = ledger;
        Ok(())
    }

    async fn on_connect_authenticate(&self, client: &ClientInfo, connect: &Connect) -> bool {
        self.ledger.authenticate(client, connect)
    }

    async fn on_acl_check(&self, client: &ClientInfo, topic: &str, access: Access) -> bool {
        self.ledger.check_acl(client, topic, access)
    }
}
