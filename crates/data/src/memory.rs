//! In-memory collaborators for development (`--dev-tokens`) and tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, RwLock};
use tradelink_core::{
    AuditSink, AuthError, AuthService, CommandRecord, MagicKey, OwnershipStore, StoreError,
    TokenInfo, UserId,
};

const DEFAULT_TOKEN_HOURS: i64 = 24;

/// Tokens and magic key ownership held in memory. Implements both
/// [`AuthService`] and [`OwnershipStore`].
#[derive(Default)]
pub struct MemoryDirectory {
    tokens: RwLock<HashMap<String, TokenInfo>>,
    keys: RwLock<HashMap<UserId, BTreeSet<MagicKey>>>,
}

/// Dev-tokens file layout.
#[derive(Debug, Deserialize)]
struct DevTokens {
    #[serde(default)]
    users: Vec<DevUser>,
}

#[derive(Debug, Deserialize)]
struct DevUser {
    id: String,
    #[serde(default)]
    tokens: Vec<String>,
    #[serde(default)]
    magic_keys: Vec<String>,
    expires_in_hours: Option<i64>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user owning `keys`, with `token` valid for the next day.
    pub fn with_user(self, token: &str, user: &str, keys: &[&str]) -> Self {
        let user = UserId::new(user);
        self.insert_token(token, user.clone(), Utc::now() + Duration::hours(DEFAULT_TOKEN_HOURS));
        self.grant(&user, keys.iter().map(|k| MagicKey::new(*k)));
        self
    }

    pub fn insert_token(&self, token: &str, user: UserId, expires_at: DateTime<Utc>) {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.insert(
            token.to_string(),
            TokenInfo {
                user_id: user,
                expires_at,
            },
        );
    }

    pub fn grant(&self, user: &UserId, keys: impl IntoIterator<Item = MagicKey>) {
        let mut owned = self.keys.write().unwrap_or_else(|e| e.into_inner());
        owned.entry(user.clone()).or_default().extend(keys);
    }

    /// Parse a dev-tokens TOML document:
    ///
    /// ```toml
    /// [[users]]
    /// id = "alice"
    /// tokens = ["dev-alice"]
    /// magic_keys = ["K1", "K2"]
    /// expires_in_hours = 72
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        let file: DevTokens = toml::from_str(text)?;
        let directory = Self::new();
        let now = Utc::now();
        for user in file.users {
            let id = UserId::new(user.id);
            let hours = user.expires_in_hours.unwrap_or(DEFAULT_TOKEN_HOURS);
            for token in &user.tokens {
                directory.insert_token(token, id.clone(), now + Duration::hours(hours));
            }
            directory.grant(&id, user.magic_keys.into_iter().map(MagicKey::new));
        }
        Ok(directory)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&text)?)
    }

    pub fn token_count(&self) -> usize {
        self.tokens.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl AuthService for MemoryDirectory {
    async fn validate(&self, token: &str) -> Result<TokenInfo, AuthError> {
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        let info = tokens.get(token).cloned().ok_or(AuthError::InvalidToken)?;
        if info.expires_at <= Utc::now() {
            return Err(AuthError::ExpiredToken);
        }
        Ok(info)
    }

    async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token);
        Ok(())
    }
}

#[async_trait]
impl OwnershipStore for MemoryDirectory {
    async fn magic_keys_for(&self, user_id: &UserId) -> Result<BTreeSet<MagicKey>, StoreError> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        Ok(keys.get(user_id).cloned().unwrap_or_default())
    }
}

/// Audit sink that keeps every record, for inspection in tests.
#[derive(Default)]
pub struct MemoryAudit {
    records: Mutex<Vec<CommandRecord>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CommandRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AuditSink for MemoryAudit {
    fn record_command(&self, record: CommandRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}
