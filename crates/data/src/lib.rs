pub mod db;
pub mod memory;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tradelink_core::{
    AuditSink, AuthError, AuthService, CommandRecord, MagicKey, OwnershipStore, StoreError,
    TokenInfo, UserId,
};

/// Session tokens backed by the `user_sessions` table.
pub struct PgAuthService {
    pub pool: sqlx::PgPool,
}

impl PgAuthService {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuthService for PgAuthService {
    async fn validate(&self, token: &str) -> Result<TokenInfo, AuthError> {
        let info = db::find_token(&self.pool, token)
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?
            .ok_or(AuthError::InvalidToken)?;
        if info.expires_at <= Utc::now() {
            return Err(AuthError::ExpiredToken);
        }
        Ok(info)
    }

    async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        db::revoke_token(&self.pool, token)
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

/// Magic key ownership backed by the `magic_keys` table.
pub struct PgOwnershipStore {
    pub pool: sqlx::PgPool,
}

impl PgOwnershipStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OwnershipStore for PgOwnershipStore {
    async fn magic_keys_for(&self, user_id: &UserId) -> Result<BTreeSet<MagicKey>, StoreError> {
        db::magic_keys_for(&self.pool, user_id)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

/// Audit sink that queues records for a background writer into
/// `command_audit`. A full queue drops the record.
pub struct PgAuditLog {
    tx: mpsc::Sender<CommandRecord>,
}

impl PgAuditLog {
    /// Start the writer task. It exits once every sender is dropped and the
    /// queue is drained.
    pub fn spawn(pool: sqlx::PgPool, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<CommandRecord>(capacity);
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = db::insert_command_record(&pool, &record).await {
                    warn!(record_id = %record.id, error = %e, "failed to write command audit");
                }
            }
            debug!("audit writer stopped");
        });
        (Self { tx }, handle)
    }
}

impl AuditSink for PgAuditLog {
    fn record_command(&self, record: CommandRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(record_id = %record.id, "audit queue full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                warn!(record_id = %record.id, "audit writer gone, dropping record");
            }
        }
    }
}
