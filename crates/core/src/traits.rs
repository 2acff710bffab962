use crate::models::*;
use async_trait::async_trait;
use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// Auth Service
// ---------------------------------------------------------------------------

/// Errors from token validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    ExpiredToken,
    #[error("Auth service unavailable: {0}")]
    Unavailable(String),
}

/// Validates the session token that accompanies every connection.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn validate(&self, token: &str) -> Result<TokenInfo, AuthError>;

    /// Forget a token (logout). Default no-op for read-only backends.
    async fn revoke(&self, _token: &str) -> Result<(), AuthError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Magic Key Ownership Store
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
}

/// Which magic keys a user owns.
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    async fn magic_keys_for(&self, user_id: &UserId) -> Result<BTreeSet<MagicKey>, StoreError>;
}

// ---------------------------------------------------------------------------
// Audit Sink
// ---------------------------------------------------------------------------

/// Fire-and-forget command audit trail.
///
/// Implementations must return immediately; a failed or slow write is the
/// sink's problem and never reaches the router.
pub trait AuditSink: Send + Sync {
    fn record_command(&self, record: CommandRecord);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudit;

impl AuditSink for NullAudit {
    fn record_command(&self, _record: CommandRecord) {}
}
