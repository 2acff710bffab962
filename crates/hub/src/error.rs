use tradelink_core::{AuthError, ConnectionId, MagicKey, Reason, StoreError};

/// Errors raised by broker operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    ExpiredToken,
    #[error("Magic key {0} is owned by another account")]
    OwnershipConflict(MagicKey),
    #[error("No bridge connected for magic key {0}")]
    NotConnected(MagicKey),
    #[error("Connection {0} is not authenticated")]
    NotAuthenticated(ConnectionId),
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
}

impl HubError {
    /// The wire reason reported to the client.
    pub fn reason(&self) -> Reason {
        match self {
            HubError::InvalidToken => Reason::InvalidToken,
            HubError::ExpiredToken => Reason::ExpiredToken,
            HubError::OwnershipConflict(_) => Reason::OwnershipConflict,
            HubError::NotConnected(_) => Reason::NoBridge,
            HubError::NotAuthenticated(_) => Reason::NotActive,
            HubError::Unavailable(_) => Reason::Unavailable,
        }
    }
}

impl From<AuthError> for HubError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidToken => HubError::InvalidToken,
            AuthError::ExpiredToken => HubError::ExpiredToken,
            AuthError::Unavailable(msg) => HubError::Unavailable(msg),
        }
    }
}

impl From<StoreError> for HubError {
    fn from(err: StoreError) -> Self {
        HubError::Unavailable(err.to_string())
    }
}
