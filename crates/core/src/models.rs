use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::protocol::{AckStatus, Reason};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// User-chosen identifier scoping which bridge and control-surface
/// connections belong together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MagicKey(String);

impl MagicKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty or whitespace-only keys never scope anything.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for MagicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MagicKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Account identifier as issued by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identity of one socket. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Connection class & state
// ---------------------------------------------------------------------------

/// The kind of peer on the other end of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionClass {
    /// MetaTrader 4 bridge.
    Bridge4,
    /// MetaTrader 5 bridge.
    Bridge5,
    Desktop,
    Mobile,
}

impl ConnectionClass {
    pub fn is_bridge(&self) -> bool {
        matches!(self, ConnectionClass::Bridge4 | ConnectionClass::Bridge5)
    }

    pub fn is_control_surface(&self) -> bool {
        !self.is_bridge()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionClass::Bridge4 => "bridge4",
            ConnectionClass::Bridge5 => "bridge5",
            ConnectionClass::Desktop => "desktop",
            ConnectionClass::Mobile => "mobile",
        }
    }
}

impl fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a connection.
///
/// `Connecting → Authenticated → Active → Draining → Closed`; any state may
/// jump straight to `Closed` when the socket goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Authenticated = 1,
    Active = 2,
    Draining = 3,
    Closed = 4,
}

impl ConnectionState {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Authenticated,
            2 => ConnectionState::Active,
            3 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Authenticated, Active)
                | (Active, Draining)
                | (Authenticated | Active | Draining | Connecting, Closed)
        )
    }
}

/// Why the broker closed a socket. Carried in the WebSocket close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// Another bridge registered for the same magic key.
    Superseded,
    HeartbeatTimeout,
    ExpiredToken,
    LoggedOut,
    /// Outbound queue was gone when the broker tried to write.
    PeerSendFailure,
    /// The client closed the socket itself.
    ClientClosed,
    Shutdown,
}

impl CloseReason {
    /// Application close code (4000-4999 is reserved for private use).
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Superseded => 4001,
            CloseReason::HeartbeatTimeout => 4002,
            CloseReason::ExpiredToken => 4003,
            CloseReason::LoggedOut => 4004,
            CloseReason::PeerSendFailure => 4005,
            CloseReason::ClientClosed => 1000,
            CloseReason::Shutdown => 1001,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Superseded => "Superseded",
            CloseReason::HeartbeatTimeout => "HeartbeatTimeout",
            CloseReason::ExpiredToken => "ExpiredToken",
            CloseReason::LoggedOut => "LoggedOut",
            CloseReason::PeerSendFailure => "PeerSendFailure",
            CloseReason::ClientClosed => "ClientClosed",
            CloseReason::Shutdown => "Shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// What the auth collaborator tells us about a valid token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
}

/// An authenticated user with the magic keys they own.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    /// Read once from the ownership store when the session is created.
    pub magic_keys: BTreeSet<MagicKey>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn owns(&self, key: &MagicKey) -> bool {
        self.magic_keys.contains(key)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Broad routing category of a command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandCategory {
    /// Causes an order action on the bridge; control surface → bridge.
    TradeIntent,
    /// Account/market state; bridge → control surfaces.
    StateReport,
    /// Liveness only, never routed.
    Control,
}

/// The `kind` field of a command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    Open,
    Close,
    Modify,
    CloseAll,
    AccountSnapshot,
    Positions,
    Tick,
    Heartbeat,
}

impl CommandKind {
    pub fn parse(kind: &str) -> Option<Self> {
        let kind = match kind {
            "open" => CommandKind::Open,
            "close" => CommandKind::Close,
            "modify" => CommandKind::Modify,
            "closeAll" => CommandKind::CloseAll,
            "accountSnapshot" => CommandKind::AccountSnapshot,
            "positions" => CommandKind::Positions,
            "tick" => CommandKind::Tick,
            "heartbeat" => CommandKind::Heartbeat,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Open => "open",
            CommandKind::Close => "close",
            CommandKind::Modify => "modify",
            CommandKind::CloseAll => "closeAll",
            CommandKind::AccountSnapshot => "accountSnapshot",
            CommandKind::Positions => "positions",
            CommandKind::Tick => "tick",
            CommandKind::Heartbeat => "heartbeat",
        }
    }

    pub fn category(&self) -> CommandCategory {
        match self {
            CommandKind::Open | CommandKind::Close | CommandKind::Modify | CommandKind::CloseAll => {
                CommandCategory::TradeIntent
            }
            CommandKind::AccountSnapshot | CommandKind::Positions | CommandKind::Tick => {
                CommandCategory::StateReport
            }
            CommandKind::Heartbeat => CommandCategory::Control,
        }
    }

    /// Whether a connection of `class` may originate this kind.
    pub fn allowed_from(&self, class: ConnectionClass) -> bool {
        match self.category() {
            CommandCategory::TradeIntent => class.is_control_surface(),
            CommandCategory::StateReport => class.is_bridge(),
            CommandCategory::Control => true,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified message travelling through the router.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub source: ConnectionId,
    pub source_class: ConnectionClass,
    pub magic_key: MagicKey,
    pub kind: CommandKind,
    pub payload: serde_json::Value,
    pub seq: u64,
    pub received_at: DateTime<Utc>,
}

/// One audit row: a command and what the router did with it.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub command: Command,
    pub status: AckStatus,
    pub reason: Option<Reason>,
}

impl CommandRecord {
    pub fn new(user_id: UserId, command: Command, status: AckStatus, reason: Option<Reason>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            command,
            status,
            reason,
        }
    }
}
