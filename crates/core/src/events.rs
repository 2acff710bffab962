use crate::models::*;
use serde::{Deserialize, Serialize};

/// Top-level event enum published by the hub to in-process observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HubEvent {
    Link(LinkChange),
    Session(SessionEvent),
}

/// Membership changes for a magic key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkChange {
    /// A bridge became the active bridge for its key.
    BridgeConnected {
        magic_key: MagicKey,
        connection: ConnectionId,
        class: ConnectionClass,
    },
    /// The active bridge slot was cleared.
    BridgeLost {
        magic_key: MagicKey,
        connection: ConnectionId,
        class: ConnectionClass,
        cause: CloseReason,
    },
    /// A bridge was replaced by a newer registration for the same key.
    BridgeSuperseded {
        magic_key: MagicKey,
        old: ConnectionId,
        new: ConnectionId,
    },
    ControlSurfaceBound {
        magic_key: MagicKey,
        connection: ConnectionId,
        class: ConnectionClass,
    },
    ControlSurfaceLost {
        magic_key: MagicKey,
        connection: ConnectionId,
        class: ConnectionClass,
        cause: CloseReason,
    },
    /// Raised by liveness eviction, in addition to the bridge/control-surface event.
    ConnectionLost {
        magic_key: MagicKey,
        connection: ConnectionId,
        class: ConnectionClass,
    },
}

impl LinkChange {
    pub fn magic_key(&self) -> &MagicKey {
        match self {
            LinkChange::BridgeConnected { magic_key, .. }
            | LinkChange::BridgeLost { magic_key, .. }
            | LinkChange::BridgeSuperseded { magic_key, .. }
            | LinkChange::ControlSurfaceBound { magic_key, .. }
            | LinkChange::ControlSurfaceLost { magic_key, .. }
            | LinkChange::ConnectionLost { magic_key, .. } => magic_key,
        }
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    Opened { user_id: UserId },
    /// A second session of the same user bound a control surface of a class
    /// another session already holds on the key.
    Competing {
        user_id: UserId,
        magic_key: MagicKey,
        class: ConnectionClass,
    },
    Closed { user_id: UserId, cause: CloseReason },
}
