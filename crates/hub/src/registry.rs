//! Magic key registry: ownership and binding state of one magic key.
//!
//! An entry is only ever touched while its key's slot lock is held (see
//! [`crate::pool`]), so every method here is plain synchronous code.

use std::collections::BTreeMap;
use tradelink_core::{ConnectionClass, ConnectionId, MagicKey, UserId};

use crate::error::HubError;

/// What `bind` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// The connection is now the active bridge; `superseded` held the slot before.
    Bridge { superseded: Option<ConnectionId> },
    ControlSurface,
}

/// What `unbind` removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unbinding {
    ActiveBridge,
    ControlSurface,
    NotBound,
}

/// magic key → owner, active bridge, bound control surfaces.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    owner: UserId,
    active_bridge: Option<(ConnectionId, ConnectionClass)>,
    control_surfaces: BTreeMap<ConnectionId, ConnectionClass>,
}

impl RegistryEntry {
    pub fn new(owner: UserId) -> Self {
        Self {
            owner,
            active_bridge: None,
            control_surfaces: BTreeMap::new(),
        }
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    /// Bind a connection owned by `user`. A bridge takes the active slot,
    /// replacing whatever bridge held it.
    pub fn bind(
        &mut self,
        key: &MagicKey,
        user: &UserId,
        connection: ConnectionId,
        class: ConnectionClass,
    ) -> Result<Binding, HubError> {
        if &self.owner != user {
            return Err(HubError::OwnershipConflict(key.clone()));
        }
        if class.is_bridge() {
            let superseded = self
                .active_bridge
                .replace((connection, class))
                .map(|(id, _)| id)
                .filter(|id| *id != connection);
            Ok(Binding::Bridge { superseded })
        } else {
            self.control_surfaces.insert(connection, class);
            Ok(Binding::ControlSurface)
        }
    }

    pub fn unbind(&mut self, connection: ConnectionId) -> Unbinding {
        if matches!(self.active_bridge, Some((id, _)) if id == connection) {
            self.active_bridge = None;
            return Unbinding::ActiveBridge;
        }
        if self.control_surfaces.remove(&connection).is_some() {
            return Unbinding::ControlSurface;
        }
        Unbinding::NotBound
    }

    pub fn active_bridge(&self, key: &MagicKey) -> Result<ConnectionId, HubError> {
        self.active_bridge_id()
            .ok_or_else(|| HubError::NotConnected(key.clone()))
    }

    pub fn active_bridge_id(&self) -> Option<ConnectionId> {
        self.active_bridge.map(|(id, _)| id)
    }

    pub fn active_bridge_class(&self) -> Option<ConnectionClass> {
        self.active_bridge.map(|(_, class)| class)
    }

    pub fn control_surfaces(&self) -> impl Iterator<Item = (ConnectionId, ConnectionClass)> + '_ {
        self.control_surfaces.iter().map(|(id, class)| (*id, *class))
    }

    pub fn control_surface_count(&self) -> usize {
        self.control_surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active_bridge.is_none() && self.control_surfaces.is_empty()
    }
}
