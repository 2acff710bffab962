//! Connection pool: magic key → live connections of every class.
//!
//! Each magic key owns one slot behind its own mutex. Operations on the same
//! key (bind, unbind, supersede, the router's forward snapshot) serialize on
//! that mutex; different keys never contend. The outer map lock is held only
//! long enough to look up or insert a slot.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tradelink_core::*;

use crate::connection::{Connection, Frame};
use crate::error::HubError;
use crate::registry::{Binding, RegistryEntry, Unbinding};

/// Everything the broker tracks for one magic key.
#[derive(Default)]
pub(crate) struct KeySlot {
    pub(crate) entry: Option<RegistryEntry>,
    pub(crate) members: HashMap<ConnectionId, Arc<Connection>>,
    /// Latest encoded state report per kind; newer reports overwrite.
    pub(crate) snapshots: HashMap<CommandKind, Frame>,
    /// Set once the slot has been removed from the map.
    retired: bool,
}

impl KeySlot {
    pub(crate) fn holds(&self, conn: &Arc<Connection>) -> bool {
        self.members
            .get(&conn.id)
            .is_some_and(|member| Arc::ptr_eq(member, conn))
    }

    pub(crate) fn owner(&self) -> Option<&UserId> {
        self.entry.as_ref().map(RegistryEntry::owner)
    }

    pub(crate) fn active_bridge(&self) -> Option<Arc<Connection>> {
        let id = self.entry.as_ref()?.active_bridge_id()?;
        self.members.get(&id).cloned()
    }

    pub(crate) fn control_surfaces(&self) -> Vec<Arc<Connection>> {
        let Some(entry) = self.entry.as_ref() else {
            return Vec::new();
        };
        entry
            .control_surfaces()
            .filter_map(|(id, _)| self.members.get(&id).cloned())
            .collect()
    }

    fn is_vacant(&self) -> bool {
        self.members.is_empty() && self.entry.as_ref().map_or(true, RegistryEntry::is_empty)
    }
}

/// Result of registering a connection.
#[derive(Debug)]
pub struct Registration {
    /// Bridge that lost the active slot to this registration, now draining.
    pub superseded: Option<Arc<Connection>>,
    /// Control surfaces bound to the key, excluding the new connection.
    pub peers: Vec<Arc<Connection>>,
    /// Class of the active bridge after registration.
    pub bridge: Option<ConnectionClass>,
    /// Cached state reports, for bootstrapping a new control surface.
    pub snapshots: Vec<Frame>,
}

/// Result of unregistering a connection that was still pooled.
#[derive(Debug)]
pub struct Departure {
    pub unbinding: Unbinding,
    /// Control surfaces still bound to the key.
    pub peers: Vec<Arc<Connection>>,
}

/// Point-in-time view of one magic key, for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub magic_key: MagicKey,
    pub owner: Option<UserId>,
    pub bridge: Option<ConnectionClass>,
    pub bridge_connection: Option<ConnectionId>,
    pub desktops: usize,
    pub mobiles: usize,
}

/// One pool for all four connection classes, keyed by magic key.
#[derive(Default)]
pub struct ConnectionPool {
    slots: RwLock<HashMap<MagicKey, Arc<Mutex<KeySlot>>>>,
    /// Pooled connections by id, for liveness sweeps.
    index: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// File an authenticated connection under its magic key and make it
    /// active. A bridge supersedes any bridge already active for the key.
    ///
    /// `notify` runs while the key is still locked, so membership
    /// notifications for one key go out in the order the changes happened.
    /// It must not block.
    pub async fn register<R>(
        &self,
        conn: &Arc<Connection>,
        notify: impl FnOnce(&Registration) -> R,
    ) -> Result<(Registration, R), HubError> {
        if conn.state() != ConnectionState::Authenticated {
            return Err(HubError::NotAuthenticated(conn.id));
        }
        let user = conn
            .user()
            .cloned()
            .ok_or(HubError::NotAuthenticated(conn.id))?;

        loop {
            let slot = self.slot_or_insert(&conn.magic_key).await;
            let mut guard = slot.lock().await;
            if guard.retired {
                continue;
            }

            if guard.owner().is_some_and(|owner| owner != &user) {
                return Err(HubError::OwnershipConflict(conn.magic_key.clone()));
            }
            if !conn.transition(ConnectionState::Active) {
                self.retire_if_vacant(&conn.magic_key, &slot, &mut guard).await;
                return Err(HubError::NotAuthenticated(conn.id));
            }

            let slot_state = &mut *guard;
            let entry = slot_state
                .entry
                .get_or_insert_with(|| RegistryEntry::new(user.clone()));
            let binding = entry.bind(&conn.magic_key, &user, conn.id, conn.class)?;
            let bridge = entry.active_bridge_class();

            let superseded = match binding {
                Binding::Bridge {
                    superseded: Some(old_id),
                } => slot_state.members.remove(&old_id),
                _ => None,
            };
            if let Some(old) = &superseded {
                old.transition(ConnectionState::Draining);
            }
            slot_state.members.insert(conn.id, Arc::clone(conn));

            let peers = slot_state
                .control_surfaces()
                .into_iter()
                .filter(|peer| peer.id != conn.id)
                .collect();
            let snapshots = slot_state.snapshots.values().cloned().collect();

            let mut index = self.index.write().await;
            index.insert(conn.id, Arc::clone(conn));
            if let Some(old) = &superseded {
                index.remove(&old.id);
            }

            drop(index);

            let registration = Registration {
                superseded,
                peers,
                bridge,
                snapshots,
            };
            let notified = notify(&registration);
            return Ok((registration, notified));
        }
    }

    /// Remove a connection from every structure. Returns `None` when it was
    /// not pooled (already unregistered, superseded, or never registered).
    ///
    /// As with [`ConnectionPool::register`], `notify` runs under the key lock.
    pub async fn unregister<R>(
        &self,
        conn: &Arc<Connection>,
        notify: impl FnOnce(&Departure) -> R,
    ) -> Option<(Departure, R)> {
        let slot = self.slots.read().await.get(&conn.magic_key).cloned();
        let mut departure = None;

        if let Some(slot) = slot {
            let mut guard = slot.lock().await;
            if guard.holds(conn) {
                guard.members.remove(&conn.id);
                let unbinding = guard
                    .entry
                    .as_mut()
                    .map_or(Unbinding::NotBound, |entry| entry.unbind(conn.id));
                if unbinding == Unbinding::ActiveBridge {
                    guard.snapshots.clear();
                }
                let peers = guard.control_surfaces();
                self.forget(conn).await;

                self.retire_if_vacant(&conn.magic_key, &slot, &mut guard).await;
                let gone = Departure { unbinding, peers };
                let notified = notify(&gone);
                departure = Some((gone, notified));
            }
        }

        if departure.is_none() {
            self.forget(conn).await;
        }
        departure
    }

    /// Current connections of `class` bound to `key`.
    pub async fn peers_of(&self, key: &MagicKey, class: ConnectionClass) -> Vec<Arc<Connection>> {
        match self.lock_slot(key).await {
            Some(slot) => slot
                .members
                .values()
                .filter(|conn| conn.class == class)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every control surface bound to `key`.
    pub async fn control_surfaces(&self, key: &MagicKey) -> Vec<Arc<Connection>> {
        match self.lock_slot(key).await {
            Some(slot) => slot.control_surfaces(),
            None => Vec::new(),
        }
    }

    pub async fn active_bridge(&self, key: &MagicKey) -> Result<Arc<Connection>, HubError> {
        self.lock_slot(key)
            .await
            .and_then(|slot| slot.active_bridge())
            .ok_or_else(|| HubError::NotConnected(key.clone()))
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.index.read().await.get(&id).cloned()
    }

    /// Snapshot of every pooled connection.
    pub async fn all(&self) -> Vec<Arc<Connection>> {
        self.index.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    pub async fn key_count(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn status(&self, key: &MagicKey) -> Option<KeyStatus> {
        let slot = self.lock_slot(key).await?;
        let bridge = slot.active_bridge();
        let count = |class| {
            slot.members
                .values()
                .filter(|conn| conn.class == class)
                .count()
        };
        Some(KeyStatus {
            magic_key: key.clone(),
            owner: slot.owner().cloned(),
            bridge: bridge.as_ref().map(|b| b.class),
            bridge_connection: bridge.as_ref().map(|b| b.id),
            desktops: count(ConnectionClass::Desktop),
            mobiles: count(ConnectionClass::Mobile),
        })
    }

    /// Lock the slot for `key`. The router holds this guard while it checks
    /// and snapshots, then drops it before any I/O.
    pub(crate) async fn lock_slot(&self, key: &MagicKey) -> Option<OwnedMutexGuard<KeySlot>> {
        let slot = self.slots.read().await.get(key).cloned()?;
        let guard = slot.lock_owned().await;
        if guard.retired {
            None
        } else {
            Some(guard)
        }
    }

    async fn slot_or_insert(&self, key: &MagicKey) -> Arc<Mutex<KeySlot>> {
        if let Some(slot) = self.slots.read().await.get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Drop an empty slot from the map. Registrants that already hold the
    /// retired slot see the flag and retry with a fresh one.
    async fn retire_if_vacant(&self, key: &MagicKey, slot: &Arc<Mutex<KeySlot>>, guard: &mut KeySlot) {
        if !guard.is_vacant() {
            return;
        }
        guard.retired = true;
        guard.entry = None;
        let mut slots = self.slots.write().await;
        if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(key);
        }
    }

    async fn forget(&self, conn: &Arc<Connection>) {
        let mut index = self.index.write().await;
        if index
            .get(&conn.id)
            .is_some_and(|current| Arc::ptr_eq(current, conn))
        {
            index.remove(&conn.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSocket;

    fn authenticated(
        socket: &TestSocket,
        id: u64,
        class: ConnectionClass,
        key: &str,
        user: &str,
    ) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(
            ConnectionId::new(id),
            class,
            MagicKey::new(key),
            socket.weak(),
        ));
        conn.mark_authenticated(UserId::new(user), "session");
        conn
    }

    #[tokio::test]
    async fn test_register_requires_authentication() {
        let pool = ConnectionPool::new();
        let socket = TestSocket::new();
        let conn = Arc::new(Connection::new(
            ConnectionId::new(1),
            ConnectionClass::Desktop,
            MagicKey::new("K1"),
            socket.weak(),
        ));
        let err = pool.register(&conn, |_| ()).await.unwrap_err();
        assert!(matches!(err, HubError::NotAuthenticated(_)));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_bridge_supersede_keeps_one_active() {
        let pool = ConnectionPool::new();
        let socket = TestSocket::new();
        let b1 = authenticated(&socket, 1, ConnectionClass::Bridge4, "K1", "alice");
        let b2 = authenticated(&socket, 2, ConnectionClass::Bridge5, "K1", "alice");

        let (first, _) = pool.register(&b1, |_| ()).await.unwrap();
        assert!(first.superseded.is_none());
        assert!(b1.is_active());

        let (second, _) = pool.register(&b2, |_| ()).await.unwrap();
        let old = second.superseded.expect("b1 superseded");
        assert_eq!(old.id, b1.id);
        assert_eq!(b1.state(), ConnectionState::Draining);
        assert!(b2.is_active());

        let key = MagicKey::new("K1");
        assert_eq!(pool.active_bridge(&key).await.unwrap().id, b2.id);
        let bridges: Vec<_> = pool
            .all()
            .await
            .into_iter()
            .filter(|c| c.class.is_bridge() && c.is_active())
            .collect();
        assert_eq!(bridges.len(), 1);

        // The superseded bridge's own disconnect is a no-op for the pool.
        assert!(pool.unregister(&b1, |_| ()).await.is_none());
        assert_eq!(pool.active_bridge(&key).await.unwrap().id, b2.id);
    }

    #[tokio::test]
    async fn test_ownership_conflict() {
        let pool = ConnectionPool::new();
        let socket = TestSocket::new();
        let alice = authenticated(&socket, 1, ConnectionClass::Desktop, "K1", "alice");
        let mallory = authenticated(&socket, 2, ConnectionClass::Bridge4, "K1", "mallory");
        pool.register(&alice, |_| ()).await.unwrap();
        let err = pool.register(&mallory, |_| ()).await.unwrap_err();
        assert!(matches!(err, HubError::OwnershipConflict(_)));
        assert_eq!(mallory.state(), ConnectionState::Authenticated);
        assert!(pool.active_bridge(&MagicKey::new("K1")).await.is_err());
    }

    #[tokio::test]
    async fn test_unregister_reports_role_and_peers() {
        let pool = ConnectionPool::new();
        let socket = TestSocket::new();
        let bridge = authenticated(&socket, 1, ConnectionClass::Bridge4, "K1", "alice");
        let desk = authenticated(&socket, 2, ConnectionClass::Desktop, "K1", "alice");
        let phone = authenticated(&socket, 3, ConnectionClass::Mobile, "K1", "alice");
        pool.register(&bridge, |_| ()).await.unwrap();
        pool.register(&desk, |_| ()).await.unwrap();
        let (reg, _) = pool.register(&phone, |_| ()).await.unwrap();
        assert_eq!(reg.peers.len(), 1);
        assert_eq!(reg.bridge, Some(ConnectionClass::Bridge4));

        let (gone, _) = pool.unregister(&bridge, |_| ()).await.unwrap();
        assert_eq!(gone.unbinding, Unbinding::ActiveBridge);
        assert_eq!(gone.peers.len(), 2);

        let (gone, _) = pool.unregister(&desk, |_| ()).await.unwrap();
        assert_eq!(gone.unbinding, Unbinding::ControlSurface);
        assert_eq!(gone.peers.len(), 1);
        assert_eq!(gone.peers[0].id, phone.id);

        assert!(pool.unregister(&desk, |_| ()).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_key_is_released() {
        let pool = ConnectionPool::new();
        let socket = TestSocket::new();
        let desk = authenticated(&socket, 1, ConnectionClass::Desktop, "K1", "alice");
        pool.register(&desk, |_| ()).await.unwrap();
        assert_eq!(pool.key_count().await, 1);
        pool.unregister(&desk, |_| ()).await.unwrap();
        assert_eq!(pool.key_count().await, 0);
        assert!(pool.status(&MagicKey::new("K1")).await.is_none());

        // Once released, another account may bind the key.
        let other = authenticated(&socket, 2, ConnectionClass::Desktop, "K1", "bob");
        assert!(pool.register(&other, |_| ()).await.is_ok());
    }

    #[tokio::test]
    async fn test_peers_of_and_status() {
        let pool = ConnectionPool::new();
        let socket = TestSocket::new();
        let key = MagicKey::new("K9");
        for (id, class) in [
            (1, ConnectionClass::Desktop),
            (2, ConnectionClass::Desktop),
            (3, ConnectionClass::Mobile),
            (4, ConnectionClass::Bridge5),
        ] {
            let conn = authenticated(&socket, id, class, "K9", "alice");
            pool.register(&conn, |_| ()).await.unwrap();
        }
        assert_eq!(pool.peers_of(&key, ConnectionClass::Desktop).await.len(), 2);
        assert_eq!(pool.peers_of(&key, ConnectionClass::Bridge4).await.len(), 0);
        assert_eq!(pool.control_surfaces(&key).await.len(), 3);

        let status = pool.status(&key).await.unwrap();
        assert_eq!(status.bridge, Some(ConnectionClass::Bridge5));
        assert_eq!(status.desktops, 2);
        assert_eq!(status.mobiles, 1);
        assert_eq!(status.owner, Some(UserId::new("alice")));
    }
}
