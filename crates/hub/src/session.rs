//! Authenticated sessions and the connections attributed to them.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use tradelink_core::*;
use uuid::Uuid;

use crate::broadcast::StateSync;
use crate::connection::Connection;
use crate::error::HubError;
use crate::pool::{ConnectionPool, Departure, Registration};
use crate::registry::Unbinding;

struct TrackedSession {
    session: Arc<Session>,
    token: String,
    connections: HashMap<ConnectionId, Arc<Connection>>,
}

#[derive(Default)]
struct Sessions {
    by_token: HashMap<String, Uuid>,
    tracked: HashMap<Uuid, TrackedSession>,
}

impl Sessions {
    fn remove_by_token(&mut self, token: &str) -> Option<TrackedSession> {
        let id = self.by_token.remove(token)?;
        self.tracked.remove(&id)
    }
}

/// Tracks sessions and drives every attach/detach through the pool so that
/// membership changes always produce their notifications.
pub struct SessionTracker {
    auth: Arc<dyn AuthService>,
    ownership: Arc<dyn OwnershipStore>,
    pool: Arc<ConnectionPool>,
    sync: Arc<StateSync>,
    supersede_grace: Duration,
    sessions: RwLock<Sessions>,
}

impl SessionTracker {
    pub fn new(
        auth: Arc<dyn AuthService>,
        ownership: Arc<dyn OwnershipStore>,
        pool: Arc<ConnectionPool>,
        sync: Arc<StateSync>,
        supersede_grace: Duration,
    ) -> Self {
        Self {
            auth,
            ownership,
            pool,
            sync,
            supersede_grace,
            sessions: RwLock::new(Sessions::default()),
        }
    }

    // -----------------------------------------------------------------------
    // Authentication
    // -----------------------------------------------------------------------

    /// Resolve a token to a session, reusing a tracked one when possible.
    pub async fn authenticate(&self, token: &str) -> Result<Arc<Session>, HubError> {
        let now = Utc::now();
        if let Some(session) = self.cached(token).await {
            if session.is_expired_at(now) {
                return Err(HubError::ExpiredToken);
            }
            return Ok(session);
        }

        let info = self.auth.validate(token).await?;
        if info.expires_at <= now {
            return Err(HubError::ExpiredToken);
        }
        let magic_keys = self.ownership.magic_keys_for(&info.user_id).await?;

        let mut sessions = self.sessions.write().await;
        // Another handshake with the same token may have won the race.
        if let Some(session) = sessions
            .by_token
            .get(token)
            .and_then(|id| sessions.tracked.get(id))
        {
            return Ok(Arc::clone(&session.session));
        }

        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            user_id: info.user_id,
            expires_at: info.expires_at,
            magic_keys,
        });
        sessions.by_token.insert(token.to_string(), session.id);
        sessions.tracked.insert(
            session.id,
            TrackedSession {
                session: Arc::clone(&session),
                token: token.to_string(),
                connections: HashMap::new(),
            },
        );
        drop(sessions);

        info!(
            session_id = %session.id,
            user_id = %session.user_id,
            keys = session.magic_keys.len(),
            "session opened"
        );
        self.sync.publish(HubEvent::Session(SessionEvent::Opened {
            user_id: session.user_id.clone(),
        }));
        Ok(session)
    }

    async fn cached(&self, token: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        let id = sessions.by_token.get(token)?;
        sessions.tracked.get(id).map(|t| Arc::clone(&t.session))
    }

    // -----------------------------------------------------------------------
    // Attach / detach
    // -----------------------------------------------------------------------

    /// Record `conn` under `session` and register it into the pool.
    pub async fn attach(&self, session: &Session, conn: &Arc<Connection>) -> Result<(), HubError> {
        if !session.owns(&conn.magic_key) {
            warn!(
                conn_id = %conn.id,
                user_id = %session.user_id,
                magic_key = %conn.magic_key,
                "magic key not owned by session"
            );
            return Err(HubError::OwnershipConflict(conn.magic_key.clone()));
        }

        {
            let mut sessions = self.sessions.write().await;
            if conn.class.is_control_surface() {
                self.flag_competing(&sessions, session, conn);
            }
            let tracked = sessions
                .tracked
                .get_mut(&session.id)
                .ok_or(HubError::InvalidToken)?;
            tracked.connections.insert(conn.id, Arc::clone(conn));
        }

        let (registration, failed) = match self
            .pool
            .register(conn, |registration| self.announce(conn, registration))
            .await
        {
            Ok(registered) => registered,
            Err(e) => {
                self.forget_connection(conn).await;
                return Err(e);
            }
        };

        info!(
            conn_id = %conn.id,
            class = %conn.class,
            magic_key = %conn.magic_key,
            user_id = %session.user_id,
            "connection attached"
        );
        if let Some(old) = registration.superseded {
            self.forget_connection(&old).await;
            self.close_after_grace(old);
        }
        self.evict_all(failed).await;
        Ok(())
    }

    fn flag_competing(&self, sessions: &Sessions, session: &Session, conn: &Connection) {
        let competing = sessions.tracked.values().any(|other| {
            other.session.id != session.id
                && other.session.user_id == session.user_id
                && other
                    .connections
                    .values()
                    .any(|c| c.magic_key == conn.magic_key && c.class == conn.class && !c.is_closed())
        });
        if competing {
            warn!(
                user_id = %session.user_id,
                magic_key = %conn.magic_key,
                class = %conn.class,
                "competing session attached"
            );
            self.sync.publish(HubEvent::Session(SessionEvent::Competing {
                user_id: session.user_id.clone(),
                magic_key: conn.magic_key.clone(),
                class: conn.class,
            }));
        }
    }

    /// Notifications for a fresh registration. Returns peers to evict.
    fn announce(&self, conn: &Connection, registration: &Registration) -> Vec<Arc<Connection>> {
        let mut failed = Vec::new();

        if conn.class.is_control_surface() {
            self.sync.link_change(
                LinkChange::ControlSurfaceBound {
                    magic_key: conn.magic_key.clone(),
                    connection: conn.id,
                    class: conn.class,
                },
                &registration.peers,
            );
            let delivery = self
                .sync
                .bootstrap(conn, registration.bridge, &registration.snapshots);
            debug!(conn_id = %conn.id, ?delivery, snapshots = registration.snapshots.len(), "bootstrap");
            return failed;
        }

        if let Some(old) = &registration.superseded {
            info!(
                magic_key = %conn.magic_key,
                old = %old.id,
                new = %conn.id,
                "bridge superseded"
            );
            self.sync.publish(HubEvent::Link(LinkChange::BridgeSuperseded {
                magic_key: conn.magic_key.clone(),
                old: old.id,
                new: conn.id,
            }));
            failed.extend(self.sync.link_change(
                LinkChange::BridgeLost {
                    magic_key: old.magic_key.clone(),
                    connection: old.id,
                    class: old.class,
                    cause: CloseReason::Superseded,
                },
                &registration.peers,
            ));
        }

        failed.extend(self.sync.link_change(
            LinkChange::BridgeConnected {
                magic_key: conn.magic_key.clone(),
                connection: conn.id,
                class: conn.class,
            },
            &registration.peers,
        ));
        failed
    }

    /// Force-close a drained bridge once its final frames had a chance to flush.
    fn close_after_grace(&self, old: Arc<Connection>) {
        let grace = self.supersede_grace;
        if grace.is_zero() {
            old.close(CloseReason::Superseded);
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            old.close(CloseReason::Superseded);
        });
    }

    /// Close `conn`, remove it from its session and the pool, and notify the
    /// remaining control surfaces. Peers that fail to take the notification
    /// are evicted the same way.
    pub async fn detach(&self, conn: &Arc<Connection>, cause: CloseReason) {
        let mut pending = vec![(Arc::clone(conn), cause)];
        while let Some((conn, cause)) = pending.pop() {
            let failed = self.detach_one(&conn, cause).await;
            pending.extend(
                failed
                    .into_iter()
                    .map(|peer| (peer, CloseReason::PeerSendFailure)),
            );
        }
    }

    async fn detach_one(&self, conn: &Arc<Connection>, cause: CloseReason) -> Vec<Arc<Connection>> {
        conn.close(cause);
        self.forget_connection(conn).await;

        let departed = self
            .pool
            .unregister(conn, |departure| self.announce_departure(conn, departure, cause))
            .await;
        let Some((_, failed)) = departed else {
            return Vec::new();
        };
        info!(
            conn_id = %conn.id,
            class = %conn.class,
            magic_key = %conn.magic_key,
            %cause,
            "connection detached"
        );
        failed
    }

    fn announce_departure(
        &self,
        conn: &Connection,
        departure: &Departure,
        cause: CloseReason,
    ) -> Vec<Arc<Connection>> {
        let change = match departure.unbinding {
            Unbinding::ActiveBridge => LinkChange::BridgeLost {
                magic_key: conn.magic_key.clone(),
                connection: conn.id,
                class: conn.class,
                cause,
            },
            Unbinding::ControlSurface => LinkChange::ControlSurfaceLost {
                magic_key: conn.magic_key.clone(),
                connection: conn.id,
                class: conn.class,
                cause,
            },
            Unbinding::NotBound => return Vec::new(),
        };
        self.sync.link_change(change, &departure.peers)
    }

    async fn evict_all(&self, peers: Vec<Arc<Connection>>) {
        for peer in peers {
            self.detach(&peer, CloseReason::PeerSendFailure).await;
        }
    }

    async fn forget_connection(&self, conn: &Connection) {
        let Some(id) = conn.session_id().and_then(|s| Uuid::parse_str(s).ok()) else {
            return;
        };
        let mut sessions = self.sessions.write().await;
        if let Some(tracked) = sessions.tracked.get_mut(&id) {
            tracked.connections.remove(&conn.id);
        }
    }

    // -----------------------------------------------------------------------
    // Session teardown
    // -----------------------------------------------------------------------

    /// Destroy the session for `token` and close its connections.
    /// Returns how many connections were closed.
    pub async fn logout(&self, token: &str) -> Result<usize, HubError> {
        let removed = self.sessions.write().await.remove_by_token(token);
        if let Err(e) = self.auth.revoke(token).await {
            warn!(error = %e, "failed to revoke token");
        }
        let Some(tracked) = removed else {
            return Ok(0);
        };
        Ok(self.close_session(tracked, CloseReason::LoggedOut).await)
    }

    /// Destroy every session whose token expired at or before `now`.
    /// Returns how many sessions were expired.
    pub async fn expire(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<TrackedSession> = {
            let mut sessions = self.sessions.write().await;
            let tokens: Vec<String> = sessions
                .tracked
                .values()
                .filter(|t| t.session.is_expired_at(now))
                .map(|t| t.token.clone())
                .collect();
            tokens
                .iter()
                .filter_map(|token| sessions.remove_by_token(token))
                .collect()
        };

        let count = expired.len();
        for tracked in expired {
            self.close_session(tracked, CloseReason::ExpiredToken).await;
        }
        count
    }

    async fn close_session(&self, tracked: TrackedSession, cause: CloseReason) -> usize {
        let closed = tracked.connections.len();
        for conn in tracked.connections.values() {
            self.detach(conn, cause).await;
        }
        info!(
            session_id = %tracked.session.id,
            user_id = %tracked.session.user_id,
            connections = closed,
            %cause,
            "session closed"
        );
        self.sync.publish(HubEvent::Session(SessionEvent::Closed {
            user_id: tracked.session.user_id.clone(),
            cause,
        }));
        closed
    }

    /// Close every session's connections, e.g. on server shutdown.
    pub async fn close_all(&self, cause: CloseReason) {
        let drained: Vec<TrackedSession> = {
            let mut sessions = self.sessions.write().await;
            sessions.by_token.clear();
            sessions.tracked.drain().map(|(_, t)| t).collect()
        };
        for tracked in drained {
            self.close_session(tracked, cause).await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.tracked.len()
    }

    /// Connection ids currently attributed to the session for `token`.
    pub async fn connections_of(&self, token: &str) -> Vec<ConnectionId> {
        let sessions = self.sessions.read().await;
        sessions
            .by_token
            .get(token)
            .and_then(|id| sessions.tracked.get(id))
            .map(|t| t.connections.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{directory, TestSocket};
    use chrono::Duration as ChronoDuration;
    use tradelink_data::memory::MemoryDirectory;

    fn tracker(directory: Arc<MemoryDirectory>) -> (SessionTracker, Arc<ConnectionPool>, Arc<StateSync>) {
        let pool = Arc::new(ConnectionPool::new());
        let sync = Arc::new(StateSync::new(64));
        let tracker = SessionTracker::new(
            directory.clone(),
            directory,
            Arc::clone(&pool),
            Arc::clone(&sync),
            Duration::ZERO,
        );
        (tracker, pool, sync)
    }

    fn connection(
        socket: &TestSocket,
        id: u64,
        class: ConnectionClass,
        key: &str,
        session: &Session,
    ) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(
            ConnectionId::new(id),
            class,
            MagicKey::new(key),
            socket.weak(),
        ));
        conn.mark_authenticated(session.user_id.clone(), session.id.to_string());
        conn
    }

    #[tokio::test]
    async fn test_authenticate_reuses_session() {
        let (tracker, _, _) = tracker(directory());
        let first = tracker.authenticate("alice-token").await.unwrap();
        let second = tracker.authenticate("alice-token").await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.owns(&MagicKey::new("K1")));
        assert_eq!(tracker.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_authenticate_rejects_bad_tokens() {
        let dir = directory();
        dir.insert_token("stale", UserId::new("alice"), Utc::now() - ChronoDuration::minutes(1));
        let (tracker, _, _) = tracker(dir);
        assert!(matches!(
            tracker.authenticate("nope").await,
            Err(HubError::InvalidToken)
        ));
        assert!(matches!(
            tracker.authenticate("stale").await,
            Err(HubError::ExpiredToken)
        ));
    }

    #[tokio::test]
    async fn test_attach_requires_owned_key() {
        let (tracker, pool, _) = tracker(directory());
        let session = tracker.authenticate("alice-token").await.unwrap();
        let socket = TestSocket::new();
        let conn = connection(&socket, 1, ConnectionClass::Desktop, "K3", &session);
        let err = tracker.attach(&session, &conn).await.unwrap_err();
        assert!(matches!(err, HubError::OwnershipConflict(_)));
        assert!(pool.is_empty().await);
        assert!(tracker.connections_of("alice-token").await.is_empty());
    }

    #[tokio::test]
    async fn test_supersede_notifies_control_surfaces() {
        let (tracker, pool, _) = tracker(directory());
        let session = tracker.authenticate("alice-token").await.unwrap();
        let mut desk_socket = TestSocket::new();
        let b1_socket = TestSocket::new();
        let b2_socket = TestSocket::new();

        let desk = connection(&desk_socket, 1, ConnectionClass::Desktop, "K1", &session);
        let b1 = connection(&b1_socket, 2, ConnectionClass::Bridge4, "K1", &session);
        let b2 = connection(&b2_socket, 3, ConnectionClass::Bridge5, "K1", &session);

        tracker.attach(&session, &desk).await.unwrap();
        tracker.attach(&session, &b1).await.unwrap();
        desk_socket.drain();

        tracker.attach(&session, &b2).await.unwrap();
        assert_eq!(b1.close_reason(), Some(CloseReason::Superseded));
        assert_eq!(pool.active_bridge(&MagicKey::new("K1")).await.unwrap().id, b2.id);

        let events: Vec<_> = desk_socket
            .drain()
            .into_iter()
            .map(|frame| frame["event"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(events, vec!["bridgeLost", "bridgeConnected"]);
        assert_eq!(tracker.connections_of("alice-token").await.len(), 2);
    }

    #[tokio::test]
    async fn test_detach_bridge_sends_bridge_lost() {
        let (tracker, pool, _) = tracker(directory());
        let session = tracker.authenticate("alice-token").await.unwrap();
        let mut phone_socket = TestSocket::new();
        let bridge_socket = TestSocket::new();
        let phone = connection(&phone_socket, 1, ConnectionClass::Mobile, "K1", &session);
        let bridge = connection(&bridge_socket, 2, ConnectionClass::Bridge4, "K1", &session);
        tracker.attach(&session, &bridge).await.unwrap();
        tracker.attach(&session, &phone).await.unwrap();
        phone_socket.drain();

        tracker.detach(&bridge, CloseReason::ClientClosed).await;
        assert!(bridge.is_closed());
        assert!(pool.active_bridge(&MagicKey::new("K1")).await.is_err());
        let frames = phone_socket.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "bridgeLost");

        // Idempotent.
        tracker.detach(&bridge, CloseReason::ClientClosed).await;
        assert!(phone_socket.drain().is_empty());
    }

    #[tokio::test]
    async fn test_detach_control_surface_sends_peer_lost() {
        let (tracker, pool, _) = tracker(directory());
        let session = tracker.authenticate("alice-token").await.unwrap();
        let mut desk_socket = TestSocket::new();
        let mut phone_socket = TestSocket::new();
        let desk = connection(&desk_socket, 1, ConnectionClass::Desktop, "K1", &session);
        let phone = connection(&phone_socket, 2, ConnectionClass::Mobile, "K1", &session);
        tracker.attach(&session, &desk).await.unwrap();
        tracker.attach(&session, &phone).await.unwrap();
        desk_socket.drain();

        tracker.detach(&phone, CloseReason::ClientClosed).await;
        assert_eq!(
            desk_socket.drain(),
            vec![serde_json::json!({"event": "peerLost", "magicKey": "K1", "class": "mobile"})]
        );
        assert!(phone_socket.drain().iter().all(|f| f["event"] != "peerLost"));
        assert_eq!(pool.control_surfaces(&MagicKey::new("K1")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_detach_evicts_dead_peers() {
        let (tracker, pool, _) = tracker(directory());
        let session = tracker.authenticate("alice-token").await.unwrap();
        let dead_socket = TestSocket::new();
        let bridge_socket = TestSocket::new();
        let dead = connection(&dead_socket, 1, ConnectionClass::Desktop, "K1", &session);
        let bridge = connection(&bridge_socket, 2, ConnectionClass::Bridge5, "K1", &session);
        tracker.attach(&session, &dead).await.unwrap();
        tracker.attach(&session, &bridge).await.unwrap();
        drop(dead_socket);

        tracker.detach(&bridge, CloseReason::HeartbeatTimeout).await;
        assert_eq!(dead.close_reason(), Some(CloseReason::PeerSendFailure));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_competing_session_is_flagged() {
        let dir = directory();
        dir.insert_token("alice-phone", UserId::new("alice"), Utc::now() + ChronoDuration::hours(1));
        let (tracker, _, sync) = tracker(dir);
        let mut events = sync.subscribe();

        let s1 = tracker.authenticate("alice-token").await.unwrap();
        let s2 = tracker.authenticate("alice-phone").await.unwrap();
        assert_ne!(s1.id, s2.id);

        let socket = TestSocket::new();
        let first = connection(&socket, 1, ConnectionClass::Mobile, "K1", &s1);
        let second = connection(&socket, 2, ConnectionClass::Mobile, "K1", &s2);
        tracker.attach(&s1, &first).await.unwrap();
        tracker.attach(&s2, &second).await.unwrap();

        let mut competing = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, HubEvent::Session(SessionEvent::Competing { .. })) {
                competing = true;
            }
        }
        assert!(competing);
        assert!(first.is_active() && second.is_active());
    }

    #[tokio::test]
    async fn test_logout_closes_connections() {
        let (tracker, pool, _) = tracker(directory());
        let session = tracker.authenticate("alice-token").await.unwrap();
        let socket = TestSocket::new();
        let desk = connection(&socket, 1, ConnectionClass::Desktop, "K1", &session);
        let bridge = connection(&socket, 2, ConnectionClass::Bridge4, "K2", &session);
        tracker.attach(&session, &desk).await.unwrap();
        tracker.attach(&session, &bridge).await.unwrap();

        assert_eq!(tracker.logout("alice-token").await.unwrap(), 2);
        assert_eq!(desk.close_reason(), Some(CloseReason::LoggedOut));
        assert_eq!(bridge.close_reason(), Some(CloseReason::LoggedOut));
        assert!(pool.is_empty().await);
        assert_eq!(tracker.session_count().await, 0);
        // Revoked tokens no longer validate.
        assert!(matches!(
            tracker.authenticate("alice-token").await,
            Err(HubError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_expire_closes_with_expired_token() {
        let (tracker, pool, _) = tracker(directory());
        let session = tracker.authenticate("alice-token").await.unwrap();
        let socket = TestSocket::new();
        let desk = connection(&socket, 1, ConnectionClass::Desktop, "K1", &session);
        tracker.attach(&session, &desk).await.unwrap();

        assert_eq!(tracker.expire(Utc::now()).await, 0);
        assert_eq!(tracker.expire(session.expires_at).await, 1);
        assert_eq!(desk.close_reason(), Some(CloseReason::ExpiredToken));
        assert!(pool.is_empty().await);
    }
}
