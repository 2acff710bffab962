use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tradelink_core::*;

use crate::broadcast::StateSync;
use crate::config::HubConfig;
use crate::connection::{Connection, Frame};
use crate::error::HubError;
use crate::liveness::{LivenessManager, SweepReport};
use crate::pool::{ConnectionPool, KeyStatus};
use crate::router::Router;
use crate::session::SessionTracker;

/// External services the broker consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthService>,
    pub ownership: Arc<dyn OwnershipStore>,
    pub audit: Arc<dyn AuditSink>,
}

/// The broker. Transports hand it sockets' frames; everything else
/// (registry, sessions, liveness, state sync) lives behind it.
pub struct Hub {
    config: HubConfig,
    pool: Arc<ConnectionPool>,
    sessions: Arc<SessionTracker>,
    sync: Arc<StateSync>,
    router: Router,
    liveness: LivenessManager,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Hub {
    pub fn new(config: HubConfig, collaborators: Collaborators) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool::new());
        let sync = Arc::new(StateSync::new(config.event_channel_capacity));
        let sessions = Arc::new(SessionTracker::new(
            collaborators.auth,
            collaborators.ownership,
            Arc::clone(&pool),
            Arc::clone(&sync),
            config.supersede_grace(),
        ));
        let router = Router::new(
            Arc::clone(&pool),
            Arc::clone(&sessions),
            Arc::clone(&sync),
            collaborators.audit,
            config.bridge_send_timeout(),
        );
        let liveness = LivenessManager::new(config.heartbeat_interval(), config.max_missed_heartbeats);
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            config,
            pool,
            sessions,
            sync,
            router,
            liveness,
            next_id: AtomicU64::new(1),
            shutdown,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Authenticate a handshake and register the new connection.
    ///
    /// `outbound` is the weak end of the queue the transport's write task
    /// drains. On error nothing is left registered and the caller should
    /// reply with [`HubError::reason`] and close the socket.
    pub async fn handshake(
        &self,
        handshake: &Handshake,
        outbound: mpsc::WeakSender<Frame>,
    ) -> Result<Arc<Connection>, HubError> {
        let session = self.sessions.authenticate(&handshake.token).await?;
        if handshake.magic_key.is_blank() {
            return Err(HubError::OwnershipConflict(handshake.magic_key.clone()));
        }

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let conn = Arc::new(Connection::new(
            id,
            handshake.class,
            handshake.magic_key.clone(),
            outbound,
        ));
        conn.touch(Instant::now());
        conn.mark_authenticated(session.user_id.clone(), session.id.to_string());

        self.sessions.attach(&session, &conn).await?;
        Ok(conn)
    }

    /// Route one inbound text frame. `None` means no ack is owed.
    pub async fn route(&self, conn: &Arc<Connection>, text: &str) -> Option<AckFrame> {
        self.router.route(conn, text).await
    }

    /// Record liveness for frames that never reach the router (ping/pong).
    pub fn touch(&self, conn: &Connection) {
        conn.touch(Instant::now());
    }

    /// The transport is done with `conn`.
    pub async fn disconnect(&self, conn: &Arc<Connection>, cause: CloseReason) {
        self.sessions.detach(conn, cause).await;
    }

    pub async fn logout(&self, token: &str) -> Result<usize, HubError> {
        self.sessions.logout(token).await
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// One liveness sweep plus session expiry, as of `now`.
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let report = self
            .liveness
            .sweep(&self.pool, &self.sessions, &self.sync, now)
            .await;
        let expired = self.sessions.expire(Utc::now()).await;
        debug!(
            checked = report.checked,
            missed = report.missed,
            evicted = report.evicted.len(),
            expired,
            "maintenance sweep"
        );
        report
    }

    /// Run [`Hub::sweep`] once per heartbeat interval until shutdown.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::downgrade(self);
        let mut stop = self.shutdown.subscribe();
        let period = self.liveness.interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(hub) = hub.upgrade() else { break };
                        hub.sweep(Instant::now()).await;
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("maintenance loop stopped");
        })
    }

    /// Stop maintenance and close every connection.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.sessions.close_all(CloseReason::Shutdown).await;
        for conn in self.pool.all().await {
            self.sessions.detach(&conn, CloseReason::Shutdown).await;
        }
        info!("hub shut down");
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sync.subscribe()
    }

    pub async fn key_status(&self, key: &MagicKey) -> Option<KeyStatus> {
        self.pool.status(key).await
    }

    pub async fn connection_count(&self) -> usize {
        self.pool.len().await
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.session_count().await
    }
}
