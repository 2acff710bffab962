use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::warn;
use tradelink_core::*;

/// Serialized frame queued for a socket's write task.
pub type Frame = Arc<str>;

/// Result of a non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The peer's queue is full; the frame was not enqueued.
    Full,
    /// The peer is closed or its write task is gone.
    Gone,
}

/// The peer's outbound queue is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peer connection is gone")]
pub struct PeerGone;

/// Serialize a frame for the wire. Failures are logged and yield `None`.
pub fn encode<T: Serialize>(frame: &T) -> Option<Frame> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(error = %e, "failed to serialize outbound frame");
            None
        }
    }
}

/// One live duplex channel as seen by the broker.
///
/// The transport owns the socket and the strong end of the outbound queue;
/// the broker only holds a weak sender, so a vanished transport shows up as
/// [`Delivery::Gone`] rather than keeping the queue alive.
pub struct Connection {
    pub id: ConnectionId,
    pub class: ConnectionClass,
    pub magic_key: MagicKey,
    pub opened_at: DateTime<Utc>,
    user: OnceLock<UserId>,
    session: OnceLock<String>,
    state: AtomicU8,
    outbound: mpsc::WeakSender<Frame>,
    shutdown: watch::Sender<Option<CloseReason>>,
    /// Reference point for `last_heartbeat_ms`.
    epoch: Instant,
    last_heartbeat_ms: AtomicU64,
    missed_heartbeats: AtomicU32,
    last_seq: Mutex<Option<u64>>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        class: ConnectionClass,
        magic_key: MagicKey,
        outbound: mpsc::WeakSender<Frame>,
    ) -> Self {
        let (shutdown, _) = watch::channel(None);
        Self {
            id,
            class,
            magic_key,
            opened_at: Utc::now(),
            user: OnceLock::new(),
            session: OnceLock::new(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            outbound,
            shutdown,
            epoch: Instant::now(),
            last_heartbeat_ms: AtomicU64::new(0),
            missed_heartbeats: AtomicU32::new(0),
            last_seq: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Move to `next` if it is a legal successor of the current state.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !ConnectionState::from_u8(current).can_transition_to(next) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// `Connecting → Authenticated`, recording who owns the connection.
    pub fn mark_authenticated(&self, user: UserId, session_id: impl Into<String>) -> bool {
        if !self.transition(ConnectionState::Authenticated) {
            return false;
        }
        let _ = self.user.set(user);
        let _ = self.session.set(session_id.into());
        true
    }

    pub fn user(&self) -> Option<&UserId> {
        self.user.get()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.get().map(String::as_str)
    }

    /// Mark closed and signal the transport to shut the socket.
    /// Queued frames that were not yet written are discarded.
    pub fn close(&self, reason: CloseReason) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.shutdown.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Resolves with the close reason once [`Connection::close`] is called.
    pub fn closed_signal(&self) -> watch::Receiver<Option<CloseReason>> {
        self.shutdown.subscribe()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.shutdown.borrow()
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Enqueue without waiting.
    pub fn try_deliver(&self, frame: Frame) -> Delivery {
        if self.is_closed() {
            return Delivery::Gone;
        }
        let Some(tx) = self.outbound.upgrade() else {
            return Delivery::Gone;
        };
        match tx.try_send(frame) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    /// Wait for room in the outbound queue without committing a frame.
    ///
    /// The caller rechecks whatever made the frame worth sending and then
    /// fills the permit, or drops it to give the slot back.
    pub async fn reserve(&self) -> Result<mpsc::OwnedPermit<Frame>, PeerGone> {
        if self.is_closed() {
            return Err(PeerGone);
        }
        let tx = self.outbound.upgrade().ok_or(PeerGone)?;
        tx.reserve_owned().await.map_err(|_| PeerGone)
    }

    /// Enqueue, waiting for queue space if needed.
    pub async fn deliver(&self, frame: Frame) -> Result<(), PeerGone> {
        if self.is_closed() {
            return Err(PeerGone);
        }
        let tx = self.outbound.upgrade().ok_or(PeerGone)?;
        tx.send(frame).await.map_err(|_| PeerGone)
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    /// Record inbound activity at `now`.
    pub fn touch(&self, now: Instant) {
        let ms = now.saturating_duration_since(self.epoch).as_millis() as u64;
        self.last_heartbeat_ms.fetch_max(ms, Ordering::AcqRel);
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        let last = self.epoch + Duration::from_millis(self.last_heartbeat_ms.load(Ordering::Acquire));
        now.saturating_duration_since(last)
    }

    pub(crate) fn record_miss(&self) -> u32 {
        self.missed_heartbeats.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_misses(&self) {
        self.missed_heartbeats.store(0, Ordering::Release);
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Sequencing
    // -----------------------------------------------------------------------

    /// Accept `seq` if it is strictly greater than the last accepted value.
    pub fn accept_seq(&self, seq: u64) -> bool {
        let mut last = self.last_seq.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(prev) if seq <= prev => false,
            _ => {
                *last = Some(seq);
                true
            }
        }
    }

    pub fn last_seq(&self) -> Option<u64> {
        *self.last_seq.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("magic_key", &self.magic_key)
            .field("user", &self.user.get())
            .field("state", &self.state())
            .finish()
    }
}
