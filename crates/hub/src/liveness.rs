use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use tradelink_core::*;

use crate::broadcast::StateSync;
use crate::connection::Connection;
use crate::pool::ConnectionPool;
use crate::session::SessionTracker;

/// Outcome of checking one connection during a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Alive,
    /// Silent for another interval; carries the consecutive miss count.
    Missed(u32),
    Evict,
}

/// What one sweep did.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub checked: usize,
    pub missed: usize,
    pub evicted: Vec<ConnectionId>,
}

/// Heartbeat bookkeeping and stale-connection eviction.
#[derive(Debug, Clone, Copy)]
pub struct LivenessManager {
    interval: Duration,
    max_missed: u32,
}

impl LivenessManager {
    pub fn new(interval: Duration, max_missed: u32) -> Self {
        Self {
            interval,
            max_missed: max_missed.max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Classify `conn` at `now`, updating its miss counter.
    pub fn check(&self, conn: &Connection, now: Instant) -> Verdict {
        if conn.silent_for(now) <= self.interval {
            conn.reset_misses();
            return Verdict::Alive;
        }
        let missed = conn.record_miss();
        if missed >= self.max_missed {
            Verdict::Evict
        } else {
            Verdict::Missed(missed)
        }
    }

    /// One pass over every pooled connection.
    pub async fn sweep(
        &self,
        pool: &ConnectionPool,
        sessions: &SessionTracker,
        sync: &StateSync,
        now: Instant,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        let mut stale: Vec<Arc<Connection>> = Vec::new();

        for conn in pool.all().await {
            report.checked += 1;
            match self.check(&conn, now) {
                Verdict::Alive => {}
                Verdict::Missed(missed) => {
                    report.missed += 1;
                    debug!(conn_id = %conn.id, missed, "heartbeat missed");
                }
                Verdict::Evict => stale.push(conn),
            }
        }

        for conn in stale {
            warn!(
                conn_id = %conn.id,
                class = %conn.class,
                magic_key = %conn.magic_key,
                missed = conn.missed_heartbeats(),
                "evicting stale connection"
            );
            sync.publish(HubEvent::Link(LinkChange::ConnectionLost {
                magic_key: conn.magic_key.clone(),
                connection: conn.id,
                class: conn.class,
            }));
            sessions.detach(&conn, CloseReason::HeartbeatTimeout).await;
            report.evicted.push(conn.id);
        }
        report
    }
}
