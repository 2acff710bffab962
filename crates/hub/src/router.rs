//! Command router: classify, authorize, forward, acknowledge.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use tradelink_core::*;

use crate::broadcast::StateSync;
use crate::connection::{encode, Connection, Frame};
use crate::pool::ConnectionPool;
use crate::session::SessionTracker;

/// Bridges replaced while one trade intent waits before it gives up.
const MAX_FORWARD_ATTEMPTS: usize = 3;

pub struct Router {
    pool: Arc<ConnectionPool>,
    sessions: Arc<SessionTracker>,
    sync: Arc<StateSync>,
    audit: Arc<dyn AuditSink>,
    bridge_send_timeout: Duration,
}

impl Router {
    pub fn new(
        pool: Arc<ConnectionPool>,
        sessions: Arc<SessionTracker>,
        sync: Arc<StateSync>,
        audit: Arc<dyn AuditSink>,
        bridge_send_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            sessions,
            sync,
            audit,
            bridge_send_timeout,
        }
    }

    /// Handle one inbound text frame from `conn`.
    ///
    /// Returns the ack for the sender, or `None` for heartbeats. Frames from
    /// one connection must be routed one at a time; the transport's read loop
    /// guarantees that.
    pub async fn route(&self, conn: &Arc<Connection>, text: &str) -> Option<AckFrame> {
        conn.touch(Instant::now());

        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                debug!(conn_id = %conn.id, error = %e, "malformed frame");
                return Some(AckFrame::rejected(0, Reason::MalformedFrame));
            }
        };
        let seq_hint = value.get("seq").and_then(Value::as_u64).unwrap_or(0);
        let frame: CommandFrame = match serde_json::from_value(value) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(conn_id = %conn.id, error = %e, "malformed frame");
                return Some(AckFrame::rejected(seq_hint, Reason::MalformedFrame));
            }
        };

        let Some(kind) = CommandKind::parse(&frame.kind) else {
            debug!(conn_id = %conn.id, kind = %frame.kind, "unknown command kind");
            return Some(AckFrame::rejected(frame.seq, Reason::UnknownKind));
        };
        if kind == CommandKind::Heartbeat {
            return None;
        }
        if !kind.allowed_from(conn.class) {
            debug!(conn_id = %conn.id, class = %conn.class, %kind, "wrong source class");
            return Some(AckFrame::rejected(frame.seq, Reason::WrongSourceClass));
        }

        let command = Command {
            source: conn.id,
            source_class: conn.class,
            magic_key: conn.magic_key.clone(),
            kind,
            payload: frame.payload,
            seq: frame.seq,
            received_at: Utc::now(),
        };
        let ack = self.dispatch(conn, &command).await;

        if let Some(user) = conn.user() {
            self.audit.record_command(CommandRecord::new(
                user.clone(),
                command,
                ack.status,
                ack.reason,
            ));
        }
        Some(ack)
    }

    async fn dispatch(&self, conn: &Arc<Connection>, command: &Command) -> AckFrame {
        let seq = command.seq;
        let Some(mut slot) = self.pool.lock_slot(&conn.magic_key).await else {
            return AckFrame::rejected(seq, Reason::NotActive);
        };
        if !conn.is_active() || !slot.holds(conn) {
            return AckFrame::rejected(seq, Reason::NotActive);
        }
        if slot.owner() != conn.user() {
            return AckFrame::rejected(seq, Reason::OwnershipConflict);
        }
        if !conn.accept_seq(seq) {
            warn!(
                conn_id = %conn.id,
                magic_key = %conn.magic_key,
                seq,
                last_seq = ?conn.last_seq(),
                "duplicate or stale sequence"
            );
            return AckFrame::dropped(seq, Reason::DuplicateOrStaleSequence);
        }
        if let Err(e) = validate_payload(command.kind, &command.payload) {
            debug!(conn_id = %conn.id, seq, error = %e, "invalid payload");
            return AckFrame::rejected(seq, Reason::InvalidPayload);
        }

        let forwarded = ForwardedFrame {
            seq,
            kind: command.kind,
            payload: command.payload.clone(),
            from: conn.class,
        };
        let Some(frame) = encode(&forwarded) else {
            return AckFrame::rejected(seq, Reason::MalformedFrame);
        };

        match command.kind.category() {
            CommandCategory::TradeIntent => {
                let Some(bridge) = slot.active_bridge() else {
                    debug!(conn_id = %conn.id, magic_key = %conn.magic_key, seq, "no bridge");
                    return AckFrame::rejected(seq, Reason::NoBridge);
                };
                drop(slot);
                self.forward_intent(conn, bridge, command, frame).await
            }
            CommandCategory::StateReport => {
                slot.snapshots.insert(command.kind, Arc::clone(&frame));
                let peers = slot.control_surfaces();
                drop(slot);

                for peer in self.sync.fan_out(&peers, frame) {
                    warn!(conn_id = %peer.id, magic_key = %conn.magic_key, "control surface gone");
                    self.sessions
                        .detach(&peer, CloseReason::PeerSendFailure)
                        .await;
                }
                AckFrame::forwarded(seq)
            }
            // Heartbeats return before dispatch.
            CommandCategory::Control => AckFrame::forwarded(seq),
        }
    }

    /// Hand a trade intent to the key's active bridge.
    ///
    /// Room in the bridge's queue is reserved without holding the key lock.
    /// The frame is committed under the lock, and only if that bridge is
    /// still the key's active bridge; otherwise the current one is tried.
    async fn forward_intent(
        &self,
        conn: &Connection,
        mut bridge: Arc<Connection>,
        command: &Command,
        frame: Frame,
    ) -> AckFrame {
        let seq = command.seq;
        for _ in 0..MAX_FORWARD_ATTEMPTS {
            let reserved = tokio::time::timeout(self.bridge_send_timeout, bridge.reserve()).await;

            let Some(slot) = self.pool.lock_slot(&conn.magic_key).await else {
                return AckFrame::rejected(seq, Reason::NoBridge);
            };
            let current = slot.active_bridge();
            let still_current =
                bridge.is_active() && current.as_ref().is_some_and(|active| active.id == bridge.id);
            if !still_current {
                drop(slot);
                let Some(active) = current else {
                    debug!(conn_id = %conn.id, magic_key = %conn.magic_key, seq, "bridge left while forwarding");
                    return AckFrame::rejected(seq, Reason::NoBridge);
                };
                debug!(old = %bridge.id, new = %active.id, seq, "bridge replaced while forwarding");
                bridge = active;
                continue;
            }

            match reserved {
                Ok(Ok(permit)) => {
                    permit.send(frame);
                    debug!(conn_id = %conn.id, bridge = %bridge.id, seq, kind = %command.kind, "forwarded");
                    return AckFrame::forwarded(seq);
                }
                Ok(Err(e)) => {
                    drop(slot);
                    warn!(bridge = %bridge.id, magic_key = %conn.magic_key, error = %e, "bridge send failed");
                }
                Err(_) => {
                    drop(slot);
                    warn!(
                        bridge = %bridge.id,
                        magic_key = %conn.magic_key,
                        timeout = ?self.bridge_send_timeout,
                        "bridge queue stayed full"
                    );
                }
            }
            self.sessions
                .detach(&bridge, CloseReason::PeerSendFailure)
                .await;
            return AckFrame::rejected(seq, Reason::NoBridge);
        }

        warn!(magic_key = %conn.magic_key, seq, "bridge kept changing while forwarding");
        AckFrame::rejected(seq, Reason::NoBridge)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::HubConfig;
    use crate::testing::{connect, connect_with, test_hub, test_hub_with, TestSocket};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tradelink_core::*;

    fn cmd(seq: u64, kind: &str, payload: serde_json::Value) -> String {
        json!({"seq": seq, "kind": kind, "payload": payload}).to_string()
    }

    fn open() -> serde_json::Value {
        json!({"symbol": "EURUSD", "side": "buy", "volume": "0.10"})
    }

    #[tokio::test]
    async fn test_trade_intent_without_bridge_is_rejected() {
        let (hub, _, audit) = test_hub();
        let (desk, _socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Desktop).await;

        let ack = hub.route(&desk, &cmd(1, "open", open())).await.unwrap();
        assert_eq!(ack, AckFrame::rejected(1, Reason::NoBridge));
        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, Some(Reason::NoBridge));
    }

    #[tokio::test]
    async fn test_trade_intent_reaches_only_the_bridge() {
        let (hub, _, _) = test_hub();
        let (desk, mut desk_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Desktop).await;
        let (_phone, mut phone_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Mobile).await;
        let (_bridge, mut bridge_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Bridge4).await;
        desk_socket.drain();
        phone_socket.drain();

        let ack = hub.route(&desk, &cmd(1, "open", open())).await.unwrap();
        assert_eq!(ack, AckFrame::forwarded(1));

        let frames = bridge_socket.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0],
            json!({"seq": 1, "kind": "open", "payload": open(), "from": "desktop"})
        );
        assert!(desk_socket.drain().is_empty());
        assert!(phone_socket.drain().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_sequence_dropped() {
        let (hub, _, _) = test_hub();
        let (desk, _desk_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Desktop).await;
        let (_bridge, mut bridge_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Bridge5).await;

        let close = json!({"ticket": 1001});
        assert_eq!(
            hub.route(&desk, &cmd(5, "close", close.clone())).await,
            Some(AckFrame::forwarded(5))
        );
        assert_eq!(
            hub.route(&desk, &cmd(5, "close", close.clone())).await,
            Some(AckFrame::dropped(5, Reason::DuplicateOrStaleSequence))
        );
        assert_eq!(
            hub.route(&desk, &cmd(4, "close", close.clone())).await,
            Some(AckFrame::dropped(4, Reason::DuplicateOrStaleSequence))
        );
        assert_eq!(
            hub.route(&desk, &cmd(6, "close", close)).await,
            Some(AckFrame::forwarded(6))
        );
        let seqs: Vec<_> = bridge_socket.drain().iter().map(|f| f["seq"].clone()).collect();
        assert_eq!(seqs, vec![json!(5), json!(6)]);
    }

    #[tokio::test]
    async fn test_rejected_command_consumes_sequence() {
        let (hub, _, _) = test_hub();
        let (desk, _socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Desktop).await;
        assert_eq!(
            hub.route(&desk, &cmd(3, "open", open())).await,
            Some(AckFrame::rejected(3, Reason::NoBridge))
        );
        let (_bridge, _bridge_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Bridge4).await;
        assert_eq!(
            hub.route(&desk, &cmd(3, "open", open())).await,
            Some(AckFrame::dropped(3, Reason::DuplicateOrStaleSequence))
        );
    }

    #[tokio::test]
    async fn test_classification_rejections() {
        let (hub, _, audit) = test_hub();
        let (desk, _socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Desktop).await;
        let (bridge, _bridge_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Bridge4).await;

        assert_eq!(
            hub.route(&desk, "{not json").await,
            Some(AckFrame::rejected(0, Reason::MalformedFrame))
        );
        assert_eq!(
            hub.route(&desk, r#"{"seq": 9, "payload": {}}"#).await,
            Some(AckFrame::rejected(9, Reason::MalformedFrame))
        );
        assert_eq!(
            hub.route(&desk, &cmd(1, "buy", json!({}))).await,
            Some(AckFrame::rejected(1, Reason::UnknownKind))
        );
        assert_eq!(
            hub.route(&desk, &cmd(2, "tick", json!({}))).await,
            Some(AckFrame::rejected(2, Reason::WrongSourceClass))
        );
        assert_eq!(
            hub.route(&bridge, &cmd(1, "open", open())).await,
            Some(AckFrame::rejected(1, Reason::WrongSourceClass))
        );
        assert_eq!(hub.route(&desk, &cmd(3, "heartbeat", json!(null))).await, None);
        // None of the above passed classification.
        assert!(audit.records().is_empty());

        assert_eq!(
            hub.route(&desk, &cmd(4, "open", json!({"symbol": "EURUSD"}))).await,
            Some(AckFrame::rejected(4, Reason::InvalidPayload))
        );
        assert_eq!(audit.records().len(), 1);
    }

    #[tokio::test]
    async fn test_state_report_fans_out_and_is_cached() {
        let (hub, _, _) = test_hub();
        let (_desk, mut desk_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Desktop).await;
        let (_other, mut other_socket) = connect(&hub, "alice-token", "K2", ConnectionClass::Desktop).await;
        let (bridge, _bridge_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Bridge5).await;
        desk_socket.drain();
        other_socket.drain();

        let snapshot = json!({"balance": "10000.00", "equity": "10012.50"});
        let ack = hub
            .route(&bridge, &cmd(1, "accountSnapshot", snapshot.clone()))
            .await;
        assert_eq!(ack, Some(AckFrame::forwarded(1)));
        let frames = desk_socket.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["from"], "bridge5");
        assert_eq!(frames[0]["payload"], snapshot);
        assert!(other_socket.drain().is_empty());

        hub.route(&bridge, &cmd(2, "accountSnapshot", json!({"balance": "9990.00"})))
            .await;

        // A late control surface gets the bridge state and the latest snapshot only.
        let (_phone, mut phone_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Mobile).await;
        let frames = phone_socket.drain();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["event"], "bridgeConnected");
        assert_eq!(frames[1]["seq"], 2);
    }

    #[tokio::test]
    async fn test_unregistered_connection_receives_nothing() {
        let (hub, _, _) = test_hub();
        let (desk, mut desk_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Desktop).await;
        let (bridge, _bridge_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Bridge4).await;
        desk_socket.drain();

        hub.disconnect(&desk, CloseReason::ClientClosed).await;
        hub.route(&bridge, &cmd(1, "positions", json!([]))).await;
        assert!(desk_socket.drain().is_empty());

        assert_eq!(
            hub.route(&desk, &cmd(7, "open", open())).await,
            Some(AckFrame::rejected(7, Reason::NotActive))
        );
    }

    #[tokio::test]
    async fn test_failed_bridge_send_evicts_bridge() {
        let (hub, _, _) = test_hub();
        let (desk, mut desk_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Desktop).await;
        let (bridge, bridge_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Bridge4).await;
        desk_socket.drain();
        drop(bridge_socket);

        assert_eq!(
            hub.route(&desk, &cmd(1, "closeAll", json!(null))).await,
            Some(AckFrame::rejected(1, Reason::NoBridge))
        );
        assert_eq!(bridge.close_reason(), Some(CloseReason::PeerSendFailure));
        let frames = desk_socket.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "bridgeLost");
        assert!(hub.key_status(&MagicKey::new("K1")).await.unwrap().bridge.is_none());
    }

    #[tokio::test]
    async fn test_superseded_bridge_cannot_route() {
        let (hub, _, _) = test_hub();
        let (desk, _desk_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Desktop).await;
        let (b1, mut b1_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Bridge4).await;
        let (_b2, mut b2_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Bridge5).await;

        assert_eq!(
            hub.route(&b1, &cmd(1, "tick", json!({"bid": "1.1"}))).await,
            Some(AckFrame::rejected(1, Reason::NotActive))
        );
        hub.route(&desk, &cmd(1, "open", open())).await;
        assert!(b1_socket.drain().is_empty());
        assert_eq!(b2_socket.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_intent_waiting_on_superseded_bridge_goes_to_replacement() {
        let (hub, _, _) = test_hub_with(HubConfig {
            supersede_grace_ms: 60_000,
            ..HubConfig::default()
        });
        let (desk, _desk_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Desktop).await;
        let (b1, mut b1_socket) = connect_with(
            &hub,
            "alice-token",
            "K1",
            ConnectionClass::Bridge4,
            TestSocket::with_capacity(1),
        )
        .await;

        assert_eq!(
            hub.route(&desk, &cmd(1, "open", open())).await,
            Some(AckFrame::forwarded(1))
        );
        // b1's queue is full; seq 2 waits for room.
        let pending = {
            let hub = Arc::clone(&hub);
            let desk = Arc::clone(&desk);
            tokio::spawn(async move { hub.route(&desk, &cmd(2, "open", open())).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        let (b2, mut b2_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Bridge5).await;
        assert_eq!(b1.state(), ConnectionState::Draining);
        assert!(b2.is_active());

        // b1's writer flushes during the grace period, freeing its queue.
        let flushed = b1_socket.drain();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0]["seq"], 1);

        let ack = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack, Some(AckFrame::forwarded(2)));
        assert!(b1_socket.drain().is_empty());
        let frames = b2_socket.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["seq"], 2);
    }

    #[tokio::test]
    async fn test_stuck_bridge_is_evicted_after_send_timeout() {
        let (hub, _, _) = test_hub_with(HubConfig {
            supersede_grace_ms: 0,
            bridge_send_timeout_ms: 50,
            ..HubConfig::default()
        });
        let (desk, mut desk_socket) = connect(&hub, "alice-token", "K1", ConnectionClass::Desktop).await;
        let (bridge, _bridge_socket) = connect_with(
            &hub,
            "alice-token",
            "K1",
            ConnectionClass::Bridge4,
            TestSocket::with_capacity(1),
        )
        .await;
        desk_socket.drain();

        assert_eq!(
            hub.route(&desk, &cmd(1, "open", open())).await,
            Some(AckFrame::forwarded(1))
        );
        let ack = tokio::time::timeout(Duration::from_secs(1), hub.route(&desk, &cmd(2, "open", open())))
            .await
            .unwrap();
        assert_eq!(ack, Some(AckFrame::rejected(2, Reason::NoBridge)));
        assert_eq!(bridge.close_reason(), Some(CloseReason::PeerSendFailure));
        let frames = desk_socket.drain();
        assert_eq!(frames.last().unwrap()["event"], "bridgeLost");
    }
}
