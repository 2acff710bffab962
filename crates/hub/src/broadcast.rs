//! Link-state events and state-report fan-out to control surfaces.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use tradelink_core::*;

use crate::connection::{encode, Connection, Delivery, Frame};

/// Pushes frames to the control surfaces of a magic key and republishes
/// every hub event to in-process observers.
///
/// Every push is a non-blocking enqueue; callers get back the peers that
/// must be evicted and do the eviction themselves.
pub struct StateSync {
    events: broadcast::Sender<HubEvent>,
}

impl StateSync {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// Publish to observers. Having no observers is fine.
    pub fn publish(&self, event: HubEvent) {
        let _ = self.events.send(event);
    }

    /// Publish a membership change and push the matching link event to
    /// `peers`. Returns peers that could not take the event.
    pub fn link_change(&self, change: LinkChange, peers: &[Arc<Connection>]) -> Vec<Arc<Connection>> {
        let event = wire_event(&change);
        self.publish(HubEvent::Link(change));
        match event {
            Some(event) => self.notify(peers, &event),
            None => Vec::new(),
        }
    }

    /// Push one link event to every peer. A peer whose queue is full or gone
    /// would silently miss a membership change, so both count as failures.
    pub fn notify(&self, peers: &[Arc<Connection>], event: &LinkEvent) -> Vec<Arc<Connection>> {
        let Some(frame) = encode(event) else {
            return Vec::new();
        };
        let mut failed = Vec::new();
        for peer in peers {
            match peer.try_deliver(Arc::clone(&frame)) {
                Delivery::Sent => {}
                Delivery::Full | Delivery::Gone => {
                    warn!(conn_id = %peer.id, magic_key = %event.magic_key, "link event undeliverable");
                    failed.push(Arc::clone(peer));
                }
            }
        }
        debug!(magic_key = %event.magic_key, event = ?event.event, recipients = peers.len(), "link event");
        failed
    }

    /// Push an encoded state report to every peer. A full queue skips this
    /// report for that peer; a gone peer is returned for eviction.
    pub fn fan_out(&self, peers: &[Arc<Connection>], frame: Frame) -> Vec<Arc<Connection>> {
        let mut failed = Vec::new();
        for peer in peers {
            match peer.try_deliver(Arc::clone(&frame)) {
                Delivery::Sent => {}
                Delivery::Full => {
                    debug!(conn_id = %peer.id, "outbound queue full, skipping state report");
                }
                Delivery::Gone => failed.push(Arc::clone(peer)),
            }
        }
        failed
    }

    /// First frames for a newly attached control surface: the current bridge
    /// state followed by the cached snapshots.
    pub fn bootstrap(
        &self,
        conn: &Connection,
        bridge: Option<ConnectionClass>,
        snapshots: &[Frame],
    ) -> Delivery {
        let event = LinkEvent {
            event: if bridge.is_some() {
                LinkEventKind::BridgeConnected
            } else {
                LinkEventKind::BridgeLost
            },
            magic_key: conn.magic_key.clone(),
            class: bridge,
        };
        let frames = encode(&event).into_iter().chain(snapshots.iter().cloned());
        for frame in frames {
            match conn.try_deliver(frame) {
                Delivery::Sent => {}
                other => return other,
            }
        }
        Delivery::Sent
    }
}

/// The control-surface-facing event for a membership change, if any.
fn wire_event(change: &LinkChange) -> Option<LinkEvent> {
    match change {
        LinkChange::BridgeConnected {
            magic_key, class, ..
        } => Some(LinkEvent::new(
            LinkEventKind::BridgeConnected,
            magic_key.clone(),
            *class,
        )),
        LinkChange::BridgeLost {
            magic_key, class, ..
        } => Some(LinkEvent::new(
            LinkEventKind::BridgeLost,
            magic_key.clone(),
            *class,
        )),
        LinkChange::ControlSurfaceLost {
            magic_key, class, ..
        } => Some(LinkEvent::new(LinkEventKind::PeerLost, magic_key.clone(), *class)),
        LinkChange::BridgeSuperseded { .. }
        | LinkChange::ControlSurfaceBound { .. }
        | LinkChange::ConnectionLost { .. } => None,
    }
}
