//! Shared fixtures for the hub's unit tests.

use std::sync::Arc;
use tokio::sync::mpsc;
use tradelink_core::*;
use tradelink_data::memory::{MemoryAudit, MemoryDirectory};

use crate::config::HubConfig;
use crate::connection::{Connection, Frame};
use crate::hub::{Collaborators, Hub};

/// Stands in for a transport: owns the strong end of an outbound queue.
pub(crate) struct TestSocket {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

impl TestSocket {
    pub(crate) fn new() -> Self {
        Self::with_capacity(64)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx }
    }

    pub(crate) fn weak(&self) -> mpsc::WeakSender<Frame> {
        self.tx.downgrade()
    }

    /// Everything queued so far, parsed.
    pub(crate) fn drain(&mut self) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(serde_json::from_str(&frame).expect("queued frames are JSON"));
        }
        frames
    }
}

/// alice owns K1 and K2, bob owns K3.
pub(crate) fn directory() -> Arc<MemoryDirectory> {
    Arc::new(
        MemoryDirectory::new()
            .with_user("alice-token", "alice", &["K1", "K2"])
            .with_user("bob-token", "bob", &["K3"]),
    )
}

pub(crate) fn test_hub() -> (Arc<Hub>, Arc<MemoryDirectory>, Arc<MemoryAudit>) {
    test_hub_with(HubConfig {
        supersede_grace_ms: 0,
        ..HubConfig::default()
    })
}

pub(crate) fn test_hub_with(config: HubConfig) -> (Arc<Hub>, Arc<MemoryDirectory>, Arc<MemoryAudit>) {
    let directory = directory();
    let audit = Arc::new(MemoryAudit::new());
    let hub = Hub::new(
        config,
        Collaborators {
            auth: directory.clone(),
            ownership: directory.clone(),
            audit: audit.clone(),
        },
    );
    (hub, directory, audit)
}

pub(crate) async fn connect(
    hub: &Hub,
    token: &str,
    key: &str,
    class: ConnectionClass,
) -> (Arc<Connection>, TestSocket) {
    connect_with(hub, token, key, class, TestSocket::new()).await
}

/// Like [`connect`], over a caller-built socket.
pub(crate) async fn connect_with(
    hub: &Hub,
    token: &str,
    key: &str,
    class: ConnectionClass,
    socket: TestSocket,
) -> (Arc<Connection>, TestSocket) {
    let handshake = Handshake {
        token: token.to_string(),
        magic_key: MagicKey::new(key),
        class,
    };
    let conn = hub
        .handshake(&handshake, socket.weak())
        .await
        .expect("handshake accepted");
    (conn, socket)
}
