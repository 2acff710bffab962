//! WebSocket transport: one reader and one writer per socket.
//!
//! The first frame must be a handshake. After it is accepted the reader
//! feeds every text frame to the hub and the writer drains the connection's
//! outbound queue until the hub closes the connection or the peer goes away.

use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use tradelink_core::{AckFrame, CloseReason, Handshake, HandshakeReply, Reason};
use tradelink_hub::connection::encode;
use tradelink_hub::{Connection, Frame, Hub};

/// Close code sent after a rejected handshake.
pub const HANDSHAKE_REJECTED: u16 = 4000;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sender, mut receiver) = socket.split();

    let handshake = match tokio::time::timeout(
        hub.config().handshake_timeout(),
        read_handshake(&mut receiver),
    )
    .await
    {
        Ok(Some(handshake)) => handshake,
        Ok(None) => {
            reject(&mut sender, Reason::MalformedFrame).await;
            return;
        }
        Err(_) => {
            debug!("handshake timed out");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let (tx, rx) = mpsc::channel::<Frame>(hub.config().outbound_queue_capacity);
    let conn = match hub.handshake(&handshake, tx.downgrade()).await {
        Ok(conn) => conn,
        Err(e) => {
            info!(
                magic_key = %handshake.magic_key,
                class = %handshake.class,
                error = %e,
                "handshake rejected"
            );
            reject(&mut sender, e.reason()).await;
            return;
        }
    };

    // The reply goes out before the writer starts, so it precedes any
    // bootstrap frames already queued for the connection.
    if send_json(&mut sender, &HandshakeReply::authenticated()).await.is_err() {
        hub.disconnect(&conn, CloseReason::ClientClosed).await;
        return;
    }
    debug!(conn_id = %conn.id, class = %conn.class, magic_key = %conn.magic_key, "socket ready");

    let writer = tokio::spawn(write_loop(sender, rx, conn.closed_signal()));
    let cause = read_loop(&hub, &conn, &mut receiver).await;
    hub.disconnect(&conn, cause).await;
    drop(tx);
    let _ = writer.await;
    debug!(conn_id = %conn.id, %cause, "socket finished");
}

/// Wait for the handshake frame, skipping control frames.
async fn read_handshake(receiver: &mut SplitStream<WebSocket>) -> Option<Handshake> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                return match serde_json::from_str(text.as_str()) {
                    Ok(handshake) => Some(handshake),
                    Err(e) => {
                        debug!(error = %e, "malformed handshake");
                        None
                    }
                };
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(_) | Err(_) => return None,
        }
    }
    None
}

async fn reject(sender: &mut SplitSink<WebSocket, Message>, reason: Reason) {
    let _ = send_json(sender, &HandshakeReply::rejected(reason)).await;
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: HANDSHAKE_REJECTED,
            reason: reason.as_str().into(),
        })))
        .await;
}

async fn send_json<T: Serialize>(
    sender: &mut SplitSink<WebSocket, Message>,
    value: &T,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).map_err(axum::Error::new)?;
    sender.send(Message::Text(text.into())).await
}

/// Feed inbound frames to the hub until the socket ends or the hub closes
/// the connection. Returns why the connection ended.
async fn read_loop(
    hub: &Hub,
    conn: &Arc<Connection>,
    receiver: &mut SplitStream<WebSocket>,
) -> CloseReason {
    let mut closed = conn.closed_signal();
    loop {
        if let Some(reason) = conn.close_reason() {
            return reason;
        }
        tokio::select! {
            changed = closed.changed() => {
                if changed.is_err() {
                    return CloseReason::ClientClosed;
                }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(ack) = hub.route(conn, text.as_str()).await {
                        reply(conn, &ack).await;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    hub.touch(conn);
                    reply(conn, &AckFrame::rejected(0, Reason::MalformedFrame)).await;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => hub.touch(conn),
                Some(Ok(Message::Close(_))) | None => return CloseReason::ClientClosed,
                Some(Err(e)) => {
                    debug!(conn_id = %conn.id, error = %e, "socket read error");
                    return CloseReason::ClientClosed;
                }
            }
        }
    }
}

/// Acks share the outbound queue so they stay ordered with forwarded frames.
async fn reply(conn: &Connection, ack: &AckFrame) {
    if let Some(frame) = encode(ack) {
        if conn.deliver(frame).await.is_err() {
            debug!(conn_id = %conn.id, seq = ack.seq, "ack undeliverable");
        }
    }
}

/// Drain the outbound queue into the socket, then send a close frame
/// carrying the hub's close reason.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Frame>,
    mut closed: watch::Receiver<Option<CloseReason>>,
) {
    loop {
        let closing = closed.borrow().is_some();
        if closing {
            break;
        }
        tokio::select! {
            biased;
            changed = closed.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if sender.send(Message::Text(frame.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    let reason = *closed.borrow();
    let close = reason.map(|reason| CloseFrame {
        code: reason.code(),
        reason: reason.as_str().into(),
    });
    let _ = sender.send(Message::Close(close)).await;
}
