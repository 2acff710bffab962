//! JSON frames exchanged with bridges and control surfaces over WebSocket.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{CommandKind, ConnectionClass, MagicKey};

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// First frame a client sends after the socket opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub token: String,
    pub magic_key: MagicKey,
    pub class: ConnectionClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStatus {
    Authenticated,
    Rejected,
}

/// The broker's answer to a [`Handshake`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub status: HandshakeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl HandshakeReply {
    pub fn authenticated() -> Self {
        Self {
            status: HandshakeStatus::Authenticated,
            reason: None,
        }
    }

    pub fn rejected(reason: Reason) -> Self {
        Self {
            status: HandshakeStatus::Rejected,
            reason: Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands & acknowledgements
// ---------------------------------------------------------------------------

/// A command as sent by a client. `kind` stays a raw string until the
/// router classifies it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    pub seq: u64,
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Forwarded,
    Rejected,
    Dropped,
}

impl AckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckStatus::Forwarded => "forwarded",
            AckStatus::Rejected => "rejected",
            AckStatus::Dropped => "dropped",
        }
    }
}

/// Machine-readable reason carried by rejected handshakes and acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    InvalidToken,
    ExpiredToken,
    OwnershipConflict,
    NoBridge,
    DuplicateOrStaleSequence,
    PeerSendFailure,
    MalformedFrame,
    UnknownKind,
    WrongSourceClass,
    NotActive,
    InvalidPayload,
    /// The auth or ownership collaborator could not be reached.
    Unavailable,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::InvalidToken => "InvalidToken",
            Reason::ExpiredToken => "ExpiredToken",
            Reason::OwnershipConflict => "OwnershipConflict",
            Reason::NoBridge => "NoBridge",
            Reason::DuplicateOrStaleSequence => "DuplicateOrStaleSequence",
            Reason::PeerSendFailure => "PeerSendFailure",
            Reason::MalformedFrame => "MalformedFrame",
            Reason::UnknownKind => "UnknownKind",
            Reason::WrongSourceClass => "WrongSourceClass",
            Reason::NotActive => "NotActive",
            Reason::InvalidPayload => "InvalidPayload",
            Reason::Unavailable => "Unavailable",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sent back to the originating connection only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFrame {
    pub seq: u64,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl AckFrame {
    pub fn forwarded(seq: u64) -> Self {
        Self {
            seq,
            status: AckStatus::Forwarded,
            reason: None,
        }
    }

    pub fn rejected(seq: u64, reason: Reason) -> Self {
        Self {
            seq,
            status: AckStatus::Rejected,
            reason: Some(reason),
        }
    }

    pub fn dropped(seq: u64, reason: Reason) -> Self {
        Self {
            seq,
            status: AckStatus::Dropped,
            reason: Some(reason),
        }
    }
}

/// A command delivered to its destination peer(s).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedFrame {
    pub seq: u64,
    pub kind: CommandKind,
    pub payload: serde_json::Value,
    pub from: ConnectionClass,
}

// ---------------------------------------------------------------------------
// Link-state events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkEventKind {
    BridgeConnected,
    BridgeLost,
    PeerLost,
}

/// Pushed to control surfaces when a magic key's membership changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkEvent {
    pub event: LinkEventKind,
    pub magic_key: MagicKey,
    /// Class of the peer the event is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ConnectionClass>,
}

impl LinkEvent {
    pub fn new(event: LinkEventKind, magic_key: MagicKey, class: ConnectionClass) -> Self {
        Self {
            event,
            magic_key,
            class: Some(class),
        }
    }
}

// ---------------------------------------------------------------------------
// Trade-intent payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

/// Payload of an `open` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub symbol: String,
    pub side: OrderSide,
    #[serde(default = "default_order_type")]
    pub order_type: OrderType,
    pub volume: Decimal,
    pub price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub comment: Option<String>,
}

fn default_order_type() -> OrderType {
    OrderType::Market
}

/// Payload of a `close` command. `volume` absent means close all of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseOrder {
    pub ticket: i64,
    pub volume: Option<Decimal>,
}

/// Payload of a `modify` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyOrder {
    pub ticket: i64,
    pub price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Payload of a `closeAll` command. No symbol closes every position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseAll {
    pub symbol: Option<String>,
}

/// Structural check of a command payload before it is routed.
///
/// Trade intents must parse into their typed payload; state reports must be
/// JSON objects. Nothing here looks at prices or sizing beyond sign checks.
pub fn validate_payload(kind: CommandKind, payload: &serde_json::Value) -> Result<(), String> {
    match kind {
        CommandKind::Open => {
            let order: OpenOrder = parse(payload)?;
            if order.symbol.trim().is_empty() {
                return Err("symbol must not be empty".to_string());
            }
            if order.volume <= Decimal::ZERO {
                return Err(format!("volume must be positive, got {}", order.volume));
            }
            if order.order_type != OrderType::Market && order.price.is_none() {
                return Err("pending orders need a price".to_string());
            }
            Ok(())
        }
        CommandKind::Close => {
            let order: CloseOrder = parse(payload)?;
            match order.volume {
                Some(v) if v <= Decimal::ZERO => {
                    Err(format!("volume must be positive, got {}", v))
                }
                _ => Ok(()),
            }
        }
        CommandKind::Modify => {
            let order: ModifyOrder = parse(payload)?;
            if order.price.is_none() && order.stop_loss.is_none() && order.take_profit.is_none() {
                return Err("modify needs at least one of price, stopLoss, takeProfit".to_string());
            }
            Ok(())
        }
        CommandKind::CloseAll => {
            if payload.is_null() {
                return Ok(());
            }
            parse::<CloseAll>(payload).map(|_| ())
        }
        CommandKind::AccountSnapshot | CommandKind::Positions | CommandKind::Tick => {
            if payload.is_object() || payload.is_array() {
                Ok(())
            } else {
                Err("state reports carry an object or array payload".to_string())
            }
        }
        CommandKind::Heartbeat => Ok(()),
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> Result<T, String> {
    T::deserialize(payload).map_err(|e| e.to_string())
}
